use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A located element. `remote_id` is driver specific (a CDP object id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub selector: String,
    pub remote_id: Option<String>,
}

impl ElementHandle {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            remote_id: None,
        }
    }
}

/// Low-level operations the executor composes into verified actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    /// Trusted pointer click at the element's centre.
    Click,
    /// Focus and press Enter/Space, for controls that ignore pointer events.
    KeyboardActivate,
    /// Synthetic `click` event dispatched straight to the element.
    DispatchClick,
    Fill(String),
    Type(String),
    Select(String),
    Hover,
    Check,
    Uncheck,
    ScrollIntoView,
    ScrollToBottom,
    Press(String),
    Upload(Vec<String>),
}

impl DriverAction {
    pub fn name(&self) -> &'static str {
        match self {
            DriverAction::Click => "click",
            DriverAction::KeyboardActivate => "keyboard_activate",
            DriverAction::DispatchClick => "dispatch_click",
            DriverAction::Fill(_) => "fill",
            DriverAction::Type(_) => "type",
            DriverAction::Select(_) => "select",
            DriverAction::Hover => "hover",
            DriverAction::Check => "check",
            DriverAction::Uncheck => "uncheck",
            DriverAction::ScrollIntoView => "scroll_into_view",
            DriverAction::ScrollToBottom => "scroll_to_bottom",
            DriverAction::Press(_) => "press",
            DriverAction::Upload(_) => "upload",
        }
    }
}

/// Reference to a captured screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotRef {
    pub label: String,
    /// File on disk, when the driver persists captures.
    pub path: Option<String>,
    pub taken_at: DateTime<Utc>,
}

impl ScreenshotRef {
    /// Stable string used in forensic records.
    pub fn reference(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.label, self.taken_at.timestamp_millis()))
    }
}

/// Cheap fingerprint used to decide whether an action changed anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    #[serde(rename = "textLength")]
    pub text_length: u64,
    #[serde(rename = "scrollY")]
    pub scroll_y: f64,
    #[serde(rename = "scrollMax")]
    pub scroll_max: f64,
}

impl PageState {
    pub fn at_scroll_limit(&self) -> bool {
        self.scroll_y + 1.0 >= self.scroll_max
    }
}

/// One node of the structural tree the driver reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<DomNode>,
    #[serde(default, rename = "shadowRoots")]
    pub shadow_roots: Vec<DomNode>,
}

impl DomNode {
    pub fn element(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: DomNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn shadow(mut self, root: DomNode) -> Self {
        self.shadow_roots.push(root);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.attributes.get("id").map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .get("class")
            .map(|c| c.split_whitespace())
            .into_iter()
            .flatten()
    }

    /// Rebuild the tree from pre-order nodes that name their parent by
    /// index. Children always follow their parent, so walking backwards
    /// finishes every subtree before it is attached.
    pub fn from_flat(nodes: Vec<FlatDomNode>) -> Option<DomNode> {
        let mut children: Vec<Vec<DomNode>> = vec![Vec::new(); nodes.len()];
        let mut shadows: Vec<Vec<DomNode>> = vec![Vec::new(); nodes.len()];
        let mut root = None;
        for (idx, flat) in nodes.into_iter().enumerate().rev() {
            let mut own_children = std::mem::take(&mut children[idx]);
            own_children.reverse();
            let mut own_shadows = std::mem::take(&mut shadows[idx]);
            own_shadows.reverse();
            let node = DomNode {
                tag: flat.tag,
                attributes: flat.attributes,
                text: flat.text,
                children: own_children,
                shadow_roots: own_shadows,
            };
            match flat.parent {
                Some(parent) if parent < idx => {
                    if flat.shadow {
                        shadows[parent].push(node);
                    } else {
                        children[parent].push(node);
                    }
                }
                _ => root = Some(node),
            }
        }
        root
    }
}

/// Wire form of one DOM node in the flat pre-order listing the page returns.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FlatDomNode {
    #[serde(default)]
    pub parent: Option<usize>,
    #[serde(default)]
    pub shadow: bool,
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
}
