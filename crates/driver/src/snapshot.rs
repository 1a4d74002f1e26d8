//! Flattened structural snapshots of the page.
//!
//! The DOM tree is walked with an explicit worklist rather than recursion so
//! arbitrarily deep or shadow-heavy pages cannot exhaust the stack. Shadow
//! roots go onto the same worklist as light-DOM children.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::types::DomNode;

const MAX_NODES: usize = 2_000;
const MAX_TEXT: usize = 80;
const MAX_BLOCKING: usize = 50;
const SHADOW_ROOT_TAG: &str = "#shadow-root";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotNode {
    pub depth: usize,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "className", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "inShadow")]
    pub in_shadow: bool,
    #[serde(skip)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructuralSnapshot {
    pub nodes: Vec<SnapshotNode>,
    #[serde(rename = "shadowRoots")]
    pub shadow_roots: usize,
    pub truncated: bool,
}

impl StructuralSnapshot {
    /// Flatten `root` in document order, shadow content before light children.
    pub fn capture(root: &DomNode) -> Self {
        let mut snapshot = StructuralSnapshot::default();
        let mut worklist: Vec<(&DomNode, usize, bool)> = vec![(root, 0, false)];

        while let Some((node, depth, in_shadow)) = worklist.pop() {
            if snapshot.nodes.len() >= MAX_NODES {
                snapshot.truncated = true;
                break;
            }
            if node.tag == SHADOW_ROOT_TAG {
                snapshot.shadow_roots += 1;
            } else {
                snapshot.nodes.push(SnapshotNode {
                    depth,
                    tag: node.tag.clone(),
                    id: node.id().map(str::to_string),
                    class_name: node.attributes.get("class").cloned(),
                    role: node.attributes.get("role").cloned(),
                    text: node.text.as_deref().map(clip_text).filter(|t| !t.is_empty()),
                    in_shadow,
                    attributes: node.attributes.clone(),
                });
            }

            for child in node.children.iter().rev() {
                worklist.push((child, depth + 1, in_shadow));
            }
            for shadow in node.shadow_roots.iter().rev() {
                if shadow.tag == SHADOW_ROOT_TAG {
                    worklist.push((shadow, depth + 1, true));
                } else {
                    snapshot.shadow_roots += 1;
                    for child in shadow.children.iter().rev() {
                        worklist.push((child, depth + 1, true));
                    }
                }
            }
        }
        snapshot
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn clip_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_TEXT {
        collapsed
    } else {
        let mut clipped: String = collapsed.chars().take(MAX_TEXT).collect();
        clipped.push('…');
        clipped
    }
}

/// A single compound selector: `tag#id.class[attr][attr="value"]`.
///
/// Sentinels declare what they watch with selectors like these. For
/// selectors with combinators only the rightmost compound is matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompoundSelector {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attributes: Vec<(String, Option<String>)>,
}

impl CompoundSelector {
    pub fn parse(selector: &str) -> Option<Self> {
        let last = selector
            .rsplit(|c: char| c.is_whitespace() || c == '>' || c == '+' || c == '~')
            .find(|part| !part.is_empty())?;
        let mut out = CompoundSelector::default();
        let mut chars = last.chars().peekable();
        let mut tag = String::new();

        while let Some(&c) = chars.peek() {
            match c {
                '#' | '.' => {
                    chars.next();
                    let name = take_ident(&mut chars);
                    if name.is_empty() {
                        return None;
                    }
                    if c == '#' {
                        out.id = Some(name);
                    } else {
                        out.classes.push(name);
                    }
                }
                '[' => {
                    chars.next();
                    let body: String = chars.by_ref().take_while(|&c| c != ']').collect();
                    let (name, value) = match body.split_once('=') {
                        Some((name, value)) => (
                            name.trim_end_matches(['*', '^', '$', '~', '|']).trim().to_string(),
                            Some(value.trim().trim_matches(['"', '\'']).to_string()),
                        ),
                        None => (body.trim().to_string(), None),
                    };
                    if name.is_empty() {
                        return None;
                    }
                    out.attributes.push((name, value));
                }
                ':' => break,
                _ => {
                    chars.next();
                    tag.push(c);
                }
            }
        }
        if !tag.is_empty() && tag != "*" {
            out.tag = Some(tag.to_ascii_lowercase());
        }
        (out != CompoundSelector::default()).then_some(out)
    }

    pub fn matches(&self, node: &SnapshotNode) -> bool {
        if let Some(tag) = self.tag.as_deref() {
            if !node.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = self.id.as_deref() {
            if node.id.as_deref() != Some(id) {
                return false;
            }
        }
        let classes: Vec<&str> = node
            .class_name
            .as_deref()
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default();
        if !self.classes.iter().all(|c| classes.contains(&c.as_str())) {
            return false;
        }
        self.attributes.iter().all(|(name, value)| match (node.attributes.get(name), value) {
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
            (None, _) => false,
        })
    }
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut ident = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            ident.push(c);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

/// A snapshot node matched by a sentinel's watch selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingMatch {
    /// The watch selector that matched.
    pub selector: String,
    pub id: Option<String>,
    #[serde(rename = "className")]
    pub class_name: Option<String>,
    pub text: Option<String>,
}

/// Nodes in `snapshot` that match any of `watch` selectors.
pub fn blocking_elements(snapshot: &StructuralSnapshot, watch: &[String]) -> Vec<BlockingMatch> {
    let parsed: Vec<(&String, CompoundSelector)> = watch
        .iter()
        .filter_map(|raw| CompoundSelector::parse(raw).map(|sel| (raw, sel)))
        .collect();
    let mut hits = Vec::new();
    for node in &snapshot.nodes {
        if let Some((raw, _)) = parsed.iter().find(|(_, sel)| sel.matches(node)) {
            hits.push(BlockingMatch {
                selector: (*raw).clone(),
                id: node.id.clone(),
                class_name: node.class_name.clone(),
                text: node.text.clone(),
            });
            if hits.len() >= MAX_BLOCKING {
                break;
            }
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> DomNode {
        DomNode::element("html").child(
            DomNode::element("body")
                .child(DomNode::element("div").attr("id", "app").shadow(
                    DomNode::element(SHADOW_ROOT_TAG).child(
                        DomNode::element("div")
                            .attr("class", "modal open")
                            .text("Accept   cookies?"),
                    ),
                ))
                .child(DomNode::element("button").attr("id", "submit").text("Submit")),
        )
    }

    #[test]
    fn worklist_visits_shadow_roots_in_document_order() {
        let snap = StructuralSnapshot::capture(&page());
        let tags: Vec<&str> = snap.nodes.iter().map(|n| n.tag.as_str()).collect();
        assert_eq!(tags, vec!["html", "body", "div", "div", "button"]);
        assert_eq!(snap.shadow_roots, 1);
        assert!(snap.nodes[3].in_shadow);
        assert_eq!(snap.nodes[3].text.as_deref(), Some("Accept cookies?"));
        assert!(!snap.nodes[4].in_shadow);
    }

    #[test]
    fn deep_trees_are_walked_iteratively() {
        let mut node = DomNode::element("span");
        for _ in 0..1_000 {
            node = DomNode::element("div").child(node);
        }
        let snap = StructuralSnapshot::capture(&node);
        assert!(!snap.truncated);
        assert_eq!(snap.nodes.len(), 1_001);
        assert_eq!(snap.nodes.last().map(|n| n.depth), Some(1_000));
    }

    #[test]
    fn oversized_pages_are_truncated() {
        let mut body = DomNode::element("body");
        for i in 0..(MAX_NODES + 10) {
            body = body.child(DomNode::element("p").attr("id", format!("p{i}")));
        }
        let snap = StructuralSnapshot::capture(&body);
        assert!(snap.truncated);
        assert_eq!(snap.nodes.len(), MAX_NODES);
    }

    #[test]
    fn compound_selectors_parse_and_match() {
        let sel = CompoundSelector::parse("div.modal.open").unwrap();
        assert_eq!(sel.tag.as_deref(), Some("div"));
        assert_eq!(sel.classes, vec!["modal", "open"]);

        let attr = CompoundSelector::parse("body > [data-overlay=\"true\"]").unwrap();
        assert_eq!(
            attr.attributes,
            vec![("data-overlay".to_string(), Some("true".to_string()))]
        );
        assert!(CompoundSelector::parse("  ").is_none());
    }

    #[test]
    fn blocking_detection_reaches_into_shadow_dom() {
        let snap = StructuralSnapshot::capture(&page());
        let hits = blocking_elements(&snap, &[".modal".to_string(), "#missing".to_string()]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].selector, ".modal");
        assert_eq!(hits[0].class_name.as_deref(), Some("modal open"));
    }
}
