//! In-memory [`PageDriver`] with scripted reactions, for tests.
//!
//! Elements are matched by exact selector string. Each element can be told
//! how it reacts to activation (navigate, grow the page text, nothing at
//! all) and which activation styles it honours, which is enough to drive
//! the executor's verification and fallback paths without a browser.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::DriverError;
use crate::types::{DomNode, DriverAction, ElementHandle, PageState, ScreenshotRef};
use crate::{DriverResult, PageDriver};

/// Ways an element can be activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Pointer,
    Keyboard,
    Dispatch,
}

impl Activation {
    fn of(action: &DriverAction) -> Option<Self> {
        match action {
            DriverAction::Click => Some(Activation::Pointer),
            DriverAction::KeyboardActivate => Some(Activation::Keyboard),
            DriverAction::DispatchClick => Some(Activation::Dispatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedElement {
    selector: String,
    tag: String,
    text: String,
    value: String,
    checked: bool,
    options: Vec<String>,
    navigates_to: Option<String>,
    text_delta: u64,
    accepts: Vec<Activation>,
    clicks_needed: u32,
    clicks_seen: u32,
    rejects_input: bool,
    hangs: bool,
}

impl ScriptedElement {
    fn new(selector: &str, tag: &str, text: &str) -> Self {
        Self {
            selector: selector.to_string(),
            tag: tag.to_string(),
            text: text.to_string(),
            value: String::new(),
            checked: false,
            options: Vec::new(),
            navigates_to: None,
            text_delta: 25,
            accepts: vec![Activation::Pointer, Activation::Keyboard, Activation::Dispatch],
            clicks_needed: 1,
            clicks_seen: 0,
            rejects_input: false,
            hangs: false,
        }
    }

    /// A clickable element that grows the page text when activated.
    pub fn button(selector: &str, text: &str) -> Self {
        Self::new(selector, "button", text)
    }

    pub fn input(selector: &str) -> Self {
        let mut element = Self::new(selector, "input", "");
        element.text_delta = 0;
        element
    }

    pub fn select(selector: &str, options: &[&str]) -> Self {
        let mut element = Self::new(selector, "select", "");
        element.text_delta = 0;
        element.options = options.iter().map(|o| o.to_string()).collect();
        element
    }

    pub fn navigates_to(mut self, url: &str) -> Self {
        self.navigates_to = Some(url.to_string());
        self
    }

    pub fn mutates_text(mut self, delta: u64) -> Self {
        self.text_delta = delta;
        self
    }

    /// Activation succeeds but changes nothing observable.
    pub fn inert(mut self) -> Self {
        self.text_delta = 0;
        self.navigates_to = None;
        self
    }

    pub fn only_on(mut self, activations: &[Activation]) -> Self {
        self.accepts = activations.to_vec();
        self
    }

    /// React only from the `n`th honoured activation onwards.
    pub fn after_clicks(mut self, n: u32) -> Self {
        self.clicks_needed = n.max(1);
        self
    }

    pub fn rejects_input(mut self) -> Self {
        self.rejects_input = true;
        self
    }

    /// Every action on this element blocks until the caller gives up.
    pub fn hangs(mut self) -> Self {
        self.hangs = true;
        self
    }

    fn to_dom(&self) -> DomNode {
        let mut node = DomNode::element(&self.tag);
        if let Some(id) = self.selector.strip_prefix('#') {
            node = node.attr("id", id);
        } else if let Some(class) = self.selector.strip_prefix('.') {
            node = node.attr("class", class);
        }
        if !self.text.is_empty() {
            node = node.text(&self.text);
        }
        node
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    url: String,
    text_length: u64,
    scroll_y: f64,
    scroll_max: f64,
    elements: Vec<ScriptedElement>,
    dom: Option<DomNode>,
    actions: Vec<String>,
    navigations: Vec<String>,
    snapshots: u64,
    fail_navigation: bool,
    closed: bool,
}

/// Cloneable handle; clones share the same page.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPage {
    pub fn new(url: &str) -> Self {
        let page = Self::default();
        {
            let mut state = page.lock();
            state.url = url.to_string();
            state.text_length = 100;
        }
        page
    }

    pub fn with_element(self, element: ScriptedElement) -> Self {
        self.lock().elements.push(element);
        self
    }

    /// Replace the generated DOM with an explicit tree.
    pub fn with_dom(self, dom: DomNode) -> Self {
        self.lock().dom = Some(dom);
        self
    }

    pub fn with_scroll_height(self, max: f64) -> Self {
        self.lock().scroll_max = max;
        self
    }

    pub fn fail_navigation(&self, fail: bool) {
        self.lock().fail_navigation = fail;
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    /// `"<action> <selector>"` for every action performed, in order.
    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.lock()
            .elements
            .iter()
            .find(|e| e.selector == selector)
            .map(|e| e.value.clone())
    }

    pub fn is_checked(&self, selector: &str) -> bool {
        self.lock()
            .elements
            .iter()
            .any(|e| e.selector == selector && e.checked)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_open(&self) -> DriverResult<()> {
        if self.lock().closed {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.check_open()?;
        let mut state = self.lock();
        if state.fail_navigation {
            return Err(DriverError::Protocol(format!("navigation to {url} failed")));
        }
        state.url = url.to_string();
        state.text_length = 100;
        state.scroll_y = 0.0;
        state.navigations.push(url.to_string());
        state.actions.push(format!("navigate {url}"));
        Ok(())
    }

    async fn locate(&self, selector: &str) -> DriverResult<Option<ElementHandle>> {
        self.check_open()?;
        let state = self.lock();
        Ok(state
            .elements
            .iter()
            .any(|e| e.selector == selector)
            .then(|| ElementHandle::new(selector)))
    }

    async fn act(&self, element: Option<&ElementHandle>, action: &DriverAction) -> DriverResult<()> {
        self.check_open()?;
        let target = element.map(|e| e.selector.clone());
        let hangs = {
            let state = self.lock();
            target
                .as_deref()
                .and_then(|sel| state.elements.iter().find(|e| e.selector == sel))
                .map(|e| e.hangs)
                .unwrap_or(false)
        };
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut state = self.lock();
        let label = match &target {
            Some(sel) => format!("{} {sel}", action.name()),
            None => action.name().to_string(),
        };
        state.actions.push(label);

        if let DriverAction::ScrollToBottom = action {
            state.scroll_y = state.scroll_max;
            return Ok(());
        }
        let Some(selector) = target else {
            return Ok(());
        };
        let index = state
            .elements
            .iter()
            .position(|e| e.selector == selector)
            .ok_or_else(|| DriverError::Detached(selector.clone()))?;

        if let Some(activation) = Activation::of(action) {
            let element = &mut state.elements[index];
            if !element.accepts.contains(&activation) {
                return Ok(());
            }
            element.clicks_seen += 1;
            if element.clicks_seen < element.clicks_needed {
                return Ok(());
            }
            let (navigate, delta) = (element.navigates_to.clone(), element.text_delta);
            if let Some(url) = navigate {
                state.url = url.clone();
                state.navigations.push(url);
            }
            state.text_length += delta;
            return Ok(());
        }

        let element = &mut state.elements[index];
        match action {
            DriverAction::Fill(value) if !element.rejects_input => element.value = value.clone(),
            DriverAction::Type(text) if !element.rejects_input => element.value.push_str(text),
            DriverAction::Select(value) => {
                if !element.options.iter().any(|o| o == value) {
                    return Err(DriverError::Script(format!("no option {value}")));
                }
                if !element.rejects_input {
                    element.value = value.clone();
                }
            }
            DriverAction::Check => element.checked = true,
            DriverAction::Uncheck => element.checked = false,
            DriverAction::Upload(files) => element.value = files.join(","),
            _ => {}
        }
        Ok(())
    }

    async fn snapshot(&self, label: &str) -> DriverResult<ScreenshotRef> {
        self.check_open()?;
        let mut state = self.lock();
        state.snapshots += 1;
        Ok(ScreenshotRef {
            label: format!("{label}-{}", state.snapshots),
            path: None,
            taken_at: Utc::now(),
        })
    }

    async fn dom_tree(&self) -> DriverResult<DomNode> {
        self.check_open()?;
        let state = self.lock();
        if let Some(dom) = &state.dom {
            return Ok(dom.clone());
        }
        let body = state
            .elements
            .iter()
            .fold(DomNode::element("body"), |body, e| body.child(e.to_dom()));
        Ok(DomNode::element("html").child(body))
    }

    async fn page_state(&self) -> DriverResult<PageState> {
        self.check_open()?;
        let state = self.lock();
        Ok(PageState {
            url: state.url.clone(),
            text_length: state.text_length,
            scroll_y: state.scroll_y,
            scroll_max: state.scroll_max,
        })
    }

    async fn read_value(&self, element: &ElementHandle) -> DriverResult<String> {
        self.value_of(&element.selector)
            .ok_or_else(|| DriverError::Detached(element.selector.clone()))
    }

    async fn close(&self) -> DriverResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activation_effects_follow_the_script() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::button("#go", "Go").navigates_to("http://app.test/next"))
            .with_element(
                ScriptedElement::button("#stubborn", "Later")
                    .only_on(&[Activation::Keyboard]),
            );

        let stubborn = page.locate("#stubborn").await.unwrap().unwrap();
        page.act(Some(&stubborn), &DriverAction::Click).await.unwrap();
        assert_eq!(page.page_state().await.unwrap().text_length, 100);
        page.act(Some(&stubborn), &DriverAction::KeyboardActivate).await.unwrap();
        assert_eq!(page.page_state().await.unwrap().text_length, 125);

        let go = page.locate("#go").await.unwrap().unwrap();
        page.act(Some(&go), &DriverAction::Click).await.unwrap();
        assert_eq!(page.url(), "http://app.test/next");
        assert!(page.locate("#missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn input_readback_and_closed_state() {
        let page = ScriptedPage::new("http://app.test/")
            .with_element(ScriptedElement::input("#email"))
            .with_element(ScriptedElement::input("#locked").rejects_input());

        let email = page.locate("#email").await.unwrap().unwrap();
        page.act(Some(&email), &DriverAction::Fill("a@b.c".into())).await.unwrap();
        assert_eq!(page.read_value(&email).await.unwrap(), "a@b.c");

        let locked = page.locate("#locked").await.unwrap().unwrap();
        page.act(Some(&locked), &DriverAction::Fill("x".into())).await.unwrap();
        assert_eq!(page.read_value(&locked).await.unwrap(), "");

        page.close().await.unwrap();
        assert!(matches!(page.page_state().await, Err(DriverError::Closed)));
    }
}
