//! [`PageDriver`] over the Chrome DevTools Protocol.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cdp::CdpClient;
use crate::error::DriverError;
use crate::types::{DomNode, DriverAction, ElementHandle, FlatDomNode, PageState, ScreenshotRef};
use crate::{DriverResult, PageDriver};

const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolves `sel` with the hub's selector dialect: plain CSS, `text=` /
/// `text="..."` for visible text, `label="..."` for labelled controls and
/// `>>>` to descend into shadow roots.
const LOCATE_JS: &str = r#"(function (sel) {
  const interactive = 'button,a,[role=button],[role=link],[role=menuitem],input[type=submit],input[type=button],summary,label,[onclick],li,span,div';
  function textOf(el) { return ((el.innerText || el.value || '') + '').trim().toLowerCase(); }
  function query(root, part) {
    const s = part.trim();
    if (s.startsWith('text=')) {
      let t = s.slice(5).trim();
      const exact = t.length > 1 && t.startsWith('"') && t.endsWith('"');
      if (exact) t = t.slice(1, -1);
      t = t.toLowerCase();
      let best = null;
      for (const el of root.querySelectorAll(interactive)) {
        const txt = textOf(el);
        if (exact ? txt === t : txt.includes(t)) {
          if (!best || best.contains(el)) best = el;
        }
      }
      return best;
    }
    if (s.startsWith('label=')) {
      const t = s.slice(6).trim().replace(/^"|"$/g, '').toLowerCase();
      for (const l of root.querySelectorAll('label')) {
        if (textOf(l) !== t) continue;
        if (l.control) return l.control;
        const f = l.getAttribute('for');
        if (f) return root.querySelector('#' + CSS.escape(f));
      }
      return null;
    }
    return root.querySelector(s);
  }
  const parts = sel.split('>>>');
  let root = document;
  let el = null;
  for (let i = 0; i < parts.length; i++) {
    el = query(root, parts[i]);
    if (!el) return null;
    if (i < parts.length - 1) {
      root = el.shadowRoot;
      if (!root) return null;
    }
  }
  return el;
})"#;

/// Pre-order listing walked with an explicit stack, so nesting depth and
/// shadow roots cost no recursion in the page or in the JSON parser.
const DOM_TREE_JS: &str = r#"(function () {
  const limit = 20000;
  const skip = ['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE'];
  const nodes = [];
  const stack = [[document.documentElement, null, false]];
  while (stack.length && nodes.length < limit) {
    const [n, parent, shadow] = stack.pop();
    const out = { parent, shadow, tag: n.nodeType === 11 ? '#shadow-root' : n.tagName.toLowerCase(), attributes: {} };
    if (n.attributes) for (const a of n.attributes) if (a.value.length < 256) out.attributes[a.name] = a.value;
    let own = '';
    for (const c of n.childNodes) if (c.nodeType === 3) own += c.textContent;
    own = own.trim();
    if (own) out.text = own.slice(0, 256);
    const idx = nodes.length;
    nodes.push(out);
    if (n.shadowRoot) stack.push([n.shadowRoot, idx, true]);
    const kids = Array.from(n.children).filter((c) => !skip.includes(c.tagName));
    for (let i = kids.length - 1; i >= 0; i--) stack.push([kids[i], idx, false]);
  }
  return nodes;
})()"#;

const PAGE_STATE_JS: &str = r#"({
  url: location.href,
  textLength: document.body ? document.body.innerText.length : 0,
  scrollY: window.scrollY,
  scrollMax: Math.max(0, document.documentElement.scrollHeight - window.innerHeight)
})"#;

const CENTER_JS: &str = r#"function () {
  this.scrollIntoView({ block: 'center', inline: 'center' });
  const r = this.getBoundingClientRect();
  return { x: r.left + r.width / 2, y: r.top + r.height / 2, w: r.width, h: r.height };
}"#;

const FILL_JS: &str = r#"function (v) {
  this.focus();
  const proto = this instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
    : this instanceof HTMLInputElement ? HTMLInputElement.prototype : null;
  const d = proto && Object.getOwnPropertyDescriptor(proto, 'value');
  if (d && d.set) d.set.call(this, v);
  else if (this.isContentEditable) this.textContent = v;
  else this.value = v;
  this.dispatchEvent(new Event('input', { bubbles: true }));
  this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

const SELECT_JS: &str = r#"function (v) {
  const opts = Array.from(this.options || []);
  const o = opts.find(o => o.value === v) || opts.find(o => o.text.trim() === v);
  if (!o) throw new Error('no option ' + v);
  this.value = o.value;
  this.dispatchEvent(new Event('input', { bubbles: true }));
  this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

const CHECK_JS: &str = r#"function (want) {
  if (this.checked !== want) this.click();
  return this.checked === want;
}"#;

const READ_VALUE_JS: &str = r#"function () {
  if ('value' in this && typeof this.value === 'string') return this.value;
  return (this.innerText || this.textContent || '').trim();
}"#;

/// How to reach (or start) the browser.
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    /// DevTools HTTP endpoint, e.g. `http://127.0.0.1:9222`.
    pub endpoint: String,
    /// Connect straight to this page socket, skipping discovery.
    pub ws_url: Option<String>,
    /// Start a private browser instead of attaching to a running one.
    pub launch: bool,
    pub browser_path: Option<PathBuf>,
    pub headless: bool,
    pub screenshot_dir: PathBuf,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9222".to_string(),
            ws_url: None,
            launch: false,
            browser_path: None,
            headless: true,
            screenshot_dir: PathBuf::from("screenshots"),
        }
    }
}

struct LaunchedBrowser {
    child: Child,
    _profile: TempDir,
}

pub struct CdpPage {
    client: CdpClient,
    screenshot_dir: PathBuf,
    browser: Mutex<Option<LaunchedBrowser>>,
    closed: AtomicBool,
}

impl CdpPage {
    pub async fn connect(options: ChromeOptions) -> DriverResult<Self> {
        let browser = if options.launch {
            Some(launch_browser(&options).await?)
        } else {
            None
        };

        let ws_url = match options.ws_url.clone() {
            Some(url) => url,
            None => discover_page_socket(&options.endpoint).await?,
        };
        let client = CdpClient::connect(&ws_url).await?;
        client.call("Page.enable", json!({})).await?;
        client.call("Runtime.enable", json!({})).await?;

        tokio::fs::create_dir_all(&options.screenshot_dir).await?;
        info!(target_ws = %ws_url, launched = browser.is_some(), "page driver ready");

        Ok(Self {
            client,
            screenshot_dir: options.screenshot_dir,
            browser: Mutex::new(browser),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    async fn evaluate(&self, expression: &str) -> DriverResult<Value> {
        let reply = self
            .client
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        script_result(reply)
    }

    async fn call_on(&self, element: &ElementHandle, function: &str, args: Vec<Value>) -> DriverResult<Value> {
        let object_id = element
            .remote_id
            .as_deref()
            .ok_or_else(|| DriverError::Detached(element.selector.clone()))?;
        let arguments: Vec<Value> = args.into_iter().map(|value| json!({ "value": value })).collect();
        let reply = self
            .client
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function,
                    "arguments": arguments,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await
            .map_err(|err| match err {
                DriverError::Cdp { .. } => DriverError::Detached(element.selector.clone()),
                other => other,
            })?;
        script_result(reply)
    }

    async fn center_of(&self, element: &ElementHandle) -> DriverResult<(f64, f64)> {
        let rect = self.call_on(element, CENTER_JS, Vec::new()).await?;
        let width = rect.get("w").and_then(Value::as_f64).unwrap_or_default();
        let height = rect.get("h").and_then(Value::as_f64).unwrap_or_default();
        if width <= 0.0 || height <= 0.0 {
            return Err(DriverError::Script(format!(
                "{} has no visible box",
                element.selector
            )));
        }
        Ok((
            rect.get("x").and_then(Value::as_f64).unwrap_or_default(),
            rect.get("y").and_then(Value::as_f64).unwrap_or_default(),
        ))
    }

    async fn mouse(&self, kind: &str, x: f64, y: f64) -> DriverResult<()> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        self.client.call("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }

    async fn key(&self, key: &str) -> DriverResult<()> {
        let (code, vk, text) = key_codes(key);
        let mut down = json!({ "type": "keyDown", "key": key, "code": code, "windowsVirtualKeyCode": vk });
        if let Some(text) = text {
            down["text"] = json!(text);
        }
        self.client.call("Input.dispatchKeyEvent", down).await?;
        self.client
            .call(
                "Input.dispatchKeyEvent",
                json!({ "type": "keyUp", "key": key, "code": code, "windowsVirtualKeyCode": vk }),
            )
            .await?;
        Ok(())
    }

    async fn focus(&self, element: &ElementHandle) -> DriverResult<()> {
        self.call_on(element, "function () { this.focus(); }", Vec::new())
            .await
            .map(|_| ())
    }

    async fn wait_for_load(&self) {
        let started = Instant::now();
        while started.elapsed() < LOAD_TIMEOUT {
            match self.evaluate("document.readyState").await {
                Ok(Value::String(state)) if state == "complete" => return,
                Ok(_) => {}
                Err(err) => debug!(error = %err, "readyState check failed"),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(timeout_secs = LOAD_TIMEOUT.as_secs(), "page did not finish loading");
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.ensure_open()?;
        let reply = self.client.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = reply.get("errorText").and_then(Value::as_str) {
            return Err(DriverError::Protocol(format!("navigation to {url} failed: {error}")));
        }
        self.wait_for_load().await;
        Ok(())
    }

    async fn locate(&self, selector: &str) -> DriverResult<Option<ElementHandle>> {
        self.ensure_open()?;
        let expression = format!("({LOCATE_JS})({})", Value::String(selector.to_string()));
        let reply = self
            .client
            .call("Runtime.evaluate", json!({ "expression": expression, "returnByValue": false }))
            .await?;
        if reply.get("exceptionDetails").is_some() {
            debug!(selector, "selector rejected by page");
            return Ok(None);
        }
        let result = reply.get("result").cloned().unwrap_or(Value::Null);
        if result.get("subtype").and_then(Value::as_str) == Some("null") {
            return Ok(None);
        }
        Ok(result
            .get("objectId")
            .and_then(Value::as_str)
            .map(|object_id| ElementHandle {
                selector: selector.to_string(),
                remote_id: Some(object_id.to_string()),
            }))
    }

    async fn act(&self, element: Option<&ElementHandle>, action: &DriverAction) -> DriverResult<()> {
        self.ensure_open()?;
        let require = || {
            element.ok_or_else(|| DriverError::Script(format!("{} needs a target element", action.name())))
        };
        match action {
            DriverAction::Click => {
                let (x, y) = self.center_of(require()?).await?;
                self.mouse("mouseMoved", x, y).await?;
                self.mouse("mousePressed", x, y).await?;
                self.mouse("mouseReleased", x, y).await?;
            }
            DriverAction::Hover => {
                let (x, y) = self.center_of(require()?).await?;
                self.mouse("mouseMoved", x, y).await?;
            }
            DriverAction::KeyboardActivate => {
                self.focus(require()?).await?;
                self.key("Enter").await?;
            }
            DriverAction::DispatchClick => {
                self.call_on(
                    require()?,
                    "function () { this.dispatchEvent(new MouseEvent('click', { bubbles: true, cancelable: true, view: window })); }",
                    Vec::new(),
                )
                .await?;
            }
            DriverAction::Fill(value) => {
                self.call_on(require()?, FILL_JS, vec![json!(value)]).await?;
            }
            DriverAction::Type(text) => {
                if let Some(element) = element {
                    self.focus(element).await?;
                }
                self.client.call("Input.insertText", json!({ "text": text })).await?;
            }
            DriverAction::Select(value) => {
                self.call_on(require()?, SELECT_JS, vec![json!(value)]).await?;
            }
            DriverAction::Check | DriverAction::Uncheck => {
                let want = matches!(action, DriverAction::Check);
                let ok = self.call_on(require()?, CHECK_JS, vec![json!(want)]).await?;
                if ok != Value::Bool(true) {
                    return Err(DriverError::Script("checkbox state did not change".to_string()));
                }
            }
            DriverAction::ScrollIntoView => {
                self.call_on(
                    require()?,
                    "function () { this.scrollIntoView({ block: 'center' }); }",
                    Vec::new(),
                )
                .await?;
            }
            DriverAction::ScrollToBottom => {
                self.evaluate("window.scrollTo(0, document.documentElement.scrollHeight)")
                    .await?;
            }
            DriverAction::Press(key) => {
                if let Some(element) = element {
                    self.focus(element).await?;
                }
                self.key(key).await?;
            }
            DriverAction::Upload(files) => {
                let target = require()?;
                let object_id = target
                    .remote_id
                    .as_deref()
                    .ok_or_else(|| DriverError::Detached(target.selector.clone()))?;
                self.client
                    .call(
                        "DOM.setFileInputFiles",
                        json!({ "files": files, "objectId": object_id }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn snapshot(&self, label: &str) -> DriverResult<ScreenshotRef> {
        self.ensure_open()?;
        let reply = self
            .client
            .call("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = reply
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Protocol("screenshot without data".to_string()))?;
        let bytes = general_purpose::STANDARD
            .decode(data)
            .map_err(|err| DriverError::Protocol(format!("screenshot decode failed: {err}")))?;
        let taken_at = Utc::now();
        let path = screenshot_path(&self.screenshot_dir, label, taken_at.timestamp_millis());
        tokio::fs::write(&path, bytes).await?;
        Ok(ScreenshotRef {
            label: label.to_string(),
            path: Some(path.display().to_string()),
            taken_at,
        })
    }

    async fn dom_tree(&self) -> DriverResult<DomNode> {
        self.ensure_open()?;
        let value = self.evaluate(DOM_TREE_JS).await?;
        let nodes: Vec<FlatDomNode> = serde_json::from_value(value)
            .map_err(|err| DriverError::Protocol(format!("unexpected DOM listing: {err}")))?;
        DomNode::from_flat(nodes).ok_or_else(|| DriverError::Protocol("page has no document element".to_string()))
    }

    async fn page_state(&self) -> DriverResult<PageState> {
        self.ensure_open()?;
        let value = self.evaluate(PAGE_STATE_JS).await?;
        serde_json::from_value(value)
            .map_err(|err| DriverError::Protocol(format!("unexpected page state: {err}")))
    }

    async fn read_value(&self, element: &ElementHandle) -> DriverResult<String> {
        let value = self.call_on(element, READ_VALUE_JS, Vec::new()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let launched = self.browser.lock().await.take();
        if let Some(mut browser) = launched {
            let _ = self.client.call_with_timeout("Browser.close", json!({}), Duration::from_secs(2)).await;
            if tokio::time::timeout(Duration::from_secs(3), browser.child.wait())
                .await
                .is_err()
            {
                let _ = browser.child.start_kill();
            }
        }
        self.client.close().await;
        info!("page driver closed");
        Ok(())
    }
}

fn script_result(reply: Value) -> DriverResult<Value> {
    if let Some(details) = reply.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("script exception")
            .to_string();
        return Err(DriverError::Script(message));
    }
    Ok(reply.pointer("/result/value").cloned().unwrap_or(Value::Null))
}

fn key_codes(key: &str) -> (String, i64, Option<&'static str>) {
    match key {
        "Enter" => ("Enter".to_string(), 13, Some("\r")),
        "Tab" => ("Tab".to_string(), 9, None),
        "Escape" => ("Escape".to_string(), 27, None),
        "Backspace" => ("Backspace".to_string(), 8, None),
        " " | "Space" => ("Space".to_string(), 32, Some(" ")),
        "ArrowDown" => ("ArrowDown".to_string(), 40, None),
        "ArrowUp" => ("ArrowUp".to_string(), 38, None),
        "ArrowLeft" => ("ArrowLeft".to_string(), 37, None),
        "ArrowRight" => ("ArrowRight".to_string(), 39, None),
        other => {
            let upper = other.chars().next().map(|c| c.to_ascii_uppercase() as i64).unwrap_or(0);
            (format!("Key{}", other.to_ascii_uppercase()), upper, None)
        }
    }
}

fn screenshot_path(dir: &Path, label: &str, millis: i64) -> PathBuf {
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{safe}_{millis}.png"))
}

async fn launch_browser(options: &ChromeOptions) -> DriverResult<LaunchedBrowser> {
    let binary = match options.browser_path.clone() {
        Some(path) => path,
        None => BROWSER_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| DriverError::Launch("no Chrome or Chromium binary on PATH".to_string()))?,
    };
    let port = endpoint_port(&options.endpoint).unwrap_or(9222);
    let profile = tempfile::Builder::new().prefix("starlight-profile").tempdir()?;

    let mut command = Command::new(&binary);
    command
        .arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", profile.path().display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-networking");
    if options.headless {
        command.arg("--headless=new");
    }
    command
        .arg("about:blank")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|err| DriverError::Launch(format!("{}: {err}", binary.display())))?;
    info!(browser = %binary.display(), port, headless = options.headless, "browser launched");
    Ok(LaunchedBrowser {
        child,
        _profile: profile,
    })
}

fn endpoint_port(endpoint: &str) -> Option<u16> {
    endpoint
        .trim_end_matches('/')
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
}

/// Find the first page target, opening one if the browser has none.
async fn discover_page_socket(endpoint: &str) -> DriverResult<String> {
    let http = reqwest::Client::new();
    let base = endpoint.trim_end_matches('/');
    let started = Instant::now();
    let connection_failed = |reason: String| DriverError::ConnectionFailed {
        url: base.to_string(),
        reason,
    };

    let targets: Vec<Value> = loop {
        match http.get(format!("{base}/json/list")).send().await {
            Ok(response) => match response.json().await {
                Ok(targets) => break targets,
                Err(err) => return Err(connection_failed(err.to_string())),
            },
            Err(err) if started.elapsed() < DISCOVERY_TIMEOUT => {
                debug!(error = %err, "DevTools endpoint not ready yet");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(err) => return Err(connection_failed(err.to_string())),
        }
    };

    let socket = targets
        .iter()
        .find(|t| t.get("type").and_then(Value::as_str) == Some("page"))
        .and_then(|t| t.get("webSocketDebuggerUrl"))
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(socket) = socket {
        return Ok(socket);
    }

    let created: Value = http
        .put(format!("{base}/json/new?about:blank"))
        .send()
        .await
        .map_err(|err| connection_failed(err.to_string()))?
        .json()
        .await
        .map_err(|err| connection_failed(err.to_string()))?;
    created
        .get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| connection_failed("browser exposes no page target".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_port_parsing() {
        assert_eq!(endpoint_port("http://127.0.0.1:9333/"), Some(9333));
        assert_eq!(endpoint_port("http://localhost"), None);
    }

    #[test]
    fn screenshot_names_are_filesystem_safe() {
        let path = screenshot_path(Path::new("/tmp/shots"), "before click #7", 42);
        assert_eq!(path, PathBuf::from("/tmp/shots/before_click__7_42.png"));
    }

    #[test]
    fn script_exceptions_become_errors() {
        let reply = json!({"exceptionDetails": {"text": "Uncaught", "exception": {"description": "boom"}}});
        assert!(matches!(script_result(reply), Err(DriverError::Script(m)) if m == "boom"));
        let ok = json!({"result": {"type": "number", "value": 3}});
        assert_eq!(script_result(ok).unwrap(), json!(3));
    }

    #[test]
    fn named_keys_map_to_virtual_codes() {
        assert_eq!(key_codes("Enter").1, 13);
        assert_eq!(key_codes("a").0, "KeyA");
    }
}
