//! Page construction from configuration.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use starlight_driver::{
    CdpPage, ChromeOptions, DomNode, DriverAction, DriverError, DriverResult, ElementHandle, PageDriver,
    PageState, ScreenshotRef,
};
use tracing::info;

use crate::config::{DriverKind, DriverSettings};

/// Open the page the hub will drive.
pub async fn open_page(settings: &DriverSettings, screenshots: &Path) -> Result<Arc<dyn PageDriver>> {
    match settings.kind {
        DriverKind::None => {
            info!("Running without a browser; page actions will fail");
            Ok(Arc::new(NullPage::default()))
        }
        DriverKind::Cdp => {
            let options = ChromeOptions {
                endpoint: settings.endpoint.clone(),
                ws_url: settings.ws_url.clone(),
                launch: settings.launch,
                browser_path: settings.browser_path.clone(),
                headless: settings.headless,
                screenshot_dir: screenshots.to_path_buf(),
            };
            let page = CdpPage::connect(options)
                .await
                .context("connecting to the browser")?;
            Ok(Arc::new(page))
        }
    }
}

/// Page for headless hub runs (protocol testing, dry runs). It remembers the
/// last navigation and has no elements.
#[derive(Debug, Default)]
pub struct NullPage {
    url: Mutex<String>,
}

impl NullPage {
    fn current_url(&self) -> String {
        self.url.lock().map(|url| url.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PageDriver for NullPage {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        if let Ok(mut current) = self.url.lock() {
            *current = url.to_string();
        }
        Ok(())
    }

    async fn locate(&self, _selector: &str) -> DriverResult<Option<ElementHandle>> {
        Ok(None)
    }

    async fn act(&self, _element: Option<&ElementHandle>, action: &DriverAction) -> DriverResult<()> {
        Err(DriverError::Protocol(format!("no browser attached for {}", action.name())))
    }

    async fn snapshot(&self, label: &str) -> DriverResult<ScreenshotRef> {
        Ok(ScreenshotRef {
            label: label.to_string(),
            path: None,
            taken_at: Utc::now(),
        })
    }

    async fn dom_tree(&self) -> DriverResult<DomNode> {
        Ok(DomNode::element("html").child(DomNode::element("body")))
    }

    async fn page_state(&self) -> DriverResult<PageState> {
        Ok(PageState {
            url: self.current_url(),
            ..PageState::default()
        })
    }

    async fn read_value(&self, element: &ElementHandle) -> DriverResult<String> {
        Err(DriverError::Detached(element.selector.clone()))
    }

    async fn close(&self) -> DriverResult<()> {
        Ok(())
    }
}
