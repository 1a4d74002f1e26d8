//! The page the hub drives.
//!
//! [`PageDriver`] is the only surface the orchestrator uses to touch a
//! browser. [`chrome::CdpPage`] implements it over the Chrome DevTools
//! Protocol; with the `test-utils` feature [`scripted::ScriptedPage`]
//! provides an in-memory page with scripted reactions.

pub mod cdp;
pub mod chrome;
mod error;
pub mod snapshot;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use chrome::{ChromeOptions, CdpPage};
pub use error::DriverError;
pub use snapshot::{blocking_elements, BlockingMatch, CompoundSelector, SnapshotNode, StructuralSnapshot};
pub use types::{DomNode, DriverAction, ElementHandle, FlatDomNode, PageState, ScreenshotRef};

use async_trait::async_trait;

pub type DriverResult<T> = Result<T, DriverError>;

/// Primitive page operations. Implementations must be safe to share behind
/// an `Arc`; the hub serialises intents so calls never overlap.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> DriverResult<()>;

    /// Find the first element matching `selector`. `Ok(None)` means the
    /// page has no such element, which is not an error.
    async fn locate(&self, selector: &str) -> DriverResult<Option<ElementHandle>>;

    /// Perform `action` on `element`, or on the page when no element applies
    /// (key presses, scrolling to the bottom).
    async fn act(&self, element: Option<&ElementHandle>, action: &DriverAction) -> DriverResult<()>;

    /// Capture the current visual state under `label`.
    async fn snapshot(&self, label: &str) -> DriverResult<ScreenshotRef>;

    /// Structural tree of the page, shadow roots included.
    async fn dom_tree(&self) -> DriverResult<DomNode>;

    async fn page_state(&self) -> DriverResult<PageState>;

    /// Current value of a form control (or text of other elements).
    async fn read_value(&self, element: &ElementHandle) -> DriverResult<String>;

    async fn close(&self) -> DriverResult<()>;
}
