//! Goal-to-selector resolution.
//!
//! [`SelectorHistory`] remembers which selector worked for a goal on a page;
//! [`SemanticResolver`] turns a natural-language goal into ranked tiers of
//! candidate selectors, consulting that history first.

pub mod history;
pub mod resolver;
pub mod variants;

pub use history::{normalize_context, normalize_goal, HistoryError, SelectorHistory, SelectorMapping};
pub use resolver::{IntentHint, Resolution, ResolutionSource, ResolverStats, SemanticResolver};
