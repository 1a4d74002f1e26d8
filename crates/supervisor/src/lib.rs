//! Sentinel process supervision.
//!
//! Sentinels are ordinary programs in whatever language they were written
//! in. The supervisor turns a [`SentinelManifest`] into a command line,
//! spawns it with the hub address in its environment, forwards its output
//! into the hub's log and tears it down on request.

mod manifest;
mod supervisor;

pub use manifest::{Invocation, Runtime, SentinelManifest};
pub use supervisor::{LaunchReport, Supervisor, SupervisorError};

/// Environment variable sentinels read to find the hub.
pub const HUB_URL_ENV: &str = "HUB_URL";
/// Environment variable carrying the manifest name to the child.
pub const SENTINEL_NAME_ENV: &str = "STARLIGHT_SENTINEL_NAME";
