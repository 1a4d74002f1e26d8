//! Starlight hub.
//!
//! The hub accepts intent clients and sentinel watchers over one WebSocket
//! listener. Sentinels prove themselves with a challenge handshake and then
//! vote on every risky action; any of them may hijack the pipeline, repair
//! the page and resume. Everything that happened ends up in the mission
//! trace, the HMAC-chained audit log and the final report.

pub mod audit;
pub mod auth;
pub mod config;
pub mod consensus;
pub mod executor;
pub mod hub;
pub mod mission;
pub mod page;
pub mod registry;
pub mod server;
pub mod trace;

pub use config::{load_config, resolve_config_path, Config};
pub use hub::{spawn_heartbeat_monitor, spawn_mission_timer, Flow, HealthReport, Hub, ShutdownCause};
pub use page::{open_page, NullPage};
pub use server::{router, serve};
