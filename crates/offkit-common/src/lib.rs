//! # Offkit Common
//!
//! Shared plumbing for the offkit workspace: logging configuration and
//! wall-clock helpers. No caching or networking logic lives here.

pub mod logging;
pub mod time;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use time::epoch_millis;
