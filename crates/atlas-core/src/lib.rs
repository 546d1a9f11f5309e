//! `atlas-core` — shared foundations for the Atlas assistant server.
//!
//! Home of the error type every crate speaks, the configuration loader,
//! the in-process event bus, the push-notification client, and the cron
//! schedule helpers used by both the scheduler engine and the job tools.

pub mod bus;
pub mod config;
pub mod error;
pub mod notify;
pub mod schedule;

pub use bus::EventBus;
pub use config::AtlasConfig;
pub use error::{Error, Result};
pub use notify::{Notification, Push, PushClient};
