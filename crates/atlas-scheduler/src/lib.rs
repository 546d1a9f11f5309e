//! `atlas-scheduler` — durable, crash-safe job execution.
//!
//! The [`service::JobService`] validates and persists job definitions; the
//! [`engine::Scheduler`] drives them: a serialized 30-second tick reclaims
//! abandoned runs, enqueues due jobs idempotently, and executes at most one
//! claimed run under a refreshed lease. Prompt jobs are dispatched through a
//! [`engine::PromptRunner`] supplied by the composition root, which keeps
//! this crate independent of the conversation engine.

pub mod engine;
pub mod service;

pub use engine::{PromptRunner, Scheduler};
pub use service::{JobService, JobSpec, JobUpdate};
