//! `atlas-agent` — the conversation engine.
//!
//! Drives a tool-using language model over persisted thread state: system
//! prompt assembly with best-effort memory recall, a bounded tool-call loop,
//! streamed deltas and tool events, and durable persistence of the exchange.
//! Also home of the tool set the model sees and the thread-title handler.

pub mod openai;
pub mod prompt;
pub mod provider;
pub mod service;
pub mod stream;
pub mod title;
pub mod tools;

pub use provider::{ChatRequest, LmClient, LmEvent, ToolDefinition, ToolInvocation};
pub use service::AgentService;
pub use stream::{RunStream, StreamEvent};
pub use title::TitleHandler;
