use tokio::sync::{mpsc, oneshot};

use atlas_core::Error;
use atlas_store::Usage;

/// Events observable by the consumer of one conversation run, in model
/// order. The terminal done/error framing belongs to the endpoint adapter,
/// not this stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta { text: String },
    /// The model invoked a tool.
    ToolCall {
        call_id: String,
        name: String,
        /// Raw JSON argument string.
        arguments: String,
    },
    /// The tool's human-readable output, fed back to the model.
    ToolResult {
        call_id: String,
        name: String,
        output: String,
    },
}

/// Handle to one in-flight run.
///
/// `events` is a single-consumer lazy sequence; dropping it cancels the run
/// (the LM call is aborted and nothing further is persisted). `outcome`
/// resolves exactly once, after the last event: token usage on success
/// (absent when the upstream did not report it), or the error that ended
/// the stream.
pub struct RunStream {
    pub thread_id: i64,
    pub model: String,
    pub events: mpsc::Receiver<StreamEvent>,
    pub outcome: oneshot::Receiver<Result<Option<Usage>, Error>>,
}
