use std::sync::Arc;

use chrono::{Local, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use atlas_core::{bus::topics, Error, EventBus, Result};
use atlas_memory::MemoryService;
use atlas_store::{Message, MessageDoc, Role, Store, Usage};

use crate::prompt::build_system_prompt;
use crate::provider::{ChatRequest, LmClient, LmEvent, ToolInvocation};
use crate::stream::{RunStream, StreamEvent};
use crate::tools::{to_definitions, Tool, ToolResult};

const EVENT_BUFFER: usize = 64;

/// The conversation engine: one public operation, `run_stream`.
pub struct AgentService {
    store: Arc<Store>,
    memory: Arc<MemoryService>,
    lm: Arc<dyn LmClient>,
    tools: Vec<Arc<dyn Tool>>,
    bus: Arc<EventBus>,
    model: String,
    max_iterations: u32,
}

impl AgentService {
    pub fn new(
        store: Arc<Store>,
        memory: Arc<MemoryService>,
        lm: Arc<dyn LmClient>,
        tools: Vec<Arc<dyn Tool>>,
        bus: Arc<EventBus>,
        model: String,
        max_iterations: u32,
    ) -> Self {
        Self {
            store,
            memory,
            lm,
            tools,
            bus,
            model,
            max_iterations,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Drive one exchange on `thread_id`. Returns immediately with the
    /// stream handle; the work happens on a background task. Dropping the
    /// event receiver cancels the run; a cancelled run persists nothing
    /// beyond what the consumer already saw completed.
    pub fn run_stream(self: &Arc<Self>, thread_id: i64, user_message: String) -> RunStream {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let service = self.clone();

        tokio::spawn(async move {
            let result = service.drive(thread_id, user_message, &events_tx).await;
            if let Err(e) = &result {
                warn!(thread_id, error = %e, "run ended with error");
            }
            // Close the event stream before resolving the outcome so the
            // consumer observes every event first.
            drop(events_tx);
            let _ = outcome_tx.send(result);
        });

        RunStream {
            thread_id,
            model: self.model.clone(),
            events: events_rx,
            outcome: outcome_rx,
        }
    }

    async fn drive(
        &self,
        thread_id: i64,
        user_message: String,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<Option<Usage>> {
        // The user's input is durable before any remote call is made.
        self.store.add_message(
            thread_id,
            &MessageDoc::new(Role::User, user_message.clone()),
            None,
            Utc::now(),
        )?;

        let persisted = self.store.list_messages(thread_id)?;
        let non_system = persisted
            .iter()
            .filter(|m| m.role != Role::System)
            .count();
        if non_system == 1 {
            self.write_system_prompt(thread_id, &user_message).await?;
        }

        let mut wire = to_wire(&self.store.list_messages(thread_id)?);
        let defs = to_definitions(&self.tools);

        let mut full_text = String::new();
        let mut usage_total: Option<Usage> = None;
        let mut iteration = 0u32;

        let finish_reason = loop {
            if iteration >= self.max_iterations {
                warn!(thread_id, max_iterations = self.max_iterations, "tool loop hit its bound");
                break "max_iterations".to_string();
            }
            iteration += 1;
            debug!(thread_id, iteration, "model turn");

            let request = ChatRequest::new(&self.model, wire.clone()).with_tools(defs.clone());
            let lm = self.lm.clone();
            let (lm_tx, mut lm_rx) = mpsc::channel(EVENT_BUFFER);
            let call =
                tokio::spawn(async move { lm.stream_chat(&request, lm_tx).await });

            let mut turn_text = String::new();
            let mut turn_calls: Vec<ToolInvocation> = Vec::new();
            let mut finish = String::from("stop");

            while let Some(event) = lm_rx.recv().await {
                match event {
                    LmEvent::Delta(text) => {
                        turn_text.push_str(&text);
                        full_text.push_str(&text);
                        if events.send(StreamEvent::Delta { text }).await.is_err() {
                            call.abort();
                            return Err(cancelled());
                        }
                    }
                    LmEvent::ToolCalls(calls) => turn_calls = calls,
                    LmEvent::Usage(usage) => {
                        usage_total = Some(merge_usage(usage_total, usage));
                    }
                    LmEvent::Done { finish_reason } => finish = finish_reason,
                }
            }

            match call.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if full_text.is_empty() {
                        // Nothing was shown, so nothing is persisted.
                        return Err(e);
                    }
                    // The user already saw this text; reloading the thread
                    // must match it. Persisted without usage.
                    self.store.add_message(
                        thread_id,
                        &MessageDoc::new(Role::Assistant, full_text.clone()),
                        Some(&self.model),
                        Utc::now(),
                    )?;
                    return Err(e);
                }
                Err(join_err) => {
                    return Err(Error::internal(format!("model task failed: {join_err}")))
                }
            }

            if turn_calls.is_empty() {
                break finish;
            }

            // Record the assistant's tool-call turn, run the tools, feed the
            // results back, and go around again. These turns are ephemeral:
            // they live in the wire list for this run only.
            wire.push(json!({
                "role": "assistant",
                "content": if turn_text.is_empty() { serde_json::Value::Null } else { json!(turn_text) },
                "tool_calls": turn_calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments},
                })).collect::<Vec<_>>(),
            }));

            for tool_call in &turn_calls {
                let sent = events
                    .send(StreamEvent::ToolCall {
                        call_id: tool_call.id.clone(),
                        name: tool_call.name.clone(),
                        arguments: tool_call.arguments.clone(),
                    })
                    .await;
                if sent.is_err() {
                    return Err(cancelled());
                }

                let result = self.execute_tool(tool_call).await;
                let sent = events
                    .send(StreamEvent::ToolResult {
                        call_id: tool_call.id.clone(),
                        name: tool_call.name.clone(),
                        output: result.content.clone(),
                    })
                    .await;
                if sent.is_err() {
                    return Err(cancelled());
                }

                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call.id,
                    "content": result.content,
                }));
            }
        };

        self.store.add_message(
            thread_id,
            &MessageDoc::new(Role::Assistant, full_text).with_usage(usage_total),
            Some(&self.model),
            Utc::now(),
        )?;

        self.bus.publish(topics::RESPONSE_COMPLETE, json!(thread_id));
        info!(thread_id, finish_reason = %finish_reason, "run complete");
        Ok(usage_total)
    }

    /// First exchange only: base instructions, wall clock, and whatever
    /// recall finds. Recall is best-effort; an embeddings outage must not
    /// abort the conversation.
    async fn write_system_prompt(&self, thread_id: i64, user_message: &str) -> Result<()> {
        let recalled = match self.memory.recall(user_message, 10).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(thread_id, error = %e, "recall failed, system prompt proceeds without memories");
                Vec::new()
            }
        };
        let text = build_system_prompt(Local::now(), &recalled);
        self.store
            .add_message(thread_id, &MessageDoc::new(Role::System, text), None, Utc::now())?;
        Ok(())
    }

    async fn execute_tool(&self, call: &ToolInvocation) -> ToolResult {
        let started = std::time::Instant::now();
        let args: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

        let result = match self.tools.iter().find(|t| t.name() == call.name) {
            Some(tool) => tool.execute(args).await,
            None => ToolResult::error(format!("unknown tool: {}", call.name)),
        };

        info!(
            call_id = %call.id,
            tool = %call.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_error = result.is_error,
            "tool executed"
        );
        result
    }
}

fn cancelled() -> Error {
    Error::internal("stream consumer dropped, run cancelled")
}

fn merge_usage(total: Option<Usage>, turn: Usage) -> Usage {
    match total {
        None => turn,
        Some(t) => Usage {
            input_tokens: t.input_tokens + turn.input_tokens,
            output_tokens: t.output_tokens + turn.output_tokens,
            total_tokens: t.total_tokens + turn.total_tokens,
        },
    }
}

/// Persisted messages → LM wire format. The system message leads regardless
/// of its row id (it is written after the first user message); tool-role
/// rows are never replayed.
fn to_wire(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut wire = Vec::with_capacity(messages.len());
    for message in messages.iter().filter(|m| m.role == Role::System) {
        wire.push(json!({"role": "system", "content": message.doc.content}));
    }
    for message in messages {
        match message.role {
            Role::System | Role::Tool => continue,
            Role::User => wire.push(json!({"role": "user", "content": message.doc.content})),
            Role::Assistant => {
                wire.push(json!({"role": "assistant", "content": message.doc.content}))
            }
        }
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::BASE_INSTRUCTIONS;
    use crate::tools::memory::{RecallTool, RememberTool};
    use async_trait::async_trait;
    use atlas_memory::Embedder;
    use atlas_store::{ThreadSource, EMBEDDING_DIM};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let hot = text.bytes().map(|b| b as usize).sum::<usize>() % EMBEDDING_DIM;
            let mut v = vec![0.0_f32; EMBEDDING_DIM];
            v[hot] = 1.0;
            Ok(v)
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::upstream("embeddings down"))
        }
    }

    enum Turn {
        Events(Vec<LmEvent>),
        FailAfter(Vec<LmEvent>, &'static str),
    }

    struct ScriptedLm {
        turns: Mutex<VecDeque<Turn>>,
    }

    impl ScriptedLm {
        fn new(turns: Vec<Turn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
            })
        }
    }

    #[async_trait]
    impl LmClient for ScriptedLm {
        async fn stream_chat(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<LmEvent>,
        ) -> Result<()> {
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            match turn {
                Turn::Events(events) => {
                    for event in events {
                        let _ = tx.send(event).await;
                    }
                    Ok(())
                }
                Turn::FailAfter(events, message) => {
                    for event in events {
                        let _ = tx.send(event).await;
                    }
                    Err(Error::upstream(message))
                }
            }
        }

        async fn complete(&self, _req: &ChatRequest) -> Result<String> {
            Ok("Scripted Title".to_string())
        }
    }

    fn usage(input: u32, output: u32) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    }

    struct Fixture {
        store: Arc<Store>,
        memory: Arc<MemoryService>,
        bus: Arc<EventBus>,
        service: Arc<AgentService>,
    }

    fn fixture_with(lm: Arc<ScriptedLm>, embedder: Arc<dyn Embedder>) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let memory = Arc::new(MemoryService::new(store.clone(), embedder));
        let bus = Arc::new(EventBus::new());
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(RecallTool::new(memory.clone())),
            Arc::new(RememberTool::new(memory.clone())),
        ];
        let service = Arc::new(AgentService::new(
            store.clone(),
            memory.clone(),
            lm,
            tools,
            bus.clone(),
            "test-model".to_string(),
            25,
        ));
        Fixture {
            store,
            memory,
            bus,
            service,
        }
    }

    fn fixture(lm: Arc<ScriptedLm>) -> Fixture {
        fixture_with(lm, Arc::new(FakeEmbedder))
    }

    async fn collect(stream: &mut RunStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn first_message_chat_persists_the_full_exchange() {
        let lm = ScriptedLm::new(vec![Turn::Events(vec![
            LmEvent::Delta("Hel".into()),
            LmEvent::Delta("lo!".into()),
            LmEvent::Usage(usage(12, 4)),
            LmEvent::Done {
                finish_reason: "stop".into(),
            },
        ])]);
        let f = fixture(lm);
        let thread = f
            .store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();
        let mut completions = f.bus.subscribe(topics::RESPONSE_COMPLETE);

        let mut stream = f.service.run_stream(thread.id, "hello".into());
        let events = collect(&mut stream).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Delta { text } if text == "Hel"));

        let outcome = stream.outcome.await.unwrap().unwrap();
        assert_eq!(outcome, Some(usage(12, 4)));

        let messages = f.store.list_messages(thread.id).unwrap();
        assert_eq!(messages.len(), 3);
        let system: Vec<_> = messages.iter().filter(|m| m.role == Role::System).collect();
        assert_eq!(system.len(), 1);
        assert!(system[0].doc.content.starts_with(BASE_INSTRUCTIONS));
        let user: Vec<_> = messages.iter().filter(|m| m.role == Role::User).collect();
        assert_eq!(user[0].doc.content, "hello");
        let assistant: Vec<_> = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        assert_eq!(assistant[0].doc.content, "Hello!");
        assert_eq!(assistant[0].doc.usage, Some(usage(12, 4)));
        assert_eq!(assistant[0].model.as_deref(), Some("test-model"));

        assert_eq!(completions.recv().await.unwrap(), json!(thread.id));
    }

    #[tokio::test]
    async fn tool_using_reply_streams_calls_and_results_in_order() {
        let lm = ScriptedLm::new(vec![
            Turn::Events(vec![
                LmEvent::ToolCalls(vec![ToolInvocation {
                    id: "call_1".into(),
                    name: "recall".into(),
                    arguments: r#"{"query": "name"}"#.into(),
                }]),
                LmEvent::Done {
                    finish_reason: "tool_calls".into(),
                },
            ]),
            Turn::Events(vec![
                LmEvent::ToolCalls(vec![ToolInvocation {
                    id: "call_2".into(),
                    name: "remember".into(),
                    arguments: r#"{"content": "user's name is Alex"}"#.into(),
                }]),
                LmEvent::Done {
                    finish_reason: "tool_calls".into(),
                },
            ]),
            Turn::Events(vec![
                LmEvent::Delta("Got it, Alex!".into()),
                LmEvent::Usage(usage(40, 9)),
                LmEvent::Done {
                    finish_reason: "stop".into(),
                },
            ]),
        ]);
        let f = fixture(lm);
        let thread = f
            .store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();

        let mut stream = f
            .service
            .run_stream(thread.id, "remember that my name is Alex".into());
        let events = collect(&mut stream).await;

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                StreamEvent::Delta { .. } => "delta",
                StreamEvent::ToolCall { .. } => "tool_call",
                StreamEvent::ToolResult { .. } => "tool_result",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["tool_call", "tool_result", "tool_call", "tool_result", "delta"]
        );
        match &events[2] {
            StreamEvent::ToolCall { name, call_id, .. } => {
                assert_eq!(name, "remember");
                assert_eq!(call_id, "call_2");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(stream.outcome.await.unwrap().is_ok());

        // Exactly one memory containing the name was stored.
        let memories = f.memory.list().unwrap();
        assert_eq!(memories.len(), 1);
        assert!(memories[0].content.contains("Alex"));

        // Tool turns were not persisted: system + user + assistant only.
        let messages = f.store.list_messages(thread.id).unwrap();
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn upstream_error_before_any_delta_persists_no_assistant_message() {
        let lm = ScriptedLm::new(vec![Turn::FailAfter(vec![], "model offline")]);
        let f = fixture(lm);
        let thread = f
            .store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();

        let mut stream = f.service.run_stream(thread.id, "hello".into());
        let events = collect(&mut stream).await;
        assert!(events.is_empty());

        let outcome = stream.outcome.await.unwrap();
        assert!(matches!(outcome, Err(Error::Upstream(_))));

        let messages = f.store.list_messages(thread.id).unwrap();
        assert!(messages.iter().all(|m| m.role != Role::Assistant));
        // The user's message survived the failure.
        assert!(messages.iter().any(|m| m.role == Role::User));
    }

    #[tokio::test]
    async fn midstream_error_persists_partial_text_without_usage() {
        let lm = ScriptedLm::new(vec![Turn::FailAfter(
            vec![LmEvent::Delta("partial answ".into())],
            "connection reset",
        )]);
        let f = fixture(lm);
        let thread = f
            .store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();

        let mut stream = f.service.run_stream(thread.id, "hello".into());
        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);

        assert!(stream.outcome.await.unwrap().is_err());

        let messages = f.store.list_messages(thread.id).unwrap();
        let assistant = messages
            .iter()
            .find(|m| m.role == Role::Assistant)
            .expect("partial reply persisted");
        assert_eq!(assistant.doc.content, "partial answ");
        assert!(assistant.doc.usage.is_none());
    }

    #[tokio::test]
    async fn recall_outage_degrades_to_base_instructions() {
        let lm = ScriptedLm::new(vec![Turn::Events(vec![
            LmEvent::Delta("hi".into()),
            LmEvent::Done {
                finish_reason: "stop".into(),
            },
        ])]);
        let f = fixture_with(lm, Arc::new(BrokenEmbedder));
        let thread = f
            .store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();

        let mut stream = f.service.run_stream(thread.id, "hello".into());
        collect(&mut stream).await;
        assert!(stream.outcome.await.unwrap().is_ok());

        let messages = f.store.list_messages(thread.id).unwrap();
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .expect("system prompt written despite recall outage");
        assert!(system.doc.content.starts_with(BASE_INSTRUCTIONS));
        assert!(!system.doc.content.contains("Relevant context from memory"));
    }

    #[tokio::test]
    async fn system_prompt_is_written_once_and_frozen() {
        let lm = ScriptedLm::new(vec![
            Turn::Events(vec![
                LmEvent::Delta("first".into()),
                LmEvent::Done {
                    finish_reason: "stop".into(),
                },
            ]),
            Turn::Events(vec![
                LmEvent::Delta("second".into()),
                LmEvent::Done {
                    finish_reason: "stop".into(),
                },
            ]),
        ]);
        let f = fixture(lm);
        let thread = f
            .store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();

        let mut stream = f.service.run_stream(thread.id, "hello".into());
        collect(&mut stream).await;
        stream.outcome.await.unwrap().unwrap();
        let first_system = f
            .store
            .list_messages(thread.id)
            .unwrap()
            .into_iter()
            .find(|m| m.role == Role::System)
            .unwrap();

        let mut stream = f.service.run_stream(thread.id, "and again".into());
        collect(&mut stream).await;
        stream.outcome.await.unwrap().unwrap();

        let messages = f.store.list_messages(thread.id).unwrap();
        let systems: Vec<_> = messages.iter().filter(|m| m.role == Role::System).collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].doc.content, first_system.doc.content);
    }

    #[test]
    fn wire_format_puts_the_system_message_first() {
        let store = Store::open_in_memory().unwrap();
        let thread = store
            .create_thread(ThreadSource::User, None, None, Utc::now())
            .unwrap();
        store
            .add_message(thread.id, &MessageDoc::new(Role::User, "hi"), None, Utc::now())
            .unwrap();
        store
            .add_message(
                thread.id,
                &MessageDoc::new(Role::System, "instructions"),
                None,
                Utc::now(),
            )
            .unwrap();

        let wire = to_wire(&store.list_messages(thread.id).unwrap());
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn usage_accumulates_across_turns() {
        let total = merge_usage(Some(usage(10, 5)), usage(7, 3));
        assert_eq!(total, usage(17, 8));
        assert_eq!(merge_usage(None, usage(1, 1)), usage(1, 1));
    }
}
