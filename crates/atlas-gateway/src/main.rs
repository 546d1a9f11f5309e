use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod http;
mod runner;

use atlas_agent::{
    tools::{
        datetime::CurrentDatetimeTool,
        directions::DirectionsTool,
        fetch::FetchUrlTool,
        jobs::{CreateJobTool, DeleteJobTool, ListJobsTool, UpdateJobTool},
        memory::{RecallTool, RememberTool},
        notify::NotifyTool,
        skills::ListSkillsTool,
        Tool,
    },
    openai::OpenAiClient,
    AgentService, TitleHandler,
};
use atlas_core::{AtlasConfig, EventBus, Push, PushClient};
use atlas_memory::{MemoryService, OpenAiEmbedder};
use atlas_scheduler::{JobService, Scheduler};
use atlas_skills::{DepartureCheckSkill, DirectionsApi, GoogleDirections, SkillRegistry};
use atlas_store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first so its log level can seed the default filter.
    let config_path = std::env::var("ATLAS_CONFIG").ok();
    let config = AtlasConfig::load(config_path.as_deref())?;

    let level = match config.server.log_level.as_str() {
        // The closed config set speaks fatal..trace; tracing tops out at error.
        "fatal" => "error",
        other => other,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("atlas={level},tower_http=info").into()),
        )
        .init();

    let store = Arc::new(Store::open(&config.database.path)?);
    let bus = Arc::new(EventBus::new());
    let push: Arc<dyn Push> = Arc::new(PushClient::new(&config.push));

    let embedder = Arc::new(OpenAiEmbedder::new(
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
        config.llm.embedding_model.clone(),
    ));
    let memory = Arc::new(MemoryService::new(store.clone(), embedder));

    // Skills and the directions tool both need the directions API key.
    let directions: Option<Arc<dyn DirectionsApi>> = config
        .directions
        .api_key
        .clone()
        .map(|key| Arc::new(GoogleDirections::new(key)) as Arc<dyn DirectionsApi>);
    let mut registry = SkillRegistry::new();
    if let Some(api) = &directions {
        registry.register(Arc::new(DepartureCheckSkill::new(api.clone(), push.clone())));
    }
    let registry = Arc::new(registry);

    let jobs = Arc::new(JobService::new(store.clone(), registry.clone()));

    let lm = Arc::new(OpenAiClient::new(
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
    ));

    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(RememberTool::new(memory.clone())),
        Arc::new(RecallTool::new(memory.clone())),
        Arc::new(CurrentDatetimeTool),
        Arc::new(FetchUrlTool::new()),
        Arc::new(NotifyTool::new(push.clone())),
        Arc::new(ListJobsTool::new(jobs.clone())),
        Arc::new(CreateJobTool::new(jobs.clone())),
        Arc::new(UpdateJobTool::new(jobs.clone())),
        Arc::new(DeleteJobTool::new(jobs.clone())),
        Arc::new(ListSkillsTool::new(registry.clone())),
    ];
    if let Some(api) = &directions {
        tools.push(Arc::new(DirectionsTool::new(api.clone())));
    }

    let agent = Arc::new(AgentService::new(
        store.clone(),
        memory.clone(),
        lm.clone(),
        tools,
        bus.clone(),
        config.llm.chat_model.clone(),
        config.llm.max_iterations,
    ));

    Arc::new(TitleHandler::new(
        store.clone(),
        lm,
        bus.clone(),
        config.llm.chat_model.clone(),
    ))
    .spawn();

    let prompt_runner = Arc::new(runner::AgentPromptRunner::new(store.clone(), agent.clone()));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        prompt_runner,
        push.clone(),
        config.app_url.clone(),
    ));
    let scheduler_task = tokio::spawn(scheduler.clone().run());

    let port = config.server.port;
    let state = Arc::new(app::AppState {
        config,
        store,
        memory,
        jobs,
        agent,
        bus,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("atlas listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown order: the listener is closed, then the scheduler cancels
    // in-flight runs; anything that does not exit in time is recovered via
    // the run lease on the next start.
    scheduler.stop();
    let _ = scheduler_task.await;
    info!("atlas stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
