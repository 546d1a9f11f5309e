use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use atlas_agent::AgentService;
use atlas_core::{AtlasConfig, EventBus};
use atlas_memory::MemoryService;
use atlas_scheduler::JobService;
use atlas_store::Store;

/// Central shared state — passed as `Arc<AppState>` to all handlers.
pub struct AppState {
    pub config: AtlasConfig,
    pub store: Arc<Store>,
    pub memory: Arc<MemoryService>,
    pub jobs: Arc<JobService>,
    pub agent: Arc<AgentService>,
    pub bus: Arc<EventBus>,
}

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/api/chat", post(crate::http::chat::chat_handler))
        .route("/api/events", get(crate::http::events::events_handler))
        .route("/api/threads", get(crate::http::threads::list_threads))
        .route(
            "/api/threads/{id}",
            get(crate::http::threads::get_thread).delete(crate::http::threads::delete_thread),
        )
        .route("/api/memories", get(crate::http::memories::list_memories))
        .route(
            "/api/memories/{id}",
            axum::routing::put(crate::http::memories::update_memory)
                .delete(crate::http::memories::delete_memory),
        )
        .route(
            "/api/jobs",
            post(crate::http::jobs::create_job).get(crate::http::jobs::list_jobs),
        )
        .route(
            "/api/jobs/{id}",
            get(crate::http::jobs::get_job)
                .patch(crate::http::jobs::update_job)
                .delete(crate::http::jobs::delete_job),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
