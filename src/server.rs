//! HTTP control and observability surface.
//!
//! One logical server per process, exposing the registered replicators:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/v1/replicators` | List replicators with stats |
//! | `GET`  | `/api/v1/replicators/{id}` | One replicator or 404 |
//! | `POST` | `/api/v1/replicators/{id}/{pause\|resume\|restart\|stop}` | Send a signal |
//!
//! Handlers only read state snapshots and enqueue signals; nothing here
//! can disturb a running replication loop.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::fsm;
use crate::replicator::{ReplicatorHandle, Signal};
use crate::stats::Stats;
use crate::Result;

/// Registry of running replicators, id -> handle. Lifetime matches the
/// process.
#[derive(Default)]
pub struct Registry {
    replicators: RwLock<HashMap<String, ReplicatorHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ReplicatorHandle) {
        info!(replicator_id = %handle.id(), state = %handle.state(), "replicator registered");
        self.replicators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().to_string(), handle);
    }

    pub fn unregister(&self, id: &str) {
        if self
            .replicators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
        {
            info!(replicator_id = %id, "replicator unregistered");
        }
    }

    pub fn get(&self, id: &str) -> Option<ReplicatorHandle> {
        self.replicators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ReplicatorHandle> {
        self.replicators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct ReplicatorInfo {
    pub id: String,
    pub state: fsm::State,
    pub stats: Stats,
}

impl From<&ReplicatorHandle> for ReplicatorInfo {
    fn from(handle: &ReplicatorHandle) -> Self {
        Self {
            id: handle.id().to_string(),
            state: handle.state(),
            stats: handle.stats(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ListResponse {
    replicators: Vec<ReplicatorInfo>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct SignalResponse {
    status: &'static str,
    replicator_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/api/v1/replicators", get(list_replicators))
        .route("/api/v1/replicators/{id}", get(get_replicator))
        .route("/api/v1/replicators/{id}/{action}", post(signal_replicator))
        .with_state(registry)
}

async fn list_replicators(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let replicators: Vec<ReplicatorInfo> =
        registry.list().iter().map(ReplicatorInfo::from).collect();
    let count = replicators.len();
    Json(ListResponse { replicators, count })
}

async fn get_replicator(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match registry.get(&id) {
        Some(handle) => Json(ReplicatorInfo::from(&handle)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("replicator {id} not found")),
    }
}

async fn signal_replicator(
    State(registry): State<Arc<Registry>>,
    Path((id, action)): Path<(String, String)>,
) -> axum::response::Response {
    let signal: Signal = match action.parse() {
        Ok(signal) => signal,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown action {action}; expected pause, resume, restart, or stop"),
            )
        }
    };

    let Some(handle) = registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, format!("replicator {id} not found"));
    };

    handle.signal(signal);
    Json(SignalResponse {
        status: signal.as_str(),
        replicator_id: id,
    })
    .into_response()
}

/// Serves the control API until the token is cancelled.
pub async fn serve(registry: Arc<Registry>, addr: &str, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "control server listening");

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
