//! Shared application state, handed to every handler via axum's `State`.

use std::sync::Arc;

use crate::config::Config;
use crate::kernel::jobs::{CodeVetter, JobStore, QueueManager, RemoteExecutor};
use crate::kernel::{Limiter, TokenStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tokens: Arc<dyn TokenStore>,
    pub limiter: Arc<Limiter>,
    pub vetter: Arc<CodeVetter>,
    pub queue: Arc<QueueManager>,
    pub jobs: Arc<dyn JobStore>,
    /// Indexed by node id; used by the cancel handler's best-effort
    /// synchronous kill when a running job's pid is already known.
    pub executors: Arc<Vec<Arc<RemoteExecutor>>>,
}
