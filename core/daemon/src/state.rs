//! Shared handles for the HTTP and WebSocket handlers.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::connections::ConnectionManager;
use crate::error::{StoreError, StoreResult};
use crate::evaluator::EvaluatorStats;
use crate::store::TimerStore;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub store: Arc<dyn TimerStore>,
    pub connections: Arc<ConnectionManager>,
    pub stats: Arc<EvaluatorStats>,
    pub config: DaemonConfig,
    /// Cancelled once the daemon begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Runs a store operation on the blocking pool.
    pub async fn with_store<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn TimerStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| StoreError::Io {
                context: "Store task failed".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
            })?
    }
}
