//! Shared state, routing and the listener loop.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use lxd_shim_core::{OperationClass, ServerConfig};
use lxd_shim_session::{ChannelRegistry, Launcher, OperationRegistry, PtyLauncher};

use crate::actions::{CommandRunner, SystemRunner};
use crate::events::{best_effort, EventBus};
use crate::handlers::{events, instances, operations};
use crate::response::OperationMetadata;
use crate::sessions::SessionTable;

const NEVER_ATTACHED: &str = "session never attached";

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration
    pub config: Arc<ServerConfig>,
    /// Tracked operations
    pub operations: Arc<OperationRegistry>,
    /// Channels of interactive operations
    pub channels: Arc<ChannelRegistry>,
    /// Live sessions
    pub sessions: SessionTable,
    /// Notification fan-out
    pub events: EventBus,
    /// Starts exec/console sessions
    pub launcher: Arc<dyn Launcher>,
    /// Runs instance action tools
    pub runner: Arc<dyn CommandRunner>,
}

impl AppState {
    /// State backed by the real LXC tools.
    pub fn new(config: ServerConfig) -> Self {
        let launcher = Arc::new(PtyLauncher::new(config.tools.clone()));
        Self::with_backends(config, launcher, Arc::new(SystemRunner))
    }

    /// State with explicit launcher and tool runner.
    pub fn with_backends(
        config: ServerConfig,
        launcher: Arc<dyn Launcher>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            sessions: SessionTable::new(config.sessions.max_sessions),
            events: EventBus::new(config.events.clone()),
            operations: Arc::new(OperationRegistry::new()),
            channels: Arc::new(ChannelRegistry::new()),
            config: Arc::new(config),
            launcher,
            runner,
        }
    }

    /// Fail interactive operations whose data channel was never attached
    /// within `operations.attach_timeout_secs`, dropping their channels.
    pub fn expire_unattached(&self) -> usize {
        let timeout = self.config.operations.attach_timeout_secs;
        if timeout == 0 {
            return 0;
        }
        let age = i64::try_from(timeout)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);

        let mut expired = 0;
        for operation in self.operations.running_older_than(OperationClass::Websocket, age) {
            let id = operation.id;
            if self.sessions.contains(&id) {
                continue;
            }
            let channel = match self.channels.get(&id) {
                Ok(channel) if channel.data_claimed => continue,
                Ok(channel) => Some(channel),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    debug!("Channel for operation {} not inspected: {}", id, e);
                    continue;
                }
            };

            let failed = match self.operations.fail(&id, NEVER_ATTACHED) {
                Ok(failed) => failed,
                Err(e) => {
                    debug!("Operation {} not expired: {}", id, e);
                    continue;
                }
            };
            // An attach that raced the expiry must not outlive its operation
            self.sessions.cancel(&id);

            let metadata = OperationMetadata::new(
                &failed,
                channel.as_ref(),
                &self.events.settings().location,
            );
            best_effort("operation", self.events.operation(metadata));
            match self.channels.delete(&id) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => debug!("Channel for operation {} not removed: {}", id, e),
            }
            info!("Operation {} expired: {}", id, NEVER_ATTACHED);
            expired += 1;
        }
        expired
    }

    /// Expire unattached sessions, then remove operations finished longer
    /// ago than the retention window together with their channels.
    pub fn prune(&self) -> usize {
        self.expire_unattached();

        let retention = i64::try_from(self.config.operations.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let pruned = self.operations.prune_finished(retention);
        for id in &pruned {
            match self.channels.delete(id) {
                Ok(_) => {}
                // Task operations never had a channel
                Err(e) if e.is_not_found() => {}
                Err(e) => debug!("Channel for operation {} not removed: {}", id, e),
            }
        }
        pruned.len()
    }
}

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/1.0/events", get(events::subscribe))
        .route("/1.0/instances/{name}/state", put(instances::change_state))
        .route("/1.0/instances/{name}/exec", post(instances::exec))
        .route("/1.0/instances/{name}/console", post(instances::console))
        .route("/1.0/operations", get(operations::list))
        .route(
            "/1.0/operations/{id}",
            get(operations::get).delete(operations::delete),
        )
        .route("/1.0/operations/{id}/websocket", get(operations::websocket))
        .with_state(state)
}

/// Periodically expire finished operations.
pub fn spawn_reaper(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.operations.prune_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let pruned = state.prune();
            if pruned > 0 {
                debug!("Reaper removed {} finished operations", pruned);
            }
        }
    })
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let reaper = spawn_reaper(state.clone());
    info!("Listening on {}", listener.local_addr()?);

    let result = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    reaper.abort();
    result
}
