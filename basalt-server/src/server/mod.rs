mod block;
mod manager;

use crate::config::{BlockConfig, Config, ManagerConfig};
use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use basalt_core::cluster::rpc::{Ack, PollQuery, URI_POLL};
use basalt_core::operations::{InternalBlockOperation, TransferBlockOperation};
use basalt_core::{
    AllocatorConfig, BasaltError, BlockAllocator, BlockStore, ClusterClient, ErrorKind,
    ErrorResponse, FailureDetector, FailureDetectorConfig, LogStore, ManagerStateStore,
    RETRY_QUEUE_LIMIT, Result, ReplicatedValueStore, ServiceRole, ValueStoreConfig,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub struct ManagerServices {
    pub value_store: Arc<ReplicatedValueStore>,
    pub allocator: Arc<BlockAllocator>,
}

pub struct BlockServices {
    pub internal: InternalBlockOperation,
    pub transfer: TransferBlockOperation,
}

pub struct ServerState {
    pub manager: Option<ManagerServices>,
    pub block: Option<BlockServices>,
    terminal: AtomicBool,
}

impl ServerState {
    fn manager(&self) -> Result<&ManagerServices> {
        self.manager
            .as_ref()
            .ok_or_else(|| BasaltError::Protocol("manager role is not enabled".to_string()))
    }

    fn block(&self) -> Result<&BlockServices> {
        self.block
            .as_ref()
            .ok_or_else(|| BasaltError::Protocol("block role is not enabled".to_string()))
    }

    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// Turns a handler result into a response. A fatal error leaves the
    /// server refusing every later request.
    fn respond<T: Serialize>(&self, result: Result<T>) -> Response {
        match result {
            Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Err(error) => {
                let kind = error.kind();
                if kind == ErrorKind::Fatal && !self.terminal.swap(true, Ordering::SeqCst) {
                    tracing::error!("entering terminal state: {}", error);
                } else if kind == ErrorKind::Internal {
                    tracing::warn!("request failed: {}", error);
                }
                response_error(kind, error.to_string())
            }
        }
    }

    fn ack(&self, result: Result<()>) -> Response {
        self.respond(result.map(|_| Ack::ok()))
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Connection | ErrorKind::Quorum | ErrorKind::Fatal => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Corruption => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Protocol => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn response_error(kind: ErrorKind, error: String) -> Response {
    (status_for(kind), Json(ErrorResponse { kind, error })).into_response()
}

async fn reject_when_terminal(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.is_terminal() {
        return response_error(
            ErrorKind::Fatal,
            "server is in a terminal error state".to_string(),
        );
    }
    next.run(request).await
}

pub async fn run_server(config: Config) -> Result<()> {
    let advertise = config.node.effective_address();
    tokio::fs::create_dir_all(&config.node.data_dir).await?;

    let client = ClusterClient::with_timeout(config.heartbeat.request_timeout())?;

    let manager = match &config.manager {
        Some(manager_config) => {
            Some(start_manager(&config, manager_config, &advertise, &client).await?)
        }
        None => None,
    };

    let block = match &config.block {
        Some(block_config) => Some(start_block(&config, block_config, &advertise, &client).await?),
        None => None,
    };

    let state = Arc::new(ServerState {
        manager,
        block,
        terminal: AtomicBool::new(false),
    });

    let app = Router::new()
        .route(URI_POLL, get(poll))
        .merge(manager::routes())
        .merge(block::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            reject_when_terminal,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!(
        "Server listening on {} advertise={}",
        config.node.bind_addr,
        advertise
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(block_config) = &config.block {
        deregister_block_server(&client, block_config, &advertise).await;
    }

    Ok(())
}

async fn start_manager(
    config: &Config,
    manager_config: &ManagerConfig,
    advertise: &str,
    client: &ClusterClient,
) -> Result<ManagerServices> {
    let data_dir = &config.node.data_dir;
    let state_store = Arc::new(ManagerStateStore::open(data_dir.join("manager.db"))?);
    match state_store.unique_id()? {
        Some(stored) if stored != manager_config.unique_id => {
            return Err(BasaltError::Config(format!(
                "unique_id {} does not match the stored unique_id {}",
                manager_config.unique_id, stored
            )));
        }
        Some(_) => {}
        None => state_store.set_unique_id(manager_config.unique_id)?,
    }

    let detector = Arc::new(FailureDetector::new(
        FailureDetectorConfig {
            poll_interval: config.heartbeat.poll_interval(),
            report_throttle: config.heartbeat.report_throttle(),
            ..FailureDetectorConfig::default()
        },
        Arc::new(client.clone()),
    ));

    let log = Arc::new(LogStore::open(data_dir.join("log.db"))?);
    let value_store = Arc::new(ReplicatedValueStore::new(
        ValueStoreConfig {
            local_address: advertise.to_string(),
            members: manager_config.members.clone(),
            retry_queue_limit: RETRY_QUEUE_LIMIT,
        },
        log,
        Arc::new(client.clone()),
        detector.clone(),
    ));

    let allocator = Arc::new(BlockAllocator::new(
        AllocatorConfig {
            unique_id: manager_config.unique_id,
            check_interval: Duration::from_secs(manager_config.check_interval_secs),
        },
        value_store.clone(),
        detector.clone(),
        state_store.clone(),
        Arc::new(client.clone()),
    ));

    for server in state_store.block_servers()? {
        detector.track(&server.address, ServiceRole::Block).await;
    }

    if value_store.init().await? {
        tracing::info!("manager log synchronized members={}", value_store.members().len());
    } else {
        tracing::warn!("manager log not yet synchronized with a majority; will retry");
    }

    detector.clone().start();
    value_store.clone().start();
    allocator.clone().start();

    Ok(ManagerServices {
        value_store,
        allocator,
    })
}

async fn start_block(
    config: &Config,
    block_config: &BlockConfig,
    advertise: &str,
    client: &ClusterClient,
) -> Result<BlockServices> {
    let store = Arc::new(BlockStore::new(config.node.data_dir.clone())?);
    let internal = InternalBlockOperation::new(store.clone());
    let transfer = TransferBlockOperation::new(store, internal.clone(), Arc::new(client.clone()));

    spawn_registration(client.clone(), block_config.clone(), advertise.to_string());

    Ok(BlockServices { internal, transfer })
}

/// Registers with every manager, retrying the ones not yet reached.
fn spawn_registration(client: ClusterClient, block_config: BlockConfig, advertise: String) {
    tokio::spawn(async move {
        let mut pending = block_config.managers.clone();
        let mut interval =
            tokio::time::interval(Duration::from_secs(block_config.register_retry_secs.max(1)));

        while !pending.is_empty() {
            interval.tick().await;

            let mut still_pending = Vec::new();
            for manager in pending {
                match client
                    .register_block_server(&manager, &advertise, block_config.server_guid)
                    .await
                {
                    Ok(()) => tracing::info!(
                        "registered with manager manager={} server_guid={}",
                        manager,
                        block_config.server_guid
                    ),
                    Err(error) => {
                        tracing::debug!("registration with {} failed: {}", manager, error);
                        still_pending.push(manager);
                    }
                }
            }
            pending = still_pending;
        }
    });
}

async fn deregister_block_server(client: &ClusterClient, block_config: &BlockConfig, advertise: &str) {
    for manager in &block_config.managers {
        if let Err(error) = client.deregister_block_server(manager, advertise).await {
            tracing::warn!("deregistration with {} failed: {}", manager, error);
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn poll(State(state): State<Arc<ServerState>>, Query(query): Query<PollQuery>) -> Response {
    let serves = match query.tag.as_deref() {
        None => true,
        Some("manager") => state.manager.is_some(),
        Some("block") => state.block.is_some(),
        Some(_) => false,
    };

    if serves {
        state.ack(Ok(()))
    } else {
        let tag = query.tag.unwrap_or_default();
        state.ack(Err(BasaltError::Protocol(format!(
            "role '{}' is not served here",
            tag
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_state() -> ServerState {
        ServerState {
            manager: None,
            block: None,
            terminal: AtomicBool::new(false),
        }
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let state = bare_state();

        let response = state.respond::<Ack>(Err(BasaltError::connection("m1:7000", "refused")));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = state.respond::<Ack>(Err(BasaltError::InvalidRequest("bad".to_string())));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.is_terminal());
    }

    #[test]
    fn fatal_error_is_terminal() {
        let state = bare_state();
        let full = std::io::Error::from(std::io::ErrorKind::StorageFull);
        let response = state.respond::<Ack>(Err(BasaltError::from(full)));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.is_terminal());
    }
}
