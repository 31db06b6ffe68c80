use crate::bus::{self, BusConnection, BusError};
use crate::config::Config;
use crate::dispatch::DeduplicationRegistry;
use crate::envelope::ResponseEnvelope;
use crate::handler::{RequestHandler, Router};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Route answering with the process health snapshot.
pub const STATUS_PATH: &str = "/api/dispatcher/status";

const DEDUP_COMPONENT: &str = "dedup";

/// Handler installed when no other business logic is wired in.
pub fn default_router() -> Router {
    Router::new().route("GET", STATUS_PATH, |request| {
        ResponseEnvelope::json(
            request.request_id.clone(),
            200,
            &crate::health::snapshot_json(),
        )
    })
}

/// Run every configured bus connection until Ctrl-C or a fatal error.
pub async fn run(config: Config) -> Result<()> {
    run_with_handler(config, Arc::new(default_router())).await
}

pub async fn run_with_handler(config: Config, handler: Arc<dyn RequestHandler>) -> Result<()> {
    let initial_backoff = config.reliability.initial_backoff_secs.max(1);
    let max_backoff = config.reliability.max_backoff_secs.max(initial_backoff);

    crate::health::mark_component_ok("daemon");

    let shutdown = CancellationToken::new();
    let registry = Arc::new(DeduplicationRegistry::new(
        config.dispatch.dedup_registry_capacity,
    ));
    let connections = bus::build_connections(&config, &registry, &handler);

    let state_writer = spawn_state_writer(
        config.clone(),
        connections.clone(),
        Arc::clone(&registry),
        shutdown.clone(),
    );
    let supervisors: Vec<_> = connections
        .iter()
        .map(|connection| {
            spawn_connection_supervisor(
                Arc::clone(connection),
                initial_backoff,
                max_backoff,
                shutdown.clone(),
            )
        })
        .collect();

    let names: Vec<&str> = connections.iter().map(|c| c.name()).collect();
    tracing::info!(
        connections = ?names,
        worker_pool_size = config.dispatch.worker_pool_size,
        dedup_capacity = registry.capacity(),
        "cse-bus dispatcher started; Ctrl+C to stop"
    );

    let signal = wait_for_stop(tokio::signal::ctrl_c(), &shutdown).await;
    crate::health::mark_component_status("daemon", "stopping");

    let mut fatal: Option<BusError> = None;
    for supervisor in supervisors {
        match supervisor.await {
            Ok(Err(e)) if fatal.is_none() => fatal = Some(e),
            Ok(_) => {}
            Err(e) => tracing::error!("Connection supervisor panicked: {e}"),
        }
    }
    let _ = state_writer.await;
    crate::health::mark_component_status("daemon", "stopped");

    match fatal {
        Some(e) => Err(e.into()),
        None if signal.is_err() => signal.context("Failed to listen for Ctrl-C"),
        None => {
            tracing::info!("All connections closed");
            Ok(())
        }
    }
}

/// Wait for Ctrl-C or an internal shutdown. Always leaves `shutdown` cancelled,
/// including when the signal handler cannot be installed.
async fn wait_for_stop(
    ctrl_c: impl std::future::Future<Output = std::io::Result<()>>,
    shutdown: &CancellationToken,
) -> std::io::Result<()> {
    let result = tokio::select! {
        signal = ctrl_c => {
            if signal.is_ok() {
                tracing::info!("Shutdown requested");
            }
            signal
        }
        () = shutdown.cancelled() => {
            tracing::warn!("Shutting down after a fatal connection error");
            Ok(())
        }
    };
    shutdown.cancel();
    result
}

/// Mirror pool occupancy, connection state and registry size into health.
fn refresh_health(connections: &[Arc<dyn BusConnection>], registry: &DeduplicationRegistry) {
    for connection in connections {
        crate::health::set_component_detail(
            connection.name(),
            serde_json::json!({
                "protocol": connection.protocol().as_str(),
                "state": connection.state().as_str(),
                "pool": connection.pool_stats(),
            }),
        );
    }
    crate::health::set_component_detail(
        DEDUP_COMPONENT,
        serde_json::json!({
            "in_flight": registry.len(),
            "capacity": registry.capacity(),
        }),
    );
}

async fn write_state_file(path: &Path) {
    let mut json = crate::health::snapshot_json();
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "written_at".into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
    if let Err(e) = tokio::fs::write(path, data).await {
        tracing::debug!(path = %path.display(), "State file not written: {e}");
    }
}

fn spawn_state_writer(
    config: Config,
    connections: Vec<Arc<dyn BusConnection>>,
    registry: Arc<DeduplicationRegistry>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        crate::health::mark_component_ok(DEDUP_COMPONENT);
        let path = config
            .dispatch
            .write_state_file
            .then(|| config.state_file_path());
        if let Some(parent) = path.as_deref().and_then(Path::parent) {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(
            config.dispatch.status_flush_secs.max(1),
        ));
        loop {
            let stopping = tokio::select! {
                _ = interval.tick() => false,
                () = shutdown.cancelled() => true,
            };
            refresh_health(&connections, &registry);
            if let Some(path) = &path {
                write_state_file(path).await;
            }
            if stopping {
                break;
            }
        }
    })
}

/// Supervise one connection. A panic inside `run` restarts it after an
/// exponential backoff; a fatal error cancels `shutdown` for the whole
/// process and is returned.
fn spawn_connection_supervisor(
    connection: Arc<dyn BusConnection>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), BusError>> {
    tokio::spawn(async move {
        let name = connection.name().to_string();
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            let task = {
                let connection = Arc::clone(&connection);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { connection.run(shutdown).await })
            };

            match task.await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_fatal() => {
                    crate::health::mark_component_error(&name, &e);
                    tracing::error!("Connection '{name}' failed fatally: {e}");
                    shutdown.cancel();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    crate::health::mark_component_error(&name, &e);
                    tracing::error!("Connection '{name}' failed: {e}");
                }
                Err(e) => {
                    crate::health::mark_component_error(&name, format!("panicked: {e}"));
                    tracing::error!("Connection '{name}' panicked: {e}");
                }
            }

            crate::health::bump_component_restart(&name);
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }
            // Double backoff AFTER sleeping so first error uses initial_backoff
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ConnectionState;
    use crate::dispatch::PoolStats;
    use crate::envelope::{Protocol, RequestEnvelope};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeConnection {
        name: &'static str,
        runs: AtomicUsize,
        behaviour: fn(usize) -> Option<BusError>,
    }

    #[async_trait]
    impl BusConnection for FakeConnection {
        fn name(&self) -> &str {
            self.name
        }

        fn protocol(&self) -> Protocol {
            Protocol::Amqp
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Subscribed
        }

        fn pool_stats(&self) -> PoolStats {
            PoolStats {
                active_workers: 1,
                total_capacity: 4,
            }
        }

        async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError> {
            let attempt = self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = (self.behaviour)(attempt) {
                return Err(e);
            }
            assert!(attempt > 0, "first run blows up");
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn supervisor_restarts_after_panic() {
        let connection = Arc::new(FakeConnection {
            name: "daemon-test-panic",
            runs: AtomicUsize::new(0),
            behaviour: |_| None,
        });
        let shutdown = CancellationToken::new();
        let handle = spawn_connection_supervisor(connection.clone(), 1, 1, shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let component = crate::health::component("daemon-test-panic").unwrap();
        assert_eq!(component.status, "error");
        assert!(component.restart_count >= 1);
        assert!(component.last_error.unwrap_or_default().contains("panicked"));

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fatal_error_cancels_shutdown_token() {
        let connection = Arc::new(FakeConnection {
            name: "daemon-test-fatal",
            runs: AtomicUsize::new(0),
            behaviour: |_| Some(BusError::Authentication("ACCESS_REFUSED".into())),
        });
        let shutdown = CancellationToken::new();
        let handle = spawn_connection_supervisor(connection.clone(), 1, 1, shutdown.clone());

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BusError::Authentication(_))));
        assert!(shutdown.is_cancelled());
        assert_eq!(connection.runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            crate::health::component("daemon-test-fatal").unwrap().status,
            "error"
        );
    }

    #[tokio::test]
    async fn failed_signal_handler_still_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        let failing = async { Err(std::io::Error::other("no signal driver")) };

        assert!(wait_for_stop(failing, &shutdown).await.is_err());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn internal_shutdown_ends_the_wait() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let never = std::future::pending::<std::io::Result<()>>();

        assert!(wait_for_stop(never, &shutdown).await.is_ok());
    }

    #[test]
    fn state_file_path_uses_config_directory() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        };
        assert_eq!(config.state_file_path(), tmp.path().join("daemon_state.json"));
    }

    #[tokio::test]
    async fn state_file_contains_connection_detail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("daemon_state.json");
        let connections: Vec<Arc<dyn BusConnection>> = vec![Arc::new(FakeConnection {
            name: "daemon-test-state",
            runs: AtomicUsize::new(0),
            behaviour: |_| None,
        })];
        let registry = DeduplicationRegistry::new(8);
        assert!(registry.try_accept("r1"));

        refresh_health(&connections, &registry);
        write_state_file(&path).await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let detail = &json["components"]["daemon-test-state"]["detail"];
        assert_eq!(detail["state"], "subscribed");
        assert_eq!(detail["pool"]["total_capacity"], 4);
        assert!(json["components"]["dedup"]["detail"]["in_flight"].as_u64().is_some());
        assert!(json["written_at"].as_str().is_some());
    }

    #[tokio::test]
    async fn default_router_serves_status() {
        let router = default_router();
        let response = router
            .handle(RequestEnvelope {
                request_id: "s1".into(),
                method: "GET".into(),
                path: format!("{STATUS_PATH}?verbose=1"),
                headers: BTreeMap::new(),
                body: Vec::new(),
                api_version: None,
            })
            .await;

        assert_eq!(response.status_code, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert!(body["components"].is_object());
        assert!(body["pid"].as_u64().is_some());
    }
}
