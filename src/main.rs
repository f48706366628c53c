mod config;
mod connection;
mod device_scanner;
mod error;
mod hub;
mod mock;
mod phase;
mod query;
mod sample;
mod server;
mod store;
mod transport;

use config::{Config, TransportKind};
use connection::DeviceManager;
use hub::TelemetryHub;
use query::QueryService;
use server::AppState;
use store::SampleStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use transport::{BleTransport, MockTransport, Transport};

const DEMO_ADDRESS: &str = "00:11:22:33:44:55";

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}; using defaults", e);
            Config::default()
        }
    };

    let shutdown = CancellationToken::new();
    let store = SampleStore::open(&config.store);
    let hub = TelemetryHub::new(store.clone(), config.hub.viewer_queue_capacity);

    let transport = match config.device.transport {
        TransportKind::Ble => Transport::Ble(BleTransport::new().await),
        TransportKind::Mock => {
            let mock = MockTransport::new();
            let monitor = mock.add_device(DEMO_ADDRESS, Some("Mock HR Monitor"), Some(-60));
            tokio::spawn(monitor.run_demo(config.mock.clone(), shutdown.clone()));
            log::info!("Using simulated radio with a demo monitor at {}", DEMO_ADDRESS);
            Transport::Mock(mock)
        }
    };

    // Create the device manager
    let (manager, device) = DeviceManager::new(
        transport,
        hub.clone(),
        config.device.clone(),
        config.mock.clone(),
        shutdown.clone(),
    );
    let manager_task = tokio::spawn(manager.run());

    let state = AppState {
        hub,
        device,
        queries: QueryService::new(store.clone(), config.server.max_raw_rows)
            .with_default_limit(config.server.history_limit),
        shutdown: shutdown.clone(),
    };

    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", config.server.bind, e);
            shutdown.cancel();
            let deadline = Instant::now() + config.shutdown_timeout();
            join_within("Device manager", manager_task, deadline).await;
            store.shutdown(config.shutdown_timeout());
            std::process::exit(1);
        }
    };

    let server_task = tokio::spawn(server::serve(listener, state));

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutdown signal received"),
        Err(e) => log::error!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();

    // server and device manager share one budget, the store gets its own
    let deadline = Instant::now() + config.shutdown_timeout();
    if let Some(Err(e)) = join_within("Server", server_task, deadline).await {
        log::error!("Server error: {}", e);
    }
    join_within("Device manager", manager_task, deadline).await;
    store.shutdown(config.shutdown_timeout());
    log::info!("Goodbye");
}

/// Wait for a task until `deadline`, aborting it if it is still running
async fn join_within<T>(name: &str, mut task: JoinHandle<T>, deadline: Instant) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::error!("{} task failed: {}", name, e);
            None
        }
        Err(_) => {
            log::warn!("{} did not stop in time, aborting it", name);
            task.abort();
            None
        }
    }
}
