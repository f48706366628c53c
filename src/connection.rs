//! # Connection Management Module
//!
//! The device manager: one task that owns the heart-rate link and walks the
//! phase machine in `crate::phase`. Everything that can change the link (the
//! startup cycle, liveness timeouts, reconnect backoff, rescans, control
//! commands) runs on this task, so there is only ever one active connection
//! and one producer feeding the hub.
//!
//! ## Key Components
//! - `DeviceManager`: the task state and its run loop
//! - `DeviceCommand`: control requests from the server (scan, connect, disconnect)
//! - `DeviceHandle`: cloneable sender side used by callers
//!
//! ## Lifecycle
//! - Startup: probe the radio. Without an adapter the manager sits in
//!   `MockFallback` for good. Otherwise it scans and connects to the preferred
//!   address (or, with autoconnect, the strongest device).
//! - `Connected`: each notification becomes one sample. Silence longer than
//!   the liveness window, or the peripheral going away, drops to `Disconnected`.
//! - `Reconnecting(n)`: retry after `min(base * 2^(n-1), cap)`; after
//!   `max_reconnect_attempts` failures fall back to mock data.
//! - `MockFallback`: the mock generator runs; every rescan interval a fresh
//!   scan-and-connect cycle runs if there is something to connect to.
//!
//! The mock generator is always stopped (and awaited) before `Connecting`.

use crate::config::{DeviceConfig, MockConfig};
use crate::device_scanner::DiscoveredDevice;
use crate::error::{ConnectionError, ScanError};
use crate::hub::TelemetryHub;
use crate::mock::MockGenerator;
use crate::phase::{ConnectionPhase, DeviceState};
use crate::sample::{parse_heart_rate_measurement, Sample};
use crate::transport::{Link, LinkEvent, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 16;

#[derive(Debug)]
pub enum DeviceCommand {
    Scan {
        reply: oneshot::Sender<Result<Vec<DiscoveredDevice>, ScanError>>,
    },
    Connect {
        address: String,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Control surface of a running device manager
#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<DeviceCommand>,
}

impl DeviceHandle {
    /// Nearby heart-rate devices, strongest signal first
    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>, ScanError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Scan { reply })
            .await
            .map_err(|_| ScanError::ManagerUnavailable)?;
        response.await.map_err(|_| ScanError::ManagerUnavailable)?
    }

    /// Resolves once connected, or with the first failure (reconnection then
    /// carries on in the background)
    pub async fn connect(&self, address: impl Into<String>) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Connect {
                address: address.into(),
                reply,
            })
            .await
            .map_err(|_| ConnectionError::ManagerUnavailable)?;
        response.await.map_err(|_| ConnectionError::ManagerUnavailable)?
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Disconnect { reply })
            .await
            .map_err(|_| ConnectionError::ManagerUnavailable)?;
        response.await.map_err(|_| ConnectionError::ManagerUnavailable)
    }
}

/// What woke the manager up
enum Wake {
    Shutdown,
    Command(DeviceCommand),
    CommandsClosed,
    Link(Option<LinkEvent>),
    Timer,
}

/// Owns the connection lifecycle.
///
/// Runs as a single tokio task. Phase changes go through `transition`, which
/// refuses edges the phase machine does not allow and tells every viewer
/// about the ones it takes.
pub struct DeviceManager {
    transport: Transport,
    hub: TelemetryHub,
    device: DeviceConfig,
    mock_config: MockConfig,
    commands: mpsc::Receiver<DeviceCommand>,
    commands_open: bool,
    shutdown: CancellationToken,
    state: DeviceState,
    adapter_present: bool,
    /// Last connected or requested address
    target: Option<String>,
    link: Option<Link>,
    last_seen: Instant,
    retry_at: Option<Instant>,
    rescan_at: Option<Instant>,
    mock: Option<MockGenerator>,
    rng: StdRng,
}

impl DeviceManager {
    /// Creates a new DeviceManager.
    ///
    /// Returns the manager and a handle for issuing commands to it.
    pub fn new(
        transport: Transport,
        hub: TelemetryHub,
        device: DeviceConfig,
        mock_config: MockConfig,
        shutdown: CancellationToken,
    ) -> (Self, DeviceHandle) {
        let (command_sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let target = device.preferred_address.clone();

        let manager = DeviceManager {
            transport,
            hub,
            device,
            mock_config,
            commands,
            commands_open: true,
            shutdown,
            state: DeviceState::default(),
            adapter_present: false,
            target,
            link: None,
            last_seen: Instant::now(),
            retry_at: None,
            rescan_at: None,
            mock: None,
            rng: StdRng::from_entropy(),
        };

        (manager, DeviceHandle { commands: command_sender })
    }

    /// Runs the connection management loop until the shutdown token fires,
    /// then disconnects and stops the mock generator.
    pub async fn run(mut self) {
        self.startup().await;

        while !self.shutdown.is_cancelled() {
            match self.state.phase {
                ConnectionPhase::Connected => self.drive_connected().await,
                ConnectionPhase::Disconnected => self.enter_reconnecting(1),
                ConnectionPhase::Reconnecting { attempt } => self.drive_reconnect(attempt).await,
                ConnectionPhase::MockFallback => self.drive_fallback().await,
                ConnectionPhase::Idle | ConnectionPhase::Scanning | ConnectionPhase::Connecting => {
                    self.drive_idle().await
                }
            }
        }

        self.teardown().await;
        log::info!("Device manager: shut down");
    }

    async fn startup(&mut self) {
        if let Err(e) = self.transport.probe() {
            log::warn!("{} Serving mock data.", e);
            self.adapter_present = false;
            self.enter_fallback();
            return;
        }
        self.adapter_present = true;
        self.scan_and_connect().await;
    }

    async fn drive_connected(&mut self) {
        let window = self.device.liveness_window();
        match self.next_wake(Some(self.last_seen + window)).await {
            Wake::Shutdown | Wake::CommandsClosed => {}
            Wake::Command(command) => self.handle_command(command).await,
            Wake::Link(Some(LinkEvent::Notification(payload))) => self.on_notification(&payload),
            Wake::Link(Some(LinkEvent::Rssi(rssi))) => self.on_rssi(rssi),
            Wake::Link(Some(LinkEvent::Closed)) | Wake::Link(None) => {
                log::warn!("Device manager: peripheral closed the link");
                self.lose_link().await;
            }
            Wake::Timer => {
                log::warn!("Device manager: {}", ConnectionError::NotificationTimeout(window));
                self.lose_link().await;
            }
        }
    }

    async fn drive_reconnect(&mut self, attempt: u32) {
        match self.next_wake(self.retry_at).await {
            Wake::Timer => self.retry(attempt).await,
            Wake::Command(command) => self.handle_command(command).await,
            Wake::Shutdown | Wake::CommandsClosed | Wake::Link(_) => {}
        }
    }

    async fn drive_fallback(&mut self) {
        let timer = if self.adapter_present { self.rescan_at } else { None };
        match self.next_wake(timer).await {
            Wake::Timer => self.rescan().await,
            Wake::Command(command) => self.handle_command(command).await,
            Wake::Shutdown | Wake::CommandsClosed | Wake::Link(_) => {}
        }
    }

    async fn drive_idle(&mut self) {
        if let Wake::Command(command) = self.next_wake(None).await {
            self.handle_command(command).await;
        }
    }

    async fn next_wake(&mut self, timer: Option<Instant>) -> Wake {
        loop {
            let commands_open = self.commands_open;
            let link = self.link.as_mut();
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::CommandsClosed,
                },
                event = next_link_event(link) => Wake::Link(event),
                _ = sleep_until_deadline(timer) => Wake::Timer,
            };

            if let Wake::CommandsClosed = wake {
                log::debug!("Device manager: command channel closed");
                self.commands_open = false;
                continue;
            }
            return wake;
        }
    }

    async fn handle_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Scan { reply } => self.scan(reply).await,
            DeviceCommand::Connect { address, reply } => {
                log::info!("Device manager: connect to {} requested", address);
                let result = self.connect(address).await;
                let _ = reply.send(result);
            }
            DeviceCommand::Disconnect { reply } => {
                log::info!("Device manager: disconnect requested");
                self.disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    async fn scan(&mut self, reply: oneshot::Sender<Result<Vec<DiscoveredDevice>, ScanError>>) {
        if !self.adapter_present {
            let _ = reply.send(Err(ScanError::AdapterUnavailable));
            return;
        }

        match self.state.phase {
            ConnectionPhase::Idle | ConnectionPhase::MockFallback => {
                let resume = self.state.phase;
                self.transition(ConnectionPhase::Scanning);
                let result = self
                    .guarded_scan()
                    .await
                    .unwrap_or(Err(ScanError::ManagerUnavailable));
                if resume == ConnectionPhase::MockFallback {
                    self.enter_fallback();
                } else {
                    self.transition(resume);
                }
                let _ = reply.send(result);
            }
            // leave the active link alone
            _ => {
                let transport = self.transport.clone();
                let window = self.device.scan_window();
                tokio::spawn(async move {
                    let _ = reply.send(transport.scan(window).await);
                });
            }
        }
    }

    async fn connect(&mut self, address: String) -> Result<(), ConnectionError> {
        if !self.adapter_present {
            return Err(ConnectionError::AdapterUnavailable);
        }

        match self.state.phase {
            ConnectionPhase::Connected
            | ConnectionPhase::Disconnected
            | ConnectionPhase::Reconnecting { .. } => {
                self.drop_link().await;
                self.clear_link_state();
                self.transition(ConnectionPhase::Idle);
            }
            _ => {}
        }

        self.target = Some(address.clone());
        self.open(address).await
    }

    async fn disconnect(&mut self) {
        self.drop_link().await;
        self.target = None;
        self.clear_link_state();
        if self.state.phase != ConnectionPhase::Idle {
            self.transition(ConnectionPhase::Idle);
        }
        self.enter_fallback();
    }

    /// Scan, pick a target and connect; falls back to mock data when there is
    /// nothing to connect to
    async fn scan_and_connect(&mut self) {
        self.transition(ConnectionPhase::Scanning);

        let found = match self.guarded_scan().await {
            None => return,
            Some(Ok(found)) => found,
            Some(Err(e)) => {
                log::warn!("Device manager: {}", e);
                self.enter_fallback();
                return;
            }
        };

        let pick = match &self.target {
            Some(target) => found
                .iter()
                .find(|d| d.address.eq_ignore_ascii_case(target))
                .map(|d| d.address.clone()),
            None if self.device.enable_autoconnect => found.first().map(|d| d.address.clone()),
            None => None,
        };

        match pick {
            Some(address) => {
                self.target = Some(address.clone());
                if let Err(e) = self.open(address).await {
                    log::warn!("Device manager: {}", e);
                }
            }
            None => {
                log::info!("Device manager: no heart rate device to connect to");
                self.enter_fallback();
            }
        }
    }

    /// `Connecting` to `Connected`, or `Disconnected` on failure
    async fn open(&mut self, address: String) -> Result<(), ConnectionError> {
        self.stop_mock().await;
        self.state.address = Some(address.clone());
        self.transition(ConnectionPhase::Connecting);

        match self.guarded_connect(&address).await {
            None => Err(ConnectionError::ManagerUnavailable),
            Some(Ok(link)) => {
                self.attach(link);
                Ok(())
            }
            Some(Err(e)) => {
                self.transition(ConnectionPhase::Disconnected);
                Err(e)
            }
        }
    }

    async fn retry(&mut self, attempt: u32) {
        let address = match self.target.clone() {
            Some(address) => address,
            None => {
                self.enter_fallback();
                return;
            }
        };

        match self.guarded_connect(&address).await {
            None => {}
            Some(Ok(link)) => self.attach(link),
            Some(Err(e)) => {
                log::warn!("Device manager: reconnect attempt {} failed: {}", attempt, e);
                if attempt >= self.device.max_reconnect_attempts {
                    log::warn!(
                        "Device manager: giving up on {} after {} attempts",
                        address,
                        attempt
                    );
                    self.enter_fallback();
                } else {
                    self.enter_reconnecting(attempt + 1);
                }
            }
        }
    }

    async fn rescan(&mut self) {
        if self.target.is_none() && !self.device.enable_autoconnect {
            self.rescan_at = Some(Instant::now() + self.device.rescan_interval());
            return;
        }
        log::info!("Device manager: rescanning for a real device");
        self.scan_and_connect().await;
    }

    async fn guarded_scan(&self) -> Option<Result<Vec<DiscoveredDevice>, ScanError>> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = self.transport.scan(self.device.scan_window()) => Some(result),
        }
    }

    async fn guarded_connect(&self, address: &str) -> Option<Result<Link, ConnectionError>> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = self.transport.connect(address, self.device.connect_timeout()) => Some(result),
        }
    }

    fn attach(&mut self, link: Link) {
        log::info!("Device manager: connected to {}", link.address);
        self.state.address = Some(link.address.clone());
        self.state.rssi = link.rssi;
        self.target = Some(link.address.clone());
        self.last_seen = Instant::now();
        self.link = Some(link);
        self.transition(ConnectionPhase::Connected);
    }

    async fn lose_link(&mut self) {
        self.drop_link().await;
        self.state.rssi = None;
        self.transition(ConnectionPhase::Disconnected);
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            self.transport.disconnect(link, self.device.connect_timeout()).await;
        }
    }

    fn clear_link_state(&mut self) {
        self.state.address = None;
        self.state.rssi = None;
    }

    fn on_notification(&mut self, payload: &[u8]) {
        // any notification proves the link is alive, even an unusable one
        self.last_seen = Instant::now();

        let bpm = match parse_heart_rate_measurement(payload) {
            Some(bpm) => bpm,
            None => {
                log::debug!("Device manager: malformed heart rate payload {:?}", payload);
                return;
            }
        };
        if !Sample::is_plausible(bpm) {
            log::debug!("Device manager: dropping implausible reading of {} bpm", bpm);
            return;
        }

        let sample = Sample::new(self.hub.next_timestamp(), bpm, self.transport.sample_source());
        self.hub.publish(sample);
        self.state.last_sample_at = Some(sample.timestamp);
        self.hub.set_device_state(self.state.clone(), false);
    }

    /// Viewers hear about signal strength changes without polling
    fn on_rssi(&mut self, rssi: i16) {
        if self.state.rssi != Some(rssi) {
            log::debug!("Device manager: rssi now {} dBm", rssi);
            self.state.rssi = Some(rssi);
            self.hub.set_device_state(self.state.clone(), true);
        }
    }

    fn enter_reconnecting(&mut self, attempt: u32) {
        let delay = backoff_delay(&self.device, attempt, &mut self.rng);
        log::info!(
            "Device manager: reconnect attempt {} in {} ms",
            attempt,
            delay.as_millis()
        );
        self.retry_at = Some(Instant::now() + delay);
        self.transition(ConnectionPhase::Reconnecting { attempt });
    }

    fn enter_fallback(&mut self) {
        self.clear_link_state();
        self.transition(ConnectionPhase::MockFallback);
        if self.adapter_present {
            self.rescan_at = Some(Instant::now() + self.device.rescan_interval());
        }
        if self.mock.is_none() {
            self.mock = Some(MockGenerator::start(self.hub.clone(), &self.mock_config));
        }
    }

    async fn stop_mock(&mut self) {
        if let Some(mock) = self.mock.take() {
            mock.stop().await;
        }
    }

    async fn teardown(&mut self) {
        self.drop_link().await;
        self.stop_mock().await;
        self.clear_link_state();
        if self.state.phase != ConnectionPhase::Idle {
            self.transition(ConnectionPhase::Idle);
        }
    }

    fn transition(&mut self, next: ConnectionPhase) {
        let current = self.state.phase;
        if !current.can_transition_to(&next) {
            log::error!("Device manager: refusing phase change {} -> {}", current, next);
            return;
        }
        log::info!("Device manager: {} -> {}", current, next);
        self.state.phase = next;
        self.hub.set_device_state(self.state.clone(), true);
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn backoff_delay(config: &DeviceConfig, attempt: u32, rng: &mut impl Rng) -> Duration {
    let doublings = attempt.saturating_sub(1).min(32);
    let mut delay = config
        .backoff_base_ms
        .saturating_mul(1u64 << doublings)
        .min(config.backoff_cap_ms);
    if config.backoff_jitter {
        delay = (delay as f64 * rng.gen_range(0.8..=1.2)) as u64;
    }
    Duration::from_millis(delay)
}

async fn next_link_event(link: Option<&mut Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, TransportKind};
    use crate::hub::{FeedEvent, FeedRecord, Viewer};
    use crate::sample::Source;
    use crate::store::SampleStore;
    use crate::transport::{MockPeripheral, MockTransport};
    use tempfile::{tempdir, TempDir};
    use tokio::task::JoinHandle;
    use tokio::time::sleep;
    use ConnectionPhase::*;

    const HRM: &str = "AA:BB:CC:DD:EE:01";

    struct Rig {
        hub: TelemetryHub,
        handle: DeviceHandle,
        viewer: Viewer,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
        _dir: TempDir,
    }

    impl Rig {
        fn start(transport: Transport, device: DeviceConfig) -> Self {
            let dir = tempdir().unwrap();
            let store = SampleStore::open(&StoreConfig {
                database: dir.path().join("device.db"),
                ..StoreConfig::default()
            });
            let hub = TelemetryHub::new(store, 4_096);
            let viewer = hub.subscribe();
            let shutdown = CancellationToken::new();
            let (manager, handle) = DeviceManager::new(
                transport,
                hub.clone(),
                device,
                MockConfig::default(),
                shutdown.clone(),
            );
            let task = tokio::spawn(manager.run());

            Rig {
                hub,
                handle,
                viewer,
                shutdown,
                task,
                _dir: dir,
            }
        }

        fn phase(&self) -> ConnectionPhase {
            self.hub.device_state().phase
        }

        async fn wait_for(&self, phase: ConnectionPhase) {
            for _ in 0..1_000 {
                if self.phase() == phase {
                    return;
                }
                sleep(Duration::from_millis(100)).await;
            }
            panic!("never reached {}, stuck in {}", phase, self.phase());
        }

        async fn stop(mut self) {
            self.shutdown.cancel();
            (&mut self.task).await.unwrap();
            assert_eq!(self.phase(), Idle);
        }
    }

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            transport: TransportKind::Mock,
            preferred_address: Some(HRM.to_string()),
            scan_seconds: 1,
            ..DeviceConfig::default()
        }
    }

    fn radio_with_monitor() -> (Transport, MockPeripheral) {
        let mock = MockTransport::new();
        let monitor = mock.add_device(HRM, Some("HRM"), Some(-50));
        (Transport::Mock(mock), monitor)
    }

    fn split(events: &[FeedEvent]) -> (Vec<ConnectionPhase>, Vec<FeedRecord>) {
        let mut phases = Vec::new();
        let mut samples = Vec::new();
        for event in events {
            match event {
                FeedEvent::Status(state) => phases.push(state.phase),
                FeedEvent::Sample(record) => samples.push(record.clone()),
            }
        }
        (phases, samples)
    }

    fn assert_valid_edges(phases: &[ConnectionPhase]) {
        for pair in phases.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "illegal edge {} -> {}", pair[0], pair[1]);
        }
    }

    fn contains_run(phases: &[ConnectionPhase], run: &[ConnectionPhase]) -> bool {
        phases.windows(run.len()).any(|w| w == run)
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = DeviceConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (1..=7)
            .map(|n| backoff_delay(&config, n, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(backoff_delay(&config, 500, &mut rng), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_jitter_stays_within_twenty_percent() {
        let config = DeviceConfig {
            backoff_jitter: true,
            ..DeviceConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..1_000 {
            let ms = backoff_delay(&config, 3, &mut rng).as_millis();
            assert!((3_200..=4_800).contains(&ms), "{} ms", ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_adapter_serves_mock_data() {
        let rig = Rig::start(Transport::Mock(MockTransport::without_adapter()), device_config());
        sleep(Duration::from_millis(3_500)).await;

        assert_eq!(rig.phase(), MockFallback);
        let (phases, samples) = split(&rig.viewer.drain());
        assert_eq!(phases, vec![Idle, MockFallback]);
        assert!((3..=5).contains(&samples.len()), "{} samples", samples.len());
        assert!(samples
            .iter()
            .all(|r| r.source == Source::Mock && r.connection_phase == "mock_fallback"));

        assert_eq!(rig.handle.scan().await, Err(ScanError::AdapterUnavailable));
        assert_eq!(rig.handle.connect(HRM).await, Err(ConnectionError::AdapterUnavailable));
        assert_eq!(rig.phase(), MockFallback);
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_reach_hub_and_store() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        rig.wait_for(Connected).await;

        for bpm in [72, 75, 74] {
            assert!(monitor.notify_bpm(bpm));
            sleep(Duration::from_secs(1)).await;
        }

        let (phases, samples) = split(&rig.viewer.drain());
        assert_eq!(phases, vec![Idle, Scanning, Connecting, Connected]);
        let bpms: Vec<u16> = samples.iter().map(|r| r.bpm).collect();
        assert_eq!(bpms, vec![72, 75, 74]);
        assert!(samples.iter().all(|r| r.connection_phase == "connected" && r.rssi == Some(-50)));
        assert!(rig.hub.device_state().last_sample_at.is_some());

        let store = rig.hub.store().clone();
        store.flush(Duration::from_secs(5)).unwrap();
        let stored: Vec<u16> = store
            .query_raw(0, i64::MAX)
            .map(|s| s.unwrap().bpm)
            .collect();
        assert_eq!(stored, vec![72, 75, 74]);
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_implausible_readings_keep_link_alive() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        rig.wait_for(Connected).await;
        rig.viewer.drain();

        for _ in 0..5 {
            assert!(monitor.notify_bpm(0));
            assert!(monitor.notify_raw(vec![0x01]));
            sleep(Duration::from_secs(2)).await;
        }

        assert_eq!(rig.phase(), Connected);
        assert!(rig.viewer.drain().iter().all(|e| e.as_sample().is_none()));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_triggers_reconnect() {
        let (transport, _monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        rig.wait_for(Connected).await;

        // liveness window is 5 s, first retry 1 s later
        sleep(Duration::from_millis(6_500)).await;

        let (phases, _) = split(&rig.viewer.drain());
        assert_valid_edges(&phases);
        assert!(contains_run(
            &phases,
            &[Connected, Disconnected, Reconnecting { attempt: 1 }, Connected]
        ));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_backoff_falls_back_then_rescan_recovers() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(
            transport,
            DeviceConfig {
                max_reconnect_attempts: 3,
                rescan_seconds: 10,
                ..device_config()
            },
        );
        rig.wait_for(Connected).await;

        monitor.set_in_range(false);
        monitor.drop_link();
        // retries after 1 s, 2 s and 4 s
        sleep(Duration::from_millis(7_500)).await;
        assert_eq!(rig.phase(), MockFallback);

        let (phases, _) = split(&rig.viewer.drain());
        assert!(contains_run(
            &phases,
            &[
                Connected,
                Disconnected,
                Reconnecting { attempt: 1 },
                Reconnecting { attempt: 2 },
                Reconnecting { attempt: 3 },
                MockFallback,
            ]
        ));

        sleep(Duration::from_secs(2)).await;
        let (_, samples) = split(&rig.viewer.drain());
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|r| r.connection_phase == "mock_fallback"));

        monitor.set_in_range(true);
        rig.wait_for(Connected).await;
        assert!(monitor.is_linked());

        let (phases, _) = split(&rig.viewer.drain());
        assert_valid_edges(&phases);
        assert!(contains_run(&phases, &[MockFallback, Scanning, Connecting, Connected]));

        // mock generator is gone once connected
        sleep(Duration::from_secs(3)).await;
        assert!(rig.viewer.drain().iter().all(|e| e.as_sample().is_none()));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_moves_to_mock_fallback() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(
            transport,
            DeviceConfig {
                rescan_seconds: 5,
                ..device_config()
            },
        );
        rig.wait_for(Connected).await;

        rig.handle.disconnect().await.unwrap();
        assert_eq!(rig.phase(), MockFallback);
        assert!(!monitor.is_linked());

        // preferred address is cleared, so rescans never reconnect
        sleep(Duration::from_secs(12)).await;
        assert_eq!(rig.phase(), MockFallback);

        let (phases, samples) = split(&rig.viewer.drain());
        assert_valid_edges(&phases);
        assert!(contains_run(&phases, &[Connected, Idle, MockFallback]));
        assert!(samples.iter().any(|r| r.source == Source::Mock));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_reports_error_then_retries() {
        let mock = MockTransport::new();
        let monitor = mock.add_device(HRM, None, Some(-70));
        let rig = Rig::start(
            Transport::Mock(mock),
            DeviceConfig {
                preferred_address: None,
                ..device_config()
            },
        );
        rig.wait_for(MockFallback).await;

        monitor.fail_next_connects(1);
        let result = rig.handle.connect(HRM).await;
        assert!(matches!(result, Err(ConnectionError::ConnectFailed { .. })));

        rig.wait_for(Connected).await;
        let (phases, _) = split(&rig.viewer.drain());
        assert_valid_edges(&phases);
        assert!(contains_run(
            &phases,
            &[MockFallback, Connecting, Disconnected, Reconnecting { attempt: 1 }, Connected]
        ));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoconnect_picks_strongest_device() {
        let mock = MockTransport::new();
        mock.add_device("AA:AA:AA:AA:AA:AA", None, Some(-90));
        let strong = mock.add_device("BB:BB:BB:BB:BB:BB", None, Some(-40));
        let rig = Rig::start(
            Transport::Mock(mock),
            DeviceConfig {
                preferred_address: None,
                enable_autoconnect: true,
                ..device_config()
            },
        );

        rig.wait_for(Connected).await;
        assert!(strong.is_linked());
        assert_eq!(rig.hub.device_state().address.as_deref(), Some(strong.address()));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_while_connected_keeps_phase() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        rig.wait_for(Connected).await;
        rig.viewer.drain();

        let found = rig.handle.scan().await.unwrap();
        assert_eq!(found[0].address, HRM);
        assert_eq!(rig.phase(), Connected);
        assert!(monitor.is_linked());

        let (phases, _) = split(&rig.viewer.drain());
        assert!(phases.is_empty());
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_from_fallback_returns_to_fallback() {
        let mock = MockTransport::new();
        mock.add_device(HRM, Some("HRM"), Some(-60));
        let rig = Rig::start(
            Transport::Mock(mock),
            DeviceConfig {
                preferred_address: None,
                ..device_config()
            },
        );
        rig.wait_for(MockFallback).await;
        rig.viewer.drain();

        let found = rig.handle.scan().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_deref(), Some("HRM"));

        let (phases, _) = split(&rig.viewer.drain());
        assert_eq!(phases, vec![Scanning, MockFallback]);
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_switches_device() {
        let mock = MockTransport::new();
        let first = mock.add_device(HRM, None, Some(-50));
        let second = mock.add_device("AA:BB:CC:DD:EE:02", None, Some(-60));
        let rig = Rig::start(Transport::Mock(mock), device_config());
        rig.wait_for(Connected).await;
        assert!(first.is_linked());

        rig.handle.connect(second.address()).await.unwrap();
        assert_eq!(rig.phase(), Connected);
        assert!(!first.is_linked());
        assert!(second.is_linked());
        assert_eq!(rig.hub.device_state().address.as_deref(), Some(second.address()));
        assert_eq!(rig.hub.device_state().rssi, Some(-60));

        let (phases, _) = split(&rig.viewer.drain());
        assert_valid_edges(&phases);
        assert!(contains_run(&phases, &[Connected, Idle, Connecting, Connected]));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_reconnecting_abandons_old_target() {
        let mock = MockTransport::new();
        let first = mock.add_device(HRM, None, Some(-50));
        let second = mock.add_device("AA:BB:CC:DD:EE:02", None, Some(-60));
        let rig = Rig::start(
            Transport::Mock(mock),
            DeviceConfig {
                backoff_base_ms: 10_000,
                ..device_config()
            },
        );
        rig.wait_for(Connected).await;

        first.set_in_range(false);
        first.drop_link();
        rig.wait_for(Reconnecting { attempt: 1 }).await;

        rig.handle.connect(second.address()).await.unwrap();
        assert!(second.is_linked());
        assert_eq!(rig.hub.device_state().address.as_deref(), Some(second.address()));

        // the old target is never retried
        first.set_in_range(true);
        sleep(Duration::from_secs(30)).await;
        assert!(!first.is_linked());
        assert_eq!(rig.phase(), Connected);

        let (phases, _) = split(&rig.viewer.drain());
        assert_valid_edges(&phases);
        assert!(contains_run(
            &phases,
            &[Reconnecting { attempt: 1 }, Idle, Connecting, Connected]
        ));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_changes_are_broadcast() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        rig.wait_for(Connected).await;
        rig.viewer.drain();

        assert!(monitor.set_rssi(-72));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.hub.device_state().rssi, Some(-72));
        let statuses: Vec<(ConnectionPhase, Option<i16>)> = rig
            .viewer
            .drain()
            .iter()
            .filter_map(|e| match e {
                FeedEvent::Status(state) => Some((state.phase, state.rssi)),
                FeedEvent::Sample(_) => None,
            })
            .collect();
        assert_eq!(statuses, vec![(Connected, Some(-72))]);

        // unchanged reading: nothing new to tell
        assert!(monitor.set_rssi(-72));
        assert!(monitor.notify_bpm(70));
        sleep(Duration::from_millis(100)).await;
        let (phases, samples) = split(&rig.viewer.drain());
        assert!(phases.is_empty());
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].rssi, Some(-72));
        rig.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_disconnect_does_not_block_shutdown() {
        let (transport, monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        rig.wait_for(Connected).await;

        monitor.stall_disconnects(true);
        let started = Instant::now();
        rig.stop().await;
        assert!(started.elapsed() >= device_config().connect_timeout());
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_manager() {
        let (transport, _monitor) = radio_with_monitor();
        let rig = Rig::start(transport, device_config());
        let handle = rig.handle.clone();
        rig.stop().await;

        assert_eq!(handle.scan().await, Err(ScanError::ManagerUnavailable));
        assert_eq!(handle.disconnect().await, Err(ConnectionError::ManagerUnavailable));
    }
}
