//! # Mock Generator Module
//!
//! Synthetic heart rate for when no real device is reachable. Values follow a
//! bounded random walk so consecutive readings never jump: each step moves at
//! most `max_step` bpm and the walk is clamped to `[min_bpm, max_bpm]`.

use crate::config::MockConfig;
use crate::hub::TelemetryHub;
use crate::sample::{Sample, Source};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Bounded random walk over plausible heart rates
pub struct BpmWalk {
    current: u16,
    min: u16,
    max: u16,
    max_step: u16,
    rng: StdRng,
}

impl BpmWalk {
    pub fn new(config: &MockConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn seeded(config: &MockConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &MockConfig, rng: StdRng) -> Self {
        let (min, max) = if config.min_bpm <= config.max_bpm {
            (config.min_bpm, config.max_bpm)
        } else {
            (config.max_bpm, config.min_bpm)
        };
        Self {
            current: min + (max - min) / 2,
            min,
            max,
            max_step: config.max_step,
            rng,
        }
    }

    /// Next value of the walk
    pub fn next_bpm(&mut self) -> u16 {
        let step = self.max_step as i32;
        let delta = self.rng.gen_range(-step..=step);
        let next = (self.current as i32 + delta).clamp(self.min as i32, self.max as i32);
        self.current = next as u16;
        self.current
    }
}

/// A running generator task. Started and stopped by the device manager.
pub struct MockGenerator {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MockGenerator {
    /// Start publishing one `Source::Mock` sample per configured interval
    pub fn start(hub: TelemetryHub, config: &MockConfig) -> Self {
        let cancel = CancellationToken::new();
        let walk = BpmWalk::new(config);
        let handle = tokio::spawn(run_generator(hub, walk, config.interval(), cancel.clone()));
        log::info!("Mock generator started ({} ms cadence)", config.interval_ms);
        MockGenerator { cancel, handle }
    }

    /// Stop the task and wait until it can no longer publish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::error!("Mock generator task failed: {}", e);
        }
        log::info!("Mock generator stopped");
    }
}

async fn run_generator(
    hub: TelemetryHub,
    mut walk: BpmWalk,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let sample = Sample::new(hub.next_timestamp(), walk.next_bpm(), Source::Mock);
                hub.publish(sample);
            }
        }
    }
}
