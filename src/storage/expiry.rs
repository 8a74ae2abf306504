//! Background expiration sweeper.
//!
//! Lazy eviction only reclaims a key when something touches it; a cold
//! expired key would otherwise sit in memory forever. The sweeper puts a
//! bound on that waste without ever scanning the whole table: every tick
//! it samples a handful of expiration records at a pseudo-random offset,
//! evicts the dead ones, and only re-samples immediately when the hit
//! rate suggests there are many more.

use crate::storage::Store;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info};

/// Tuning knobs for the sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Keys sampled from the expiration table per round.
    pub sample_size: usize,
    /// Re-sample immediately when strictly more than this fraction of
    /// the sample was expired.
    pub repeat_threshold: f64,
    /// Upper bound on rounds per tick, so one tick cannot stall the
    /// runtime on a pathological table.
    pub max_rounds: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            sample_size: 20,
            repeat_threshold: 0.25,
            max_rounds: 16,
        }
    }
}

/// Handle to the running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    /// Spawns the sweeper on the current tokio runtime.
    pub fn start(store: Arc<Store>, config: SweeperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweeper_loop(store, config, shutdown_rx));
        info!("expiration sweeper started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    store: Arc<Store>,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut rng = rng_seed();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("expiration sweeper shutting down");
                    return;
                }
            }
        }

        let mut total_evicted = 0usize;
        for _ in 0..config.max_rounds {
            rng = xorshift64(rng);
            let (sampled, evicted) =
                store.evict_expired_sample(config.sample_size, rng as usize);
            total_evicted += evicted;
            if sampled == 0 {
                break;
            }
            // Keep going only while the sample suggests a backlog.
            if (evicted as f64) <= (sampled as f64) * config.repeat_threshold {
                break;
            }
        }

        if total_evicted > 0 {
            debug!(
                evicted = total_evicted,
                volatile = store.expiration_count(),
                "sweeper evicted expired keys"
            );
        }
    }
}

/// Non-zero seed derived from the wall clock; the sweeper only needs
/// enough randomness to spread its sampling offsets around the table.
fn rng_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0)
        | 1
}

fn xorshift64(mut state: u64) -> u64 {
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state
}

/// Starts the sweeper with default settings.
pub fn start_sweeper(store: Arc<Store>) -> Sweeper {
    Sweeper::start(store, SweeperConfig::default())
}
