//! Simulated business logic.
//!
//! The user endpoints exist to produce telemetry: each one sleeps for a
//! random latency inside child spans, and the error endpoint fails at a
//! configured rate.
//!
//! # Design Decisions
//! - All randomness comes from one seeded generator, so a fixed `seed`
//!   replays the same latencies and failures for the same request order
//! - Delays are drawn under a short mutex and slept outside it

pub mod users;

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::schema::{LatencyRange, SimulationConfig};

pub use users::{create_user, lookup_user, CreatedUser, UserError, UserRecord, MISSING_USER_ID};

/// Source of simulated latency and failures.
pub struct Simulator {
    rng: Mutex<StdRng>,
    config: SimulationConfig,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            config,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Latency of one user lookup.
    pub fn lookup_delay(&self) -> Duration {
        self.draw_delay(self.config.user_lookup_latency_ms)
    }

    /// Latency of one user creation, all steps included.
    pub fn create_delay(&self) -> Duration {
        self.draw_delay(self.config.user_create_latency_ms)
    }

    /// Whether the next simulated operation fails.
    pub fn should_fail(&self) -> bool {
        let p = self.config.error_rate.clamp(0.0, 1.0);
        self.with_rng(|rng| rng.gen_bool(p)).unwrap_or(false)
    }

    /// Id for a newly created user, in `1000..=9999`.
    pub fn new_user_id(&self) -> u32 {
        self.with_rng(|rng| rng.gen_range(1000..=9999)).unwrap_or(1000)
    }

    fn draw_delay(&self, range: LatencyRange) -> Duration {
        let (lo, hi) = (range.min_ms.min(range.max_ms), range.max_ms.max(range.min_ms));
        let ms = self.with_rng(|rng| rng.gen_range(lo..=hi)).unwrap_or(lo);
        Duration::from_millis(ms)
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> Option<T> {
        self.rng.lock().ok().map(|mut rng| f(&mut *rng))
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator").field("config", &self.config).finish()
    }
}
