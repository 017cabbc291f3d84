//! Throughput shaping
//!
//! Each tier gets a byte-per-second ceiling, backpressure watermarks and a
//! smoothing factor for the reported speed. Premium transfers are not
//! throttled and use deeper buffers.

use roomdrop_config::TransferConfig;
use roomdrop_core::Tier;
use std::time::Duration;

const STANDARD_HIGH_WATER: usize = 256 * 1024;
const STANDARD_LOW_WATER: usize = 128 * 1024;
const PREMIUM_HIGH_WATER: usize = 2 * 1024 * 1024;
const PREMIUM_LOW_WATER: usize = 1024 * 1024;

const STANDARD_POLL: Duration = Duration::from_millis(10);
const PREMIUM_POLL: Duration = Duration::from_millis(5);

const STANDARD_EMA_ALPHA: f64 = 0.15;
const PREMIUM_EMA_ALPHA: f64 = 0.12;

#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputBudget {
    pub tier: Tier,
    /// `None` means unthrottled
    pub bytes_per_sec: Option<u64>,
    pub chunk_size: usize,
    /// Stop sending above this many buffered bytes
    pub high_water: usize,
    /// Resume once the buffer drains below this
    pub low_water: usize,
    pub poll_interval: Duration,
    pub ema_alpha: f64,
}

impl ThroughputBudget {
    pub fn for_tier(tier: Tier, config: &TransferConfig) -> Self {
        let premium = tier == Tier::Premium;
        Self {
            tier,
            bytes_per_sec: config.rate_limit(tier),
            chunk_size: config.chunk_size.max(1),
            high_water: if premium { PREMIUM_HIGH_WATER } else { STANDARD_HIGH_WATER },
            low_water: if premium { PREMIUM_LOW_WATER } else { STANDARD_LOW_WATER },
            poll_interval: if premium { PREMIUM_POLL } else { STANDARD_POLL },
            ema_alpha: if premium { PREMIUM_EMA_ALPHA } else { STANDARD_EMA_ALPHA },
        }
    }

    /// Pause before sending a chunk of `len` bytes
    pub fn chunk_delay(&self, len: usize) -> Option<Duration> {
        match self.bytes_per_sec {
            Some(rate) if rate > 0 && len > 0 => {
                Some(Duration::from_secs_f64(len as f64 / rate as f64))
            }
            _ => None,
        }
    }

    pub fn speed_meter(&self) -> SpeedMeter {
        SpeedMeter::new(self.ema_alpha)
    }
}

/// Exponential moving average of the transfer speed
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    alpha: f64,
    speed: Option<f64>,
}

impl SpeedMeter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            speed: None,
        }
    }

    /// Feed the bytes sent so far and the time since the transfer started.
    /// Returns the smoothed bytes per second.
    pub fn observe(&mut self, total_bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.speed();
        }
        let instant = total_bytes as f64 / secs;
        let next = match self.speed {
            Some(prev) => self.alpha * instant + (1.0 - self.alpha) * prev,
            None => instant,
        };
        self.speed = Some(next);
        next
    }

    pub fn speed(&self) -> f64 {
        self.speed.unwrap_or(0.0)
    }
}
