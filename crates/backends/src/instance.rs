use desk_protocol::config::BalancerConfig;
use desk_protocol::{InstanceHealth, ModelTier};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Capabilities an instance declares at registration time.
#[derive(Debug, Clone)]
pub struct InstanceCapabilities {
    pub models: Vec<String>,
    pub max_context_tokens: u32,
    pub tiers: Vec<ModelTier>,
}

#[derive(Debug)]
struct RollingStats {
    avg_latency_ms: f64,
    error_rate: f64,
    consecutive_failures: u32,
    samples: u64,
}

/// One LLM backend instance. Registered at startup, never removed; health
/// flips dynamically. Health and load fields are per-instance atomics and a
/// fine-grained mutex so concurrent `record_outcome` calls never lose
/// updates and selection never takes a registry-wide lock.
#[derive(Debug)]
pub struct ModelInstance {
    id: String,
    base_url: String,
    capabilities: InstanceCapabilities,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
    stats: Mutex<RollingStats>,
}

impl ModelInstance {
    #[must_use]
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, capabilities: InstanceCapabilities) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            capabilities,
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            stats: Mutex::new(RollingStats {
                avg_latency_ms: 0.0,
                error_rate: 0.0,
                consecutive_failures: 0,
                samples: 0,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn capabilities(&self) -> &InstanceCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            log::info!("Instance {} marked {}", self.id, if healthy { "healthy" } else { "unhealthy" });
        }
        if healthy {
            self.stats.lock().expect("stats poisoned").consecutive_failures = 0;
        }
    }

    #[must_use]
    pub fn serves_tier(&self, tier: ModelTier) -> bool {
        self.capabilities.tiers.contains(&tier)
    }

    #[must_use]
    pub fn supports_model(&self, model: &str) -> bool {
        self.capabilities.models.iter().any(|m| m == model)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Track one in-flight request; the guard decrements on drop so the
    /// counter stays correct on every exit path, including cancellation.
    #[must_use]
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            instance: Arc::clone(self),
        }
    }

    /// Fold one request outcome into the rolling statistics. Returns the new
    /// consecutive-failure count so the registry can trip the breaker.
    pub fn record_outcome(&self, success: bool, latency_ms: u64, cfg: &BalancerConfig) -> u32 {
        let alpha = ema_alpha(cfg.ema_half_life_samples);
        let mut stats = self.stats.lock().expect("stats poisoned");

        if stats.samples == 0 {
            stats.avg_latency_ms = latency_ms as f64;
            stats.error_rate = if success { 0.0 } else { 1.0 };
        } else {
            stats.avg_latency_ms = alpha * latency_ms as f64 + (1.0 - alpha) * stats.avg_latency_ms;
            let err = if success { 0.0 } else { 1.0 };
            stats.error_rate = alpha * err + (1.0 - alpha) * stats.error_rate;
        }
        stats.samples += 1;

        if success {
            stats.consecutive_failures = 0;
        } else {
            stats.consecutive_failures += 1;
        }
        stats.consecutive_failures
    }

    /// Composite selection score: `w1*(1/avg_latency) + w2*(1 - error_rate)
    /// + w3*(1/(1 + in_flight))`. Unsampled instances get a generous latency
    /// term so fresh instances are not starved.
    #[must_use]
    pub fn selection_score(&self, cfg: &BalancerConfig) -> f64 {
        let stats = self.stats.lock().expect("stats poisoned");
        let latency = if stats.samples == 0 || stats.avg_latency_ms <= 0.0 {
            1.0
        } else {
            stats.avg_latency_ms
        };
        let in_flight = self.in_flight.load(Ordering::Acquire) as f64;
        cfg.latency_weight * (1.0 / latency)
            + cfg.error_weight * (1.0 - stats.error_rate)
            + cfg.load_weight * (1.0 / (1.0 + in_flight))
    }

    #[must_use]
    pub fn snapshot(&self) -> InstanceHealth {
        let stats = self.stats.lock().expect("stats poisoned");
        InstanceHealth {
            id: self.id.clone(),
            healthy: self.is_healthy(),
            avg_latency_ms: stats.avg_latency_ms,
            error_rate: stats.error_rate,
            in_flight: self.in_flight(),
        }
    }
}

/// Per-sample EMA smoothing constant for a given half-life in samples.
fn ema_alpha(half_life_samples: u32) -> f64 {
    let half_life = f64::from(half_life_samples.max(1));
    1.0 - 0.5f64.powf(1.0 / half_life)
}

pub struct InFlightGuard {
    instance: Arc<ModelInstance>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.instance.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
