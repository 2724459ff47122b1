use crate::error::{BackendError, Result};
use crate::instance::ModelInstance;
use desk_protocol::config::BalancerConfig;
use desk_protocol::{InstanceHealth, ModelTier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Scores within this relative band of the best are treated as tied and
/// rotated round-robin so equal instances are not starved.
const TIE_EPSILON: f64 = 1e-9;

/// Shared registry of generation backend instances. Instances are registered
/// at startup and never removed; health flips via probes and outcome
/// reporting.
pub struct BackendRegistry {
    instances: Vec<Arc<ModelInstance>>,
    cfg: BalancerConfig,
    cursor: AtomicUsize,
}

impl BackendRegistry {
    #[must_use]
    pub fn new(instances: Vec<Arc<ModelInstance>>, cfg: BalancerConfig) -> Self {
        Self {
            instances,
            cfg,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BalancerConfig {
        &self.cfg
    }

    #[must_use]
    pub fn instances(&self) -> &[Arc<ModelInstance>] {
        &self.instances
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ModelInstance>> {
        self.instances.iter().find(|i| i.id() == id).cloned()
    }

    /// Select the highest-scoring healthy instance serving `tier`.
    ///
    /// Returns `NoHealthyBackend` deterministically when nothing qualifies;
    /// never blocks or hangs.
    pub fn select(&self, tier: ModelTier) -> Result<Arc<ModelInstance>> {
        self.select_excluding(tier, &[])
    }

    /// Selection with an exclusion list, used by the retry path to avoid the
    /// instance that just failed.
    pub fn select_excluding(&self, tier: ModelTier, exclude: &[&str]) -> Result<Arc<ModelInstance>> {
        let candidates: Vec<(&Arc<ModelInstance>, f64)> = self
            .instances
            .iter()
            .filter(|i| i.is_healthy() && i.serves_tier(tier))
            .filter(|i| !exclude.contains(&i.id()))
            .map(|i| (i, i.selection_score(&self.cfg)))
            .collect();

        let best = candidates
            .iter()
            .map(|(_, score)| *score)
            .fold(f64::MIN, f64::max);
        if candidates.is_empty() {
            return Err(BackendError::NoHealthyBackend);
        }

        let tied: Vec<&Arc<ModelInstance>> = candidates
            .iter()
            .filter(|(_, score)| (best - *score).abs() <= TIE_EPSILON)
            .map(|(i, _)| *i)
            .collect();

        // Round-robin across tied instances.
        let pick = self.cursor.fetch_add(1, Ordering::AcqRel) % tied.len();
        Ok(Arc::clone(tied[pick]))
    }

    /// Fold a request outcome into the instance's statistics and open the
    /// circuit breaker after the configured run of consecutive failures.
    pub fn report_outcome(&self, instance_id: &str, success: bool, latency_ms: u64) {
        let Some(instance) = self.get(instance_id) else {
            log::warn!("Outcome reported for unknown instance '{instance_id}'");
            return;
        };
        let consecutive = instance.record_outcome(success, latency_ms, &self.cfg);
        if !success && consecutive >= self.cfg.circuit_breaker_failures {
            log::warn!(
                "Circuit breaker opened for {} after {} consecutive failures",
                instance_id,
                consecutive
            );
            instance.set_healthy(false);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<InstanceHealth> {
        self.instances.iter().map(|i| i.snapshot()).collect()
    }
}
