use crate::client::GenerationBackend;
use crate::registry::BackendRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn the background health prober. Runs on its own interval, decoupled
/// from request serving; a probe success closes an open circuit breaker,
/// a failure marks the instance unhealthy. Stops when `shutdown` flips.
pub fn spawn_prober(
    registry: Arc<BackendRegistry>,
    backend: Arc<dyn GenerationBackend>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(registry.config().probe_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    probe_all(&registry, backend.as_ref()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("Health prober stopped");
    })
}

async fn probe_all(registry: &BackendRegistry, backend: &dyn GenerationBackend) {
    for instance in registry.instances() {
        match backend.list_models(instance).await {
            Ok(models) => {
                if !instance.is_healthy() {
                    log::info!(
                        "Probe recovered instance {} ({} models available)",
                        instance.id(),
                        models.len()
                    );
                }
                instance.set_healthy(true);
            }
            Err(err) => {
                log::warn!("Probe failed for instance {}: {err}", instance.id());
                instance.set_healthy(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, Result};
    use crate::instance::{InstanceCapabilities, ModelInstance};
    use async_trait::async_trait;
    use desk_protocol::config::BalancerConfig;
    use desk_protocol::{GenerationParams, ModelTier};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyBackend {
        up: AtomicBool,
    }

    #[async_trait]
    impl GenerationBackend for FlakyBackend {
        async fn generate(
            &self,
            _instance: &ModelInstance,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String> {
            unreachable!("probe tests never generate")
        }

        async fn list_models(&self, _instance: &ModelInstance) -> Result<Vec<String>> {
            if self.up.load(Ordering::Relaxed) {
                Ok(vec!["m".to_string()])
            } else {
                Err(BackendError::Connection {
                    instance: "inst-0".to_string(),
                    message: "refused".to_string(),
                })
            }
        }
    }

    fn registry() -> Arc<BackendRegistry> {
        Arc::new(BackendRegistry::new(
            vec![Arc::new(ModelInstance::new(
                "inst-0",
                "http://localhost:8000",
                InstanceCapabilities {
                    models: vec!["m".to_string()],
                    max_context_tokens: 8_192,
                    tiers: vec![ModelTier::Fast],
                },
            ))],
            BalancerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn probe_marks_down_instances_unhealthy_and_recovers_them() {
        let reg = registry();
        let backend = FlakyBackend {
            up: AtomicBool::new(false),
        };

        probe_all(&reg, &backend).await;
        assert!(!reg.instances()[0].is_healthy());

        backend.up.store(true, Ordering::Relaxed);
        probe_all(&reg, &backend).await;
        assert!(reg.instances()[0].is_healthy());
    }
}
