use crate::client::GenerationBackend;
use crate::error::{BackendError, Result};
use crate::registry::BackendRegistry;
use desk_protocol::{GenerationParams, ModelTier};
use std::time::{Duration, Instant};

/// A completed generation with the instance that produced it.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub instance_id: String,
    pub latency_ms: u64,
}

/// Dispatch one prompt through the load balancer with a hard per-call
/// timeout and a single automatic retry against a different instance on
/// timeout/connection error. A second failure is surfaced, never silently
/// retried again.
pub async fn dispatch(
    registry: &BackendRegistry,
    backend: &dyn GenerationBackend,
    tier: ModelTier,
    prompt: &str,
    params: &GenerationParams,
    per_call_timeout: Duration,
) -> Result<Generation> {
    let first = registry.select(tier)?;
    match generate_on(registry, backend, &first, prompt, params, per_call_timeout).await {
        Ok(generation) => Ok(generation),
        Err(err) if err.is_transient() => {
            log::warn!(
                "Generation on {} failed ({err}), retrying on a different instance",
                first.id()
            );
            let retry = registry
                .select_excluding(tier, &[first.id()])
                .map_err(|_| err)?;
            generate_on(registry, backend, &retry, prompt, params, per_call_timeout).await
        }
        Err(err) => Err(err),
    }
}

/// One bounded attempt against a specific instance, with in-flight tracking
/// and outcome reporting. Consensus fan-out calls this directly with the
/// instances it selected.
pub async fn generate_on(
    registry: &BackendRegistry,
    backend: &dyn GenerationBackend,
    instance: &std::sync::Arc<crate::instance::ModelInstance>,
    prompt: &str,
    params: &GenerationParams,
    per_call_timeout: Duration,
) -> Result<Generation> {
    let _guard = instance.begin_request();
    let started = Instant::now();

    let outcome = tokio::time::timeout(
        per_call_timeout,
        backend.generate(instance, prompt, params),
    )
    .await;

    let latency_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(text)) => {
            registry.report_outcome(instance.id(), true, latency_ms);
            Ok(Generation {
                text,
                instance_id: instance.id().to_string(),
                latency_ms,
            })
        }
        Ok(Err(err)) => {
            registry.report_outcome(instance.id(), false, latency_ms);
            Err(err)
        }
        Err(_) => {
            registry.report_outcome(instance.id(), false, latency_ms);
            Err(BackendError::Timeout {
                instance: instance.id().to_string(),
                timeout_ms: per_call_timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceCapabilities, ModelInstance};
    use async_trait::async_trait;
    use desk_protocol::config::BalancerConfig;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Backend where listed instance ids fail with a connection error.
    struct PartialBackend {
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationBackend for PartialBackend {
        async fn generate(
            &self,
            instance: &ModelInstance,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String> {
            self.calls.lock().unwrap().push(instance.id().to_string());
            if self.failing.contains(instance.id()) {
                return Err(BackendError::Connection {
                    instance: instance.id().to_string(),
                    message: "refused".to_string(),
                });
            }
            Ok(format!("answer from {}", instance.id()))
        }

        async fn list_models(&self, _instance: &ModelInstance) -> Result<Vec<String>> {
            Ok(vec!["m".to_string()])
        }
    }

    fn registry(n: usize) -> BackendRegistry {
        let instances = (0..n)
            .map(|i| {
                Arc::new(ModelInstance::new(
                    format!("inst-{i}"),
                    format!("http://localhost:800{i}"),
                    InstanceCapabilities {
                        models: vec!["m".to_string()],
                        max_context_tokens: 8_192,
                        tiers: vec![ModelTier::Fast],
                    },
                ))
            })
            .collect();
        BackendRegistry::new(instances, BalancerConfig::default())
    }

    #[tokio::test]
    async fn retries_once_on_a_different_instance() {
        let reg = registry(2);
        let backend = PartialBackend {
            failing: HashSet::from(["inst-0".to_string()]),
            calls: Mutex::new(Vec::new()),
        };

        // Pin the first selection to inst-0 by excluding nothing and relying
        // on round-robin order from a fresh cursor.
        let generation = dispatch(
            &reg,
            &backend,
            ModelTier::Fast,
            "prompt",
            &GenerationParams::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(generation.text, "answer from inst-1");
        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0], calls[1]);
    }

    #[tokio::test]
    async fn second_failure_is_surfaced_not_retried() {
        let reg = registry(2);
        let backend = PartialBackend {
            failing: HashSet::from(["inst-0".to_string(), "inst-1".to_string()]),
            calls: Mutex::new(Vec::new()),
        };

        let err = dispatch(
            &reg,
            &backend,
            ModelTier::Fast,
            "prompt",
            &GenerationParams::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn single_instance_failure_returns_original_error() {
        let reg = registry(1);
        let backend = PartialBackend {
            failing: HashSet::from(["inst-0".to_string()]),
            calls: Mutex::new(Vec::new()),
        };

        let err = dispatch(
            &reg,
            &backend,
            ModelTier::Fast,
            "prompt",
            &GenerationParams::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BackendError::Connection { .. }));
        assert_eq!(backend.calls.lock().unwrap().len(), 1);
    }
}
