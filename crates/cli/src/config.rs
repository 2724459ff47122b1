use anyhow::{Context, Result};
use desk_protocol::{ModelTier, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level config file: orchestrator tunables plus the deployment-specific
/// collaborators (chunk index, embedder, web search) and the backend roster.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DeskConfig {
    pub orchestrator: OrchestratorConfig,
    pub services: ServicesConfig,
    pub backends: Vec<BackendEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ServicesConfig {
    /// Base URL of the chunk retrieval service (vector + lexical search).
    pub index_url: Option<String>,
    /// Base URL of the embedding service.
    pub embed_url: Option<String>,
    /// Base URL of the web search fallback service, if any.
    pub web_search_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendEntry {
    pub id: String,
    pub base_url: String,
    pub models: Vec<String>,
    pub tiers: Vec<ModelTier>,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
}

fn default_max_context_tokens() -> u32 {
    8_192
}

impl DeskConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load from `path` when given, else from `DESK_CONFIG`, else from
    /// `desk.toml` in the working directory, else defaults. Service URLs can
    /// always be overridden from the environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = if let Some(path) = explicit {
            Self::load(path)?
        } else if let Ok(env_path) = std::env::var("DESK_CONFIG") {
            Self::load(Path::new(&env_path))?
        } else {
            let default_path = Path::new("desk.toml");
            if default_path.exists() {
                Self::load(default_path)?
            } else {
                log::warn!("No config file found, using built-in defaults");
                Self::default()
            }
        };
        cfg.services.apply_env();
        Ok(cfg)
    }
}

impl ServicesConfig {
    fn apply_env(&mut self) {
        if let Some(url) = url_from_env("DESK_INDEX_URL") {
            self.index_url = Some(url);
        }
        if let Some(url) = url_from_env("DESK_EMBED_URL") {
            self.embed_url = Some(url);
        }
        if let Some(url) = url_from_env("DESK_WEB_SEARCH_URL") {
            self.web_search_url = Some(url);
        }
    }
}

fn url_from_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_a_full_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[orchestrator]
web_fallback_enabled = true

[orchestrator.fusion]
alpha = 0.6

[services]
index_url = "http://localhost:9200"
embed_url = "http://localhost:9300"

[[backends]]
id = "local-small"
base_url = "http://localhost:8001"
models = ["llama-8b"]
tiers = ["fast", "balanced"]

[[backends]]
id = "local-large"
base_url = "http://localhost:8002"
models = ["llama-70b"]
tiers = ["deep"]
max_context_tokens = 32768
"#
        )
        .unwrap();

        let cfg = DeskConfig::load(file.path()).unwrap();
        assert!(cfg.orchestrator.web_fallback_enabled);
        assert!((cfg.orchestrator.fusion.alpha - 0.6).abs() < f32::EPSILON);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.orchestrator.decompose.max_sub_requests, 5);
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[0].tiers, vec![ModelTier::Fast, ModelTier::Balanced]);
        assert_eq!(cfg.backends[1].max_context_tokens, 32_768);
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let cfg = DeskConfig::default();
        assert!(cfg.backends.is_empty());
        assert!(cfg.services.index_url.is_none());
    }
}
