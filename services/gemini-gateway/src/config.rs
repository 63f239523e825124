//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from the environment variables named in `[credentials]`
//! or from `key_file`, never from the TOML itself.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use dispatcher::{KeySelection, RetryPolicy};
use key_pool::{ClassMap, OperationClass, PoolConfig};
use serde::Deserialize;
use tracing::warn;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Overrides on top of the default operation partitioning.
    #[serde(default)]
    pub operations: ClassMap,
    #[serde(default)]
    pub models: ModelsConfig,
    /// Resolved API keys, in ring order.
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

/// HTTP listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Upstream calls a single batch request may have in flight.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Larger batches are rejected with 400.
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
    /// How long `/health` reports `draining` before the listener stops accepting.
    #[serde(default = "default_drain_notice_ms")]
    pub drain_notice_ms: u64,
}

/// Retry budget and per-attempt timeout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub timeout_ms: u64,
    pub jitter: bool,
    pub rotate_on_transient: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            timeout_ms: 30_000,
            jitter: false,
            rotate_on_transient: false,
        }
    }
}

/// How a request picks its first credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Each operation starts on its designated credential.
    #[default]
    Partitioned,
    /// Every operation starts on the shared cursor.
    RoundRobin,
}

impl Selection {
    pub fn for_operation(self, operation: OperationClass) -> KeySelection {
        match self {
            Selection::Partitioned => KeySelection::Operation(operation),
            Selection::RoundRobin => KeySelection::RoundRobin,
        }
    }
}

/// Where API keys are read from
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Environment variables holding keys, in ring order.
    pub env: Vec<String>,
    /// File with one key per line, appended after the env keys.
    pub key_file: Option<PathBuf>,
    pub min_credentials: usize,
    pub selection: Selection,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env: vec!["GOOGLE_API_KEY".into(), "GOOGLE_API_KEY2".into()],
            key_file: None,
            min_credentials: 2,
            selection: Selection::Partitioned,
        }
    }
}

/// Upstream model names per kind of output
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub text: String,
    pub image: String,
    pub audio: String,
    /// Prebuilt voice for speech output.
    pub voice: String,
    /// Per-operation overrides of the above.
    pub overrides: BTreeMap<OperationClass, String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            text: "gemini-2.0-flash".into(),
            image: "gemini-2.0-flash-preview-image-generation".into(),
            audio: "gemini-2.5-flash-preview-tts".into(),
            voice: "Algenib".into(),
            overrides: BTreeMap::new(),
        }
    }
}

impl ModelsConfig {
    pub fn model_for(&self, operation: OperationClass) -> &str {
        if let Some(model) = self.overrides.get(&operation) {
            return model;
        }
        match operation {
            OperationClass::GenerateImage => &self.image,
            OperationClass::GenerateAudio => &self.audio,
            _ => &self.text,
        }
    }
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_max_connections() -> usize {
    1000
}

fn default_batch_concurrency() -> usize {
    8
}

fn default_max_batch_items() -> usize {
    100
}

fn default_drain_notice_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then resolve keys.
    ///
    /// Key resolution order:
    /// 1. each env var in `credentials.env`, skipping unset or blank ones
    /// 2. lines of `credentials.key_file` (blank lines and `#` comments skipped)
    ///
    /// A key seen twice keeps its first position only.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.keys = config.resolve_keys()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.gateway.upstream_url.starts_with("http://")
            && !self.gateway.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.gateway.upstream_url
            )));
        }
        if self.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.gateway.batch_concurrency == 0 {
            return Err(common::Error::Config(
                "batch_concurrency must be greater than 0".into(),
            ));
        }
        if self.gateway.max_batch_items == 0 {
            return Err(common::Error::Config(
                "max_batch_items must be greater than 0".into(),
            ));
        }
        if self.dispatch.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.dispatch.timeout_ms == 0 {
            return Err(common::Error::Config(
                "timeout_ms must be greater than 0".into(),
            ));
        }
        if self.credentials.min_credentials == 0 {
            return Err(common::Error::Config(
                "min_credentials must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn resolve_keys(&self) -> common::Result<Vec<Secret<String>>> {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |key: Secret<String>, source: &str| {
            if key.is_blank() {
                return;
            }
            if seen.insert(key.expose().clone()) {
                keys.push(key);
            } else {
                warn!(source, key_hint = %key.hint(), "duplicate API key ignored");
            }
        };

        for name in &self.credentials.env {
            if let Ok(value) = std::env::var(name) {
                push(Secret::new(value.trim().to_owned()), name.as_str());
            }
        }

        if let Some(ref key_file) = self.credentials.key_file {
            let contents = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::CredentialSource(format!(
                    "failed to read key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .for_each(|line| push(Secret::new(line.to_owned()), "key_file"));
        }

        Ok(keys)
    }

    /// Pool settings: partitioned mode layers `[operations]` over the default
    /// mapping, round-robin mode uses no mapping at all.
    pub fn pool_config(&self) -> PoolConfig {
        let class_map = match self.credentials.selection {
            Selection::Partitioned => ClassMap::exam_defaults().merged(&self.operations),
            Selection::RoundRobin => ClassMap::new(),
        };
        PoolConfig {
            min_credentials: self.credentials.min_credentials,
            class_map,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.dispatch.max_retries)
            .with_initial_delay(Duration::from_millis(self.dispatch.initial_delay_ms))
            .with_timeout(Duration::from_millis(self.dispatch.timeout_ms))
            .with_jitter(self.dispatch.jitter)
            .with_rotate_on_transient(self.dispatch.rotate_on_transient)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-gateway.toml")
    }
}
