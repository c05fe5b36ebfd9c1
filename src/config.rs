//! Configuration for the round-table server.
//!
//! Settings are layered: `roundtable.toml` → environment (including a `.env`
//! file loaded at startup) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = ".roundtable/roundtable.db"
//! dev_mode = false
//!
//! [llm]
//! provider = "azure"
//! model = "gpt-4o"
//! endpoint = "https://example.openai.azure.com"
//! api_version = "2024-02-15-preview"
//! temperature = 0.7
//! timeout_secs = 120
//!
//! [kamiwaza]
//! api_uri = "http://localhost:7777"
//!
//! [logging]
//! filter = "info"
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "roundtable.toml";

/// Text-generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Deterministic offline backend
    #[default]
    Echo,
    Azure,
    #[serde(rename = "openai")]
    OpenAi,
    /// Self-hosted OpenAI-compatible server
    Kamiwaza,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Echo => write!(f, "echo"),
            LlmProvider::Azure => write!(f, "azure"),
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Kamiwaza => write!(f, "kamiwaza"),
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(LlmProvider::Echo),
            "azure" => Ok(LlmProvider::Azure),
            "openai" => Ok(LlmProvider::OpenAi),
            "kamiwaza" | "local" => Ok(LlmProvider::Kamiwaza),
            _ => anyhow::bail!(
                "Invalid LLM provider '{}'. Valid values: echo, azure, openai, kamiwaza",
                s
            ),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a local frontend dev server
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".roundtable/roundtable.db")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Generation backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    /// Model or deployment name; each provider has its own default
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL of the backend (Azure resource endpoint, OpenAI base, local server `/v1`)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_version() -> String {
    "2024-02-15-preview".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: None,
            api_key: None,
            endpoint: None,
            api_version: default_api_version(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    /// Configured model, or the provider's default.
    pub fn model_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider {
            LlmProvider::Azure => "gpt-4o".to_string(),
            LlmProvider::OpenAi => "gpt-4".to_string(),
            LlmProvider::Kamiwaza => "local".to_string(),
            LlmProvider::Echo => "echo".to_string(),
        }
    }

    /// Check that the selected provider has what it needs to make requests.
    pub fn validate(&self) -> Result<()> {
        match self.provider {
            LlmProvider::Echo => {}
            LlmProvider::Azure => {
                if self.api_key.as_deref().is_none_or(str::is_empty) {
                    anyhow::bail!("Azure OpenAI API key not configured (AZURE_OPENAI_API_KEY)");
                }
                if self.endpoint.as_deref().is_none_or(str::is_empty) {
                    anyhow::bail!("Azure OpenAI endpoint not configured (AZURE_OPENAI_ENDPOINT)");
                }
            }
            LlmProvider::OpenAi => {
                if self.api_key.as_deref().is_none_or(str::is_empty) {
                    anyhow::bail!("OpenAI API key not configured (OPENAI_API_KEY)");
                }
            }
            LlmProvider::Kamiwaza => {
                if self.endpoint.as_deref().is_none_or(str::is_empty) {
                    anyhow::bail!("Kamiwaza endpoint not configured (KAMIWAZA_HOST / KAMIWAZA_PORT)");
                }
                if self.model.is_none() {
                    anyhow::bail!("Kamiwaza model not configured (KAMIWAZA_MODEL)");
                }
            }
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!("temperature must be between 0.0 and 2.0, got {}", self.temperature);
        }
        Ok(())
    }
}

/// Kamiwaza deployment server used to list deployed models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KamiwazaSettings {
    /// Base URI of the Kamiwaza API, e.g. `http://localhost:7777`
    #[serde(default)]
    pub api_uri: Option<String>,
}

/// Log output settings. `RUST_LOG` takes precedence over `filter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Complete `roundtable.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundTableConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub kamiwaza: KamiwazaSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RoundTableConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse roundtable.toml")
    }

    /// Load from `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize roundtable.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Provider-specific variables are read for the provider that is active
    /// after `ACTIVE_LLM_CONFIG` has been applied.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("ROUNDTABLE_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = get("ROUNDTABLE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid ROUNDTABLE_PORT '{}'", port))?;
        }
        if let Some(filter) = get("ROUNDTABLE_LOG") {
            self.logging.filter = filter;
        }
        if let Some(uri) = get("KAMIWAZA_API_URI") {
            self.kamiwaza.api_uri = Some(uri.trim_end_matches('/').to_string());
        }
        if let Some(provider) = get("ACTIVE_LLM_CONFIG") {
            self.llm.provider = provider.parse()?;
        }

        let parse_f32 = |key: &str, raw: String| -> Result<f32> {
            raw.parse()
                .with_context(|| format!("Invalid {} '{}'", key, raw))
        };

        let llm = &mut self.llm;
        match llm.provider {
            LlmProvider::Echo => {}
            LlmProvider::Azure => {
                if let Some(key) = get("AZURE_OPENAI_API_KEY") {
                    llm.api_key = Some(key);
                }
                if let Some(endpoint) = get("AZURE_OPENAI_ENDPOINT") {
                    llm.endpoint = Some(endpoint.trim_end_matches('/').to_string());
                }
                if let Some(model) = get("AZURE_OPENAI_MODEL") {
                    llm.model = Some(model);
                }
                if let Some(version) = get("AZURE_OPENAI_API_VERSION") {
                    llm.api_version = version;
                }
                if let Some(raw) = get("AZURE_OPENAI_TEMPERATURE") {
                    llm.temperature = parse_f32("AZURE_OPENAI_TEMPERATURE", raw)?;
                }
            }
            LlmProvider::OpenAi => {
                if let Some(key) = get("OPENAI_API_KEY") {
                    llm.api_key = Some(key);
                }
                if let Some(model) = get("OPENAI_MODEL") {
                    llm.model = Some(model);
                }
                if let Some(base) = get("OPENAI_API_BASE") {
                    llm.endpoint = Some(base.trim_end_matches('/').to_string());
                }
                if let Some(raw) = get("OPENAI_TEMPERATURE") {
                    llm.temperature = parse_f32("OPENAI_TEMPERATURE", raw)?;
                }
            }
            LlmProvider::Kamiwaza => {
                if let Some(port) = get("KAMIWAZA_PORT") {
                    let host = get("KAMIWAZA_HOST").unwrap_or_else(|| "localhost".to_string());
                    llm.endpoint = Some(format!("http://{}:{}/v1", host, port));
                }
                if let Some(model) = get("KAMIWAZA_MODEL") {
                    llm.model = Some(model);
                }
                if let Some(raw) = get("KAMIWAZA_TEMPERATURE") {
                    llm.temperature = parse_f32("KAMIWAZA_TEMPERATURE", raw)?;
                }
                if let Some(raw) = get("KAMIWAZA_MAX_TOKENS") {
                    llm.max_tokens = Some(
                        raw.parse()
                            .with_context(|| format!("Invalid KAMIWAZA_MAX_TOKENS '{}'", raw))?,
                    );
                } else if llm.max_tokens.is_none() {
                    llm.max_tokens = Some(150);
                }
            }
        }
        Ok(())
    }
}
