//! Engine configuration stored as TOML (default `solver.toml`).

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::flags::DEFAULT_FLAG_PATTERN;

/// Engine configuration (TOML).
///
/// Every table is optional; missing fields fall back to defaults. The value is
/// loaded once at startup and shared read-only with every session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Security policy file. The embedded default policy is used when unset.
    pub policy_path: Option<PathBuf>,

    /// Directory of prompt template overrides (`<kind>.md`).
    pub prompts_dir: Option<PathBuf>,

    /// Root directory for session transcripts.
    pub output_dir: PathBuf,

    pub provider: ProviderSection,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub flags: FlagConfig,

    /// Script language -> engines in priority order.
    pub scripts: BTreeMap<String, Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut scripts = BTreeMap::new();
        scripts.insert(
            "javascript".to_string(),
            vec!["node".to_string(), "deno".to_string(), "bun".to_string()],
        );
        scripts.insert(
            "python".to_string(),
            vec!["python3".to_string(), "python".to_string()],
        );
        Self {
            policy_path: None,
            prompts_dir: None,
            output_dir: PathBuf::from("output"),
            provider: ProviderSection::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            session: SessionConfig::default(),
            flags: FlagConfig::default(),
            scripts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[default]
    #[serde(rename = "deepseek")]
    DeepSeek,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
        }
    }

    fn default_api_key_env(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::DeepSeek => "DEEPSEEK_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderSection {
    pub id: ProviderKind,
    /// Defaults to the provider's public endpoint.
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    /// Retries after the first attempt; max attempts is `max_retries + 1`.
    pub max_retries: u32,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            id: ProviderKind::default(),
            base_url: None,
            model: None,
            api_key_env: None,
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl ProviderSection {
    pub fn api_key_env(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or_else(|| self.id.default_api_key_env())
    }

    /// Build the immutable provider config, reading the credential from the
    /// environment.
    pub fn resolve(&self) -> Result<ProviderConfig> {
        let var = self.api_key_env();
        let credential = std::env::var(var)
            .with_context(|| format!("read provider credential from ${var}"))?;
        if credential.trim().is_empty() {
            return Err(anyhow!("${var} is empty"));
        }
        Ok(self.resolve_with_credential(credential))
    }

    pub fn resolve_with_credential(&self, credential: String) -> ProviderConfig {
        ProviderConfig {
            id: self.id,
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| self.id.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            model: self
                .model
                .clone()
                .unwrap_or_else(|| self.id.default_model().to_string()),
            credential,
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
        }
    }
}

/// Resolved provider settings. Immutable after session start.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub credential: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl ProviderConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("credential", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on the summed backoff sleeps of one request.
    pub max_total_wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_total_wait_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Tool executions (and answered questions) allowed per session.
    pub step_budget: u32,
    pub session_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// Captured bytes per stream; the rest is discarded.
    pub output_limit_bytes: usize,
    /// Byte budget of the conversation view sent to the provider.
    pub context_budget_bytes: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_budget: 30,
            session_timeout_secs: 30 * 60,
            tool_timeout_secs: 120,
            output_limit_bytes: 64_000,
            context_budget_bytes: 200_000,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

impl SessionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlagConfig {
    pub pattern: String,
    pub case_insensitive: bool,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_FLAG_PATTERN.to_string(),
            case_insensitive: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if let Some(url) = &self.provider.base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(anyhow!("provider.base_url must be an http(s) URL"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.base_delay_ms must be <= retry.max_delay_ms"));
        }
        if self.rate_limit.requests_per_minute == 0 || self.rate_limit.burst == 0 {
            return Err(anyhow!(
                "rate_limit.requests_per_minute and rate_limit.burst must be > 0"
            ));
        }
        if self.session.step_budget == 0 {
            return Err(anyhow!("session.step_budget must be > 0"));
        }
        if self.session.session_timeout_secs == 0 || self.session.tool_timeout_secs == 0 {
            return Err(anyhow!("session timeouts must be > 0"));
        }
        if self.session.output_limit_bytes == 0 || self.session.context_budget_bytes == 0 {
            return Err(anyhow!(
                "session.output_limit_bytes and session.context_budget_bytes must be > 0"
            ));
        }
        if !(0.0..=2.0).contains(&self.session.temperature) {
            return Err(anyhow!("session.temperature must be within 0.0..=2.0"));
        }
        Regex::new(&self.flags.pattern).context("flags.pattern is not a valid regex")?;
        for (language, engines) in &self.scripts {
            if engines.is_empty() || engines.iter().any(|e| e.trim().is_empty()) {
                return Err(anyhow!("scripts.{language} must list at least one engine"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("out");
    let tmp_path = path.with_extension(format!("{extension}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("solver.toml");
        let mut cfg = EngineConfig::default();
        cfg.provider.id = ProviderKind::Anthropic;
        cfg.policy_path = Some(PathBuf::from("policy.toml"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("solver.toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("solver.toml");
        fs::write(&path, "[session]\nstep_budget = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.session.step_budget, 5);
        assert_eq!(cfg.session.tool_timeout_secs, 120);
        assert_eq!(cfg.provider.max_retries, 3);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = EngineConfig::default();
        cfg.session.step_budget = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.flags.pattern = "pico{".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.scripts.insert("ruby".to_string(), Vec::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn provider_defaults_follow_kind() {
        let section = ProviderSection {
            id: ProviderKind::OpenAi,
            base_url: Some("http://localhost:9/v1/".to_string()),
            ..ProviderSection::default()
        };
        let provider = section.resolve_with_credential("sk-secret".to_string());
        assert_eq!(provider.base_url, "http://localhost:9/v1");
        assert_eq!(provider.model, "gpt-4o");
        assert_eq!(provider.max_attempts(), 4);
        assert_eq!(section.api_key_env(), "OPENAI_API_KEY");
    }

    #[test]
    fn debug_redacts_credential() {
        let provider =
            ProviderSection::default().resolve_with_credential("sk-very-secret".to_string());
        let rendered = format!("{provider:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
