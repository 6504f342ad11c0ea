use crate::error::AppError;
use directories::ProjectDirs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "agent-meter";
pub const ENV_PREFIX: &str = "AGENT_METER";

pub fn normalize_provider_name(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("AGENT_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "agent-meter", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".agent-meter"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_provider: String,
    pub base_url: Option<String>,
    pub default_model: String,
    pub agent_models: BTreeMap<String, String>,
    pub max_tokens_per_call: u32,
    pub thinking_budget_tokens: u32,
    pub request_timeout_secs: u64,
    pub environment: String,
    pub log_level: String,
    pub database_path: Option<PathBuf>,
    pub prompt_caching: PromptCachingSettings,
    pub retry: RetrySettings,
    pub budget: BudgetSettings,
    pub pricing_overrides: Vec<PricingOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptCachingSettings {
    pub enabled: bool,
    pub min_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub monthly_budget_usd: Decimal,
    pub warning_ratio: Decimal,
    pub critical_ratio: Decimal,
}

/// Rates in USD per million tokens for an exact model id. Missing cache
/// rates are derived from the input rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverride {
    pub model_id: String,
    pub input_per_1m: Decimal,
    pub output_per_1m: Decimal,
    pub cache_write_per_1m: Option<Decimal>,
    pub cache_read_per_1m: Option<Decimal>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let opus = "claude-opus-4-6";
        let sonnet = "claude-sonnet-4-6";
        let haiku = "claude-haiku-4-5-20251001";
        let agent_models = [
            ("manager", opus),
            ("fundamental_analyst", opus),
            ("business_analyst", sonnet),
            ("finance_researcher", sonnet),
            ("ai_analyst", sonnet),
            ("data_engineer", haiku),
            ("technical_analyst", haiku),
            ("qa_tester", haiku),
            ("project_manager", haiku),
        ]
        .into_iter()
        .map(|(agent, model)| (agent.to_string(), model.to_string()))
        .collect();

        Self {
            api_provider: "anthropic".into(),
            base_url: None,
            default_model: sonnet.into(),
            agent_models,
            max_tokens_per_call: 4096,
            thinking_budget_tokens: 8_000,
            request_timeout_secs: 120,
            environment: "production".into(),
            log_level: "info".into(),
            database_path: None,
            prompt_caching: PromptCachingSettings::default(),
            retry: RetrySettings::default(),
            budget: BudgetSettings::default(),
            pricing_overrides: vec![],
        }
    }
}

impl Default for PromptCachingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chars: 1024,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            monthly_budget_usd: Decimal::new(100, 0),
            warning_ratio: Decimal::new(60, 2),
            critical_ratio: Decimal::new(80, 2),
        }
    }
}

impl AppConfig {
    /// Model identifier for an agent, falling back to `default_model`.
    pub fn model_for(&self, agent_name: &str) -> &str {
        self.agent_models
            .get(&agent_name.trim().to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Storage location: the configured path, else the ledger file under the data dir.
pub fn db_path(cfg: &AppConfig) -> Result<PathBuf, AppError> {
    match &cfg.database_path {
        Some(path) => Ok(path.clone()),
        None => Ok(data_dir()?.join("ledger.sqlite")),
    }
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) {
    config.api_provider = normalize_provider_name(&config.api_provider);
    config.agent_models = std::mem::take(&mut config.agent_models)
        .into_iter()
        .map(|(agent, model)| (agent.trim().to_ascii_lowercase(), model.trim().to_string()))
        .collect();
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

/// Defaults, then the TOML file at `path` if present, then
/// `AGENT_METER__*` environment variables.
pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    let layered = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(false),
        )
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut parsed: AppConfig = layered.try_deserialize()?;
    normalize_config(&mut parsed);
    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), AppError> {
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn set_api_key(provider: &str, key: &str) -> Result<(), AppError> {
    let normalized = normalize_provider_name(provider);
    let entry = keyring::Entry::new(SERVICE_NAME, &format!("provider:{normalized}"))?;
    entry.set_password(key)?;
    Ok(())
}

pub fn delete_api_key(provider: &str) -> Result<(), AppError> {
    let normalized = normalize_provider_name(provider);
    let entry = keyring::Entry::new(SERVICE_NAME, &format!("provider:{normalized}"))?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(AppError::Keyring(e)),
    }
}

pub fn get_api_key(provider: &str) -> Result<String, AppError> {
    let normalized = normalize_provider_name(provider);
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, &format!("provider:{normalized}")) {
        if let Ok(value) = entry.get_password() {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }

    let env_name = format!(
        "{}_API_KEY",
        normalized.to_ascii_uppercase().replace('-', "_")
    );
    if let Ok(value) = std::env::var(env_name) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Config(format!(
        "No API key found for provider '{normalized}'. Run `agent-meter set-key` or set the env var."
    )))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !cfg_path.exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_provider_name_trims_and_lowercases() {
        assert_eq!(normalize_provider_name(" Anthropic "), "anthropic");
    }

    #[test]
    fn model_for_uses_agent_map_then_default() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.model_for("manager"), "claude-opus-4-6");
        assert_eq!(cfg.model_for(" Data_Engineer "), "claude-haiku-4-5-20251001");
        assert_eq!(cfg.model_for("someone_new"), "claude-sonnet-4-6");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let cfg = load_config_from(&tmp.path().join("absent.toml")).expect("load defaults");
        assert_eq!(cfg.max_tokens_per_call, 4096);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.budget.monthly_budget_usd, Decimal::new(100, 0));
        assert!(cfg.prompt_caching.enabled);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
            api_provider = " Anthropic "
            max_tokens_per_call = 2048

            [agent_models]
            "Manager" = "claude-sonnet-4-6"

            [retry]
            initial_backoff_ms = 500

            [[pricing_overrides]]
            model_id = "tier-a"
            input_per_1m = "3"
            output_per_1m = "15"
            "#,
        )
        .expect("write config");

        let cfg = load_config_from(&path).expect("load config");
        assert_eq!(cfg.api_provider, "anthropic");
        assert_eq!(cfg.max_tokens_per_call, 2048);
        assert_eq!(cfg.retry.initial_backoff_ms, 500);
        assert_eq!(cfg.retry.max_backoff_ms, 30_000);
        assert_eq!(cfg.model_for("manager"), "claude-sonnet-4-6");
        assert_eq!(cfg.pricing_overrides.len(), 1);
        assert_eq!(cfg.pricing_overrides[0].output_per_1m, Decimal::new(15, 0));
    }

    #[test]
    fn saved_config_loads_back() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.environment = "staging".into();
        cfg.database_path = Some(tmp.path().join("ledger.sqlite"));
        save_config_to(&path, &cfg).expect("save");

        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.environment, "staging");
        assert_eq!(loaded.database_path, cfg.database_path);
        assert_eq!(loaded.agent_models, cfg.agent_models);
        assert_eq!(loaded.budget.warning_ratio, Decimal::new(60, 2));
    }
}
