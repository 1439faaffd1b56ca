use garde::Validate;
use serde::Deserialize;
use strum::{Display, EnumString};

/// Classification strategy, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClassifierKind {
    Wd14,
    DeepDanbooru,
}

/// How the process drives the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunMode {
    Single,
    Continuous,
    Scheduled,
    HealthOnly,
}

/// One independently credentialed Immich library the orchestrator can target.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryConfig {
    pub name: String,
    pub api_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("configuration validation failed: {0}")]
    Invalid(#[from] garde::Report),

    #[error("no Immich credentials configured: set IMMICH_API_KEY or IMMICH_LIBRARIES")]
    MissingCredentials,

    #[error("malformed IMMICH_LIBRARIES entry '{0}': expected name:api_key")]
    MalformedLibrary(String),
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Immich server base URL (e.g. "https://photos.example.com").
    #[garde(custom(base_url_has_scheme))]
    pub immich_base_url: String,

    /// Single-library legacy credential.
    #[garde(skip)]
    pub immich_api_key: Option<String>,

    /// Multi-library credential list, "name1:key1,name2:key2".
    #[garde(skip)]
    pub immich_libraries: Option<String>,

    /// Minimum confidence for a predicted tag to be applied.
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Batch size hint; the server ultimately dictates page size.
    #[garde(range(min = 1, max = 500))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Marker tag applied to fully processed assets.
    #[garde(length(min = 1, max = 100))]
    #[serde(default = "default_processed_tag_name")]
    pub processed_tag_name: String,

    /// Failures before an asset is marked permanently failed.
    /// 0 means permanent on the first failure.
    #[garde(skip)]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Path of the JSON failure store.
    #[garde(length(min = 1))]
    #[serde(default = "default_failure_file")]
    pub failure_file: String,

    /// Additional request attempts beyond the first.
    #[garde(range(max = 10))]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential backoff base, milliseconds.
    #[garde(range(min = 1))]
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-attempt request timeout, seconds.
    #[garde(range(min = 1, max = 600))]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Tag cache time-to-live, seconds.
    #[garde(range(min = 1))]
    #[serde(default = "default_tag_cache_ttl_secs")]
    pub tag_cache_ttl_secs: u64,

    #[garde(skip)]
    #[serde(default = "default_tagging_model")]
    pub tagging_model: ClassifierKind,

    /// Directory holding the wd14 model and label files.
    #[garde(length(min = 1))]
    #[serde(default = "default_model_cache_dir")]
    pub model_cache_dir: String,

    /// Remote DeepDanbooru inference endpoint; required when selected.
    #[garde(skip)]
    pub deepdanbooru_url: Option<String>,

    #[garde(skip)]
    #[serde(default = "default_run_mode")]
    pub run_mode: RunMode,

    /// Optional cap on continuous-mode cycles.
    #[garde(skip)]
    pub max_cycles: Option<u64>,

    /// Pause between continuous cycles, milliseconds.
    #[garde(skip)]
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,

    /// Five-field cron expression for scheduled mode.
    #[garde(length(min = 1))]
    #[serde(default = "default_cron_schedule")]
    pub cron_schedule: String,

    /// IANA time zone name the cron expression is evaluated in.
    #[garde(length(min = 1))]
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Missed-trigger catch-up window, hours.
    #[garde(range(min = 1))]
    #[serde(default = "default_schedule_lookback_hours")]
    pub schedule_lookback_hours: i64,

    #[garde(range(min = 1, max = 65535))]
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// How long a health probe's connectivity result stays cached, seconds.
    #[garde(range(min = 1))]
    #[serde(default = "default_health_probe_ttl_secs")]
    pub health_probe_ttl_secs: u64,
}

fn base_url_has_scheme(value: &String, _ctx: &()) -> garde::Result {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(garde::Error::new(
            "IMMICH_BASE_URL must start with http:// or https://",
        ))
    }
}

fn default_confidence_threshold() -> f32 {
    0.35
}
fn default_batch_size() -> usize {
    25
}
fn default_processed_tag_name() -> String {
    "auto:processed".to_string()
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_failure_file() -> String {
    "processing_failures.json".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_tag_cache_ttl_secs() -> u64 {
    300
}
fn default_tagging_model() -> ClassifierKind {
    ClassifierKind::Wd14
}
fn default_model_cache_dir() -> String {
    "/app/models".to_string()
}
fn default_run_mode() -> RunMode {
    RunMode::Continuous
}
fn default_cycle_delay_ms() -> u64 {
    1000
}
fn default_cron_schedule() -> String {
    // Daily at 02:00
    "0 2 * * *".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_schedule_lookback_hours() -> i64 {
    24
}
fn default_health_port() -> u16 {
    8000
}
fn default_health_probe_ttl_secs() -> u64 {
    3600
}

impl AppConfig {
    /// Load and validate configuration from the environment (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config: AppConfig = envy::from_env()?;
        config.immich_base_url = config.immich_base_url.trim_end_matches('/').to_string();
        config.validate()?;
        config.libraries()?;
        Ok(config)
    }

    /// Resolve the configured library list.
    ///
    /// `IMMICH_LIBRARIES` takes precedence; `IMMICH_API_KEY` alone yields a
    /// single library named "default". At least one credential is required.
    pub fn libraries(&self) -> Result<Vec<LibraryConfig>, ConfigError> {
        if let Some(list) = self
            .immich_libraries
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            let mut libraries = Vec::new();
            for entry in list.split(',') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                let (name, api_key) = entry
                    .split_once(':')
                    .ok_or_else(|| ConfigError::MalformedLibrary(entry.to_string()))?;
                let (name, api_key) = (name.trim(), api_key.trim());
                if name.is_empty() || api_key.is_empty() {
                    return Err(ConfigError::MalformedLibrary(entry.to_string()));
                }
                libraries.push(LibraryConfig {
                    name: name.to_string(),
                    api_key: api_key.to_string(),
                });
            }
            if libraries.is_empty() {
                return Err(ConfigError::MissingCredentials);
            }
            return Ok(libraries);
        }

        match self
            .immich_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
        {
            Some(key) => Ok(vec![LibraryConfig {
                name: "default".to_string(),
                api_key: key.trim().to_string(),
            }]),
            None => Err(ConfigError::MissingCredentials),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AppConfig {
        AppConfig {
            immich_base_url: "https://photos.example.com".to_string(),
            immich_api_key: Some("key-1".to_string()),
            immich_libraries: None,
            confidence_threshold: default_confidence_threshold(),
            batch_size: default_batch_size(),
            processed_tag_name: default_processed_tag_name(),
            failure_threshold: default_failure_threshold(),
            failure_file: default_failure_file(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            tag_cache_ttl_secs: default_tag_cache_ttl_secs(),
            tagging_model: default_tagging_model(),
            model_cache_dir: default_model_cache_dir(),
            deepdanbooru_url: None,
            run_mode: default_run_mode(),
            max_cycles: None,
            cycle_delay_ms: default_cycle_delay_ms(),
            cron_schedule: default_cron_schedule(),
            timezone: default_timezone(),
            schedule_lookback_hours: default_schedule_lookback_hours(),
            health_port: default_health_port(),
            health_probe_ttl_secs: default_health_probe_ttl_secs(),
        }
    }

    #[test]
    fn legacy_key_yields_default_library() {
        let libs = minimal().libraries().unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].name, "default");
        assert_eq!(libs[0].api_key, "key-1");
    }

    #[test]
    fn library_list_takes_precedence_over_legacy_key() {
        let mut config = minimal();
        config.immich_libraries = Some("family:abc, archive:def".to_string());
        let libs = config.libraries().unwrap();
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[0].name, "family");
        assert_eq!(libs[1].api_key, "def");
    }

    #[test]
    fn malformed_library_entry_is_rejected() {
        let mut config = minimal();
        config.immich_libraries = Some("family".to_string());
        assert!(matches!(
            config.libraries(),
            Err(ConfigError::MalformedLibrary(_))
        ));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let mut config = minimal();
        config.immich_api_key = None;
        assert!(matches!(
            config.libraries(),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[test]
    fn bad_base_url_fails_validation() {
        let mut config = minimal();
        config.immich_base_url = "photos.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_confidence_fails_validation() {
        let mut config = minimal();
        config.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mode_strings_parse() {
        use std::str::FromStr;
        assert_eq!(RunMode::from_str("health-only").unwrap(), RunMode::HealthOnly);
        assert_eq!(
            ClassifierKind::from_str("deepdanbooru").unwrap(),
            ClassifierKind::DeepDanbooru
        );
    }
}
