use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use layerport_oci::{Credentials, Platform, RetryPolicy};
use secrecy::SecretString;

use crate::archive::LayerEncoding;
use crate::docker_manifest::LayerLayout;
use crate::logging::{LogFormat, LoggingConfig};
use crate::{Error, Result};

/// Prefix for environment overrides, e.g. `LAYERPORT_CONCURRENCY=4`.
pub const ENV_PREFIX: &str = "LAYERPORT_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Attempts per blob before the run fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff step; attempt `n` waits `n * retry_delay`.
    #[serde(default = "default_retry_delay", with = "duration_str")]
    pub retry_delay: Duration,
    /// Layers downloaded in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Working directory for blobs, manifest.json and repositories.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Abort the whole run after this long.
    #[serde(default, with = "opt_duration_str")]
    pub deadline: Option<Duration>,
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,
    /// `os/arch[/variant]` used to pick from multi-platform images.
    #[serde(default = "default_platform")]
    pub platform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default)]
    pub layout: LayerLayout,
    #[serde(default)]
    pub layer_encoding: LayerEncoding,
}

/// Optional credentials for the registry token service.  The password is
/// read from the environment variable named by `password_env`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            concurrency: default_concurrency(),
            output_dir: default_output_dir(),
            deadline: None,
            connect_timeout: default_connect_timeout(),
            platform: default_platform(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            output: default_archive_output(),
            gzip: false,
            layout: LayerLayout::default(),
            layer_encoding: LayerEncoding::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_concurrency() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_platform() -> String {
    "linux/amd64".to_string()
}

fn default_archive_output() -> PathBuf {
    PathBuf::from("output.tar")
}

impl DownloadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    pub fn platform(&self) -> Result<Platform> {
        Platform::parse(&self.platform).map_err(|e| Error::Config(e.to_string()))
    }
}

impl RegistryConfig {
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        let Some(username) = &self.username else {
            return Ok(None);
        };
        let Some(var) = &self.password_env else {
            return Err(Error::Config(
                "registry.username requires registry.password_env".into(),
            ));
        };
        let password = std::env::var(var).map_err(|_| {
            Error::Config(format!("registry password variable {} is not set", var))
        })?;
        Ok(Some(Credentials {
            username: username.clone(),
            password: SecretString::from(password),
        }))
    }
}

/// Load configuration from `path` (YAML for `.yaml`/`.yml`, JSON otherwise),
/// apply `LAYERPORT_*` environment overrides and validate.  Without a path
/// the defaults are used.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => parse_config_file(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    Ok(config)
}

fn parse_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))
    }
}

/// Override fields from `LAYERPORT_*` variables.  Values that fail to parse
/// leave the existing setting in place.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

    if let Some(n) = var("MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.download.max_retries = n;
    }
    if let Some(d) = var("RETRY_DELAY").and_then(|v| parse_seconds_or_duration(&v)) {
        config.download.retry_delay = d;
    }
    if let Some(n) = var("CONCURRENCY").and_then(|v| v.parse().ok()) {
        config.download.concurrency = n;
    }
    if let Some(dir) = var("OUTPUT_DIR") {
        config.download.output_dir = PathBuf::from(dir);
    }
    if let Some(platform) = var("PLATFORM").filter(|v| Platform::parse(v).is_ok()) {
        config.download.platform = platform;
    }
    if let Some(output) = var("OUTPUT") {
        config.archive.output = PathBuf::from(output);
    }
    if let Some(level) = var("LOG_LEVEL") {
        let candidate = LoggingConfig {
            level,
            ..config.logging.clone()
        };
        if candidate.level_filter().is_ok() {
            config.logging = candidate;
        }
    }
    if let Some(format) = var("LOG_FORMAT").and_then(|v| v.parse::<LogFormat>().ok()) {
        config.logging.format = format;
    }
}

fn parse_seconds_or_duration(raw: &str) -> Option<Duration> {
    raw.parse::<u64>()
        .ok()
        .map(Duration::from_secs)
        .or_else(|| humantime::parse_duration(raw).ok())
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.download.max_retries == 0 {
        return Err(Error::Config("download.max_retries must be at least 1".into()));
    }
    if config.download.concurrency == 0 {
        return Err(Error::Config("download.concurrency must be at least 1".into()));
    }
    if config.download.output_dir.as_os_str().is_empty() {
        return Err(Error::Config("download.output_dir cannot be empty".into()));
    }
    if config.archive.output.as_os_str().is_empty() {
        return Err(Error::Config("archive.output cannot be empty".into()));
    }
    config.download.platform()?;
    config.logging.level_filter()?;
    if config.registry.username.is_some() && config.registry.password_env.is_none() {
        return Err(Error::Config(
            "registry.username requires registry.password_env".into(),
        ));
    }
    Ok(())
}

mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

mod opt_duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.collect_str(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| humantime::parse_duration(&raw).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.download.max_retries, 5);
        assert_eq!(cfg.download.retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.download.concurrency, 1);
        assert_eq!(cfg.download.platform, "linux/amd64");
        assert_eq!(cfg.archive.layout, LayerLayout::Flat);
        assert_eq!(cfg.archive.layer_encoding, LayerEncoding::Compressed);
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn yaml_config_loads() {
        let yaml = r#"
download:
  max_retries: 3
  retry_delay: 500ms
  concurrency: 4
  deadline: 10m
  platform: linux/arm64/v8
archive:
  output: /tmp/app.tar.gz
  gzip: true
  layout: directory
logging:
  level: debug
  format: json
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layerport.yaml");
        fs::write(&path, yaml).unwrap();

        let cfg = parse_config_file(&path).unwrap();
        validate_config(&cfg).unwrap();
        assert_eq!(cfg.download.max_retries, 3);
        assert_eq!(cfg.download.retry_delay, Duration::from_millis(500));
        assert_eq!(cfg.download.deadline, Some(Duration::from_secs(600)));
        assert_eq!(cfg.download.platform().unwrap().variant.as_deref(), Some("v8"));
        assert!(cfg.archive.gzip);
        assert_eq!(cfg.archive.layout, LayerLayout::Directory);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        // Unset sections keep their defaults.
        assert_eq!(cfg.archive.layer_encoding, LayerEncoding::Compressed);
    }

    #[test]
    fn json_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layerport.json");
        fs::write(&path, r#"{"download":{"concurrency":2}}"#).unwrap();

        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.download.concurrency, 2);
        assert_eq!(cfg.download.max_retries, 5);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = parse_config_file(Path::new("/nonexistent/layerport.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<String, String> = [
            ("LAYERPORT_MAX_RETRIES", "7"),
            ("LAYERPORT_RETRY_DELAY", "3"),
            ("LAYERPORT_CONCURRENCY", "not-a-number"),
            ("LAYERPORT_OUTPUT_DIR", "/var/tmp/export"),
            ("LAYERPORT_LOG_FORMAT", "json"),
            ("LAYERPORT_LOG_LEVEL", "loud"),
            ("LAYERPORT_PLATFORM", "amd64"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).cloned());

        assert_eq!(cfg.download.max_retries, 7);
        assert_eq!(cfg.download.retry_delay, Duration::from_secs(3));
        assert_eq!(cfg.download.concurrency, 1);
        assert_eq!(cfg.download.output_dir, PathBuf::from("/var/tmp/export"));
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.download.platform, "linux/amd64");
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn env_overrides_accept_valid_platform_and_level() {
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg, |k| match k {
            "LAYERPORT_PLATFORM" => Some("linux/arm64/v8".to_string()),
            "LAYERPORT_LOG_LEVEL" => Some("Warning".to_string()),
            _ => None,
        });
        assert_eq!(cfg.download.platform, "linux/arm64/v8");
        assert_eq!(cfg.logging.level, "Warning");
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn retry_delay_accepts_humantime() {
        assert_eq!(
            parse_seconds_or_duration("1m 30s"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(parse_seconds_or_duration("soon"), None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.download.concurrency = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.download.max_retries = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.download.platform = "amd64".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.logging.level = "chatty".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.registry.username = Some("robot".into());
        assert!(validate_config(&cfg).is_err());
    }
}
