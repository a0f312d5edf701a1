use crate::batch::{Channel, SourceSet};
use crate::detector::{DetectorKind, DetectorSettings};
use crate::monitor::{ConditionerSettings, MonitorSettings, SegmentPolicy};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_GRPC_SOCKET: &str = "/tmp/health_monitor.sock";

fn setup_config_path() -> Option<PathBuf> {
    env::var("HEALTH_MONITOR_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_pool_size: Option<u32>,
    #[serde(default)]
    setup_database: Option<bool>,
    #[serde(default)]
    serializable: Option<bool>,
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    grpc_socket_path: Option<String>,
    #[serde(default)]
    max_queue: Option<usize>,
    #[serde(default)]
    segment_policy: Option<SegmentPolicy>,
    #[serde(default)]
    noisy_channel: Option<String>,
    #[serde(default)]
    detector: DetectorOverrides,
    #[serde(default)]
    conditioner: ConditionerOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DetectorOverrides {
    #[serde(default)]
    kind: Option<DetectorKind>,
    #[serde(default)]
    word_size: Option<usize>,
    #[serde(default)]
    window_factor: Option<usize>,
    #[serde(default)]
    lead_window_factor: Option<usize>,
    #[serde(default)]
    lag_window_factor: Option<usize>,
    #[serde(default)]
    threshold_sigma: Option<f64>,
    #[serde(default)]
    warmup_scores: Option<usize>,
    #[serde(default)]
    history: Option<usize>,
    #[serde(default)]
    min_history: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConditionerOverrides {
    #[serde(default)]
    filter_order: Option<u32>,
    #[serde(default)]
    min_order: Option<u32>,
    #[serde(default)]
    low_cut: Option<f64>,
    #[serde(default)]
    high_cut: Option<f64>,
    #[serde(default)]
    min_std_threshold: Option<f64>,
    #[serde(default)]
    buffer_capacity: Option<usize>,
    #[serde(default)]
    sample_rate_hz: Option<f64>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "health-monitor failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_overrides(contents, path)
}

fn parse_setup_overrides(mut bytes: Vec<u8>, path: &Path) -> Option<SetupConfigOverrides> {
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "health-monitor failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub setup_database: bool,
    pub serializable: bool,
    pub sources: Vec<String>,
    pub grpc_socket_path: String,
    pub max_queue: usize,
    pub segment_policy: SegmentPolicy,
    pub noisy_channel: Channel,
    pub detector: DetectorSettings,
    pub conditioner: ConditionerSettings,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = setup_config_path()
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();
        Self::from_lookup(|key| env::var(key).ok(), &overrides)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        overrides: &SetupConfigOverrides,
    ) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let flag = |key: &str| {
            var(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let database_url = var("HEALTH_MONITOR_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .database_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
            .map(normalize_database_url);

        let db_pool_size = parse_or(var("HEALTH_MONITOR_DB_POOL_SIZE"), "HEALTH_MONITOR_DB_POOL_SIZE")?
            .or(overrides.db_pool_size.filter(|v| *v != 0))
            .unwrap_or(10);
        let setup_database = flag("HEALTH_MONITOR_SETUP_DATABASE")
            .or(overrides.setup_database)
            .unwrap_or(true);
        let serializable = flag("HEALTH_MONITOR_SERIALIZABLE")
            .or(overrides.serializable)
            .unwrap_or(true);

        let sources = match var("HEALTH_MONITOR_SOURCES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => overrides.sources.clone().unwrap_or_default(),
        };

        let grpc_socket_path = var("HEALTH_MONITOR_GRPC_SOCKET")
            .or_else(|| {
                overrides
                    .grpc_socket_path
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_GRPC_SOCKET.to_string());
        let max_queue = parse_or(var("HEALTH_MONITOR_MAX_QUEUE"), "HEALTH_MONITOR_MAX_QUEUE")?
            .or(overrides.max_queue.filter(|v| *v != 0))
            .unwrap_or(64);

        let segment_policy = match var("HEALTH_MONITOR_SEGMENT_POLICY") {
            Some(raw) => raw
                .parse::<SegmentPolicy>()
                .map_err(anyhow::Error::msg)
                .context("HEALTH_MONITOR_SEGMENT_POLICY")?,
            None => overrides.segment_policy.unwrap_or_default(),
        };
        let noisy_channel = match var("HEALTH_MONITOR_NOISY_CHANNEL")
            .or_else(|| overrides.noisy_channel.clone())
        {
            Some(raw) => raw
                .parse::<Channel>()
                .context("HEALTH_MONITOR_NOISY_CHANNEL")?,
            None => Channel::Ecg,
        };

        let detector = detector_settings(&var, &overrides.detector)?;
        let conditioner = conditioner_settings(&var, &overrides.conditioner)?;
        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            database_url,
            db_pool_size,
            setup_database,
            serializable,
            sources,
            grpc_socket_path,
            max_queue,
            segment_policy,
            noisy_channel,
            detector,
            conditioner,
            otlp_endpoint,
        })
    }

    pub fn source_set(&self) -> Result<SourceSet> {
        SourceSet::new(&self.sources).context("invalid HEALTH_MONITOR_SOURCES")
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            conditioner: self.conditioner.clone(),
            detector: self.detector.clone(),
            segment_policy: self.segment_policy,
            noisy_channel: self.noisy_channel,
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{key}={value:?}: {err}"))
    })
    .transpose()
}

fn detector_settings(
    var: &impl Fn(&str) -> Option<String>,
    overrides: &DetectorOverrides,
) -> Result<DetectorSettings> {
    let defaults = DetectorSettings::default();
    let kind = match var("HEALTH_MONITOR_DETECTOR") {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "bitmap" => DetectorKind::Bitmap,
            "zscore" => DetectorKind::Zscore,
            other => anyhow::bail!("HEALTH_MONITOR_DETECTOR: unknown detector {other:?}"),
        },
        None => overrides.kind.unwrap_or(defaults.kind),
    };
    Ok(DetectorSettings {
        kind,
        word_size: parse_or(var("HEALTH_MONITOR_WORD_SIZE"), "HEALTH_MONITOR_WORD_SIZE")?
            .or(overrides.word_size)
            .unwrap_or(defaults.word_size),
        window_factor: parse_or(var("HEALTH_MONITOR_WINDOW_FACTOR"), "HEALTH_MONITOR_WINDOW_FACTOR")?
            .or(overrides.window_factor)
            .unwrap_or(defaults.window_factor),
        lead_window_factor: parse_or(
            var("HEALTH_MONITOR_LEAD_WINDOW_FACTOR"),
            "HEALTH_MONITOR_LEAD_WINDOW_FACTOR",
        )?
        .or(overrides.lead_window_factor)
        .unwrap_or(defaults.lead_window_factor),
        lag_window_factor: parse_or(
            var("HEALTH_MONITOR_LAG_WINDOW_FACTOR"),
            "HEALTH_MONITOR_LAG_WINDOW_FACTOR",
        )?
        .or(overrides.lag_window_factor)
        .unwrap_or(defaults.lag_window_factor),
        threshold_sigma: parse_or(
            var("HEALTH_MONITOR_THRESHOLD_SIGMA"),
            "HEALTH_MONITOR_THRESHOLD_SIGMA",
        )?
        .or(overrides.threshold_sigma)
        .unwrap_or(defaults.threshold_sigma),
        warmup_scores: parse_or(var("HEALTH_MONITOR_WARMUP_SCORES"), "HEALTH_MONITOR_WARMUP_SCORES")?
            .or(overrides.warmup_scores)
            .unwrap_or(defaults.warmup_scores),
        history: parse_or(var("HEALTH_MONITOR_HISTORY"), "HEALTH_MONITOR_HISTORY")?
            .or(overrides.history)
            .unwrap_or(defaults.history),
        min_history: parse_or(var("HEALTH_MONITOR_MIN_HISTORY"), "HEALTH_MONITOR_MIN_HISTORY")?
            .or(overrides.min_history)
            .unwrap_or(defaults.min_history),
    })
}

fn conditioner_settings(
    var: &impl Fn(&str) -> Option<String>,
    overrides: &ConditionerOverrides,
) -> Result<ConditionerSettings> {
    let defaults = ConditionerSettings::default();
    Ok(ConditionerSettings {
        filter_order: parse_or(var("HEALTH_MONITOR_FILTER_ORDER"), "HEALTH_MONITOR_FILTER_ORDER")?
            .or(overrides.filter_order)
            .unwrap_or(defaults.filter_order),
        min_order: parse_or(var("HEALTH_MONITOR_MIN_ORDER"), "HEALTH_MONITOR_MIN_ORDER")?
            .or(overrides.min_order)
            .unwrap_or(defaults.min_order),
        low_cut: parse_or(var("HEALTH_MONITOR_LOW_CUT"), "HEALTH_MONITOR_LOW_CUT")?
            .or(overrides.low_cut)
            .unwrap_or(defaults.low_cut),
        high_cut: parse_or(var("HEALTH_MONITOR_HIGH_CUT"), "HEALTH_MONITOR_HIGH_CUT")?
            .or(overrides.high_cut)
            .unwrap_or(defaults.high_cut),
        min_std_threshold: parse_or(
            var("HEALTH_MONITOR_MIN_STD_THRESHOLD"),
            "HEALTH_MONITOR_MIN_STD_THRESHOLD",
        )?
        .or(overrides.min_std_threshold)
        .unwrap_or(defaults.min_std_threshold),
        buffer_capacity: parse_or(
            var("HEALTH_MONITOR_BUFFER_CAPACITY"),
            "HEALTH_MONITOR_BUFFER_CAPACITY",
        )?
        .or(overrides.buffer_capacity.filter(|v| *v != 0))
        .unwrap_or(defaults.buffer_capacity),
        sample_rate_hz: parse_or(var("HEALTH_MONITOR_SAMPLE_RATE_HZ"), "HEALTH_MONITOR_SAMPLE_RATE_HZ")?
            .or(overrides.sample_rate_hz)
            .unwrap_or(defaults.sample_rate_hz),
    })
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)], overrides: SetupConfigOverrides) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned(), &overrides)
    }

    #[test]
    fn defaults_without_env() {
        let config = load(&[], SetupConfigOverrides::default()).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.grpc_socket_path, DEFAULT_GRPC_SOCKET);
        assert_eq!(config.segment_policy, SegmentPolicy::FirstSegment);
        assert_eq!(config.noisy_channel, Channel::Ecg);
        assert_eq!(config.detector, DetectorSettings::default());
        assert_eq!(config.conditioner, ConditionerSettings::default());
        assert!(config.serializable);
        assert!(config.setup_database);
        assert!(config.source_set().unwrap().is_empty());
    }

    #[test]
    fn env_values_are_parsed() {
        let config = load(
            &[
                ("DATABASE_URL", "postgresql+psycopg2://monitor@db/health"),
                ("HEALTH_MONITOR_SOURCES", "bed-1, bed-2,,bed-3"),
                ("HEALTH_MONITOR_SEGMENT_POLICY", "all"),
                ("HEALTH_MONITOR_DETECTOR", "zscore"),
                ("HEALTH_MONITOR_FILTER_ORDER", "32"),
                ("HEALTH_MONITOR_SETUP_DATABASE", "1"),
                ("HEALTH_MONITOR_NOISY_CHANNEL", "ecg_v1"),
            ],
            SetupConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgresql://monitor@db/health"));
        assert_eq!(config.source_set().unwrap().len(), 3);
        assert_eq!(config.segment_policy, SegmentPolicy::AllSegments);
        assert_eq!(config.detector.kind, DetectorKind::Zscore);
        assert_eq!(config.conditioner.filter_order, 32);
        assert!(config.setup_database);
        assert_eq!(config.noisy_channel, Channel::Ecg);
    }

    #[test]
    fn env_wins_over_setup_file() {
        let raw = br#"{
            "database_url": "postgresql://file@db/health",
            "max_queue": 12,
            "sources": ["icu-1"],
            "segment_policy": "all_segments",
            "detector": { "kind": "zscore", "word_size": 7 },
            "conditioner": { "buffer_capacity": 2000, "low_cut": 1.5 }
        }"#
        .to_vec();
        let overrides = parse_setup_overrides(raw, Path::new("setup.json")).unwrap();
        let config = load(
            &[
                ("HEALTH_MONITOR_DATABASE_URL", "postgresql://env@db/health"),
                ("HEALTH_MONITOR_WORD_SIZE", "4"),
            ],
            overrides,
        )
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgresql://env@db/health"));
        assert_eq!(config.max_queue, 12);
        assert_eq!(config.sources, vec!["icu-1".to_string()]);
        assert_eq!(config.segment_policy, SegmentPolicy::AllSegments);
        assert_eq!(config.detector.kind, DetectorKind::Zscore);
        assert_eq!(config.detector.word_size, 4);
        assert_eq!(config.conditioner.buffer_capacity, 2000);
        assert_eq!(config.conditioner.low_cut, 1.5);
        assert_eq!(config.conditioner.filter_order, 144);
    }

    #[test]
    fn schema_bootstrap_can_be_disabled() {
        let config = load(
            &[("HEALTH_MONITOR_SETUP_DATABASE", "0")],
            SetupConfigOverrides::default(),
        )
        .unwrap();
        assert!(!config.setup_database);

        let overrides = SetupConfigOverrides {
            setup_database: Some(false),
            ..SetupConfigOverrides::default()
        };
        assert!(!load(&[], overrides).unwrap().setup_database);
    }

    #[test]
    fn bad_values_are_reported() {
        let err = load(
            &[("HEALTH_MONITOR_MAX_QUEUE", "lots")],
            SetupConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("HEALTH_MONITOR_MAX_QUEUE"));
        assert!(load(
            &[("HEALTH_MONITOR_SEGMENT_POLICY", "some")],
            SetupConfigOverrides::default()
        )
        .is_err());
        assert!(parse_setup_overrides(b"{not json".to_vec(), Path::new("x.json")).is_none());
    }

    #[test]
    fn duplicate_sources_are_rejected() {
        let config = load(
            &[("HEALTH_MONITOR_SOURCES", "bed-1,bed-1")],
            SetupConfigOverrides::default(),
        )
        .unwrap();
        assert!(config.source_set().is_err());
    }
}
