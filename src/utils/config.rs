use crate::report::CsvOptions;
use crate::source::webdriver::{FirstPagePolicy, Selectors};
use crate::traversal::{
    Clock, FilterMode, Period, PeriodUnit, PollSettings, StabilitySettings, TraversalSettings,
};
use anyhow::Result;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config location when `CONFIG_FILE` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix of environment overrides, e.g. `PAGE_TALLY__TRAVERSAL__MAX_ADVANCES=50`
pub const ENV_PREFIX: &str = "PAGE_TALLY";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub columns: ColumnsConfig,
    pub filter: FilterConfig,
    pub traversal: TraversalConfig,
    pub source: SourceConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Label shown in summaries
    pub name: String,
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "page-tally".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Header labels of the columns read from each row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnsConfig {
    pub category: String,
    pub timestamp: String,
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            category: "Fax".to_string(),
            timestamp: "Created Time".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub mode: FilterMode,
    pub period: PeriodUnit,
    pub week_start: Weekday,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::All,
            period: PeriodUnit::Week,
            week_start: Weekday::Mon,
        }
    }
}

impl FilterConfig {
    pub fn period(&self) -> Period {
        Period {
            unit: self.period,
            week_start: self.week_start,
        }
    }
}

/// Timing and limits of a traversal. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub poll_interval_ms: u64,
    pub stability_samples: usize,
    pub render_max_wait_ms: u64,
    pub transition_max_wait_ms: u64,
    pub post_change_delay_ms: u64,
    pub min_non_blank_ratio: f64,
    pub max_advances: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            stability_samples: 2,
            render_max_wait_ms: 20_000,
            transition_max_wait_ms: 20_000,
            post_change_delay_ms: 500,
            min_non_blank_ratio: 0.05,
            max_advances: 500,
        }
    }
}

impl TraversalConfig {
    pub fn stability(&self) -> StabilitySettings {
        StabilitySettings {
            poll: PollSettings {
                interval: Duration::from_millis(self.poll_interval_ms),
                max_wait: Duration::from_millis(self.render_max_wait_ms),
            },
            samples: self.stability_samples.max(1),
            min_non_blank_ratio: self.min_non_blank_ratio,
        }
    }

    pub fn transition(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_wait: Duration::from_millis(self.transition_max_wait_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// WebDriver server, e.g. a local chromedriver/geckodriver
    pub webdriver_url: String,
    /// Attach to this session instead of opening a new one
    pub session_id: Option<String>,
    /// List view to open before traversing
    pub start_url: Option<String>,
    pub request_timeout_ms: u64,
    pub first_page: FirstPagePolicy,
    pub selectors: Selectors,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            session_id: None,
            start_url: None,
            request_timeout_ms: 10_000,
            first_page: FirstPagePolicy::default(),
            selectors: Selectors::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub category_header: String,
    pub include_total: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            file_prefix: "lead_types_by_fax".to_string(),
            category_header: "LeadType(Fax)".to_string(),
            include_total: true,
        }
    }
}

impl ReportConfig {
    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            category_header: self.category_header.clone(),
            file_prefix: self.file_prefix.clone(),
            include_total: self.include_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "pretty".to_string(),
            file_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Write the text exposition here at the end of a run; empty prints to stdout
    pub output_path: String,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Layer the TOML file (if present) with `PAGE_TALLY__SECTION__KEY` overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load from `CONFIG_FILE` or the default path
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn traversal_settings(&self, clock: Clock) -> TraversalSettings {
        let mut settings = TraversalSettings::new(&self.columns.category, &self.columns.timestamp);
        settings.stability = self.traversal.stability();
        settings.transition = self.traversal.transition();
        settings.post_change_delay = Duration::from_millis(self.traversal.post_change_delay_ms);
        settings.max_advances = self.traversal.max_advances;
        settings.period = self.filter.period();
        settings.clock = clock;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        let settings = config.traversal_settings(Clock::System);
        assert_eq!(settings.columns.category, "Fax");
        assert_eq!(settings.stability.samples, 2);
        assert_eq!(settings.stability.poll.interval, Duration::from_millis(250));
        assert_eq!(settings.transition.max_wait, Duration::from_secs(20));
        assert_eq!(settings.post_change_delay, Duration::from_millis(500));
        assert_eq!(settings.max_advances, 500);
        assert_eq!(config.source.first_page.per_page_value, "10");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [columns]
            category = "Lead Source"

            [filter]
            mode = "previous-period"
            period = "month"

            [traversal]
            max_advances = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.columns.category, "Lead Source");
        assert_eq!(config.columns.timestamp, "Created Time");
        assert_eq!(config.filter.mode, FilterMode::PreviousPeriod);
        assert_eq!(config.filter.period().unit, PeriodUnit::Month);
        assert_eq!(config.traversal.max_advances, 20);
        assert_eq!(config.traversal.poll_interval_ms, 250);
    }

    #[test]
    fn test_environment_overrides_file() {
        std::env::set_var("PAGE_TALLY__TRAVERSAL__MAX_ADVANCES", "7");
        std::env::set_var("PAGE_TALLY__COLUMNS__CATEGORY", "Lead Source");
        std::env::set_var("PAGE_TALLY__LOGGING__LEVEL", "debug");
        let config = Config::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml"));
        std::env::remove_var("PAGE_TALLY__TRAVERSAL__MAX_ADVANCES");
        std::env::remove_var("PAGE_TALLY__COLUMNS__CATEGORY");
        std::env::remove_var("PAGE_TALLY__LOGGING__LEVEL");

        let config = config.unwrap();
        assert_eq!(config.traversal.max_advances, 7);
        assert_eq!(config.columns.category, "Lead Source");
        assert_eq!(config.logging.level, "debug");
        // untouched keys still come from the file
        assert_eq!(config.report.category_header, "LeadType(Fax)");
    }

    #[test]
    fn test_load_shipped_default_config() {
        let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml")).unwrap();
        assert_eq!(config.report.category_header, "LeadType(Fax)");
        assert_eq!(config.filter.week_start, Weekday::Mon);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::from_file("config/does-not-exist.toml").is_err());
    }
}
