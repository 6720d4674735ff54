use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tracked: TrackedConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("yieldsync.db")
}

/// Staging area shared with the interceptor process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StagingConfig {
    /// Directory holding `{id}_PENDING` / `{id}_COMPLETE` artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Artifact file extension (without the dot).
    #[serde(default = "default_artifact_ext")]
    pub artifact_ext: String,
    /// JSON side file remembering which candidate URL resolved each entity.
    #[serde(default = "default_url_cache_path")]
    pub url_cache_path: PathBuf,
    /// Directory for per-identifier diagnostic logs.
    #[serde(default = "default_diagnostics_dir")]
    pub diagnostics_dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            artifact_ext: default_artifact_ext(),
            url_cache_path: default_url_cache_path(),
            diagnostics_dir: default_diagnostics_dir(),
        }
    }
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_artifact_ext() -> String {
    "txt".to_string()
}

fn default_url_cache_path() -> PathBuf {
    PathBuf::from("logs/url_list.json")
}

fn default_diagnostics_dir() -> PathBuf {
    PathBuf::from("logs/identifiers")
}

/// Description of the upstream source: page URLs and its data API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Candidate historical-data page templates, in priority order.
    /// `{name}` and `{period}` are substituted.
    #[serde(default = "default_url_templates")]
    pub url_templates: Vec<String>,
    /// Entity names that the source spells differently in its URLs.
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, String>,
    /// Id of the element holding the page's embedded JSON state.
    #[serde(default = "default_embedded_element_id")]
    pub embedded_element_id: String,
    /// Prefix of the data API requests the interceptor acts on.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Regex with one capture group extracting the identifier from the API URL.
    #[serde(default = "default_identifier_pattern")]
    pub identifier_pattern: String,
    #[serde(default = "default_start_param")]
    pub start_param: String,
    #[serde(default = "default_end_param")]
    pub end_param: String,
    /// Maximum rows the API returns per response.
    #[serde(default = "default_page_size_limit")]
    pub page_size_limit: usize,
    /// Start of the fetch window for entities with no observations.
    #[serde(default = "default_epoch_floor")]
    pub epoch_floor: NaiveDate,
    /// User-Agent set on forwarded API requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url_templates: default_url_templates(),
            aliases: default_aliases(),
            embedded_element_id: default_embedded_element_id(),
            api_prefix: default_api_prefix(),
            identifier_pattern: default_identifier_pattern(),
            start_param: default_start_param(),
            end_param: default_end_param(),
            page_size_limit: default_page_size_limit(),
            epoch_floor: default_epoch_floor(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_url_templates() -> Vec<String> {
    vec![
        "https://www.investing.com/rates-bonds/{name}-{period}-year-bond-yield-historical-data"
            .to_string(),
        "https://www.investing.com/rates-bonds/{name}-{period}-years-bond-yield-historical-data"
            .to_string(),
        "https://www.investing.com/rates-bonds/{name}-{period}-year-historical-data".to_string(),
    ]
}

fn default_aliases() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("u.k.".to_string(), "uk".to_string()),
        ("belgium".to_string(), "belguim".to_string()),
    ])
}

fn default_embedded_element_id() -> String {
    "__NEXT_DATA__".to_string()
}

fn default_api_prefix() -> String {
    "https://api.investing.com/api/financialdata/historical/".to_string()
}

fn default_identifier_pattern() -> String {
    r"historical/(\d+)".to_string()
}

fn default_start_param() -> String {
    "start-date".to_string()
}

fn default_end_param() -> String {
    "end-date".to_string()
}

fn default_page_size_limit() -> usize {
    5000
}

fn default_epoch_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.159 Safari/537.36".to_string()
}

/// WebDriver browser configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    /// Start a private driver process for every session. When false, all
    /// sessions share the driver at `webdriver_url`.
    #[serde(default = "default_true")]
    pub spawn_driver: bool,
    /// Driver executable started per session.
    #[serde(default = "default_driver_path")]
    pub driver_path: String,
    #[serde(default = "default_driver_startup_timeout")]
    pub driver_startup_timeout_secs: u64,
    /// Shared WebDriver endpoint, used when `spawn_driver` is false.
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Firefox binary override.
    #[serde(default)]
    pub firefox_binary: Option<String>,
    /// Proxy every session routes through (host:port). None = direct.
    #[serde(default = "default_proxy")]
    pub proxy: Option<String>,
    /// Accept certificates the browser cannot verify (the interceptor's).
    #[serde(default = "default_true")]
    pub accept_insecure_certs: bool,
    /// Template profile; each session runs on a private copy of it.
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
    /// Interceptor CA certificate to install into `profile_dir`.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default = "default_certutil_path")]
    pub certutil_path: String,
    #[serde(default = "default_page_load_timeout")]
    pub page_load_timeout_secs: u64,
    #[serde(default = "default_element_timeout")]
    pub element_timeout_secs: u64,
    /// Element waits per candidate page before giving up on it.
    #[serde(default = "default_element_retries")]
    pub element_retries: u32,
    /// HTTP timeout for WebDriver commands.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            spawn_driver: true,
            driver_path: default_driver_path(),
            driver_startup_timeout_secs: default_driver_startup_timeout(),
            webdriver_url: default_webdriver_url(),
            headless: true,
            firefox_binary: None,
            proxy: default_proxy(),
            accept_insecure_certs: true,
            profile_dir: None,
            ca_cert_path: None,
            certutil_path: default_certutil_path(),
            page_load_timeout_secs: default_page_load_timeout(),
            element_timeout_secs: default_element_timeout(),
            element_retries: default_element_retries(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl BrowserConfig {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.element_timeout_secs)
    }
}

fn default_driver_path() -> String {
    "geckodriver".to_string()
}

fn default_driver_startup_timeout() -> u64 {
    10
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:4444".to_string()
}

fn default_true() -> bool {
    true
}

fn default_proxy() -> Option<String> {
    Some("127.0.0.1:8080".to_string())
}

fn default_certutil_path() -> String {
    "certutil".to_string()
}

fn default_page_load_timeout() -> u64 {
    5
}

fn default_element_timeout() -> u64 {
    10
}

fn default_element_retries() -> u32 {
    2
}

fn default_command_timeout() -> u64 {
    60
}

/// Ingestion run configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Concurrent workers, each owning one browser session.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Delay between artifact polls (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Artifact polls per wait cycle.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    /// Address the interceptor listens on, probed before a run.
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: String,
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    #[serde(default = "default_probe_delay")]
    pub probe_delay_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            proxy_addr: default_proxy_addr(),
            probe_retries: default_probe_retries(),
            probe_delay_secs: default_probe_delay(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_workers() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_max_polls() -> u32 {
    30
}

fn default_proxy_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_probe_retries() -> u32 {
    5
}

fn default_probe_delay() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    10
}

/// Which entities and periods are ingested.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackedConfig {
    /// Entity names (lowercase, dash-separated, e.g. "united-states").
    #[serde(default)]
    pub entities: Vec<String>,
    /// Periods in years.
    #[serde(default = "default_periods")]
    pub periods: Vec<u32>,
    /// Also track every entity listed in the live table.
    #[serde(default = "default_true")]
    pub discover_from_live_table: bool,
}

impl Default for TrackedConfig {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            periods: default_periods(),
            discover_from_live_table: true,
        }
    }
}

fn default_periods() -> Vec<u32> {
    vec![2, 5]
}

/// Live snapshot configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_realtime_url")]
    pub url: String,
    /// Element that signals the live table has rendered.
    #[serde(default = "default_table_element_id")]
    pub table_element_id: String,
    #[serde(default = "default_realtime_interval")]
    pub interval_secs: u64,
    /// Market clock offset from UTC, used for minute flooring and bucketing.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_realtime_retries")]
    pub element_retries: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_realtime_url(),
            table_element_id: default_table_element_id(),
            interval_secs: default_realtime_interval(),
            utc_offset_minutes: default_utc_offset(),
            element_retries: default_realtime_retries(),
        }
    }
}

fn default_realtime_url() -> String {
    "https://www.investing.com/rates-bonds/world-government-bonds?maturity_from=10&maturity_to=310"
        .to_string()
}

fn default_table_element_id() -> String {
    "rates_bonds_table_99".to_string()
}

fn default_realtime_interval() -> u64 {
    60
}

fn default_utc_offset() -> i32 {
    8 * 60
}

fn default_realtime_retries() -> u32 {
    3
}

/// Metrics export.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Prometheus textfile written after each run, if set.
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.database.path.to_str().unwrap(), "yieldsync.db");
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.max_polls, 30);
        assert_eq!(config.source.page_size_limit, 5000);
        assert_eq!(
            config.source.epoch_floor,
            NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
        );
        assert_eq!(config.tracked.periods, vec![2, 5]);
        assert_eq!(config.realtime.utc_offset_minutes, 480);
        assert!(config.metrics.textfile_path.is_none());
    }

    #[test]
    fn test_default_aliases() {
        let source = SourceConfig::default();
        assert_eq!(source.aliases.get("u.k.").map(String::as_str), Some("uk"));
        assert_eq!(
            source.aliases.get("belgium").map(String::as_str),
            Some("belguim")
        );
    }

    #[test]
    fn test_deserialize_custom_sections() {
        let toml = r#"
[database]
path = "/data/yields.sqlite"

[source]
url_templates = ["https://example.test/{name}-{period}"]
page_size_limit = 3
epoch_floor = "1990-01-01"

[source.aliases]
"south-korea" = "korea"

[scheduler]
workers = 5
poll_interval_ms = 10

[tracked]
entities = ["germany", "france"]
periods = [10]
discover_from_live_table = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.path.to_str().unwrap(), "/data/yields.sqlite");
        assert_eq!(config.source.url_templates.len(), 1);
        assert_eq!(config.source.page_size_limit, 3);
        assert_eq!(
            config.source.epoch_floor,
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()
        );
        assert_eq!(config.source.aliases.len(), 1);
        assert_eq!(config.scheduler.workers, 5);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.tracked.entities, vec!["germany", "france"]);
        assert!(!config.tracked.discover_from_live_table);
    }

    #[test]
    fn test_browser_proxy_can_be_disabled() {
        let toml = r#"
[browser]
proxy = "10.0.0.2:3128"
headless = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.browser.proxy.as_deref(), Some("10.0.0.2:3128"));
        assert!(!config.browser.headless);
        assert_eq!(config.browser.page_load_timeout(), Duration::from_secs(5));
    }
}
