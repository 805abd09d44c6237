//! YAML configuration, environment overrides, and the per-run settings snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mpscout_core::parse_config_duration;
use mpscout_storage::webhook_is_configured;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "mpscout.yaml";
pub const DEFAULT_BASE_URL: &str = "https://www.facebook.com/marketplace";
/// Location token that switches the CLI to config-driven terms and location.
pub const ALL_TOKEN: &str = "all";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub scraper: ScraperSection,
    pub advanced: AdvancedSection,
    pub output: OutputSection,
    pub notifications: NotificationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperSection {
    pub max_listing_age: String,
    #[serde(deserialize_with = "comma_list")]
    pub anti_keywords: Vec<String>,
    #[serde(deserialize_with = "comma_list")]
    pub search_terms: Vec<String>,
    pub location: String,
}

impl Default for ScraperSection {
    fn default() -> Self {
        Self {
            max_listing_age: "1 hour".to_string(),
            anti_keywords: Vec::new(),
            search_terms: Vec::new(),
            location: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSection {
    /// Seconds.
    pub timeout: u64,
    pub human_delay_seconds: u64,
    pub reveal_passes: usize,
    pub webdriver_url: String,
    pub headless: bool,
    pub base_url: String,
}

impl Default for AdvancedSection {
    fn default() -> Self {
        Self {
            timeout: 20,
            human_delay_seconds: 3,
            reveal_passes: 3,
            webdriver_url: "http://localhost:9515".to_string(),
            headless: false,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub output_file: PathBuf,
    pub deduplication_file: PathBuf,
    pub snapshot_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            output_file: PathBuf::from("marketplace_listings.csv"),
            deduplication_file: PathBuf::from("scraped_ids.txt"),
            snapshot_dir: None,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub slack_enabled: bool,
    pub slack_webhook_url: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommaListRepr {
    Joined(String),
    Items(Vec<String>),
}

/// Accepts `"a, b"` as well as a YAML sequence; entries are trimmed and blanks dropped.
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match Option::<CommaListRepr>::deserialize(deserializer)? {
        Some(CommaListRepr::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
        Some(CommaListRepr::Items(items)) => items,
        None => Vec::new(),
    };
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

impl ScoutConfig {
    /// Reads `path`. A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::read(path)? {
            Some(config) => Ok(config),
            None => {
                warn!(path = %path.display(), "config file not found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Like [`ScoutConfig::load`] but reports a missing file as `None`.
    pub fn read(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)
                .map(Some)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env_overrides(|key| std::env::var(key).ok());
        self
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("MPSCOUT_WEBDRIVER_URL") {
            self.advanced.webdriver_url = url;
        }
        if let Some(url) = lookup("MPSCOUT_SLACK_WEBHOOK_URL") {
            self.notifications.slack_webhook_url = url;
        }
        if let Some(flag) = lookup("MPSCOUT_HEADLESS") {
            self.advanced.headless = matches!(flag.trim(), "1" | "true" | "TRUE" | "True" | "yes");
        }
    }
}

/// Inclusive range a pause is sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = rand::thread_rng().gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Immutable snapshot every stage of a run reads from.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_listing_age: Duration,
    pub anti_keywords: Vec<String>,
    pub timeout: Duration,
    pub dialog_close_timeout: Duration,
    pub human_delay: DelayRange,
    pub candidate_pause: DelayRange,
    pub reveal_passes: usize,
    pub reveal_settle: Duration,
    pub base_url: String,
    pub output_file: PathBuf,
    pub deduplication_file: PathBuf,
    pub snapshot_dir: Option<PathBuf>,
    /// Set only when notifications are enabled and the URL is usable.
    pub slack_webhook_url: Option<String>,
}

impl RunSettings {
    pub fn from_config(config: &ScoutConfig) -> Self {
        let human = Duration::from_secs(config.advanced.human_delay_seconds);
        let webhook = config.notifications.slack_webhook_url.trim();
        let slack_webhook_url = (config.notifications.slack_enabled && webhook_is_configured(webhook))
            .then(|| webhook.to_string());
        if config.notifications.slack_enabled && slack_webhook_url.is_none() {
            warn!("slack notifications enabled without a usable webhook url; notifications disabled");
        }
        Self {
            max_listing_age: parse_config_duration(&config.scraper.max_listing_age),
            anti_keywords: config
                .scraper
                .anti_keywords
                .iter()
                .map(|kw| kw.to_lowercase())
                .collect(),
            timeout: Duration::from_secs(config.advanced.timeout.max(1)),
            dialog_close_timeout: Duration::from_secs(5),
            human_delay: DelayRange::new(human, human + Duration::from_secs(2)),
            candidate_pause: DelayRange::new(Duration::from_secs(1), Duration::from_secs(2)),
            reveal_passes: config.advanced.reveal_passes,
            reveal_settle: Duration::from_secs(3),
            base_url: config.advanced.base_url.trim_end_matches('/').to_string(),
            output_file: config.output.output_file.clone(),
            deduplication_file: config.output.deduplication_file.clone(),
            snapshot_dir: config.output.snapshot_dir.clone(),
            slack_webhook_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPlan {
    pub location: String,
    pub terms: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("a search term is required unless the location is `all`")]
    MissingSearchTerm,
    #[error("config-driven mode needs scraper.search_terms")]
    MissingConfiguredTerms,
    #[error("config-driven mode needs scraper.location")]
    MissingConfiguredLocation,
}

/// Resolves the CLI arguments into the location and terms to scout.
pub fn plan_search(
    config: &ScoutConfig,
    location_arg: &str,
    term_arg: Option<&str>,
) -> Result<SearchPlan, PlanError> {
    if location_arg.trim().eq_ignore_ascii_case(ALL_TOKEN) {
        if config.scraper.search_terms.is_empty() {
            return Err(PlanError::MissingConfiguredTerms);
        }
        let location = config.scraper.location.trim();
        if location.is_empty() {
            return Err(PlanError::MissingConfiguredLocation);
        }
        return Ok(SearchPlan {
            location: location.to_string(),
            terms: config.scraper.search_terms.clone(),
        });
    }
    let term = term_arg
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .ok_or(PlanError::MissingSearchTerm)?;
    Ok(SearchPlan {
        location: location_arg.trim().to_string(),
        terms: vec![term.to_string()],
    })
}
