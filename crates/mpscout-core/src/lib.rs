//! Core domain model for the marketplace listing scout.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod age;

pub use age::{parse_config_duration, parse_relative_age, DEFAULT_CONFIG_DURATION, UNPARSEABLE_AGE};

pub const CRATE_NAME: &str = "mpscout-core";

static ITEM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/item/(\d+)/").expect("item id pattern is valid"));

/// Extracts the numeric listing id from an item link such as `/marketplace/item/123/`.
pub fn item_id_from_link(link: &str) -> Option<String> {
    ITEM_ID
        .captures(link)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Snapshot of one rendered listing card, rebuilt every time the result list is re-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Candidate {
    pub external_id: Option<String>,
    pub raw_link: String,
    pub display_title: Option<String>,
    pub shipping_marked: bool,
}

impl Candidate {
    pub fn from_link(raw_link: impl Into<String>) -> Self {
        let raw_link = raw_link.into();
        Self {
            external_id: item_id_from_link(&raw_link),
            raw_link,
            display_title: None,
            shipping_marked: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        let trimmed = title.trim();
        self.display_title = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn with_shipping_marker(mut self, marked: bool) -> Self {
        self.shipping_marked = marked;
        self
    }

    /// Best-known label for log lines.
    pub fn log_label(&self) -> &str {
        self.display_title.as_deref().unwrap_or("N/A")
    }
}

/// A candidate that made it through every cheap gate and is worth opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenedListing {
    pub id: String,
    pub title: String,
    pub link: String,
}

/// Durable output for a listing that passed every filter and extracted cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: String,
    pub title: String,
    pub price: String,
    pub location: String,
    pub post_time_str: String,
    pub scraped_at: DateTime<Utc>,
    pub link: String,
    pub image_url: Vec<String>,
}

impl ListingRecord {
    pub fn primary_image(&self) -> Option<&str> {
        self.image_url.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOutcome {
    Duplicate,
    MalformedLink,
    ShippingExcluded,
    KeywordExcluded,
    TitleUnavailable,
    Passed,
}

impl FilterOutcome {
    /// Exclusions based on stable listing properties are written to the ledger for good.
    pub fn records_exclusion(self) -> bool {
        matches!(self, Self::ShippingExcluded | Self::KeywordExcluded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::MalformedLink => "malformed_link",
            Self::ShippingExcluded => "shipping_excluded",
            Self::KeywordExcluded => "keyword_excluded",
            Self::TitleUnavailable => "title_unavailable",
            Self::Passed => "passed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObstructionOutcome {
    DismissedViaControl,
    DismissedViaEscape,
    DismissedViaRemoval,
    NotFound,
}

impl ObstructionOutcome {
    pub fn dismissed(self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Per-term counters reported at the end of each search term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermReport {
    pub term: String,
    pub url: String,
    pub candidates_seen: usize,
    pub committed: usize,
    pub duplicates: usize,
    pub excluded: usize,
    pub skipped: usize,
    pub too_old: usize,
    pub failed: usize,
    pub page_shrank: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub location: String,
    pub terms: Vec<TermReport>,
    pub new_records: usize,
}

impl RunSummary {
    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_requires_numeric_segment() {
        assert_eq!(
            item_id_from_link("https://www.facebook.com/marketplace/item/1234567890/?ref=search"),
            Some("1234567890".to_string())
        );
        assert_eq!(item_id_from_link("https://www.facebook.com/marketplace/item/abc/"), None);
        assert_eq!(item_id_from_link("/marketplace/item/42"), None);
        assert_eq!(item_id_from_link(""), None);
    }

    #[test]
    fn candidate_builder_trims_blank_titles_to_none() {
        let candidate = Candidate::from_link("/marketplace/item/77/").with_title("   ");
        assert_eq!(candidate.external_id.as_deref(), Some("77"));
        assert_eq!(candidate.display_title, None);
        assert_eq!(candidate.log_label(), "N/A");

        let titled = candidate.with_title("  Oak desk ");
        assert_eq!(titled.display_title.as_deref(), Some("Oak desk"));
    }

    #[test]
    fn only_stable_exclusions_hit_the_ledger() {
        let recorded: Vec<_> = [
            FilterOutcome::Duplicate,
            FilterOutcome::MalformedLink,
            FilterOutcome::ShippingExcluded,
            FilterOutcome::KeywordExcluded,
            FilterOutcome::TitleUnavailable,
            FilterOutcome::Passed,
        ]
        .into_iter()
        .filter(|o| o.records_exclusion())
        .collect();
        assert_eq!(
            recorded,
            vec![FilterOutcome::ShippingExcluded, FilterOutcome::KeywordExcluded]
        );
    }

    #[test]
    fn listing_record_serializes_with_snake_case_columns() {
        let record = ListingRecord {
            id: "1".into(),
            title: "Bike".into(),
            price: "$40".into(),
            location: "Austin, TX".into(),
            post_time_str: "5 minutes ago".into(),
            scraped_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            link: "https://www.facebook.com/marketplace/item/1/".into(),
            image_url: vec!["https://cdn.example/1.jpg".into()],
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["post_time_str"], "5 minutes ago");
        assert_eq!(json["image_url"][0], "https://cdn.example/1.jpg");
        assert_eq!(record.primary_image(), Some("https://cdn.example/1.jpg"));
    }
}
