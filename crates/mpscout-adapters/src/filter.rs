//! Cheap, ordered gates applied to each candidate before its detail view is opened.

use mpscout_core::{Candidate, FilterOutcome, ScreenedListing};
use mpscout_storage::{DedupLedger, LedgerError};

use crate::selectors;
use crate::session::{PageSession, SessionError};

/// Reads the rendered card into an in-memory [`Candidate`] snapshot.
pub async fn read_candidate<S: PageSession>(
    session: &S,
    card: &S::Element,
) -> Result<Candidate, SessionError> {
    let raw_link = session.attribute(card, "href").await?.unwrap_or_default();
    let candidate = Candidate::from_link(raw_link);
    if candidate.external_id.is_none() {
        return Ok(candidate);
    }
    let shipping_marked = !session
        .find_all_within(card, selectors::SHIPPING_MARKER)
        .await?
        .is_empty();
    let candidate = candidate.with_shipping_marker(shipping_marked);
    match read_label(session, card).await? {
        Some(label) => Ok(candidate.with_title(label)),
        None => Ok(candidate),
    }
}

async fn read_label<S: PageSession>(
    session: &S,
    card: &S::Element,
) -> Result<Option<String>, SessionError> {
    if let Some(img) = session.find_within(card, selectors::CARD_IMAGE).await? {
        if let Some(alt) = session.attribute(&img, "alt").await? {
            if !alt.trim().is_empty() {
                return Ok(Some(alt));
            }
        }
    }
    if let Some(span) = session.find_within(card, selectors::CARD_TITLE).await? {
        let text = session.text(&span).await?;
        if !text.trim().is_empty() {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

#[derive(Debug)]
pub struct FilterDecision {
    pub outcome: FilterOutcome,
    /// Present only when the outcome is `Passed`.
    pub screened: Option<ScreenedListing>,
    /// A permanent exclusion whose durable append failed. The in-memory ledger still has it.
    pub ledger_error: Option<LedgerError>,
}

impl FilterDecision {
    fn rejected(outcome: FilterOutcome) -> Self {
        Self {
            outcome,
            screened: None,
            ledger_error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    anti_keywords: Vec<String>,
}

impl FilterChain {
    pub fn new<I, K>(anti_keywords: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let anti_keywords = anti_keywords
            .into_iter()
            .map(|kw| kw.as_ref().trim().to_lowercase())
            .filter(|kw| !kw.is_empty())
            .collect();
        Self { anti_keywords }
    }

    pub fn anti_keywords(&self) -> &[String] {
        &self.anti_keywords
    }

    pub fn blocked_keyword(&self, title: &str) -> Option<&str> {
        let lower = title.to_lowercase();
        self.anti_keywords
            .iter()
            .find(|kw| lower.contains(kw.as_str()))
            .map(String::as_str)
    }

    /// Applies link shape, dedup, shipping, title and keyword gates in that order.
    ///
    /// Shipping and keyword exclusions are recorded in `ledger` immediately; nothing
    /// else writes to it.
    pub fn evaluate(&self, candidate: &Candidate, ledger: &mut DedupLedger) -> FilterDecision {
        let Some(id) = candidate.external_id.as_deref() else {
            return FilterDecision::rejected(FilterOutcome::MalformedLink);
        };
        if ledger.contains(id) {
            return FilterDecision::rejected(FilterOutcome::Duplicate);
        }
        if candidate.shipping_marked {
            return Self::exclude(FilterOutcome::ShippingExcluded, id, ledger);
        }
        let Some(title) = candidate.display_title.as_deref() else {
            return FilterDecision::rejected(FilterOutcome::TitleUnavailable);
        };
        if self.blocked_keyword(title).is_some() {
            return Self::exclude(FilterOutcome::KeywordExcluded, id, ledger);
        }
        FilterDecision {
            outcome: FilterOutcome::Passed,
            screened: Some(ScreenedListing {
                id: id.to_string(),
                title: title.to_string(),
                link: candidate.raw_link.clone(),
            }),
            ledger_error: None,
        }
    }

    fn exclude(outcome: FilterOutcome, id: &str, ledger: &mut DedupLedger) -> FilterDecision {
        debug_assert!(outcome.records_exclusion());
        FilterDecision {
            outcome,
            screened: None,
            ledger_error: ledger.record(id).err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixturePage, PageFixture};
    use std::fs;
    use tempfile::tempdir;

    fn link(id: &str) -> String {
        format!("https://www.facebook.com/marketplace/item/{id}/?ref=search")
    }

    fn ledger_lines(ledger: &DedupLedger) -> Vec<String> {
        fs::read_to_string(ledger.path())
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn keywords_are_normalized_and_blank_entries_dropped() {
        let chain = FilterChain::new([" Broken ", "", "PARTS only", "  "]);
        assert_eq!(chain.anti_keywords(), ["broken", "parts only"]);
        assert_eq!(chain.blocked_keyword("Laptop - for PARTS ONLY"), Some("parts only"));
        assert_eq!(chain.blocked_keyword("Working laptop"), None);
    }

    #[test]
    fn malformed_link_skips_without_ledger_write() {
        let dir = tempdir().expect("tempdir");
        let mut ledger = DedupLedger::load(dir.path().join("ids.txt")).expect("ledger");
        let candidate = Candidate::from_link("https://www.facebook.com/marketplace/category/").with_title("Sofa");

        let decision = FilterChain::default().evaluate(&candidate, &mut ledger);
        assert_eq!(decision.outcome, FilterOutcome::MalformedLink);
        assert!(ledger.is_empty());
    }

    #[test]
    fn duplicate_beats_shipping_and_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ids.txt");
        fs::write(&path, "42\n").expect("seed");
        let mut ledger = DedupLedger::load(&path).expect("ledger");
        let candidate = Candidate::from_link(link("42"))
            .with_title("Kayak")
            .with_shipping_marker(true);

        let decision = FilterChain::default().evaluate(&candidate, &mut ledger);
        assert_eq!(decision.outcome, FilterOutcome::Duplicate);
        assert_eq!(ledger_lines(&ledger), vec!["42"]);
    }

    #[test]
    fn shipping_exclusion_records_once_even_without_title() {
        let dir = tempdir().expect("tempdir");
        let mut ledger = DedupLedger::load(dir.path().join("ids.txt")).expect("ledger");
        let candidate = Candidate::from_link(link("7")).with_shipping_marker(true);

        let chain = FilterChain::default();
        assert_eq!(chain.evaluate(&candidate, &mut ledger).outcome, FilterOutcome::ShippingExcluded);
        assert_eq!(chain.evaluate(&candidate, &mut ledger).outcome, FilterOutcome::Duplicate);
        assert_eq!(ledger_lines(&ledger), vec!["7"]);
    }

    #[test]
    fn missing_title_never_hits_the_ledger() {
        let dir = tempdir().expect("tempdir");
        let mut ledger = DedupLedger::load(dir.path().join("ids.txt")).expect("ledger");
        let candidate = Candidate::from_link(link("8"));

        let chain = FilterChain::new(["broken"]);
        for _ in 0..3 {
            let decision = chain.evaluate(&candidate, &mut ledger);
            assert_eq!(decision.outcome, FilterOutcome::TitleUnavailable);
        }
        assert!(ledger.is_empty());
        assert!(ledger_lines(&ledger).is_empty());
    }

    #[test]
    fn keyword_exclusion_records_once() {
        let dir = tempdir().expect("tempdir");
        let mut ledger = DedupLedger::load(dir.path().join("ids.txt")).expect("ledger");
        let candidate = Candidate::from_link(link("9")).with_title("iPhone 12 BROKEN screen");

        let decision = FilterChain::new(["broken"]).evaluate(&candidate, &mut ledger);
        assert_eq!(decision.outcome, FilterOutcome::KeywordExcluded);
        assert!(decision.ledger_error.is_none());
        assert_eq!(ledger_lines(&ledger), vec!["9"]);
    }

    #[test]
    fn passing_candidate_is_screened_without_ledger_write() {
        let dir = tempdir().expect("tempdir");
        let mut ledger = DedupLedger::load(dir.path().join("ids.txt")).expect("ledger");
        let candidate = Candidate::from_link(link("10")).with_title("Standing desk");

        let decision = FilterChain::new(["broken"]).evaluate(&candidate, &mut ledger);
        assert_eq!(decision.outcome, FilterOutcome::Passed);
        let screened = decision.screened.expect("screened");
        assert_eq!(screened.id, "10");
        assert_eq!(screened.title, "Standing desk");
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn reads_card_snapshot_with_span_fallback() {
        let page = FixturePage::new(PageFixture {
            cards: vec![
                r#"<a href="/marketplace/item/11/"><img alt="Road bike"><i data-visualcompletion="css-img"></i></a>"#.to_string(),
                r#"<a href="/marketplace/item/12/"><img alt=""><span style="-webkit-line-clamp: 2;">Bookshelf</span></a>"#.to_string(),
                r#"<a href="/marketplace/item/13/"><div>no label</div></a>"#.to_string(),
            ],
            ..Default::default()
        });
        page.goto("https://example.test/").await.expect("goto");
        let cards = page.find_all(selectors::CANDIDATE_LINK).await.expect("cards");

        let first = read_candidate(&page, &cards[0]).await.expect("first");
        assert_eq!(first.external_id.as_deref(), Some("11"));
        assert!(first.shipping_marked);
        assert_eq!(first.display_title.as_deref(), Some("Road bike"));

        let second = read_candidate(&page, &cards[1]).await.expect("second");
        assert!(!second.shipping_marked);
        assert_eq!(second.display_title.as_deref(), Some("Bookshelf"));

        let third = read_candidate(&page, &cards[2]).await.expect("third");
        assert_eq!(third.display_title, None);
    }
}
