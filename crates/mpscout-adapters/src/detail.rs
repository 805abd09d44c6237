//! Opens a screened listing's detail dialog and extracts a complete record from it.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use mpscout_core::{parse_relative_age, ListingRecord, ScreenedListing};
use thiserror::Error;
use tracing::debug;

use crate::selectors;
use crate::session::{PageSession, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailField {
    Price,
    Location,
    Image,
}

impl fmt::Display for DetailField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Price => "price",
            Self::Location => "location",
            Self::Image => "image",
        })
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("detail view did not open within {0:?}")]
    ViewDidNotOpen(Duration),
    #[error("post time did not render within {0:?}")]
    TimeUnavailable(Duration),
    #[error("detail view has no {0}")]
    FieldMissing(DetailField),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ExtractionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Session(err) if err.is_fatal())
    }

    /// Failures worth a screenshot: the view rendered differently than expected.
    pub fn wants_snapshot(&self) -> bool {
        matches!(self, Self::ViewDidNotOpen(_) | Self::TimeUnavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailOutcome {
    Extracted(ListingRecord),
    TooOld { age: Duration, post_time_str: String },
}

#[derive(Debug, Clone)]
pub struct DetailExtractor {
    timeout: Duration,
    max_age: Duration,
    settle: Duration,
}

impl DetailExtractor {
    pub fn new(timeout: Duration, max_age: Duration) -> Self {
        Self {
            timeout,
            max_age,
            settle: Duration::from_secs(1),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Clicks `card` and reads the dialog it opens. Never builds a partial record.
    ///
    /// Closing the dialog afterwards is the caller's job, whatever this returns.
    pub async fn extract<S: PageSession>(
        &self,
        session: &S,
        card: &S::Element,
        listing: &ScreenedListing,
    ) -> Result<DetailOutcome, ExtractionError> {
        session.click(card).await?;
        let dialog = session
            .wait_for(selectors::DIALOG, self.timeout)
            .await
            .map_err(|err| on_timeout(err, ExtractionError::ViewDidNotOpen(self.timeout)))?;
        tokio::time::sleep(self.settle).await;

        let time_el = session
            .wait_for(selectors::POST_TIME, self.timeout)
            .await
            .map_err(|err| on_timeout(err, ExtractionError::TimeUnavailable(self.timeout)))?;
        let post_time_str = session
            .attribute(&time_el, selectors::POST_TIME_ATTR)
            .await?
            .unwrap_or_default();
        let age = parse_relative_age(&post_time_str);
        debug!(listing_id = %listing.id, post_time = %post_time_str, ?age, "parsed post time");
        if age > self.max_age {
            return Ok(DetailOutcome::TooOld { age, post_time_str });
        }

        let price = read_price(session, &dialog)
            .await?
            .ok_or(ExtractionError::FieldMissing(DetailField::Price))?;
        let location = read_location(session, &dialog)
            .await?
            .ok_or(ExtractionError::FieldMissing(DetailField::Location))?;
        let image = read_image(session, &dialog)
            .await?
            .ok_or(ExtractionError::FieldMissing(DetailField::Image))?;

        Ok(DetailOutcome::Extracted(ListingRecord {
            id: listing.id.clone(),
            title: listing.title.clone(),
            price,
            location,
            post_time_str,
            scraped_at: Utc::now(),
            link: listing.link.clone(),
            image_url: vec![image],
        }))
    }
}

fn on_timeout(err: SessionError, replacement: ExtractionError) -> ExtractionError {
    if err.is_timeout() {
        replacement
    } else {
        ExtractionError::Session(err)
    }
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

async fn read_price<S: PageSession>(
    session: &S,
    dialog: &S::Element,
) -> Result<Option<String>, SessionError> {
    for span in session.find_all_within(dialog, selectors::PRICE_SPAN).await? {
        let text = session.text(&span).await?;
        if text.trim_start().starts_with('$') {
            return Ok(non_empty(text));
        }
    }
    Ok(None)
}

async fn read_location<S: PageSession>(
    session: &S,
    dialog: &S::Element,
) -> Result<Option<String>, SessionError> {
    for link in session.find_all_within(dialog, selectors::LOCATION_LINK).await? {
        let mut labelled = false;
        for span in session.find_all_within(&link, selectors::LOCATION_LABEL).await? {
            if !session.text(&span).await?.trim().is_empty() {
                labelled = true;
                break;
            }
        }
        if labelled {
            if let Some(text) = non_empty(session.text(&link).await?) {
                return Ok(Some(text));
            }
        }
    }
    Ok(None)
}

async fn read_image<S: PageSession>(
    session: &S,
    dialog: &S::Element,
) -> Result<Option<String>, SessionError> {
    match session.find_within(dialog, selectors::PRODUCT_PHOTO).await? {
        Some(img) => Ok(session.attribute(&img, "src").await?.and_then(non_empty)),
        None => Ok(None),
    }
}
