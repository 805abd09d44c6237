//! Capability surface over a single rendered browser page.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("timed out after {waited:?} waiting for `{selector}`")]
    Timeout { selector: String, waited: Duration },
    #[error("element reference went stale: {0}")]
    Stale(String),
    #[error("browser command failed: {0}")]
    Command(String),
    #[error("browser session is unusable: {0}")]
    Unusable(String),
}

impl SessionError {
    /// Only an unusable session ends the run; everything else is scoped to one candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unusable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// The operations the scout needs from a page. Callers borrow the session for one call
/// at a time and never hold element handles across a re-resolution of the result list.
#[async_trait]
pub trait PageSession: Send + Sync {
    type Element: Clone + Debug + Send + Sync;

    async fn goto(&self, url: &str) -> Result<(), SessionError>;

    async fn find_all(&self, selector: &str) -> Result<Vec<Self::Element>, SessionError>;

    async fn find_all_within(
        &self,
        scope: &Self::Element,
        selector: &str,
    ) -> Result<Vec<Self::Element>, SessionError>;

    async fn attribute(
        &self,
        element: &Self::Element,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    async fn text(&self, element: &Self::Element) -> Result<String, SessionError>;

    async fn is_clickable(&self, element: &Self::Element) -> Result<bool, SessionError>;

    /// Native pointer click.
    async fn click(&self, element: &Self::Element) -> Result<(), SessionError>;

    /// Click dispatched from script, for controls that sit under an overlay.
    async fn script_click(&self, element: &Self::Element) -> Result<(), SessionError>;

    /// Detaches the element from the render tree.
    async fn remove(&self, element: &Self::Element) -> Result<(), SessionError>;

    /// Hides the parent container of the first match. Returns whether anything was hidden.
    async fn hide_container_of(&self, selector: &str) -> Result<bool, SessionError>;

    async fn send_escape(&self, element: &Self::Element) -> Result<(), SessionError>;

    async fn scroll_to_bottom(&self) -> Result<(), SessionError>;

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError>;

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<Option<Self::Element>, SessionError> {
        Ok(self.find_all(selector).await?.into_iter().next())
    }

    async fn find_within(
        &self,
        scope: &Self::Element,
        selector: &str,
    ) -> Result<Option<Self::Element>, SessionError> {
        Ok(self.find_all_within(scope, selector).await?.into_iter().next())
    }

    /// Polls until `selector` is present, bounded by `timeout`.
    async fn wait_for(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Self::Element, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(selector).await {
                Ok(Some(element)) => return Ok(element),
                Ok(None) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(selector, error = %err, "transient error while waiting"),
            }
            pause_until_next_poll(selector, deadline, timeout).await?;
        }
    }

    /// Polls until `selector` is present and clickable, bounded by `timeout`.
    async fn wait_for_clickable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Self::Element, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(selector).await {
                Ok(Some(element)) => match self.is_clickable(&element).await {
                    Ok(true) => return Ok(element),
                    Ok(false) => {}
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => debug!(selector, error = %err, "clickability check failed"),
                },
                Ok(None) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(selector, error = %err, "transient error while waiting"),
            }
            pause_until_next_poll(selector, deadline, timeout).await?;
        }
    }

    /// Polls until nothing matches `selector`, bounded by `timeout`.
    async fn wait_until_absent(&self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(selector).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(selector, error = %err, "transient error while waiting"),
            }
            pause_until_next_poll(selector, deadline, timeout).await?;
        }
    }
}

async fn pause_until_next_poll(
    selector: &str,
    deadline: Instant,
    waited: Duration,
) -> Result<(), SessionError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(SessionError::Timeout {
            selector: selector.to_string(),
            waited,
        });
    }
    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    Ok(())
}
