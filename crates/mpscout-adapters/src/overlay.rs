//! Best-effort dismissal of popups, modals and banners that block the results page.

use std::time::Duration;

use mpscout_core::ObstructionOutcome;
use tracing::{debug, error, info, warn};

use crate::selectors;
use crate::session::{PageSession, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Close control scoped to an open dialog.
    DialogCloseControl,
    /// Close control anywhere on the page.
    PageCloseControl,
    /// Overlay with no dismiss affordance; detached from the DOM.
    PersistentOverlayRemoval,
    /// Escape key sent to the page body.
    EscapeKey,
}

impl RecoveryStrategy {
    pub const DEFAULT_ORDER: [RecoveryStrategy; 4] = [
        RecoveryStrategy::DialogCloseControl,
        RecoveryStrategy::PageCloseControl,
        RecoveryStrategy::PersistentOverlayRemoval,
        RecoveryStrategy::EscapeKey,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DialogCloseControl => "dialog_close_control",
            Self::PageCloseControl => "page_close_control",
            Self::PersistentOverlayRemoval => "persistent_overlay_removal",
            Self::EscapeKey => "escape_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayPolicy {
    pub dialog_wait: Duration,
    pub page_wait: Duration,
    pub control_settle: Duration,
    pub removal_settle: Duration,
}

impl OverlayPolicy {
    /// Control waits stay strictly below the main per-action timeout.
    pub fn for_timeout(timeout: Duration) -> Self {
        Self {
            dialog_wait: wait_bound(Duration::from_secs(3), timeout),
            page_wait: wait_bound(Duration::from_secs(2), timeout),
            control_settle: Duration::from_secs(1),
            removal_settle: Duration::from_millis(500),
        }
    }
}

fn wait_bound(nominal: Duration, timeout: Duration) -> Duration {
    if nominal < timeout {
        nominal
    } else {
        timeout / 2
    }
}

#[derive(Debug, Clone)]
pub struct OverlayRecovery {
    policy: OverlayPolicy,
    strategies: Vec<RecoveryStrategy>,
}

impl OverlayRecovery {
    pub fn new(policy: OverlayPolicy) -> Self {
        Self::with_strategies(policy, RecoveryStrategy::DEFAULT_ORDER.to_vec())
    }

    pub fn with_strategies(policy: OverlayPolicy, strategies: Vec<RecoveryStrategy>) -> Self {
        Self { policy, strategies }
    }

    pub fn policy(&self) -> &OverlayPolicy {
        &self.policy
    }

    pub fn strategies(&self) -> &[RecoveryStrategy] {
        &self.strategies
    }

    /// Runs the strategies in order until one dismisses something.
    ///
    /// Only a fatal session error escapes; a page with nothing to dismiss is `NotFound`.
    pub async fn dismiss_obstructions<S: PageSession>(
        &self,
        session: &S,
    ) -> Result<ObstructionOutcome, SessionError> {
        for (position, strategy) in self.strategies.iter().copied().enumerate() {
            match self.attempt(session, strategy).await {
                Ok(Some(outcome)) => {
                    info!(strategy = strategy.name(), ?outcome, "dismissed obstruction");
                    tokio::time::sleep(self.settle_for(outcome)).await;
                    return Ok(outcome);
                }
                Ok(None) => log_miss(position, strategy),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(strategy = strategy.name(), error = %err, "obstruction strategy failed"),
            }
        }
        Ok(ObstructionOutcome::NotFound)
    }

    /// One find-and-act step. `Ok(None)` means the strategy found nothing to act on.
    pub async fn attempt<S: PageSession>(
        &self,
        session: &S,
        strategy: RecoveryStrategy,
    ) -> Result<Option<ObstructionOutcome>, SessionError> {
        match strategy {
            RecoveryStrategy::DialogCloseControl => {
                self.click_control(session, selectors::DIALOG_CLOSE, self.policy.dialog_wait)
                    .await
            }
            RecoveryStrategy::PageCloseControl => {
                self.click_control(session, selectors::PAGE_CLOSE, self.policy.page_wait)
                    .await
            }
            RecoveryStrategy::PersistentOverlayRemoval => {
                match session.find(selectors::PERSISTENT_OVERLAY).await? {
                    Some(overlay) => {
                        session.remove(&overlay).await?;
                        Ok(Some(ObstructionOutcome::DismissedViaRemoval))
                    }
                    None => Ok(None),
                }
            }
            RecoveryStrategy::EscapeKey => match session.find(selectors::BODY).await? {
                Some(body) => {
                    session.send_escape(&body).await?;
                    Ok(Some(ObstructionOutcome::DismissedViaEscape))
                }
                None => Ok(None),
            },
        }
    }

    async fn click_control<S: PageSession>(
        &self,
        session: &S,
        selector: &str,
        wait: Duration,
    ) -> Result<Option<ObstructionOutcome>, SessionError> {
        match session.wait_for_clickable(selector, wait).await {
            Ok(control) => {
                session.script_click(&control).await?;
                Ok(Some(ObstructionOutcome::DismissedViaControl))
            }
            Err(err) if err.is_timeout() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn settle_for(&self, outcome: ObstructionOutcome) -> Duration {
        match outcome {
            ObstructionOutcome::DismissedViaRemoval => self.policy.removal_settle,
            ObstructionOutcome::NotFound => Duration::ZERO,
            _ => self.policy.control_settle,
        }
    }
}

fn log_miss(position: usize, strategy: RecoveryStrategy) {
    match position {
        0 => warn!(strategy = strategy.name(), "no obstruction matched"),
        1 => info!(strategy = strategy.name(), "no obstruction matched"),
        _ => debug!(strategy = strategy.name(), "no obstruction matched"),
    }
}

/// Hides the login prompt that has no close control. Returns whether it was present.
pub async fn hide_login_prompt<S: PageSession>(session: &S) -> Result<bool, SessionError> {
    match session.hide_container_of(selectors::LOGIN_PROMPT_FORM).await {
        Ok(true) => {
            info!("hid the persistent login prompt");
            Ok(true)
        }
        Ok(false) => Ok(false),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            error!(error = %err, "could not hide the login prompt");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{DetailFixture, FixturePage, OverlayFixture, PageFixture};
    use std::collections::BTreeMap;

    fn page(overlays: OverlayFixture, with_dialog: bool) -> PageFixture {
        let mut details = BTreeMap::new();
        if with_dialog {
            details.insert("9".to_string(), DetailFixture::new("<p>detail</p>"));
        }
        PageFixture {
            cards: vec![r#"<a href="/marketplace/item/9/"><img alt="Grill"></a>"#.to_string()],
            details,
            overlays,
            ..Default::default()
        }
    }

    async fn open_first_card(session: &FixturePage) {
        let cards = session.find_all(selectors::CANDIDATE_LINK).await.expect("cards");
        session.click(&cards[0]).await.expect("click");
    }

    #[test]
    fn control_waits_stay_below_the_main_timeout() {
        let policy = OverlayPolicy::for_timeout(Duration::from_secs(10));
        assert_eq!(policy.dialog_wait, Duration::from_secs(3));
        assert_eq!(policy.page_wait, Duration::from_secs(2));

        let tight = OverlayPolicy::for_timeout(Duration::from_secs(2));
        assert!(tight.dialog_wait < Duration::from_secs(2));
        assert!(tight.page_wait < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn open_dialog_is_closed_by_its_own_control() {
        let session = FixturePage::new(page(OverlayFixture::default(), true));
        session.goto("https://example.test/").await.expect("goto");
        open_first_card(&session).await;

        let recovery = OverlayRecovery::new(OverlayPolicy::for_timeout(Duration::from_secs(10)));
        let outcome = recovery.dismiss_obstructions(&session).await.expect("dismiss");
        assert_eq!(outcome, ObstructionOutcome::DismissedViaControl);
        assert!(session.open_dialog().is_none());
        assert_eq!(session.log().escapes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_overlay_is_removed_before_escape() {
        let session = FixturePage::new(page(
            OverlayFixture {
                persistent_overlay: true,
                ..Default::default()
            },
            false,
        ));
        session.goto("https://example.test/").await.expect("goto");

        let recovery = OverlayRecovery::new(OverlayPolicy::for_timeout(Duration::from_secs(10)));
        let outcome = recovery.dismiss_obstructions(&session).await.expect("dismiss");
        assert_eq!(outcome, ObstructionOutcome::DismissedViaRemoval);
        assert_eq!(session.log().overlays_removed, 1);
        assert_eq!(session.log().escapes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn escape_is_the_last_resort() {
        let session = FixturePage::new(page(OverlayFixture::default(), false));
        session.goto("https://example.test/").await.expect("goto");

        let recovery = OverlayRecovery::new(OverlayPolicy::for_timeout(Duration::from_secs(10)));
        let outcome = recovery.dismiss_obstructions(&session).await.expect("dismiss");
        assert_eq!(outcome, ObstructionOutcome::DismissedViaEscape);
        assert_eq!(session.log().escapes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_strategies_report_not_found() {
        let session = FixturePage::new(page(OverlayFixture::default(), false));
        session.goto("https://example.test/").await.expect("goto");

        let recovery = OverlayRecovery::with_strategies(
            OverlayPolicy::for_timeout(Duration::from_secs(10)),
            vec![
                RecoveryStrategy::DialogCloseControl,
                RecoveryStrategy::PersistentOverlayRemoval,
            ],
        );
        let outcome = recovery.dismiss_obstructions(&session).await.expect("dismiss");
        assert_eq!(outcome, ObstructionOutcome::NotFound);
        assert!(!outcome.dismissed());
    }

    #[tokio::test(start_paused = true)]
    async fn page_level_control_dismisses_login_modal() {
        let session = FixturePage::new(page(
            OverlayFixture {
                page_close_control: true,
                ..Default::default()
            },
            false,
        ));
        session.goto("https://example.test/").await.expect("goto");

        let recovery = OverlayRecovery::new(OverlayPolicy::for_timeout(Duration::from_secs(10)));
        let step = recovery
            .attempt(&session, RecoveryStrategy::PageCloseControl)
            .await
            .expect("attempt");
        assert_eq!(step, Some(ObstructionOutcome::DismissedViaControl));
        let again = recovery
            .attempt(&session, RecoveryStrategy::PageCloseControl)
            .await
            .expect("attempt");
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn login_prompt_is_hidden_once() {
        let session = FixturePage::new(page(
            OverlayFixture {
                login_prompt: true,
                ..Default::default()
            },
            false,
        ));
        session.goto("https://example.test/").await.expect("goto");
        assert!(hide_login_prompt(&session).await.expect("hide"));
        assert!(!hide_login_prompt(&session).await.expect("hide again"));
    }
}
