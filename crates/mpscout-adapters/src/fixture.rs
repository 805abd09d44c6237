//! In-memory page used for dry runs and tests.
//!
//! A [`PageFixture`] describes a search-results page as HTML fragments: the listing cards,
//! cards revealed by later scrolls, per-item detail dialogs and the overlays that get in
//! the way. [`FixturePage`] plays that page back through [`PageSession`], including the
//! stale-reference and shrinking-list behavior of a live page.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use mpscout_core::item_id_from_link;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::selectors;
use crate::session::{PageSession, SessionError};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageFixture {
    /// Outer HTML of each listing card rendered on first load.
    #[serde(default)]
    pub cards: Vec<String>,
    /// Cards appended by each successive scroll to the bottom.
    #[serde(default)]
    pub reveal_batches: Vec<Vec<String>>,
    /// Detail dialog inner HTML keyed by item id.
    #[serde(default)]
    pub details: BTreeMap<String, DetailFixture>,
    #[serde(default)]
    pub overlays: OverlayFixture,
    #[serde(default)]
    pub shrink: Option<ShrinkFixture>,
    /// Navigation to any URL containing one of these fragments fails.
    #[serde(default)]
    pub failing_urls: Vec<String>,
    /// After this many card clicks every call reports an unusable session.
    #[serde(default)]
    pub session_dies_after_clicks: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailFixture {
    pub html: String,
    /// When false neither the close control nor escape dismisses the dialog.
    #[serde(default = "default_true")]
    pub closable: bool,
}

impl DetailFixture {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            closable: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayFixture {
    #[serde(default)]
    pub page_close_control: bool,
    #[serde(default)]
    pub persistent_overlay: bool,
    #[serde(default)]
    pub login_prompt: bool,
}

/// Drops the result list to `keep` cards once `after_clicks` cards have been clicked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShrinkFixture {
    pub after_clicks: usize,
    pub keep: usize,
}

pub fn load_page_fixture(path: impl AsRef<Path>) -> Result<PageFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Everything the page was asked to do, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionLog {
    pub visited: Vec<String>,
    pub card_clicks: Vec<String>,
    pub dialogs_closed: usize,
    pub overlays_removed: usize,
    pub escapes: usize,
    pub scrolls: usize,
    pub prompts_hidden: usize,
    pub screenshots: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureNode {
    pub html: String,
    pub text: String,
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureElement {
    Card { index: usize, generation: u64 },
    Dialog { item_id: String },
    DialogClose { item_id: String },
    PageClose,
    PersistentOverlay,
    Body,
    Node(Arc<FixtureNode>),
}

#[derive(Debug)]
struct PageState {
    cards: Vec<String>,
    revealed: usize,
    generation: u64,
    clicks_on_page: usize,
    total_clicks: usize,
    open_dialog: Option<String>,
    page_close_control: bool,
    persistent_overlay: bool,
    login_prompt: bool,
    dead: bool,
    log: InteractionLog,
}

#[derive(Debug)]
pub struct FixturePage {
    fixture: PageFixture,
    state: Mutex<PageState>,
}

impl FixturePage {
    pub fn new(fixture: PageFixture) -> Self {
        let state = PageState {
            cards: Vec::new(),
            revealed: 0,
            generation: 0,
            clicks_on_page: 0,
            total_clicks: 0,
            open_dialog: None,
            page_close_control: false,
            persistent_overlay: false,
            login_prompt: false,
            dead: false,
            log: InteractionLog::default(),
        };
        Self {
            fixture,
            state: Mutex::new(state),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_page_fixture(path)?))
    }

    pub fn log(&self) -> InteractionLog {
        self.state
            .lock()
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    pub fn open_dialog(&self) -> Option<String> {
        self.state.lock().ok().and_then(|state| state.open_dialog.clone())
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut PageState) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let mut state: MutexGuard<'_, PageState> = self
            .state
            .lock()
            .map_err(|_| SessionError::Unusable("fixture page state poisoned".to_string()))?;
        if state.dead {
            return Err(SessionError::Unusable("fixture session terminated".to_string()));
        }
        f(&mut state)
    }

    fn detail_html(&self, item_id: &str) -> Option<&str> {
        self.fixture.details.get(item_id).map(|d| d.html.as_str())
    }

    fn dialog_closable(&self, item_id: &str) -> bool {
        self.fixture
            .details
            .get(item_id)
            .is_some_and(|d| d.closable)
    }

    fn live_card<'a>(
        state: &'a PageState,
        index: usize,
        generation: u64,
    ) -> Result<&'a str, SessionError> {
        if generation != state.generation {
            return Err(SessionError::Stale(format!(
                "card {index} belongs to an earlier render"
            )));
        }
        state
            .cards
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| SessionError::Stale(format!("card {index} is no longer attached")))
    }

    fn close_dialog(&self, state: &mut PageState, force: bool) {
        if let Some(item_id) = state.open_dialog.clone() {
            if force || self.dialog_closable(&item_id) {
                state.open_dialog = None;
                state.log.dialogs_closed += 1;
            }
        }
    }

    fn click_card(&self, state: &mut PageState, index: usize, generation: u64) -> Result<(), SessionError> {
        let card = Self::live_card(state, index, generation)?.to_string();
        let href = first_node(&card, "a")?
            .and_then(|node| node.attrs.get("href").cloned())
            .unwrap_or_default();
        state.log.card_clicks.push(href.clone());
        state.clicks_on_page += 1;
        state.total_clicks += 1;

        if let Some(item_id) = item_id_from_link(&href) {
            if self.fixture.details.contains_key(&item_id) {
                state.open_dialog = Some(item_id);
            }
        }
        if let Some(shrink) = self.fixture.shrink {
            if state.clicks_on_page == shrink.after_clicks {
                state.cards.truncate(shrink.keep);
                state.generation += 1;
            }
        }
        if self
            .fixture
            .session_dies_after_clicks
            .is_some_and(|limit| state.total_clicks >= limit)
        {
            state.dead = true;
        }
        Ok(())
    }

    fn activate(&self, state: &mut PageState, element: &FixtureElement) -> Result<(), SessionError> {
        match element {
            FixtureElement::Card { index, generation } => self.click_card(state, *index, *generation),
            FixtureElement::DialogClose { .. } => {
                self.close_dialog(state, false);
                Ok(())
            }
            FixtureElement::PageClose => {
                state.page_close_control = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn page_matches(&self, state: &PageState, selector: &str) -> Result<Vec<FixtureElement>, SessionError> {
        let closable_dialog = state
            .open_dialog
            .clone()
            .filter(|item_id| self.dialog_closable(item_id));
        let found = match selector {
            selectors::CANDIDATE_LINK => (0..state.cards.len())
                .map(|index| FixtureElement::Card {
                    index,
                    generation: state.generation,
                })
                .collect(),
            selectors::DIALOG => state
                .open_dialog
                .iter()
                .map(|item_id| FixtureElement::Dialog {
                    item_id: item_id.clone(),
                })
                .collect(),
            selectors::DIALOG_CLOSE => closable_dialog
                .map(|item_id| vec![FixtureElement::DialogClose { item_id }])
                .unwrap_or_default(),
            selectors::PAGE_CLOSE => {
                let mut found: Vec<_> = closable_dialog
                    .map(|item_id| FixtureElement::DialogClose { item_id })
                    .into_iter()
                    .collect();
                if state.page_close_control {
                    found.push(FixtureElement::PageClose);
                }
                found
            }
            selectors::PERSISTENT_OVERLAY if state.persistent_overlay => {
                vec![FixtureElement::PersistentOverlay]
            }
            selectors::PERSISTENT_OVERLAY => Vec::new(),
            selectors::BODY => vec![FixtureElement::Body],
            other => match state.open_dialog.as_deref().and_then(|id| self.detail_html(id)) {
                Some(html) => as_elements(select_nodes(html, other)?),
                None => Vec::new(),
            },
        };
        Ok(found)
    }

    fn scoped_matches(
        &self,
        state: &PageState,
        scope: &FixtureElement,
        selector: &str,
    ) -> Result<Vec<FixtureElement>, SessionError> {
        let html = match scope {
            FixtureElement::Card { index, generation } => {
                Self::live_card(state, *index, *generation)?.to_string()
            }
            FixtureElement::Dialog { item_id } => match self.detail_html(item_id) {
                Some(html) if state.open_dialog.as_deref() == Some(item_id.as_str()) => html.to_string(),
                _ => return Err(SessionError::Stale("detail dialog is closed".to_string())),
            },
            FixtureElement::Node(node) => node.html.clone(),
            _ => return Ok(Vec::new()),
        };
        Ok(as_elements(select_nodes(&html, selector)?))
    }
}

fn as_elements(nodes: Vec<FixtureNode>) -> Vec<FixtureElement> {
    nodes
        .into_iter()
        .map(|node| FixtureElement::Node(Arc::new(node)))
        .collect()
}

fn select_nodes(html: &str, selector: &str) -> Result<Vec<FixtureNode>, SessionError> {
    let sel = Selector::parse(selector)
        .map_err(|e| SessionError::Command(format!("invalid selector `{selector}`: {e}")))?;
    let document = Html::parse_fragment(html);
    let nodes = document
        .select(&sel)
        .map(|el| FixtureNode {
            html: el.html(),
            text: el.text().collect::<String>(),
            attrs: el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .collect();
    Ok(nodes)
}

fn first_node(html: &str, selector: &str) -> Result<Option<FixtureNode>, SessionError> {
    Ok(select_nodes(html, selector)?.into_iter().next())
}

#[async_trait]
impl PageSession for FixturePage {
    type Element = FixtureElement;

    async fn goto(&self, url: &str) -> Result<(), SessionError> {
        self.with_state(|state| {
            if self.fixture.failing_urls.iter().any(|frag| url.contains(frag.as_str())) {
                return Err(SessionError::Command(format!("navigation to {url} failed")));
            }
            state.log.visited.push(url.to_string());
            state.cards = self.fixture.cards.clone();
            state.revealed = 0;
            state.generation += 1;
            state.clicks_on_page = 0;
            state.open_dialog = None;
            state.page_close_control = self.fixture.overlays.page_close_control;
            state.persistent_overlay = self.fixture.overlays.persistent_overlay;
            state.login_prompt = self.fixture.overlays.login_prompt;
            Ok(())
        })
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<FixtureElement>, SessionError> {
        self.with_state(|state| self.page_matches(state, selector))
    }

    async fn find_all_within(
        &self,
        scope: &FixtureElement,
        selector: &str,
    ) -> Result<Vec<FixtureElement>, SessionError> {
        self.with_state(|state| self.scoped_matches(state, scope, selector))
    }

    async fn attribute(&self, element: &FixtureElement, name: &str) -> Result<Option<String>, SessionError> {
        self.with_state(|state| match element {
            FixtureElement::Card { index, generation } => {
                let card = Self::live_card(state, *index, *generation)?;
                Ok(first_node(card, "a")?.and_then(|node| node.attrs.get(name).cloned()))
            }
            FixtureElement::Node(node) => Ok(node.attrs.get(name).cloned()),
            _ => Ok(None),
        })
    }

    async fn text(&self, element: &FixtureElement) -> Result<String, SessionError> {
        self.with_state(|state| match element {
            FixtureElement::Card { index, generation } => {
                let card = Self::live_card(state, *index, *generation)?;
                Ok(first_node(card, "a")?.map(|node| node.text).unwrap_or_default())
            }
            FixtureElement::Node(node) => Ok(node.text.clone()),
            _ => Ok(String::new()),
        })
    }

    async fn is_clickable(&self, element: &FixtureElement) -> Result<bool, SessionError> {
        self.with_state(|state| match element {
            FixtureElement::Card { index, generation } => {
                Self::live_card(state, *index, *generation).map(|_| true)
            }
            _ => Ok(true),
        })
    }

    async fn click(&self, element: &FixtureElement) -> Result<(), SessionError> {
        self.with_state(|state| self.activate(state, element))
    }

    async fn script_click(&self, element: &FixtureElement) -> Result<(), SessionError> {
        self.with_state(|state| self.activate(state, element))
    }

    async fn remove(&self, element: &FixtureElement) -> Result<(), SessionError> {
        self.with_state(|state| {
            match element {
                FixtureElement::PersistentOverlay => state.persistent_overlay = false,
                FixtureElement::Dialog { .. } => self.close_dialog(state, true),
                _ => {}
            }
            state.log.overlays_removed += 1;
            Ok(())
        })
    }

    async fn hide_container_of(&self, selector: &str) -> Result<bool, SessionError> {
        self.with_state(|state| {
            if selector == selectors::LOGIN_PROMPT_FORM && state.login_prompt {
                state.login_prompt = false;
                state.log.prompts_hidden += 1;
                return Ok(true);
            }
            Ok(false)
        })
    }

    async fn send_escape(&self, _element: &FixtureElement) -> Result<(), SessionError> {
        self.with_state(|state| {
            state.log.escapes += 1;
            self.close_dialog(state, false);
            Ok(())
        })
    }

    async fn scroll_to_bottom(&self) -> Result<(), SessionError> {
        self.with_state(|state| {
            state.log.scrolls += 1;
            if let Some(batch) = self.fixture.reveal_batches.get(state.revealed) {
                state.cards.extend(batch.iter().cloned());
                state.revealed += 1;
            }
            Ok(())
        })
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        self.with_state(|state| {
            state.log.screenshots += 1;
            let view = state.open_dialog.as_deref().unwrap_or("results");
            Ok(format!("fixture-screenshot:{view}").into_bytes())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn card(id: &str, title: &str) -> String {
        format!(
            r#"<a href="https://www.facebook.com/marketplace/item/{id}/"><img alt="{title}" src="https://cdn.example/{id}.jpg"><span>$10</span></a>"#
        )
    }

    fn fixture() -> PageFixture {
        let mut details = BTreeMap::new();
        details.insert(
            "1".to_string(),
            DetailFixture::new(r#"<abbr aria-label="5 minutes ago">5m</abbr>"#),
        );
        PageFixture {
            cards: vec![card("1", "Desk"), card("2", "Chair")],
            reveal_batches: vec![vec![card("3", "Lamp")]],
            details,
            overlays: OverlayFixture {
                persistent_overlay: true,
                login_prompt: true,
                ..Default::default()
            },
            shrink: Some(ShrinkFixture {
                after_clicks: 1,
                keep: 1,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scrolling_reveals_batches_once() {
        let page = FixturePage::new(fixture());
        page.goto("https://example.test/search").await.expect("goto");
        assert_eq!(page.find_all(selectors::CANDIDATE_LINK).await.expect("cards").len(), 2);

        page.scroll_to_bottom().await.expect("scroll");
        page.scroll_to_bottom().await.expect("scroll");
        assert_eq!(page.find_all(selectors::CANDIDATE_LINK).await.expect("cards").len(), 3);
        assert_eq!(page.log().scrolls, 2);
    }

    #[tokio::test]
    async fn card_reads_come_from_the_fragment() {
        let page = FixturePage::new(fixture());
        page.goto("https://example.test/search").await.expect("goto");
        let cards = page.find_all(selectors::CANDIDATE_LINK).await.expect("cards");

        let href = page.attribute(&cards[1], "href").await.expect("href");
        assert_eq!(href.as_deref(), Some("https://www.facebook.com/marketplace/item/2/"));
        let img = page
            .find_within(&cards[1], selectors::CARD_IMAGE)
            .await
            .expect("img")
            .expect("img present");
        assert_eq!(page.attribute(&img, "alt").await.expect("alt").as_deref(), Some("Chair"));
    }

    #[tokio::test]
    async fn shrinking_list_makes_old_handles_stale() {
        let page = FixturePage::new(fixture());
        page.goto("https://example.test/search").await.expect("goto");
        let cards = page.find_all(selectors::CANDIDATE_LINK).await.expect("cards");

        page.click(&cards[0]).await.expect("click");
        assert_eq!(page.open_dialog().as_deref(), Some("1"));

        let err = page.attribute(&cards[0], "href").await.expect_err("stale");
        assert!(matches!(err, SessionError::Stale(_)));
        assert_eq!(page.find_all(selectors::CANDIDATE_LINK).await.expect("cards").len(), 1);
    }

    #[tokio::test]
    async fn overlays_and_dialog_respond_to_recovery_actions() {
        let page = FixturePage::new(fixture());
        page.goto("https://example.test/search").await.expect("goto");

        assert!(page.hide_container_of(selectors::LOGIN_PROMPT_FORM).await.expect("hide"));
        assert!(!page.hide_container_of(selectors::LOGIN_PROMPT_FORM).await.expect("hide again"));

        let overlay = page
            .find(selectors::PERSISTENT_OVERLAY)
            .await
            .expect("find")
            .expect("overlay present");
        page.remove(&overlay).await.expect("remove");
        assert!(page.find(selectors::PERSISTENT_OVERLAY).await.expect("find").is_none());

        let cards = page.find_all(selectors::CANDIDATE_LINK).await.expect("cards");
        page.click(&cards[0]).await.expect("open");
        let time = page
            .find(selectors::POST_TIME)
            .await
            .expect("find")
            .expect("post time inside dialog");
        assert_eq!(
            page.attribute(&time, "aria-label").await.expect("attr").as_deref(),
            Some("5 minutes ago")
        );
        let close = page
            .find(selectors::DIALOG_CLOSE)
            .await
            .expect("find")
            .expect("close control");
        page.script_click(&close).await.expect("close");
        assert!(page.open_dialog().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_time_out_on_missing_elements() {
        let page = FixturePage::new(fixture());
        page.goto("https://example.test/search").await.expect("goto");
        let err = page
            .wait_for(selectors::DIALOG, Duration::from_secs(2))
            .await
            .expect_err("no dialog open");
        assert!(err.is_timeout());
        page.wait_until_absent(selectors::DIALOG, Duration::from_secs(1))
            .await
            .expect("already absent");
    }

    #[tokio::test]
    async fn failing_urls_and_dead_sessions() {
        let mut fx = fixture();
        fx.failing_urls.push("query=broken".to_string());
        fx.session_dies_after_clicks = Some(1);
        fx.shrink = None;
        let page = FixturePage::new(fx);

        let err = page.goto("https://example.test/?query=broken").await.expect_err("nav fails");
        assert!(!err.is_fatal());

        page.goto("https://example.test/?query=ok").await.expect("goto");
        let cards = page.find_all(selectors::CANDIDATE_LINK).await.expect("cards");
        page.click(&cards[1]).await.expect("click");
        let err = page.find_all(selectors::CANDIDATE_LINK).await.expect_err("dead");
        assert!(err.is_fatal());
    }
}
