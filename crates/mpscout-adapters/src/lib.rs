//! Browser-facing side of the scout: the page session contract, a WebDriver-backed session,
//! a fixture-backed session, and the per-listing stages that drive them.

pub mod detail;
pub mod filter;
pub mod fixture;
pub mod overlay;
pub mod selectors;
pub mod session;
pub mod webdriver;

pub use detail::{DetailExtractor, DetailField, DetailOutcome, ExtractionError};
pub use filter::{read_candidate, FilterChain, FilterDecision};
pub use fixture::{load_page_fixture, FixtureElement, FixturePage, InteractionLog, PageFixture};
pub use overlay::{hide_login_prompt, OverlayPolicy, OverlayRecovery, RecoveryStrategy};
pub use session::{PageSession, SessionError, POLL_INTERVAL};
pub use webdriver::{WebDriverOptions, WebDriverSession};

pub const CRATE_NAME: &str = "mpscout-adapters";
