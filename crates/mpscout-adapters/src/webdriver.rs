//! [`PageSession`] backed by a W3C WebDriver server (chromedriver) through fantoccini.

use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::session::{PageSession, SessionError};

// WebDriver key code for Escape.
const ESCAPE_KEY: &str = "\u{e00c}";

const SESSION_GONE_MARKERS: [&str; 7] = [
    "invalid session id",
    "no such window",
    "session deleted",
    "not reachable",
    "disconnected",
    "connection refused",
    "broken pipe",
];

const HIDE_CONTAINER_SCRIPT: &str = r#"
var target = document.querySelector(arguments[0]);
if (target && target.parentElement) {
    target.parentElement.style.display = 'none';
    return true;
}
return false;
"#;

#[derive(Debug, Clone)]
pub struct WebDriverOptions {
    pub webdriver_url: String,
    pub headless: bool,
    pub window_size: (u32, u32),
    pub extra_args: Vec<String>,
}

impl Default for WebDriverOptions {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            headless: false,
            window_size: (1920, 1080),
            extra_args: Vec::new(),
        }
    }
}

impl WebDriverOptions {
    pub fn chrome_args(&self) -> Vec<String> {
        let (width, height) = self.window_size;
        let mut args = vec![
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!("--window-size={width},{height}"),
            "--disable-notifications".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub fn capabilities(&self) -> serde_json::Map<String, JsonValue> {
        let mut caps = serde_json::Map::new();
        caps.insert("browserName".to_string(), json!("chrome"));
        caps.insert(
            "goog:chromeOptions".to_string(),
            json!({ "args": self.chrome_args() }),
        );
        caps
    }
}

/// Maps a driver error onto the scout's error taxonomy.
pub fn classify_cmd_error(err: CmdError) -> SessionError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if SESSION_GONE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        SessionError::Unusable(message)
    } else if lower.contains("stale element") {
        SessionError::Stale(message)
    } else {
        SessionError::Command(message)
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverSession {
    client: Client,
}

impl WebDriverSession {
    pub async fn connect(options: &WebDriverOptions) -> Result<Self, SessionError> {
        info!(url = %options.webdriver_url, headless = options.headless, "connecting to webdriver");
        let mut builder = ClientBuilder::native();
        builder.capabilities(options.capabilities());
        let client = builder.connect(&options.webdriver_url).await.map_err(|err| {
            SessionError::Unusable(format!(
                "starting browser session at {}: {err}",
                options.webdriver_url
            ))
        })?;
        info!("webdriver session established");
        Ok(Self { client })
    }

    async fn execute_on(&self, script: &str, element: &Element) -> Result<JsonValue, SessionError> {
        let arg = serde_json::to_value(element)
            .map_err(|err| SessionError::Command(format!("serializing element handle: {err}")))?;
        self.client
            .execute(script, vec![arg])
            .await
            .map_err(classify_cmd_error)
    }
}

#[async_trait]
impl PageSession for WebDriverSession {
    type Element = Element;

    async fn goto(&self, url: &str) -> Result<(), SessionError> {
        self.client.goto(url).await.map_err(classify_cmd_error)
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, SessionError> {
        self.client
            .find_all(Locator::Css(selector))
            .await
            .map_err(classify_cmd_error)
    }

    async fn find_all_within(
        &self,
        scope: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, SessionError> {
        scope
            .find_all(Locator::Css(selector))
            .await
            .map_err(classify_cmd_error)
    }

    async fn attribute(&self, element: &Element, name: &str) -> Result<Option<String>, SessionError> {
        // Links and image sources come back resolved against the page URL.
        if matches!(name, "href" | "src") {
            return element.prop(name).await.map_err(classify_cmd_error);
        }
        element.attr(name).await.map_err(classify_cmd_error)
    }

    async fn text(&self, element: &Element) -> Result<String, SessionError> {
        element.text().await.map_err(classify_cmd_error)
    }

    async fn is_clickable(&self, element: &Element) -> Result<bool, SessionError> {
        if !element.is_displayed().await.map_err(classify_cmd_error)? {
            return Ok(false);
        }
        element.is_enabled().await.map_err(classify_cmd_error)
    }

    async fn click(&self, element: &Element) -> Result<(), SessionError> {
        element.click().await.map_err(classify_cmd_error)
    }

    async fn script_click(&self, element: &Element) -> Result<(), SessionError> {
        self.execute_on("arguments[0].click();", element).await.map(|_| ())
    }

    async fn remove(&self, element: &Element) -> Result<(), SessionError> {
        self.execute_on("arguments[0].remove();", element).await.map(|_| ())
    }

    async fn hide_container_of(&self, selector: &str) -> Result<bool, SessionError> {
        let hidden = self
            .client
            .execute(HIDE_CONTAINER_SCRIPT, vec![json!(selector)])
            .await
            .map_err(classify_cmd_error)?;
        Ok(hidden.as_bool().unwrap_or(false))
    }

    async fn send_escape(&self, element: &Element) -> Result<(), SessionError> {
        element.send_keys(ESCAPE_KEY).await.map_err(classify_cmd_error)
    }

    async fn scroll_to_bottom(&self) -> Result<(), SessionError> {
        self.client
            .execute("window.scrollTo(0, document.body.scrollHeight);", Vec::new())
            .await
            .map(|_| ())
            .map_err(classify_cmd_error)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        self.client.screenshot().await.map_err(classify_cmd_error)
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.client.clone().close().await.map_err(classify_cmd_error)
    }
}
