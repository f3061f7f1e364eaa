//! Headless browser sessions over the W3C WebDriver HTTP protocol.
//!
//! Works against chromedriver, geckodriver or a Selenium grid. Only the handful of
//! endpoints the frontend strategy needs are implemented.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::core::{
    error::{Error, Result},
    ports::{BrowserLauncher, BrowserSession},
};

/// Key under which WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    value: Value,
}

#[derive(Clone)]
pub struct WebDriverLauncher {
    endpoint: String,
    headless: bool,
    client: Client,
}

impl WebDriverLauncher {
    pub fn new(endpoint: impl Into<String>, headless: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Browser(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            headless,
            client,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage", "--window-size=1280,720"];
        if self.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let url = format!("{}/session", self.endpoint);
        let value = send(&self.client, Method::POST, &url, Some(self.capabilities())).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Browser("no session id in WebDriver response".into()))?;
        debug!(session_id, "browser session opened");
        Ok(Box::new(WebDriverSession {
            base: format!("{}/session/{session_id}", self.endpoint),
            client: self.client.clone(),
            closed: false,
        }))
    }
}

pub struct WebDriverSession {
    base: String,
    client: Client,
    closed: bool,
}

impl WebDriverSession {
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        if self.closed {
            return Err(Error::Browser("session already closed".into()));
        }
        send(&self.client, method, &format!("{}{path}", self.base), body).await
    }

    /// Returns the element reference, or `None` when nothing matches.
    async fn find(&self, selector: &str) -> Result<Option<String>> {
        let body = json!({ "using": "css selector", "value": selector });
        match self.command(Method::POST, "/element", Some(body)).await {
            Ok(value) => value
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| Error::Browser("malformed element reference".into())),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        let element = self
            .find(selector)
            .await?
            .ok_or_else(|| Error::Browser(format!("Element not found: {selector}")))?;
        self.command(
            Method::POST,
            &format!("/element/{element}/click"),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn exists(&mut self, selector: &str) -> Result<bool> {
        Ok(self.find(selector).await?.is_some())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        let value = self.command(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| Error::Browser("screenshot payload is not a string".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Browser(format!("failed to decode screenshot: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.command(Method::DELETE, "", None).await.map(|_| ());
        self.closed = true;
        if let Err(err) = &result {
            warn!(error = %err, "failed to close browser session");
        }
        result
    }
}

/// Sends one WebDriver command and unwraps the `value` member.
///
/// A `no such element` error maps to `NotFound` so callers can probe for elements.
async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|e| Error::Browser(format!("WebDriver unreachable at {url}: {e}")))?;
    let status = response.status();
    let envelope: Envelope = response
        .json()
        .await
        .map_err(|e| Error::Browser(format!("invalid WebDriver response: {e}")))?;

    if status.is_success() {
        return Ok(envelope.value);
    }
    let kind = envelope
        .value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = envelope
        .value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if status == StatusCode::NOT_FOUND && kind == "no such element" {
        return Err(Error::NotFound(format!("Element ({message})")));
    }
    Err(Error::Browser(format!("{kind}: {message}")))
}
