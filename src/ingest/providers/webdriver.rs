// src/ingest/providers/webdriver.rs
//! Minimal W3C WebDriver client (chromedriver/geckodriver) over reqwest.
//! Only the handful of endpoints the dynamic adapter needs.

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::{json, Value};

use crate::error::{ConfigError, FetchError};

#[derive(Clone)]
pub struct WebDriverClient {
    client: Client,
    base: String,
}

impl WebDriverClient {
    pub fn new(base: &str, request_timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("webdriver client: {e}")))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Start a fresh, isolated browser session.
    pub async fn new_session(&self, capabilities: Value) -> Result<Session, FetchError> {
        let url = format!("{}/session", self.base);
        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let value = call(&self.client, Method::POST, &url, Some(body)).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::RenderFailure("session response without sessionId".into()))?;
        Ok(Session {
            client: self.client.clone(),
            endpoint: format!("{}/session/{}", self.base, id),
            closed: false,
        })
    }
}

/// One browser session. Deleted explicitly via `close`, or in the background on drop.
pub struct Session {
    client: Client,
    endpoint: String,
    closed: bool,
}

impl Session {
    pub async fn set_page_load_timeout(&self, t: Duration) -> Result<(), FetchError> {
        let ms = t.as_millis() as u64;
        self.post("timeouts", json!({ "pageLoad": ms, "script": ms }))
            .await
            .map(|_| ())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        self.post("url", json!({ "url": url })).await.map(|_| ())
    }

    pub async fn add_cookie(&self, cookie: Value) -> Result<(), FetchError> {
        self.post("cookie", json!({ "cookie": cookie }))
            .await
            .map(|_| ())
    }

    pub async fn execute(&self, script: &str, args: Value) -> Result<Value, FetchError> {
        self.post("execute/sync", json!({ "script": script, "args": args }))
            .await
    }

    pub async fn source(&self) -> Result<String, FetchError> {
        let url = format!("{}/source", self.endpoint);
        let v = call(&self.client, Method::GET, &url, None).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| FetchError::RenderFailure("page source is not a string".into()))
    }

    pub async fn close(mut self) {
        self.closed = true;
        if let Err(e) = call(&self.client, Method::DELETE, &self.endpoint, None).await {
            tracing::debug!(error = %e, "webdriver session delete failed");
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, FetchError> {
        let url = format!("{}/{}", self.endpoint, path);
        call(&self.client, Method::POST, &url, Some(body)).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped mid-render (outer timeout/cancel): still release the browser.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            let endpoint = self.endpoint.clone();
            rt.spawn(async move {
                let _ = call(&client, Method::DELETE, &endpoint, None).await;
            });
        }
    }
}

async fn call(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, FetchError> {
    let mut req = client.request(method, url);
    if let Some(b) = body {
        req = req.json(&b);
    }
    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout {
                after: Duration::ZERO,
            }
        } else {
            FetchError::RenderFailure(format!("webdriver unreachable: {e}"))
        }
    })?;
    let status = resp.status();
    let v: Value = resp
        .json()
        .await
        .map_err(|e| FetchError::RenderFailure(format!("webdriver reply: {e}")))?;
    if !status.is_success() {
        return Err(map_error(&v));
    }
    Ok(v.get("value").cloned().unwrap_or(Value::Null))
}

/// Map a WebDriver error payload (`{"value":{"error":..,"message":..}}`).
pub fn map_error(v: &Value) -> FetchError {
    let inner = v.get("value").unwrap_or(v);
    let code = inner.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = inner.get("message").and_then(Value::as_str).unwrap_or("");
    match code {
        "timeout" | "script timeout" => FetchError::Timeout {
            after: Duration::ZERO,
        },
        _ => FetchError::RenderFailure(format!("{code}: {message}")),
    }
}

/// Convert an exported browser cookie (Playwright/DevTools style) into the WebDriver
/// cookie shape. Entries without name/value are dropped.
pub fn to_webdriver_cookie(v: &Value) -> Option<Value> {
    let name = v.get("name")?.as_str()?;
    let value = v.get("value")?.as_str()?;
    let mut out = json!({ "name": name, "value": value });
    for key in ["path", "domain", "secure", "httpOnly"] {
        if let Some(x) = v.get(key) {
            out[key] = x.clone();
        }
    }
    let expiry = v
        .get("expiry")
        .or_else(|| v.get("expires"))
        .and_then(Value::as_f64)
        .filter(|e| *e > 0.0);
    if let Some(e) = expiry {
        out["expiry"] = json!(e as u64);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_codes_map_to_timeout() {
        let v = json!({"value": {"error": "timeout", "message": "page load"}});
        assert!(matches!(map_error(&v), FetchError::Timeout { .. }));
        let v = json!({"value": {"error": "javascript error", "message": "boom"}});
        assert_eq!(
            map_error(&v),
            FetchError::RenderFailure("javascript error: boom".into())
        );
    }

    #[test]
    fn playwright_cookie_is_converted() {
        let c = json!({
            "name": "auth_token", "value": "abc", "domain": ".x.com", "path": "/",
            "expires": 1_900_000_000.5, "httpOnly": true, "secure": true, "sameSite": "Lax"
        });
        let out = to_webdriver_cookie(&c).unwrap();
        assert_eq!(out["name"], "auth_token");
        assert_eq!(out["expiry"], 1_900_000_000u64);
        assert!(out.get("sameSite").is_none());
        assert!(to_webdriver_cookie(&json!({"name": "x"})).is_none());
    }
}
