use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, PartialEq)]
pub enum HealthResult {
    Healthy,
    Unhealthy(String),
    Error(String),
}

/// Map the socket endpoint to the backend's health endpoint on the same
/// host: `ws://host:8000/ws` becomes `http://host:8000/health`.
pub fn health_url(ws_url: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(ws_url)?;
    let scheme = match url.scheme() {
        "wss" | "https" => "https",
        _ => "http",
    };
    // Switching between special schemes only fails for `file`, which
    // cannot host a WebSocket anyway.
    let _ = url.set_scheme(scheme);
    url.set_path("/health");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub async fn check_backend_health(ws_url: &str) -> HealthResult {
    let url = match health_url(ws_url) {
        Ok(url) => url,
        Err(e) => return HealthResult::Error(format!("Invalid url: {}", e)),
    };

    log::info!("Checking backend health via HTTP: {}", url);

    let client = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(e) => return HealthResult::Error(format!("HTTP client error: {}", e)),
    };

    match client.get(url).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                match resp.json::<HealthResponse>().await {
                    Ok(body) if body.ok => HealthResult::Healthy,
                    Ok(_) => HealthResult::Unhealthy("backend reported ok=false".to_string()),
                    Err(e) => HealthResult::Error(format!("JSON parse error: {}", e)),
                }
            } else {
                HealthResult::Unhealthy(format!("HTTP Error: {}", resp.status()))
            }
        }
        Err(e) => HealthResult::Error(format!("Request failed: {}", e)),
    }
}
