use crate::schema::{GlobalSettings, HttpRequest, HttpResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;

/// Sends one fully resolved request. The engine only looks at the returned
/// status and body, so any transport can sit behind this. Timeouts are
/// enforced by the engine around `execute`.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: &HttpRequest, settings: &GlobalSettings) -> Result<HttpResponse>;
}

pub struct HttpExecutor;

impl HttpExecutor {
    fn client(&self, settings: &GlobalSettings) -> Result<reqwest::Client> {
        let redirects = if settings.follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .redirect(redirects)
            .danger_accept_invalid_certs(!settings.verify_ssl);

        if let Some(proxy) = settings.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .with_context(|| format!("Invalid proxy URL: {}", proxy))?;
            builder = builder.proxy(proxy);
        }

        builder.build().context("Failed to build HTTP client")
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: &HttpRequest, settings: &GlobalSettings) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .with_context(|| format!("Unsupported HTTP method: {}", request.method))?;

        log::info!("HTTP {} request to: {}", method, request.url);

        let client = self.client(settings)?;
        let mut builder = client.request(method, &request.url);

        let params: Vec<(&str, &str)> = request
            .params
            .iter()
            .filter(|p| p.enabled && !p.key.is_empty())
            .map(|p| (p.key.as_str(), p.value.as_str()))
            .collect();
        if !params.is_empty() {
            builder = builder.query(&params);
        }

        for header in request.headers.iter().filter(|h| h.enabled && !h.key.is_empty()) {
            builder = builder.header(header.key.as_str(), header.value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .with_context(|| format!("Request to {} failed", request.url))?;

        let status = response.status();
        let headers = collect_headers(response.headers());
        let body = response.text().await.context("Failed to read response body")?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            size: body.len(),
            body,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Flatten a header map; repeated headers (`Set-Cookie`, `Vary`) are joined
/// with `, `. Values that are not valid UTF-8 are dropped.
fn collect_headers(map: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}
