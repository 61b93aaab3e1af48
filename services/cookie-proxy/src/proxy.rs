//! Outbound API client
//!
//! Executes one caller request against the upstream web API with the current
//! session cookies attached. A 401/403 means the session is gone: the client
//! asks the `Refresher` for new cookies and tries again with them. Every
//! attempt after the first waits a fixed delay. The caller always gets a
//! structured `ProxyResponse`, never an error.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_refresh::{AttemptOutcome, Refresher, classify_status};
use session_store::CredentialStore;
use tracing::{debug, info, instrument, warn};

/// Headers to strip from caller overrides (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Caller request as posted to `/proxy`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Result of one proxied call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub success: bool,
    /// Last upstream status, 0 when no response was ever received
    pub status_code: u16,
    /// Upstream body: parsed JSON, else the raw text, else null
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_time: String,
    pub duration_ms: u64,
    /// Every attempt made, for history and metrics
    #[serde(skip)]
    pub attempts: Vec<AttemptRecord>,
}

/// One upstream round trip.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub number: u32,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub outcome: &'static str,
    pub duration: Duration,
}

/// Bounded retry settings for outbound calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    /// Fixed wait before every attempt after the first
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

/// Client for the upstream API.
pub struct ProxyClient {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    refresher: Arc<dyn Refresher>,
    policy: RetryPolicy,
    fingerprint: HeaderMap,
}

impl ProxyClient {
    pub fn new(
        http: reqwest::Client,
        store: Arc<CredentialStore>,
        refresher: Arc<dyn Refresher>,
        policy: RetryPolicy,
        origin: &str,
    ) -> Self {
        Self {
            http,
            store,
            refresher,
            policy,
            fingerprint: fingerprint_headers(origin),
        }
    }

    /// Execute `request` with up to `max_retries + 1` attempts.
    #[instrument(
        skip_all,
        fields(method = request.method.as_deref().unwrap_or("GET"), url = %request.url)
    )]
    pub async fn execute(&self, request: &ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        let method_name = request
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase();

        let method = match Method::from_str(&method_name) {
            Ok(m) => m,
            Err(_) => {
                let error = format!("invalid method {method_name}");
                return failure(started, 0, Value::Null, error, vec![]);
            }
        };
        if let Err(e) = reqwest::Url::parse(&request.url) {
            return failure(started, 0, Value::Null, format!("invalid url: {e}"), vec![]);
        }
        let body = match &request.body {
            Some(value) => match serde_json::to_vec(value) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    let error = format!("serializing body: {e}");
                    return failure(started, 0, Value::Null, error, vec![]);
                }
            },
            None => None,
        };

        let total = self.policy.max_retries + 1;
        let mut attempts = Vec::with_capacity(total as usize);
        let mut last_status: Option<u16> = None;
        let mut last_data = Value::Null;
        let mut last_error = String::new();

        for number in 1..=total {
            if number > 1 {
                debug!(attempt = number, total, "retrying upstream request");
                tokio::time::sleep(self.policy.retry_delay).await;
            }

            let attempt_started = Instant::now();
            let headers = self.build_headers(&request.headers).await;
            let mut req = self
                .http
                .request(method.clone(), &request.url)
                .headers(headers)
                .timeout(self.policy.request_timeout);
            if let Some(bytes) = &body {
                req = req.body(bytes.clone());
            }

            let sent = req.send().await;
            let (status, data) = match sent {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    match resp.bytes().await {
                        Ok(bytes) => (status, parse_data(&bytes)),
                        Err(e) => {
                            last_status = Some(status);
                            last_error = format!("reading upstream response: {e}");
                            warn!(
                                attempt = number,
                                status,
                                error = %e,
                                "failed to read upstream body"
                            );
                            attempts.push(self.record(
                                number,
                                &method_name,
                                request,
                                Some(status),
                                "failed",
                                attempt_started,
                            ));
                            continue;
                        }
                    }
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        format!(
                            "upstream timed out after {}s",
                            self.policy.request_timeout.as_secs()
                        )
                    } else {
                        format!("upstream request failed: {e}")
                    };
                    warn!(attempt = number, error = %e, "upstream transport error");
                    attempts.push(self.record(
                        number,
                        &method_name,
                        request,
                        None,
                        "transport_error",
                        attempt_started,
                    ));
                    continue;
                }
            };

            let outcome = classify_status(status);
            attempts.push(self.record(
                number,
                &method_name,
                request,
                Some(status),
                outcome.label(),
                attempt_started,
            ));
            last_status = Some(status);

            match outcome {
                AttemptOutcome::Success => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(status, attempts = number, duration_ms, "upstream request succeeded");
                    return ProxyResponse {
                        success: true,
                        status_code: status,
                        data,
                        error: None,
                        request_time: now_rfc3339(),
                        duration_ms,
                        attempts,
                    };
                }
                AttemptOutcome::AuthRejected => {
                    last_data = data;
                    warn!(
                        attempt = number,
                        status,
                        "upstream rejected session, refreshing credentials"
                    );
                    match self.refresher.request_refresh().await {
                        Ok(()) => {
                            info!(attempt = number, "credentials refreshed, retrying");
                            last_error = format!("upstream rejected credentials ({status})");
                        }
                        Err(e) => {
                            warn!(attempt = number, error = %e, "credential refresh failed");
                            last_error = format!(
                                "upstream rejected credentials ({status}); refresh failed: {e}"
                            );
                        }
                    }
                }
                AttemptOutcome::Failed => {
                    last_data = data;
                    last_error = format!("upstream returned {status}");
                    warn!(attempt = number, status, "upstream request failed");
                }
            }
        }

        warn!(attempts = total, error = %last_error, "upstream request failed after all attempts");
        failure(
            started,
            last_status.unwrap_or(0),
            last_data,
            format!("{last_error} ({total} attempts)"),
            attempts,
        )
    }

    /// Fingerprint defaults, then caller overrides, then the session cookie.
    async fn build_headers(&self, overrides: &HashMap<String, String>) -> HeaderMap {
        let mut headers = self.fingerprint.clone();

        for (name, value) in overrides {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            let name = match HeaderName::from_str(name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            let value = match HeaderValue::from_str(value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }

        let cookie = self.store.cookie_header_value().await;
        if !cookie.is_empty() {
            match HeaderValue::from_str(&cookie) {
                Ok(mut v) => {
                    v.set_sensitive(true);
                    headers.insert(header::COOKIE, v);
                }
                Err(e) => warn!(error = %e, "stored cookies are not a valid header value"),
            }
        }

        headers
    }

    fn record(
        &self,
        number: u32,
        method: &str,
        request: &ProxyRequest,
        status: Option<u16>,
        outcome: &'static str,
        started: Instant,
    ) -> AttemptRecord {
        AttemptRecord {
            number,
            method: method.to_string(),
            url: request.url.clone(),
            status,
            outcome,
            duration: started.elapsed(),
        }
    }
}

/// Browser-like default headers for the upstream site.
fn fingerprint_headers(origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::ACCEPT, HeaderValue::from_static(session_store::ACCEPT));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(session_store::ACCEPT_LANGUAGE),
    );
    headers.insert(header::USER_AGENT, HeaderValue::from_static(session_store::USER_AGENT));

    let origin = origin.trim_end_matches('/');
    match (
        HeaderValue::from_str(origin),
        HeaderValue::from_str(&format!("{origin}/")),
    ) {
        (Ok(o), Ok(r)) => {
            headers.insert(header::ORIGIN, o);
            headers.insert(header::REFERER, r);
        }
        _ => warn!(origin, "origin is not a valid header value, omitting Origin/Referer"),
    }
    headers
}

fn failure(
    started: Instant,
    status_code: u16,
    data: Value,
    error: String,
    attempts: Vec<AttemptRecord>,
) -> ProxyResponse {
    ProxyResponse {
        success: false,
        status_code,
        data,
        error: Some(error),
        request_time: now_rfc3339(),
        duration_ms: started.elapsed().as_millis() as u64,
        attempts,
    }
}

fn now_rfc3339() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// JSON if it parses, the text otherwise, null when empty.
fn parse_data(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Check if a header is hop-by-hop (never forwarded from caller overrides)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
