//! HTTP fetch for extension code.
//!
//! Each extension gets one [`FetchClient`] holding two reqwest clients:
//! the default one carries browser-like headers for hosts behind
//! CloudFlare, the plain one is used when an extension opts out with
//! `noCloudflareBypass`. In-flight requests are capped per extension by
//! a semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, SET_COOKIE, USER_AGENT,
};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::{HostError, HostResult};
use crate::host::abort::AbortSignal;
use crate::host::form_data::FormData;

/// Default in-flight request cap per extension.
pub const MAX_CONCURRENT_FETCHES: usize = 50;

const DEFAULT_TIMEOUT_SECS: u64 = 35;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

fn impersonation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers
}

/// Request body forms accepted by [`FetchClient::fetch`].
#[derive(Debug)]
pub enum FetchBody {
    Text(String),
    Bytes(Vec<u8>),
    /// Multipart form; the content type with its boundary is set from
    /// the form itself.
    Form(FormData),
    /// Serialized as JSON with the content type set accordingly.
    Json(Value),
}

/// Options for a single fetch. Everything is optional.
#[derive(Debug, Default)]
pub struct FetchOptions {
    /// Defaults to GET.
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<FetchBody>,
    /// Seconds, defaults to 35.
    pub timeout: Option<u64>,
    /// Skip the browser impersonation headers.
    pub no_cloudflare_bypass: bool,
    pub signal: Option<AbortSignal>,
}

/// A completed response with the body fully read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    /// Status line text, e.g. `200 OK`.
    pub status_text: String,
    pub method: String,
    pub ok: bool,
    /// Final URL after redirects.
    pub url: String,
    pub redirected: bool,
    pub raw_headers: HashMap<String, Vec<String>>,
    /// First value per header name.
    pub headers: HashMap<String, String>,
    /// Cookie names to values from `Set-Cookie` headers.
    pub cookies: HashMap<String, String>,
    pub content_type: String,
    pub content_length: Option<u64>,
    #[serde(skip)]
    pub body: Vec<u8>,
    #[serde(skip)]
    json: Option<Value>,
}

impl FetchResponse {
    /// The body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The body parsed as JSON, `None` when it is not valid JSON.
    pub fn json(&self) -> Option<Value> {
        self.json.clone()
    }
}

/// Per-extension HTTP client with bounded concurrency.
#[derive(Debug, Clone)]
pub struct FetchClient {
    extension_id: String,
    semaphore: Arc<Semaphore>,
    impersonated: reqwest::Client,
    plain: reqwest::Client,
}

impl FetchClient {
    pub fn new(extension_id: impl Into<String>) -> HostResult<Self> {
        Self::with_concurrency(extension_id, MAX_CONCURRENT_FETCHES)
    }

    /// As [`FetchClient::new`] with a custom in-flight request cap.
    pub fn with_concurrency(
        extension_id: impl Into<String>,
        max_in_flight: usize,
    ) -> HostResult<Self> {
        let impersonated = reqwest::Client::builder()
            .default_headers(impersonation_headers())
            .build()
            .map_err(anyhow::Error::from)?;
        let plain = reqwest::Client::builder()
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            extension_id: extension_id.into(),
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            impersonated,
            plain,
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Execute a request and read the whole body.
    ///
    /// Rejects with [`HostError::Cancelled`] when the signal aborts,
    /// [`HostError::Timeout`] when the deadline passes, and
    /// [`HostError::Upstream`] on network errors. Non-2xx statuses are
    /// not errors; callers inspect `ok`.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> HostResult<FetchResponse> {
        let FetchOptions {
            method,
            headers,
            body,
            timeout,
            no_cloudflare_bypass,
            signal,
        } = options;

        if let Some(signal) = &signal {
            if let Some(reason) = abort_reason(signal) {
                return Err(HostError::Cancelled(reason));
            }
        }

        let requested = Url::parse(url)
            .map_err(|error| HostError::invalid_argument(format!("invalid url {url:?}: {error}")))?;
        let method = match method {
            Some(name) => Method::from_bytes(name.to_uppercase().as_bytes())
                .map_err(|_| HostError::invalid_argument(format!("invalid method {name:?}")))?,
            None => Method::GET,
        };
        let timeout = Duration::from_secs(timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));

        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(anyhow::Error::from)?;

        let client = if no_cloudflare_bypass {
            &self.plain
        } else {
            &self.impersonated
        };
        let mut request = client
            .request(method.clone(), requested.clone())
            .timeout(timeout);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match body {
            Some(FetchBody::Text(text)) => request = request.body(text),
            Some(FetchBody::Bytes(bytes)) => request = request.body(bytes),
            Some(FetchBody::Form(mut form)) => {
                request = request
                    .header(CONTENT_TYPE, form.content_type())
                    .body(form.to_buffer());
            }
            Some(FetchBody::Json(value)) => request = request.json(&value),
            None => {}
        }

        let map_send_error = |error: reqwest::Error| {
            if error.is_timeout() {
                HostError::Timeout(timeout)
            } else {
                HostError::Upstream(error.to_string())
            }
        };

        let send = request.send();
        let response = match &signal {
            Some(signal) => tokio::select! {
                () = signal.cancelled() => {
                    return Err(HostError::Cancelled(
                        signal.reason().unwrap_or_else(|| "cancelled".to_owned()),
                    ));
                }
                result = send => result.map_err(map_send_error)?,
            },
            None => send.await.map_err(map_send_error)?,
        };

        let status = response.status();
        let final_url = response.url().clone();
        let content_length = response.content_length();

        let mut raw_headers: HashMap<String, Vec<String>> = HashMap::new();
        let mut flat_headers: HashMap<String, String> = HashMap::new();
        let mut cookies = HashMap::new();
        for (name, value) in response.headers() {
            let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if name == &SET_COOKIE {
                if let Some((cookie_name, cookie_value)) = parse_set_cookie(&text) {
                    cookies.insert(cookie_name, cookie_value);
                }
            }
            flat_headers
                .entry(name.as_str().to_owned())
                .or_insert_with(|| text.clone());
            raw_headers.entry(name.as_str().to_owned()).or_default().push(text);
        }
        let content_type = flat_headers
            .get(CONTENT_TYPE.as_str())
            .cloned()
            .unwrap_or_default();

        let bytes = match &signal {
            Some(signal) => tokio::select! {
                () = signal.cancelled() => {
                    return Err(HostError::Cancelled(
                        signal.reason().unwrap_or_else(|| "cancelled".to_owned()),
                    ));
                }
                result = response.bytes() => result.map_err(map_send_error)?,
            },
            None => response.bytes().await.map_err(map_send_error)?,
        };
        drop(permit);

        let body = bytes.to_vec();
        let json = serde_json::from_slice(&body).ok();

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_owned(),
            method: method.to_string(),
            ok: status.is_success(),
            redirected: final_url != requested,
            url: final_url.to_string(),
            raw_headers,
            headers: flat_headers,
            cookies,
            content_type,
            content_length,
            body,
            json,
        })
    }
}

fn abort_reason(signal: &AbortSignal) -> Option<String> {
    signal
        .aborted()
        .then(|| signal.reason().unwrap_or_else(|| "cancelled".to_owned()))
}

fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_owned(), value.trim().to_owned()))
}
