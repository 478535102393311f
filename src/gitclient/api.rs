//! Shared HTTP request pipeline for the provider API clients.
//!
//! Both API dialects run the same skeleton: rate-limiter admission, an
//! authenticated request with a mandatory user-agent, bounded retries with
//! linear backoff on transient failures, a rate-header parse off every
//! response, and a uniform status-to-error mapping. The variants only supply
//! their auth header shape and rate-limit header convention.

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use super::error::GitClientError;
use super::ratelimit::RateLimiter;

pub const SENTRY_USER_AGENT: &str = concat!("gitsentry/", env!("CARGO_PKG_VERSION"));

/// Authentication header shape per provider family.
#[derive(Debug, Clone, Copy)]
pub enum AuthStyle {
    /// `Authorization: token <secret>`
    Token,
    /// `Authorization: Bearer <secret>`
    Bearer,
}

/// How a provider encodes its rate-limit reset header.
#[derive(Debug, Clone, Copy)]
pub enum ResetFormat {
    UnixSeconds,
    Rfc3339,
}

/// Rate-limit header names and reset encoding for one provider family.
#[derive(Debug, Clone, Copy)]
pub struct RateHeaders {
    pub limit: &'static str,
    pub remaining: &'static str,
    pub reset: &'static str,
    pub format: ResetFormat,
}

impl RateHeaders {
    pub const GITHUB: RateHeaders = RateHeaders {
        limit: "X-RateLimit-Limit",
        remaining: "X-RateLimit-Remaining",
        reset: "X-RateLimit-Reset",
        format: ResetFormat::UnixSeconds,
    };

    pub const GITLAB: RateHeaders = RateHeaders {
        limit: "RateLimit-Limit",
        remaining: "RateLimit-Remaining",
        reset: "RateLimit-ResetTime",
        format: ResetFormat::Rfc3339,
    };
}

/// One authenticated, rate-limited, retrying HTTP channel to a provider API.
pub struct ApiTransport {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    auth: AuthStyle,
    token: String,
    rate_headers: RateHeaders,
    retry_attempts: u32,
    retry_backoff: Duration,
    cancel: CancellationToken,
}

impl ApiTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthStyle,
        token: String,
        rate_headers: RateHeaders,
        limiter: Arc<RateLimiter>,
        retry_attempts: u32,
        retry_backoff: Duration,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, GitClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(SENTRY_USER_AGENT));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| GitClientError::network_caused_by("failed to build HTTP client", e))?;

        Ok(ApiTransport {
            http,
            limiter,
            auth,
            token,
            rate_headers,
            retry_attempts,
            retry_backoff,
            cancel,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GitClientError> {
        let response = self.get(url).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| GitClientError::network_caused_by("failed to decode response body", e))
    }

    /// GET `url` through the full pipeline, returning the successful response.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, GitClientError> {
        self.limiter.wait(&self.cancel).await?;

        let mut last_error = GitClientError::network("request was never attempted");

        for attempt in 0..=self.retry_attempts {
            if attempt > 0 {
                let backoff = self.retry_backoff * attempt;
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(GitClientError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let mut request = self.http.get(url);
            if !self.token.is_empty() {
                let value = match self.auth {
                    AuthStyle::Token => format!("token {}", self.token),
                    AuthStyle::Bearer => format!("Bearer {}", self.token),
                };
                let value = HeaderValue::from_str(&value)
                    .map_err(|_| GitClientError::Authentication)?;
                request = request.header(AUTHORIZATION, value);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = GitClientError::network_caused_by("request failed", e);
                    continue;
                }
            };

            self.record_rate_headers(response.headers());

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(GitClientError::Authentication);
                }
                StatusCode::NOT_FOUND => {
                    return Err(GitClientError::NotFound(url.to_string()));
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let reset = self
                        .parse_reset(response.headers())
                        .unwrap_or_else(|| OffsetDateTime::now_utc() + time::Duration::minutes(1));
                    return Err(GitClientError::RateLimited { reset });
                }
                StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => {
                    last_error =
                        GitClientError::network(format!("server error {}", status.as_u16()));
                    continue;
                }
                other => {
                    return Err(GitClientError::network(format!(
                        "unexpected status {}",
                        other.as_u16()
                    )));
                }
            }
        }

        Err(last_error)
    }

    fn record_rate_headers(&self, headers: &HeaderMap) {
        let Some(limit) = parse_u32(headers, self.rate_headers.limit) else {
            return;
        };
        let Some(remaining) = parse_u32(headers, self.rate_headers.remaining) else {
            return;
        };
        let Some(reset) = self.parse_reset(headers) else {
            return;
        };
        self.limiter.update_limit(limit, remaining, reset);
    }

    fn parse_reset(&self, headers: &HeaderMap) -> Option<OffsetDateTime> {
        let raw = headers.get(self.rate_headers.reset)?.to_str().ok()?;
        match self.rate_headers.format {
            ResetFormat::UnixSeconds => {
                let secs: i64 = raw.trim().parse().ok()?;
                OffsetDateTime::from_unix_timestamp(secs).ok()
            }
            ResetFormat::Rfc3339 => OffsetDateTime::parse(raw.trim(), &Rfc3339).ok(),
        }
    }
}

fn parse_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}
