//! HTTP client shared by catalog and CDN traffic.
//!
//! Catalog calls go through a rate limiter so that a burst of fallback
//! lookups cannot flood the web gateway: at most 50 calls per 5 seconds,
//! with bursts up to that amount and later calls delayed.
//!
//! CDN traffic (probes and ranged downloads) uses the [`unlimited`] client.
//! Throttling those would stall playback without reducing load on any API.
//!
//! [`unlimited`]: Client::unlimited

use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    cookie::Jar,
    header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE},
    Body, Method, Url,
};

use crate::{config::Config, error::Result};

/// HTTP client with a rate limited path for API calls.
pub struct Client {
    /// Client without rate limiting, for CDN access.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window of the API rate limit.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Calls allowed per window.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Longest wait for a single network read. A stalled CDN read fails the
    /// stream instead of hanging the client.
    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new client, optionally sending the cookies in `cookie_jar`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    ///
    /// # Panics
    ///
    /// Panics if the rate limit parameters are zero.
    pub fn new(config: &Config, cookie_jar: Option<Jar>) -> Result<Self> {
        // Not having `Accept-Language` set is non-fatal.
        let mut headers = HeaderMap::new();
        if let Ok(lang) = HeaderValue::from_str(&config.app_lang) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }

        let mut http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        if let Some(jar) = cookie_jar {
            http_client = http_client.cookie_provider(Arc::new(jar));
        }

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request to be run with [`execute`](Self::execute).
    pub fn request<T>(&self, method: Method, url: Url, body: T) -> reqwest::Request
    where
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url);
        *request.body_mut() = Some(body.into());
        request
    }

    pub fn post<T>(&self, url: Url, body: T) -> reqwest::Request
    where
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    #[must_use]
    pub fn get(&self, url: Url) -> reqwest::Request {
        reqwest::Request::new(Method::GET, url)
    }

    /// Runs `request` once the rate limiter allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails on the network.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn bursts_are_not_delayed() {
        let client = Client::new(&Config::default(), None).unwrap();

        let started = Instant::now();
        for _ in 0..Client::RATE_LIMIT_CALLS_PER_INTERVAL {
            client.rate_limiter.until_ready().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(client.rate_limiter.check().is_err());
    }

    #[test]
    fn builds_requests_with_body() {
        let client = Client::new(&Config::default(), None).unwrap();
        let url: Url = "https://www.deezer.com/ajax/gw-light.php".parse().unwrap();

        let request = client.post(url.clone(), "{}");
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url(), &url);
        assert_eq!(
            request.body().and_then(Body::as_bytes),
            Some(b"{}".as_slice())
        );

        let request = client.get(url);
        assert_eq!(request.method(), Method::GET);
        assert!(request.body().is_none());
    }
}
