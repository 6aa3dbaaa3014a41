//! Catalog client for the web gateway and the public API.
//!
//! Gateway calls need an API token from the user data of the ARL session.
//! The token is fetched on first use and refetched once whenever the
//! gateway reports it as invalid. Session cookies set along the way are
//! kept in the client's cookie jar.
//!
//! All calls share the rate limiter of [`http::Client`](crate::http::Client).

use async_trait::async_trait;
use reqwest::{
    cookie::Jar,
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    catalog::{Catalog, CatalogTrack},
    config::Config,
    error::{Error, ErrorKind, Result},
    http::Client as HttpClient,
    protocol::{
        self, api,
        gateway::{self, page_track, Method, PageTrack, Status, UserData},
    },
    track::Quality,
};

pub struct Gateway {
    http_client: HttpClient,

    /// Fetched lazily; `None` until the first call or after the API token
    /// was rejected.
    user_data: Mutex<Option<UserData>>,

    /// OAuth token for unencrypted lossless URLs.
    access_token: Option<String>,

    gateway_url: Url,
    api_url: Url,
}

impl Gateway {
    /// The URL of the cookie origin. Cookies are set for the whole
    /// `deezer.com` domain.
    const COOKIE_ORIGIN: &'static str = "https://www.deezer.com";

    const GATEWAY_URL: &'static str = "https://www.deezer.com/ajax/gw-light.php";

    const GATEWAY_VERSION: &'static str = "1.0";

    const GATEWAY_INPUT: &'static str = "3";

    const API_URL: &'static str = "https://api.deezer.com/";

    /// Although the bodies of all gateway requests are JSON, the
    /// `Content-Type` is not.
    const PLAIN_TEXT_CONTENT: HeaderValue = HeaderValue::from_static("text/plain;charset=UTF-8");

    const EMPTY_JSON_OBJECT: &'static str = "{}";

    fn cookie_jar(config: &Config) -> Result<Jar> {
        let cookie_jar = Jar::default();
        let cookie_origin = Self::COOKIE_ORIGIN.parse::<Url>()?;

        let lang_cookie = format!(
            "dz_lang={}; Domain=deezer.com; Path=/; Secure; HttpOnly",
            config.app_lang
        );
        cookie_jar.add_cookie_str(&lang_cookie, &cookie_origin);

        if let Some(ref arl) = config.arl {
            let arl_cookie = format!("arl={arl}; Domain=deezer.com; Path=/; Secure; HttpOnly");
            cookie_jar.add_cookie_str(&arl_cookie, &cookie_origin);
        }

        Ok(cookie_jar)
    }

    /// Creates a client for the ARL and access token in `config`. No
    /// requests are made until the first lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let cookie_jar = Self::cookie_jar(config)?;
        let http_client = HttpClient::new(config, Some(cookie_jar))?;

        Ok(Self {
            http_client,
            user_data: Mutex::new(None),
            access_token: config.access_token.clone(),
            gateway_url: Self::GATEWAY_URL.parse()?,
            api_url: Self::API_URL.parse()?,
        })
    }

    /// The HTTP client without rate limiting, for CDN traffic.
    #[must_use]
    pub fn cdn_client(&self) -> reqwest::Client {
        self.http_client.unlimited.clone()
    }

    /// Calls a gateway method and returns its first result.
    ///
    /// Refetches the API token and retries once if the gateway rejects it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the gateway reports an error,
    /// or the response holds no result.
    pub async fn request<T>(&self, body: &impl Serialize) -> Result<T>
    where
        T: std::fmt::Debug + Method + for<'de> Deserialize<'de>,
    {
        let body = serde_json::to_string(body)?;

        let api_token = self.api_token().await?;
        let response = match self.call::<T>(&api_token, body.clone()).await {
            Err(e) if e.kind == ErrorKind::Unauthenticated => {
                debug!("{}: api token rejected, refreshing user data", T::METHOD);
                self.user_data.lock().await.take();
                let api_token = self.api_token().await?;
                self.call::<T>(&api_token, body).await?
            }
            result => result?,
        };

        response
            .into_first()
            .ok_or_else(|| Error::not_found(format!("{}: no results", T::METHOD)))
    }

    /// Returns the current API token, fetching user data when there is
    /// none.
    async fn api_token(&self) -> Result<String> {
        let mut user_data = self.user_data.lock().await;
        if let Some(ref data) = *user_data {
            return Ok(data.api_token.clone());
        }

        let data = self
            .call::<UserData>("", Self::EMPTY_JSON_OBJECT.to_owned())
            .await?
            .into_first()
            .ok_or_else(|| Error::unauthenticated("no user data received"))?;

        if data.user.is_logged_in() {
            debug!("logged in as user {}", data.user.id);
        } else {
            warn!("arl is missing or expired; catalog lookups may fail");
        }

        let api_token = data.api_token.clone();
        *user_data = Some(data);
        Ok(api_token)
    }

    async fn call<T>(&self, api_token: &str, body: String) -> Result<gateway::Response<T>>
    where
        T: std::fmt::Debug + Method + for<'de> Deserialize<'de>,
    {
        let mut url = self.gateway_url.clone();
        url.query_pairs_mut()
            .append_pair("method", T::METHOD)
            .append_pair("input", Self::GATEWAY_INPUT)
            .append_pair("api_version", Self::GATEWAY_VERSION)
            .append_pair("api_token", api_token);

        let mut request = self.http_client.post(url, body);
        request
            .headers_mut()
            .try_insert(CONTENT_TYPE, Self::PLAIN_TEXT_CONTENT)?;

        let response = self.http_client.execute(request).await?;
        let body = response.error_for_status()?.text().await?;

        protocol::json::<Status>(&body, T::METHOD)?.into_result()?;
        protocol::json(&body, T::METHOD)
    }

    /// Calls the public API at `path`, optionally with a bearer token.
    async fn public_api<T>(&self, path: &str, access_token: Option<&str>) -> Result<T>
    where
        T: std::fmt::Debug + for<'de> Deserialize<'de>,
    {
        let url = self.api_url.join(path)?;
        let mut request = self.http_client.get(url);
        if let Some(token) = access_token {
            request
                .headers_mut()
                .try_insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?)?;
        }

        let response = self.http_client.execute(request).await?;
        let body = response.error_for_status()?.text().await?;

        protocol::json::<api::Response<T>>(&body, path)?.into_result()
    }

    async fn page_track(&self, track_id: &str) -> Result<CatalogTrack> {
        let request = page_track::Request {
            track_id: track_id.to_owned(),
        };
        let page: PageTrack = self.request(&request).await?;
        Ok(page.data.into())
    }
}

#[async_trait]
impl Catalog for Gateway {
    async fn track(&self, track_id: &str) -> Result<CatalogTrack> {
        self.page_track(track_id).await
    }

    async fn track_by_isrc(&self, isrc: &str) -> Result<CatalogTrack> {
        let track = self
            .public_api::<api::IsrcTrack>(&format!("track/isrc:{isrc}"), None)
            .await?;
        self.page_track(&track.id.to_string()).await
    }

    async fn direct_url(&self, track_id: &str, quality: Quality) -> Result<Option<Url>> {
        let Some(ref access_token) = self.access_token else {
            return Ok(None);
        };
        if quality != Quality::Lossless {
            return Ok(None);
        }

        let urls = self
            .public_api::<api::StreamUrls>(
                &format!("platform/gcast/track/{track_id}/streamUrls"),
                Some(access_token),
            )
            .await?;
        Ok(urls.into_flac_url())
    }
}
