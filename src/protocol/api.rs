//! Public REST API responses.
//!
//! The API answers errors with status `200` and an error object instead of
//! the payload:
//!
//! ```json
//! { "error": { "type": "DataException", "message": "no data", "code": 800 } }
//! ```

use std::fmt;

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use url::Url;

use crate::error::{Error, Result};

/// Either a payload or an error object.
#[derive(Clone, PartialEq, Deserialize, Debug)]
#[serde(untagged)]
pub enum Response<T> {
    Err { error: ApiError },
    Ok(T),
}

impl<T> Response<T> {
    /// # Errors
    ///
    /// Returns `Error::NotFound` for missing data, `Error::Unauthenticated`
    /// for token errors and `Error::Unknown` otherwise.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err { error } => Err(error.into()),
        }
    }
}

#[derive(Clone, PartialEq, Deserialize, Debug)]
pub struct ApiError {
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub code: u32,
}

impl ApiError {
    /// Code for queries without results.
    const NO_DATA: u32 = 800;

    /// Code for invalid or expired OAuth tokens.
    const INVALID_TOKEN: u32 = 300;
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.code, self.message)
    }
}

impl From<ApiError> for Error {
    fn from(e: ApiError) -> Self {
        match e.code {
            ApiError::NO_DATA => Self::not_found(e.to_string()),
            ApiError::INVALID_TOKEN => Self::unauthenticated(e.to_string()),
            _ => Self::unknown(e.to_string()),
        }
    }
}

/// Track looked up by ISRC; only the ID is needed.
#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Debug)]
pub struct IsrcTrack {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: i64,
}

/// Stream URLs handed out to cast receivers.
#[derive(Clone, PartialEq, Deserialize, Debug)]
pub struct StreamUrls {
    pub data: StreamUrlsData,
}

#[derive(Clone, PartialEq, Deserialize, Debug)]
pub struct StreamUrlsData {
    pub attributes: StreamUrlsAttributes,
}

#[derive(Clone, PartialEq, Deserialize, Debug)]
pub struct StreamUrlsAttributes {
    /// Unencrypted FLAC, when available for the account.
    #[serde(default)]
    pub url_flac: Option<Url>,
}

impl StreamUrls {
    #[must_use]
    pub fn into_flac_url(self) -> Option<Url> {
        self.data.attributes.url_flac
    }
}
