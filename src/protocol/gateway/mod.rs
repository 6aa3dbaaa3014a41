//! Web gateway methods and response envelope.
//!
//! Every call is a `POST` to the gateway URL with the method name in the
//! query string and a JSON body. Responses wrap their payload as:
//!
//! ```json
//! {
//!     "error": [],
//!     "results": { ... }
//! }
//! ```
//!
//! On failure `error` becomes an object such as
//! `{"VALID_TOKEN_REQUIRED": "Invalid CSRF token"}` and `results` is empty,
//! so the envelope is checked before the payload is parsed.

pub mod page_track;
pub mod user_data;

pub use page_track::PageTrack;
pub use user_data::UserData;

use std::collections::HashMap;

use serde::Deserialize;
use serde_with::{serde_as, OneOrMany, PickFirst, Seq};

use crate::error::{Error, Result};

/// A gateway method, identified by its dotted name.
pub trait Method {
    const METHOD: &'static str;
}

/// Error part of a gateway response.
#[serde_as]
#[derive(Clone, Default, PartialEq, Deserialize, Debug)]
pub struct Status {
    /// Error codes with their messages; empty on success.
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, Seq<(_, _)>)>")]
    pub error: HashMap<String, serde_json::Value>,
}

impl Status {
    /// Code sent when the API token is missing or stale.
    pub const INVALID_TOKEN: &'static str = "VALID_TOKEN_REQUIRED";

    /// Code sent for unknown or unavailable items.
    pub const DATA_ERROR: &'static str = "DATA_ERROR";

    /// Converts the error map into an `Err`.
    ///
    /// # Errors
    ///
    /// * `Error::Unauthenticated` for an invalid API token
    /// * `Error::NotFound` for missing data
    /// * `Error::Unknown` for any other code
    pub fn into_result(self) -> Result<()> {
        let Some((code, message)) = self.error.into_iter().next() else {
            return Ok(());
        };

        let details = format!("{code}: {message}");
        Err(match code.as_str() {
            Self::INVALID_TOKEN => Error::unauthenticated(details),
            Self::DATA_ERROR => Error::not_found(details),
            _ => Error::unknown(details),
        })
    }
}

/// Successful gateway response.
#[serde_as]
#[derive(Clone, PartialEq, Deserialize, Debug)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Response<T> {
    /// A single result or a list of them.
    #[serde_as(as = "OneOrMany<_>")]
    pub results: Vec<T>,
}

impl<T> Response<T> {
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.results.first()
    }

    #[must_use]
    pub fn into_first(self) -> Option<T> {
        self.results.into_iter().next()
    }
}
