//! Wire types of the catalog services.
//!
//! * [`gateway`] - the web gateway behind the ARL session
//! * [`api`] - the public REST API
//!
//! Identifiers arrive as numbers in some responses and as strings in
//! others; the types here accept both.

pub mod api;
pub mod gateway;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Parses a JSON response body, logging it at trace level.
///
/// When the body is valid JSON of an unexpected shape, the raw value is
/// traced so the mismatch can be diagnosed. When it is not JSON at all, an
/// error is logged.
///
/// # Errors
///
/// Returns an error if `body` does not deserialize into `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
