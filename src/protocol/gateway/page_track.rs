//! Track page data.
//!
//! Request body:
//! ```json
//! { "sng_id": "3135556" }
//! ```
//!
//! Response results (abridged):
//! ```json
//! {
//!     "DATA": {
//!         "SNG_ID": "3135556",
//!         "MD5_ORIGIN": "1d2f9b5c...",
//!         "MEDIA_VERSION": "8",
//!         "ISRC": "GBDUW0000059",
//!         "FALLBACK": { "SNG_ID": "3135557", ... }
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, NoneAsEmptyString, PickFirst};

use crate::{catalog::CatalogTrack, track::StreamInfo};

use super::Method;

impl Method for PageTrack {
    const METHOD: &'static str = "deezer.pageTrack";
}

#[derive(Clone, Eq, PartialEq, Deserialize, Debug)]
pub struct PageTrack {
    #[serde(rename = "DATA")]
    pub data: TrackData,
}

#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Debug)]
pub struct TrackData {
    /// Negative for user uploads.
    #[serde(rename = "SNG_ID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub track_id: i64,

    #[serde(rename = "MD5_ORIGIN")]
    pub origin_hash: String,

    #[serde(rename = "MEDIA_VERSION")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub media_version: u32,

    #[serde(default, rename = "ISRC")]
    #[serde_as(as = "NoneAsEmptyString")]
    pub isrc: Option<String>,

    #[serde(default, rename = "FALLBACK")]
    pub fallback: Option<Fallback>,
}

#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Debug)]
pub struct Fallback {
    #[serde(rename = "SNG_ID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub track_id: i64,
}

impl From<TrackData> for CatalogTrack {
    fn from(data: TrackData) -> Self {
        Self {
            stream_info: StreamInfo::new(
                data.track_id.to_string(),
                data.origin_hash,
                data.media_version.to_string(),
            ),
            fallback_id: data.fallback.map(|fallback| fallback.track_id.to_string()),
            isrc: data.isrc,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Debug)]
pub struct Request {
    #[serde(rename = "sng_id")]
    pub track_id: String,
}
