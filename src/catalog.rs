//! Catalog lookups needed by the quality fallback.
//!
//! The resolver only needs three things from a catalog: the stream
//! descriptor of a track together with its designated substitute and ISRC,
//! a lookup of another track by ISRC, and optionally a direct unencrypted
//! URL. [`Gateway`](crate::gateway::Gateway) implements this against the
//! live service.

use async_trait::async_trait;
use url::Url;

use crate::{error::Result, track::Quality, track::StreamInfo};

/// A catalog entry as far as stream resolution is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogTrack {
    pub stream_info: StreamInfo,

    /// Track that the catalog designates as a substitute for this one.
    pub fallback_id: Option<String>,

    /// International Standard Recording Code.
    pub isrc: Option<String>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetches a track by ID.
    async fn track(&self, track_id: &str) -> Result<CatalogTrack>;

    /// Looks up a track by ISRC.
    async fn track_by_isrc(&self, isrc: &str) -> Result<CatalogTrack>;

    /// Returns an unencrypted URL for a track in the given quality, if the
    /// catalog can provide one.
    async fn direct_url(&self, _track_id: &str, _quality: Quality) -> Result<Option<Url>> {
        Ok(None)
    }
}
