//! Quality and track fallback for stream resolution.
//!
//! Not every track is available in every quality, and some tracks are not
//! available at all under their own ID. Resolution therefore walks:
//!
//! 1. The quality ladder, strictly downward: lossless, standard, low
//! 2. The track the catalog designates as substitute, with its own ladder
//!    and substitutes
//! 3. The track with the same ISRC, likewise
//!
//! Every rung is checked with a `HEAD` probe against the derived URL.
//! Probes run one at a time because each only happens when the previous one
//! failed. Failed probes and failed lookups are logged and skipped; only
//! when nothing is left is the track reported as not found.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use url::Url;

use crate::{
    catalog::{Catalog, CatalogTrack},
    cdn,
    error::{Error, Result},
    track::{Quality, StreamInfo},
};

/// Checks whether a stream URL can be fetched.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns the content length of the resource at `url`, if declared.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be fetched.
    async fn probe(&self, url: &Url) -> Result<Option<u64>>;
}

/// Probes with `HEAD` requests, each bounded by a timeout.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    #[must_use]
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &Url) -> Result<Option<u64>> {
        let request = self.client.head(url.clone()).send();
        let response = tokio::time::timeout(self.timeout, request).await??;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::not_found(format!("probe answered with {status}")));
        }

        // Read the header: the body of a `HEAD` response is always empty.
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());

        Ok(length)
    }
}

/// Work item of the resolution state machine.
enum Step {
    /// Walk the quality ladder of a track. Carries the catalog entry when
    /// it was already fetched.
    Ladder {
        info: StreamInfo,
        track: Option<CatalogTrack>,
    },

    /// Look up a substitute by ISRC.
    Isrc { track_id: String, isrc: String },
}

/// Resolves stream descriptors to a quality that can actually be fetched.
#[derive(Clone)]
pub struct Resolver {
    probe: Arc<dyn Probe>,
    catalog: Arc<dyn Catalog>,
}

impl Resolver {
    /// Upper bound on the number of tracks whose ladder is walked in one
    /// resolution.
    const MAX_CANDIDATES: usize = 8;

    #[must_use]
    pub fn new(probe: Arc<dyn Probe>, catalog: Arc<dyn Catalog>) -> Self {
        Self { probe, catalog }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Resolves `info` starting at `quality`.
    ///
    /// On success, the returned descriptor has its quality, size and
    /// encryption set, and may be for a different track than requested.
    /// Returns `Ok(None)` when every quality of every substitute failed.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the identifiers of `info` are
    /// malformed.
    pub async fn resolve(&self, info: StreamInfo, quality: Quality) -> Result<Option<StreamInfo>> {
        if !info.is_user_upload() {
            cdn::stream_url(
                &info.track_id,
                &info.origin_hash,
                &info.media_version,
                quality,
            )?;
        }

        // Substitutes are pushed after the ISRC step of the same track, so
        // that a substitute and everything below it is tried first.
        let mut stack = vec![Step::Ladder { info, track: None }];
        let mut visited = HashSet::new();

        while let Some(step) = stack.pop() {
            match step {
                Step::Ladder { mut info, track } => {
                    if !visited.insert(info.track_id.clone()) {
                        debug!("track {} was already tried", info.track_id);
                        continue;
                    }
                    if visited.len() > Self::MAX_CANDIDATES {
                        warn!(
                            "giving up after trying {} tracks",
                            Self::MAX_CANDIDATES
                        );
                        break;
                    }

                    if info.is_user_upload() {
                        info.quality = Quality::Standard;
                        return Ok(Some(info));
                    }

                    if self.quality_fallback(&mut info, quality).await {
                        return Ok(Some(info));
                    }

                    let track = match track {
                        Some(track) => track,
                        None => match self.catalog.track(&info.track_id).await {
                            Ok(track) => track,
                            Err(e) => {
                                warn!("catalog lookup of track {} failed: {e}", info.track_id);
                                continue;
                            }
                        },
                    };

                    if let Some(isrc) = track.isrc {
                        stack.push(Step::Isrc {
                            track_id: info.track_id.clone(),
                            isrc,
                        });
                    }

                    if let Some(fallback_id) =
                        track.fallback_id.filter(|id| *id != info.track_id)
                    {
                        match self.catalog.track(&fallback_id).await {
                            Ok(fallback) => {
                                warn!(
                                    "falling back from track {} to track {fallback_id}",
                                    info.track_id
                                );
                                stack.push(Step::Ladder {
                                    info: fallback.stream_info.clone(),
                                    track: Some(fallback),
                                });
                            }
                            Err(e) => warn!(
                                "track id fallback failed: {e} (original id: {})",
                                info.track_id
                            ),
                        }
                    }
                }

                Step::Isrc { track_id, isrc } => match self.catalog.track_by_isrc(&isrc).await {
                    Ok(found) => {
                        warn!(
                            "falling back from track {track_id} to track {} by isrc {isrc}",
                            found.stream_info.track_id
                        );
                        stack.push(Step::Ladder {
                            info: found.stream_info.clone(),
                            track: Some(found),
                        });
                    }
                    Err(e) => warn!("isrc fallback failed: {e} (original id: {track_id})"),
                },
            }
        }

        Ok(None)
    }

    /// Walks the quality ladder of one track from `quality` downward,
    /// updating `info` on the first successful probe.
    async fn quality_fallback(&self, info: &mut StreamInfo, quality: Quality) -> bool {
        let mut rung = Some(quality);
        while let Some(quality) = rung {
            match self.probe_quality(info, quality).await {
                Ok(()) => {
                    debug!(
                        "resolved track {} in quality {quality} ({} bytes)",
                        info.track_id,
                        info.size.map_or_else(|| "unknown".to_owned(), |s| s.to_string())
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        "quality fallback: track {} in quality {quality} failed: {e}",
                        info.track_id
                    );
                    rung = quality.fallback();
                }
            }
        }

        warn!("no quality available for track {}", info.track_id);
        false
    }

    async fn probe_quality(&self, info: &mut StreamInfo, quality: Quality) -> Result<()> {
        let direct_url = match self.catalog.direct_url(&info.track_id, quality).await {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    "no direct url for track {} in quality {quality}: {e}",
                    info.track_id
                );
                None
            }
        };

        let mut candidate = info.clone().with_quality(quality);
        candidate.encrypted = direct_url.is_none();
        candidate.direct_url = direct_url;

        let url = candidate.url()?;
        candidate.size = self.probe.probe(&url).await?;

        *info = candidate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use crate::error::ErrorKind;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    fn info(track_id: &str) -> StreamInfo {
        StreamInfo::new(track_id, HASH, "1")
    }

    fn url(track_id: &str, quality: Quality) -> Url {
        info(track_id).with_quality(quality).url().unwrap()
    }

    /// Succeeds for the listed URLs and records every probe.
    #[derive(Default)]
    struct MockProbe {
        available: HashMap<Url, u64>,
        probed: Mutex<Vec<Url>>,
    }

    impl MockProbe {
        fn with(mut self, track_id: &str, quality: Quality, size: u64) -> Self {
            self.available.insert(url(track_id, quality), size);
            self
        }

        fn with_direct(mut self, url: &Url, size: u64) -> Self {
            self.available.insert(url.clone(), size);
            self
        }

        fn probed(&self) -> Vec<Url> {
            self.probed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Probe for MockProbe {
        async fn probe(&self, url: &Url) -> Result<Option<u64>> {
            self.probed.lock().unwrap().push(url.clone());
            self.available
                .get(url)
                .map(|size| Some(*size))
                .ok_or_else(|| Error::not_found("probe answered with 404 Not Found"))
        }
    }

    #[derive(Default)]
    struct MockCatalog {
        tracks: HashMap<String, CatalogTrack>,
        by_isrc: HashMap<String, String>,
        direct: HashMap<String, Url>,
    }

    impl MockCatalog {
        fn with(mut self, track_id: &str, fallback_id: Option<&str>, isrc: Option<&str>) -> Self {
            let track = CatalogTrack {
                stream_info: info(track_id),
                fallback_id: fallback_id.map(ToOwned::to_owned),
                isrc: isrc.map(ToOwned::to_owned),
            };
            if let Some(isrc) = isrc {
                self.by_isrc
                    .entry(isrc.to_owned())
                    .or_insert_with(|| track_id.to_owned());
            }
            self.tracks.insert(track_id.to_owned(), track);
            self
        }

        fn with_isrc(mut self, isrc: &str, track_id: &str) -> Self {
            self.by_isrc.insert(isrc.to_owned(), track_id.to_owned());
            self
        }

        fn with_direct(mut self, track_id: &str, url: &Url) -> Self {
            self.direct.insert(track_id.to_owned(), url.clone());
            self
        }
    }

    #[async_trait]
    impl Catalog for MockCatalog {
        async fn track(&self, track_id: &str) -> Result<CatalogTrack> {
            self.tracks
                .get(track_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("track {track_id} not in catalog")))
        }

        async fn track_by_isrc(&self, isrc: &str) -> Result<CatalogTrack> {
            let id = self
                .by_isrc
                .get(isrc)
                .ok_or_else(|| Error::not_found(format!("no track with isrc {isrc}")))?;
            self.track(id).await
        }

        async fn direct_url(&self, track_id: &str, quality: Quality) -> Result<Option<Url>> {
            if quality != Quality::Lossless {
                return Ok(None);
            }
            Ok(self.direct.get(track_id).cloned())
        }
    }

    fn resolver(probe: &Arc<MockProbe>, catalog: MockCatalog) -> Resolver {
        Resolver::new(Arc::clone(probe) as _, Arc::new(catalog))
    }

    #[tokio::test]
    async fn walks_quality_ladder_in_order() {
        let probe = Arc::new(MockProbe::default().with("100", Quality::Low, 1234));
        let resolver = resolver(&probe, MockCatalog::default());

        let resolved = resolver
            .resolve(info("100"), Quality::Lossless)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.quality, Quality::Low);
        assert_eq!(resolved.size, Some(1234));
        assert!(resolved.encrypted);
        assert_eq!(
            probe.probed(),
            [
                url("100", Quality::Lossless),
                url("100", Quality::Standard),
                url("100", Quality::Low),
            ]
        );
    }

    #[tokio::test]
    async fn starts_at_requested_quality() {
        let probe = Arc::new(MockProbe::default().with("100", Quality::Lossless, 1));
        let resolver = resolver(&probe, MockCatalog::default());

        let resolved = resolver.resolve(info("100"), Quality::Standard).await.unwrap();

        assert!(resolved.is_none());
        assert_eq!(
            probe.probed(),
            [url("100", Quality::Standard), url("100", Quality::Low)]
        );
    }

    #[tokio::test]
    async fn falls_back_to_substitute_track() {
        let probe = Arc::new(MockProbe::default().with("200", Quality::Standard, 42));
        let catalog = MockCatalog::default()
            .with("100", Some("200"), None)
            .with("200", None, None);

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Standard)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.track_id, "200");
        assert_eq!(resolved.quality, Quality::Standard);
        assert_eq!(resolved.size, Some(42));
    }

    #[tokio::test]
    async fn falls_back_by_isrc_after_substitute() {
        let probe = Arc::new(MockProbe::default().with("300", Quality::Low, 7));
        let catalog = MockCatalog::default()
            .with("100", Some("200"), Some("GBAYE0601498"))
            .with("200", None, None)
            .with("300", None, None)
            .with_isrc("GBAYE0601498", "300");

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Standard)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.track_id, "300");
        assert_eq!(resolved.quality, Quality::Low);
        assert_eq!(
            probe.probed(),
            [
                url("100", Quality::Standard),
                url("100", Quality::Low),
                url("200", Quality::Standard),
                url("200", Quality::Low),
                url("300", Quality::Standard),
                url("300", Quality::Low),
            ]
        );
    }

    #[tokio::test]
    async fn substitutes_start_at_requested_quality() {
        let probe = Arc::new(MockProbe::default().with("200", Quality::Lossless, 9000));
        let catalog = MockCatalog::default()
            .with("100", Some("200"), None)
            .with("200", None, None);

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Lossless)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.track_id, "200");
        assert_eq!(resolved.quality, Quality::Lossless);
        assert_eq!(resolved.size, Some(9000));
        assert_eq!(
            probe.probed(),
            [
                url("100", Quality::Lossless),
                url("100", Quality::Standard),
                url("100", Quality::Low),
                url("200", Quality::Lossless),
            ]
        );

        let probe = Arc::new(MockProbe::default().with("300", Quality::Lossless, 9100));
        let catalog = MockCatalog::default()
            .with("100", None, Some("GBAYE0601498"))
            .with("300", None, None)
            .with_isrc("GBAYE0601498", "300");

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Lossless)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.track_id, "300");
        assert_eq!(resolved.quality, Quality::Lossless);
        assert_eq!(probe.probed().last(), Some(&url("300", Quality::Lossless)));
    }

    #[tokio::test]
    async fn ignores_self_referencing_fallbacks() {
        let probe = Arc::new(MockProbe::default());
        let catalog = MockCatalog::default().with("100", Some("100"), Some("ISRC1"));

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Low)
            .await
            .unwrap();

        assert!(resolved.is_none());
        assert_eq!(probe.probed(), [url("100", Quality::Low)]);
    }

    #[tokio::test]
    async fn survives_substitution_cycles() {
        let probe = Arc::new(MockProbe::default());
        let catalog = MockCatalog::default()
            .with("100", Some("200"), None)
            .with("200", Some("100"), None);

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Low)
            .await
            .unwrap();

        assert!(resolved.is_none());
        assert_eq!(
            probe.probed(),
            [url("100", Quality::Low), url("200", Quality::Low)]
        );
    }

    #[tokio::test]
    async fn catalog_errors_are_not_fatal() {
        let probe = Arc::new(MockProbe::default());
        let resolved = resolver(&probe, MockCatalog::default())
            .resolve(info("100"), Quality::Standard)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn user_uploads_skip_probing() {
        let probe = Arc::new(MockProbe::default());
        let resolved = resolver(&probe, MockCatalog::default())
            .resolve(info("-5000"), Quality::Lossless)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.quality, Quality::Standard);
        assert!(probe.probed().is_empty());
    }

    #[tokio::test]
    async fn prefers_direct_lossless_url() {
        let direct: Url = "https://cdn.example.com/100.flac".parse().unwrap();
        let probe = Arc::new(MockProbe::default().with_direct(&direct, 99));
        let catalog = MockCatalog::default().with_direct("100", &direct);

        let resolved = resolver(&probe, catalog)
            .resolve(info("100"), Quality::Lossless)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.quality, Quality::Lossless);
        assert!(!resolved.encrypted);
        assert_eq!(resolved.direct_url, Some(direct.clone()));
        assert_eq!(resolved.url().unwrap(), direct);
    }

    #[tokio::test]
    async fn rejects_malformed_identifiers() {
        let probe = Arc::new(MockProbe::default());
        let err = resolver(&probe, MockCatalog::default())
            .resolve(StreamInfo::new("100", "", "1"), Quality::Standard)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(probe.probed().is_empty());
    }
}
