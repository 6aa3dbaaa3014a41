//! Decrypted byte-range streams over HTTP.
//!
//! A [`RangeStream`] fetches a byte range of a track from the CDN and
//! yields the plaintext. Because encryption is striped over fixed blocks,
//! the request always starts at the block boundary at or before the
//! requested byte; the leading bytes are dropped again after decryption.
//!
//! The stream is pull-based: the HTTP body is only polled when the
//! consumer polls for the next chunk. Dropping the stream drops the
//! response body, which aborts the request, together with the decryptor
//! and any partial block it was holding.

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};
use url::Url;

use crate::{
    decrypt::{BlockDecryptor, KeyProvider, BLOCK_SIZE},
    error::{Error, Result},
    track::StreamInfo,
};

type Body = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Plaintext stream of a byte range of one track.
pub struct RangeStream {
    body: Body,

    /// `None` for unencrypted streams.
    decryptor: Option<BlockDecryptor>,

    /// Total size in bytes, counted from the start of the track.
    size: Option<u64>,

    /// First plaintext byte of this stream.
    start: u64,

    /// Plaintext bytes left to yield when the range has an end.
    remaining: Option<u64>,

    /// Set once the body ended or failed; no chunks follow after that.
    finished: bool,
}

impl RangeStream {
    /// Opens a stream from byte `start` up to and including byte `end`, or
    /// to the end of the track when `end` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifiers are malformed, the key cannot be
    /// derived, or the CDN does not answer with a successful range
    /// response.
    pub async fn open(
        client: &reqwest::Client,
        info: &StreamInfo,
        keys: Arc<dyn KeyProvider>,
        start: u64,
        end: Option<u64>,
    ) -> Result<Self> {
        let url = info.url()?;
        let keys = info.encrypted.then_some(keys);
        Self::open_url(client, url, &info.track_id, keys, start, end).await
    }

    /// Opens a stream from an explicit URL. Without `keys`, the content is
    /// passed through as is.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn open_url(
        client: &reqwest::Client,
        url: Url,
        track_id: &str,
        keys: Option<Arc<dyn KeyProvider>>,
        start: u64,
        end: Option<u64>,
    ) -> Result<Self> {
        if end.is_some_and(|end| end < start) {
            return Err(Error::out_of_range(format!(
                "range end {end:?} is before start {start}"
            )));
        }

        // Decryption must start at a block boundary to keep the stripe
        // phase; unencrypted content can be fetched from the exact byte.
        let fetch_start = match keys {
            Some(_) => start - start % BLOCK_SIZE as u64,
            None => start,
        };

        // Derive the key before touching the network.
        let decryptor = keys
            .map(|keys| BlockDecryptor::new(track_id, start, keys))
            .transpose()?;

        // Likewise, fetch up to the end of the block holding the last byte:
        // a block cut short would not be decrypted. The surplus is trimmed
        // after decryption.
        let block_size = BLOCK_SIZE as u64;
        let encrypted = decryptor.is_some();
        let fetch_end = end.map(|end| {
            if encrypted {
                (end - end % block_size).saturating_add(block_size - 1)
            } else {
                end
            }
        });

        let range = match fetch_end {
            Some(end) => format!("bytes={fetch_start}-{end}"),
            None => format!("bytes={fetch_start}-"),
        };
        debug!("opening track {track_id} with {range}");

        let response = client
            .get(url)
            .header(RANGE, range)
            .send()
            .await?
            .error_for_status()?;

        // A server that ignores the range sends the whole track, which
        // would put the block grid out of phase.
        if fetch_start > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::failed_precondition(format!(
                "range request for track {track_id} answered with {}",
                response.status()
            )));
        }

        // Prefer the total from `Content-Range`: with an explicit end, the
        // content length only covers the requested range.
        let size = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(total_size)
            .or_else(|| response.content_length().map(|length| length + fetch_start));
        match size {
            Some(size) => trace!("track {track_id} is {size} bytes"),
            None => trace!("track {track_id} has unknown size"),
        }

        Ok(Self {
            body: Box::pin(response.bytes_stream()),
            decryptor,
            size,
            start,
            remaining: end.map(|end| (end - start).saturating_add(1)),
            finished: false,
        })
    }

    /// Total size in bytes counted from the start of the track, or `None`
    /// if the CDN did not declare a content length.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// First plaintext byte of this stream.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Cuts `chunk` off at the end of the requested range.
    #[expect(clippy::cast_possible_truncation)]
    fn limit(&mut self, mut chunk: Bytes) -> Bytes {
        if let Some(remaining) = self.remaining.as_mut() {
            if chunk.len() as u64 >= *remaining {
                chunk.truncate(*remaining as usize);
                *remaining = 0;
                self.finished = true;
            } else {
                *remaining -= chunk.len() as u64;
            }
        }
        chunk
    }
}

/// Parses the complete length out of a `Content-Range` header value such
/// as `bytes 0-1023/4096`.
fn total_size(content_range: &str) -> Option<u64> {
    let (_, total) = content_range.strip_prefix("bytes ")?.rsplit_once('/')?;
    total.trim().parse().ok()
}

impl Stream for RangeStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match this.body.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,

                Poll::Ready(Some(Ok(chunk))) => {
                    let Some(decryptor) = this.decryptor.as_mut() else {
                        return Poll::Ready(Some(Ok(this.limit(chunk))));
                    };

                    match decryptor.feed(&chunk) {
                        // Keep reading until a full block is available.
                        Ok(plain) if plain.is_empty() => {}
                        Ok(plain) => return Poll::Ready(Some(Ok(this.limit(plain)))),
                        Err(e) => {
                            this.finished = true;
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }

                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    this.decryptor = None;
                    return Poll::Ready(Some(Err(Error::data_loss(e))));
                }

                Poll::Ready(None) => {
                    this.finished = true;
                    let tail = this
                        .decryptor
                        .take()
                        .map(|mut decryptor| decryptor.flush())
                        .unwrap_or_default();
                    if !tail.is_empty() {
                        return Poll::Ready(Some(Ok(this.limit(tail))));
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeStream")
            .field("size", &self.size)
            .field("start", &self.start)
            .field("encrypted", &self.is_encrypted())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;

    use axum::{
        body::Body as AxumBody,
        extract::State,
        http::{header, HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };
    use futures_util::TryStreamExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::decrypt::tests::{plaintext, XorKeys};

    const TRACK_ID: &str = "3135556";

    /// Serves `data` with single-range support.
    async fn ranged(State(data): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response {
        let len = data.len() as u64;
        let Some(range) = headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
        else {
            return (StatusCode::OK, data.as_ref().clone()).into_response();
        };

        let (start, end) = range.split_once('-').unwrap();
        let start: u64 = start.parse().unwrap();
        let end: u64 = if end.is_empty() {
            len - 1
        } else {
            end.parse::<u64>().unwrap().min(len - 1)
        };
        if start >= len {
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        }

        #[expect(clippy::cast_possible_truncation)]
        let body = data[start as usize..=end as usize].to_vec();
        Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
            .header(header::CONTENT_LENGTH, body.len())
            .body(AxumBody::from(body))
            .unwrap()
    }

    pub(crate) async fn serve(data: Vec<u8>) -> SocketAddr {
        let router = Router::new()
            .route("/track", get(ranged))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .with_state(Arc::new(data));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    pub(crate) fn url(addr: SocketAddr, path: &str) -> Url {
        format!("http://{addr}{path}").parse().unwrap()
    }

    async fn open(
        addr: SocketAddr,
        encrypted: bool,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeStream> {
        let keys: Option<Arc<dyn KeyProvider>> = encrypted.then(|| Arc::new(XorKeys) as _);
        RangeStream::open_url(
            &reqwest::Client::new(),
            url(addr, "/track"),
            TRACK_ID,
            keys,
            start,
            end,
        )
        .await
    }

    async fn collect(stream: RangeStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn streams_whole_track() {
        let plain = plaintext(10 * BLOCK_SIZE + 123);
        let addr = serve(XorKeys::encrypt(TRACK_ID, &plain)).await;

        let stream = open(addr, true, 0, None).await.unwrap();
        assert_eq!(stream.size(), Some(plain.len() as u64));
        assert!(stream.is_encrypted());
        assert_eq!(collect(stream).await, plain);
    }

    #[tokio::test]
    async fn seeks_to_unaligned_offsets() {
        let plain = plaintext(10 * BLOCK_SIZE + 123);
        let addr = serve(XorKeys::encrypt(TRACK_ID, &plain)).await;

        for start in [1, 100, 2048, 3 * 2048 + 1, 6 * 2048 - 1, 10 * 2048 + 100] {
            let stream = open(addr, true, start, None).await.unwrap();
            assert_eq!(stream.size(), Some(plain.len() as u64), "start {start}");
            assert_eq!(stream.start(), start);
            #[expect(clippy::cast_possible_truncation)]
            let expected = &plain[start as usize..];
            assert_eq!(collect(stream).await, expected, "start {start}");
        }
    }

    #[tokio::test]
    async fn honours_range_end() {
        let plain = plaintext(8 * BLOCK_SIZE);
        let addr = serve(XorKeys::encrypt(TRACK_ID, &plain)).await;

        let stream = open(addr, true, 5000, Some(9999)).await.unwrap();
        assert_eq!(stream.size(), Some(plain.len() as u64));
        assert_eq!(collect(stream).await, &plain[5000..10_000]);
    }

    #[tokio::test]
    async fn decrypts_block_holding_range_end() {
        let plain = plaintext(8 * BLOCK_SIZE);
        let addr = serve(XorKeys::encrypt(TRACK_ID, &plain)).await;

        for (start, end) in [(0, 100), (10, 2047), (3 * 2048 + 5, 3 * 2048 + 6)] {
            let stream = open(addr, true, start, Some(end)).await.unwrap();
            #[expect(clippy::cast_possible_truncation)]
            let expected = &plain[start as usize..=end as usize];
            assert_eq!(collect(stream).await, expected, "range {start}-{end}");
        }
    }

    #[tokio::test]
    async fn range_end_may_exceed_track() {
        let plain = plaintext(3 * BLOCK_SIZE);
        let addr = serve(XorKeys::encrypt(TRACK_ID, &plain)).await;

        for start in [0, 2000] {
            let stream = open(addr, true, start, Some(u64::MAX)).await.unwrap();
            assert_eq!(stream.size(), Some(plain.len() as u64));
            #[expect(clippy::cast_possible_truncation)]
            let expected = &plain[start as usize..];
            assert_eq!(collect(stream).await, expected, "start {start}");
        }

        let addr = serve(plain.clone()).await;
        let stream = open(addr, false, 0, Some(u64::MAX)).await.unwrap();
        assert_eq!(collect(stream).await, plain);
    }

    #[tokio::test]
    async fn passes_unencrypted_content_through() {
        let plain = plaintext(3 * BLOCK_SIZE);
        let addr = serve(plain.clone()).await;

        let stream = open(addr, false, 4000, None).await.unwrap();
        assert!(!stream.is_encrypted());
        assert_eq!(stream.size(), Some(plain.len() as u64));
        assert_eq!(collect(stream).await, &plain[4000..]);
    }

    #[tokio::test]
    async fn missing_track_is_not_found() {
        let addr = serve(Vec::new()).await;
        let err = RangeStream::open_url(
            &reqwest::Client::new(),
            url(addr, "/missing"),
            TRACK_ID,
            Some(Arc::new(XorKeys)),
            0,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rejects_inverted_range() {
        let addr = serve(plaintext(BLOCK_SIZE)).await;
        let err = open(addr, true, 100, Some(50)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::OutOfRange);
    }

    #[tokio::test]
    async fn key_failure_prevents_open() {
        let addr = serve(plaintext(BLOCK_SIZE)).await;
        let err = RangeStream::open_url(
            &reqwest::Client::new(),
            url(addr, "/track"),
            "broken",
            Some(Arc::new(XorKeys)),
            0,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
    }

    #[test]
    fn parses_content_range_total() {
        assert_eq!(total_size("bytes 0-1023/4096"), Some(4096));
        assert_eq!(total_size("bytes 4096-8191/8192"), Some(8192));
        assert_eq!(total_size("bytes 0-1023/*"), None);
        assert_eq!(total_size("items 0-1/2"), None);
    }
}
