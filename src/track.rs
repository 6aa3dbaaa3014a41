//! Stream descriptors and audio quality levels.
//!
//! A [`StreamInfo`] identifies one encrypted resource on the CDN: a track
//! ID, the origin hash and media version that feed URL derivation, and the
//! quality level to fetch. It starts life as an opaque token in a request
//! path and is filled in by the quality fallback resolver.
//!
//! # Token Format
//!
//! ```text
//! 0123456789abcdef0123456789abcdef 0 1 3135556
//! └──────── origin hash ─────────┘ │ │ └ track ID
//!                                  │ └ media version
//!                                  └ `1` if the origin hash carries `.mp3`
//! ```
//!
//! (without the spaces)

use std::{fmt, str::FromStr};

use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};
use url::Url;
use veil::Redact;

use crate::{
    cdn,
    error::{Error, Result},
};

/// Audio quality levels as used in CDN URL derivation.
///
/// The discriminants are the wire values.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize_repr,
    Deserialize_repr,
)]
#[repr(u8)]
pub enum Quality {
    /// 128 kbps MP3
    Low = 1,
    /// 320 kbps MP3
    #[default]
    Standard = 3,
    /// FLAC
    Lossless = 9,
}

impl Quality {
    /// The next rung down the fallback ladder, or `None` at the bottom.
    #[must_use]
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Lossless => Some(Self::Standard),
            Self::Standard => Some(Self::Low),
            Self::Low => None,
        }
    }

    /// MIME type of the decrypted content.
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Lossless => "audio/flac",
            Self::Standard | Self::Low => "audio/mp3",
        }
    }

    /// The wire value of this quality.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Quality {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Low),
            3 => Ok(Self::Standard),
            9 => Ok(Self::Lossless),
            _ => Err(Error::invalid_argument(format!(
                "unknown audio quality {value}"
            ))),
        }
    }
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim().parse::<u8>()?.try_into()
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Everything needed to locate, probe and decrypt one track stream.
///
/// Unencrypted streams carry their `direct_url`; decryption is skipped for
/// them entirely. `size` is only known after a successful probe.
#[derive(Clone, Eq, PartialEq, Serialize, Redact)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub track_id: String,

    #[serde(rename = "md5origin")]
    pub origin_hash: String,

    pub media_version: String,

    pub quality: Quality,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    pub encrypted: bool,

    #[serde(rename = "direct", skip_serializing_if = "Option::is_none")]
    #[redact]
    pub direct_url: Option<Url>,
}

impl StreamInfo {
    /// Length of the hexadecimal origin hash at the start of a token.
    const ORIGIN_HASH_LENGTH: usize = 32;

    /// Suffix of origin hashes of user-uploaded MP3 files.
    const MP3_SUFFIX: &'static str = ".mp3";

    /// Prefix that marks track IDs of user uploads.
    const USER_UPLOAD_PREFIX: char = '-';

    /// Creates an encrypted stream descriptor in the default quality.
    #[must_use]
    pub fn new(
        track_id: impl Into<String>,
        origin_hash: impl Into<String>,
        media_version: impl Into<String>,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            origin_hash: origin_hash.into(),
            media_version: media_version.into(),
            quality: Quality::default(),
            size: None,
            encrypted: true,
            direct_url: None,
        }
    }

    /// Returns the same stream descriptor in another quality.
    #[must_use]
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Whether this track is a user-uploaded file rather than a catalog
    /// track.
    #[must_use]
    pub fn is_user_upload(&self) -> bool {
        self.track_id.starts_with(Self::USER_UPLOAD_PREFIX)
    }

    /// The URL to fetch this stream from: the direct URL for unencrypted
    /// streams, or the derived CDN URL otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the identifiers are malformed.
    pub fn url(&self) -> Result<Url> {
        match (&self.direct_url, self.encrypted) {
            (Some(url), false) => Ok(url.clone()),
            (None, false) => Err(Error::failed_precondition(format!(
                "unencrypted stream for track {} has no direct url",
                self.track_id
            ))),
            (_, true) => cdn::stream_url(
                &self.track_id,
                &self.origin_hash,
                &self.media_version,
                self.quality,
            ),
        }
    }

    /// Encodes the stream token that [`from_str`](Self::from_str) decodes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the origin hash is not 32
    /// hexadecimal characters, optionally followed by `.mp3`, or if the
    /// media version is not a single character.
    pub fn token(&self) -> Result<String> {
        let (hash, flag) = match self.origin_hash.strip_suffix(Self::MP3_SUFFIX) {
            Some(hash) => (hash, '1'),
            None => (self.origin_hash.as_str(), '0'),
        };
        if hash.len() != Self::ORIGIN_HASH_LENGTH
            || !hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::invalid_argument(format!(
                "origin hash \"{}\" cannot be encoded in a stream token",
                self.origin_hash
            )));
        }

        let mut chars = self.media_version.chars();
        match (chars.next(), chars.next()) {
            (Some(version), None) if version.is_ascii() => {
                Ok(format!("{hash}{flag}{version}{}", self.track_id))
            }
            _ => Err(Error::invalid_argument(format!(
                "media version \"{}\" of track {} cannot be encoded in a stream token",
                self.media_version, self.track_id
            ))),
        }
    }
}

impl FromStr for StreamInfo {
    type Err = Error;

    /// Decodes a stream token.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the token is too short, the origin
    /// hash is not hexadecimal, or the suffix flag is not `0` or `1`.
    fn from_str(token: &str) -> Result<Self> {
        let hash_len = Self::ORIGIN_HASH_LENGTH;
        if !token.is_ascii() || token.len() < hash_len + 3 {
            return Err(Error::invalid_argument(format!(
                "stream token \"{token}\" is malformed"
            )));
        }

        let (hash, rest) = token.split_at(hash_len);
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_argument(format!(
                "origin hash \"{hash}\" is not hexadecimal"
            )));
        }

        let (flag, rest) = rest.split_at(1);
        let (media_version, track_id) = rest.split_at(1);

        let origin_hash = match flag {
            "0" => hash.to_owned(),
            "1" => format!("{hash}{}", Self::MP3_SUFFIX),
            _ => {
                return Err(Error::invalid_argument(format!(
                    "stream token \"{token}\" has unknown suffix flag {flag}"
                )))
            }
        };

        Ok(Self::new(track_id, origin_hash, media_version))
    }
}
