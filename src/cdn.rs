//! CDN URL derivation for encrypted track streams.
//!
//! Stream URLs are not handed out by the catalog; they are derived from the
//! track identifiers:
//!
//! 1. Join origin hash, quality, track ID and media version with `0xA4`
//! 2. Prepend the hex MD5 digest of that payload and append `0xA4`
//! 3. Pad with `.` to the AES block size
//! 4. Encrypt with AES-128-ECB under a fixed protocol key
//! 5. Hex-encode into the path of the origin's proxy host
//!
//! The AES key is part of the URL scheme shared by all clients. It is not a
//! credential and does not protect any content.

use std::fmt::Write;

use aes::{
    cipher::{block_padding::NoPadding, BlockEncryptMut, KeyInit},
    Aes128,
};
use md5::{Digest, Md5};
use url::Url;

use crate::{
    error::{Error, Result},
    track::Quality,
};

/// Separator byte between URL payload fields.
const SEPARATOR: u8 = 0xA4;

/// AES key of the URL scheme.
const URL_KEY: &[u8; 16] = b"jo6aey6haid2Teih";

/// AES block size in bytes.
const AES_BLOCK_SIZE: usize = 16;

/// Derives the CDN URL for a track in the given quality.
///
/// The result is deterministic: the same inputs always yield the same URL.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if any identifier is empty, or if the
/// origin hash does not start with an ASCII alphanumeric character.
pub fn stream_url(
    track_id: &str,
    origin_hash: &str,
    media_version: &str,
    quality: Quality,
) -> Result<Url> {
    let origin = origin_hash
        .chars()
        .next()
        .filter(char::is_ascii_alphanumeric)
        .ok_or_else(|| {
            Error::invalid_argument(format!(
                "origin hash \"{origin_hash}\" of track {track_id} is malformed"
            ))
        })?;
    if track_id.is_empty() {
        return Err(Error::invalid_argument("track id is empty"));
    }
    if media_version.is_empty() {
        return Err(Error::invalid_argument(format!(
            "media version of track {track_id} is empty"
        )));
    }

    let token = url_token(track_id, origin_hash, media_version, quality)?;
    let url = format!("https://e-cdns-proxy-{origin}.dzcdn.net/mobile/1/{token}");
    url.parse::<Url>().map_err(Into::into)
}

/// Builds the encrypted path token.
fn url_token(
    track_id: &str,
    origin_hash: &str,
    media_version: &str,
    quality: Quality,
) -> Result<String> {
    let quality = quality.to_string();

    let mut payload = Vec::with_capacity(
        origin_hash.len() + quality.len() + track_id.len() + media_version.len() + 3,
    );
    for (i, field) in [origin_hash, quality.as_str(), track_id, media_version]
        .into_iter()
        .enumerate()
    {
        if i > 0 {
            payload.push(SEPARATOR);
        }
        payload.extend_from_slice(field.as_bytes());
    }

    let digest = format!("{:x}", Md5::digest(&payload));

    let mut signed = Vec::with_capacity(digest.len() + payload.len() + 2 + AES_BLOCK_SIZE);
    signed.extend_from_slice(digest.as_bytes());
    signed.push(SEPARATOR);
    signed.extend_from_slice(&payload);
    signed.push(SEPARATOR);

    let padded_len = signed.len().next_multiple_of(AES_BLOCK_SIZE);
    signed.resize(padded_len, b'.');

    // The buffer is block-aligned, so no padding is added by the cipher.
    let cipher = ecb::Encryptor::<Aes128>::new_from_slice(URL_KEY)
        .map_err(|e| Error::internal(e.to_string()))?;
    let encrypted = cipher
        .encrypt_padded_mut::<NoPadding>(&mut signed, padded_len)
        .map_err(|e| Error::internal(e.to_string()))?;

    let mut token = String::with_capacity(encrypted.len() * 2);
    for byte in encrypted {
        write!(token, "{byte:02x}")?;
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn matches_reference_vector() {
        let url = stream_url("12345", HASH, "1", Quality::Standard).unwrap();
        assert_eq!(
            url.as_str(),
            "https://e-cdns-proxy-0.dzcdn.net/mobile/1/\
             5c3898617d639a875156fdb1269b74bb39fd8a179477a97ee9a16ce8320a9f33\
             fc55ebdaf19415c9fb377bbdc870fb8335805f758945ebcef0ad5316ab652a66\
             f512448e00bc4bb635c70f0b88fda106"
        );
    }

    #[test]
    fn matches_reference_vectors_for_other_qualities() {
        let url = stream_url(
            "3135556",
            "b5b5c3c2a0e1b6f2e2b3d8a5c9d7f1e4",
            "4",
            Quality::Lossless,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://e-cdns-proxy-b.dzcdn.net/mobile/1/\
             20a9f6cd3653555400147ab194657b968f353970ab9ae1bc498d3f7bf5d7c1ae\
             25a34f7a3213398b74e9af6cf2aa0210a0ac2855a02d76141dc4d9216e45d53f\
             fe2e3e0b82912addf3f8ed95116b9494"
        );

        let url = stream_url(
            "-1234",
            "fedcba9876543210fedcba9876543210",
            "1",
            Quality::Low,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://e-cdns-proxy-f.dzcdn.net/mobile/1/\
             ab8d56d79efbc7a8f0909111260408803e2608a10a7acde0d927eef5c484637a\
             03564ca28c509bbde5807d8b0653dc1190e7c3bfdf925828c38cc9f1d9641a9f\
             83d4e4559071c244f78822ad26e8182e"
        );
    }

    #[test]
    fn is_deterministic() {
        let first = stream_url("12345", HASH, "1", Quality::Lossless).unwrap();
        let second = stream_url("12345", HASH, "1", Quality::Lossless).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn quality_changes_the_token() {
        let standard = stream_url("12345", HASH, "1", Quality::Standard).unwrap();
        let low = stream_url("12345", HASH, "1", Quality::Low).unwrap();
        assert_ne!(standard, low);
        assert_eq!(standard.host_str(), low.host_str());
    }

    #[test]
    fn token_is_block_aligned_hex() {
        let url = stream_url("987654321", HASH, "12", Quality::Standard).unwrap();
        let token = url.path().trim_start_matches("/mobile/1/");
        assert_eq!(token.len() % (2 * AES_BLOCK_SIZE), 0);
        assert!(token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(stream_url("", HASH, "1", Quality::Standard).is_err());
        assert!(stream_url("12345", "", "1", Quality::Standard).is_err());
        assert!(stream_url("12345", HASH, "", Quality::Standard).is_err());
        assert!(stream_url("12345", "/bad", "1", Quality::Standard).is_err());
    }
}
