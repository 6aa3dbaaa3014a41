//! Streaming decryption of protected tracks.
//!
//! # Encryption Format
//!
//! Tracks use a striped encryption pattern:
//! * Content is divided into 2 KiB blocks
//! * Every third block, counting from zero, is encrypted
//! * Encrypted blocks use Blowfish in CBC mode with a fixed IV
//! * A trailing partial block is never encrypted
//!
//! # Key Handling
//!
//! The cipher is reached through the [`KeyProvider`] trait, which derives a
//! per-track [`Key`] and decrypts single blocks. [`BlowfishStripe`] is the
//! local implementation. No master secret is included in this code: it must
//! be supplied through the secrets file.
//!
//! # Resuming at an Offset
//!
//! [`BlockDecryptor`] can start at any byte offset of the plaintext. The
//! input must then begin at the start of the block that contains that
//! offset; the decryptor drops the leading bytes after decrypting the first
//! block, so the stripe phase stays correct.
//!
//! ```rust
//! use dzstream::decrypt::{BlockDecryptor, BlowfishStripe};
//!
//! let keys = Arc::new(BlowfishStripe::new(salt));
//! let mut decryptor = BlockDecryptor::new("3135556", 100, keys)?;
//!
//! let mut plain = decryptor.feed(&first_chunk)?.to_vec();
//! plain.extend_from_slice(&decryptor.feed(&second_chunk)?);
//! plain.extend_from_slice(&decryptor.flush());
//! ```

use std::{ops::Deref, str::FromStr, sync::Arc};

use blowfish::{cipher::BlockDecryptMut, cipher::KeyIvInit, Blowfish};
use bytes::{Bytes, BytesMut};
use cbc::cipher::block_padding::NoPadding;
use md5::{Digest, Md5};
use veil::Redact;

use crate::error::{Error, Result};

/// Size of each block in bytes (2 KiB).
pub const BLOCK_SIZE: usize = 2 * 1024;

/// Number of blocks in a stripe. The first block of each stripe is
/// encrypted.
pub const STRIPE_COUNT: u64 = 3;

/// A single block of stream data.
pub type Block = [u8; BLOCK_SIZE];

/// Length of decryption keys in bytes.
pub const KEY_LENGTH: usize = 16;

/// Raw key bytes.
pub type RawKey = [u8; KEY_LENGTH];

/// Validated decryption key.
///
/// Used both for the master secret and for the per-track keys derived from
/// it. Redacted in debug output.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Redact)]
#[redact(all)]
pub struct Key(RawKey);

impl Key {
    #[must_use]
    pub fn new(raw: RawKey) -> Self {
        Self(raw)
    }
}

impl FromStr for Key {
    type Err = Error;

    /// Parses a string into a decryption key.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfRange` if the string isn't exactly 16 bytes.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let len = s.len();
        if len != KEY_LENGTH {
            return Err(Error::out_of_range(format!(
                "key length is {len} but should be {KEY_LENGTH}",
            )));
        }

        let mut key = [0; KEY_LENGTH];
        key.copy_from_slice(s.as_bytes());

        Ok(Self(key))
    }
}

impl Deref for Key {
    type Target = RawKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Source of per-track keys and single-block decryption.
///
/// Both operations are local and synchronous. Implementations must not
/// cache keys across tracks: a key is derived once per opened stream and
/// owned by that stream's [`BlockDecryptor`].
pub trait KeyProvider: Send + Sync {
    /// Derives the key for a track.
    ///
    /// # Errors
    ///
    /// Returns an error if no key can be derived for `track_id`. This is
    /// fatal to the stream being opened.
    fn derive_key(&self, track_id: &str) -> Result<Key>;

    /// Decrypts one full block in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the cipher rejects the key.
    fn decrypt_block(&self, key: &Key, block: &mut Block) -> Result<()>;
}

/// Blowfish CBC decryption with per-track keys.
///
/// Track keys are derived from the MD5 hash of the track ID, folded onto
/// itself and XOR-ed with the master secret.
#[derive(Clone, Debug)]
pub struct BlowfishStripe {
    salt: Key,
}

impl BlowfishStripe {
    /// Fixed IV for CBC decryption.
    const CBC_BF_IV: &[u8; 8] = b"\x00\x01\x02\x03\x04\x05\x06\x07";

    #[must_use]
    pub fn new(salt: Key) -> Self {
        Self { salt }
    }

    /// Calculates the track-specific decryption key.
    #[must_use]
    pub fn key_for_track_id(track_id: &str, salt: &Key) -> Key {
        let track_hash = format!("{:x}", Md5::digest(track_id));
        let track_hash = track_hash.as_bytes();

        let mut key = RawKey::default();
        for i in 0..KEY_LENGTH {
            key[i] = track_hash[i] ^ track_hash[i + KEY_LENGTH] ^ salt[i];
        }
        Key(key)
    }
}

impl KeyProvider for BlowfishStripe {
    fn derive_key(&self, track_id: &str) -> Result<Key> {
        if track_id.is_empty() {
            return Err(Error::invalid_argument(
                "cannot derive a key for an empty track id",
            ));
        }

        Ok(Self::key_for_track_id(track_id, &self.salt))
    }

    fn decrypt_block(&self, key: &Key, block: &mut Block) -> Result<()> {
        // The state of the cipher is reset on each block.
        let cipher = cbc::Decryptor::<Blowfish>::new_from_slices(&**key, Self::CBC_BF_IV)
            .map_err(|e| Error::internal(e.to_string()))?;

        // The block is a multiple of the cipher block size, so no padding is
        // necessary.
        cipher
            .decrypt_padded_mut::<NoPadding>(block)
            .map_err(|e| Error::data_loss(e.to_string()))?;

        Ok(())
    }
}

/// Position within the block grid of one stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockCursor {
    /// Index of the next full block, counted from the start of the track.
    pub block_index: u64,

    /// Bytes still to drop from the start of the next emitted block.
    ///
    /// Always less than [`BLOCK_SIZE`].
    pub leading_drop: usize,

    /// Partial block carried over to the next call. Always shorter than
    /// [`BLOCK_SIZE`].
    pub carry: Vec<u8>,
}

impl BlockCursor {
    /// Positions a cursor at a plaintext byte offset.
    #[must_use]
    pub fn at_offset(offset: u64) -> Self {
        let block_size = BLOCK_SIZE as u64;

        // The remainder is below `BLOCK_SIZE`, so it always fits.
        #[expect(clippy::cast_possible_truncation)]
        let leading_drop = (offset % block_size) as usize;

        Self {
            block_index: offset / block_size,
            leading_drop,
            carry: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Whether the next full block is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.block_index % STRIPE_COUNT == 0
    }
}

/// Push-based decryptor that turns encrypted chunks into plaintext chunks.
///
/// Chunks may be split at arbitrary boundaries; the output does not depend
/// on how the input was chunked. The decryptor owns its key and cursor
/// exclusively, and both are dropped with it.
pub struct BlockDecryptor {
    keys: Arc<dyn KeyProvider>,
    key: Key,
    cursor: BlockCursor,
}

impl BlockDecryptor {
    /// Creates a decryptor for `track_id` that starts emitting plaintext at
    /// byte `offset`.
    ///
    /// The input fed to it must start at the block boundary at or before
    /// `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key for the track cannot be derived.
    pub fn new(track_id: &str, offset: u64, keys: Arc<dyn KeyProvider>) -> Result<Self> {
        let key = keys.derive_key(track_id)?;
        let cursor = BlockCursor::at_offset(offset);

        trace!(
            "decrypting track {track_id} from block {} dropping {} bytes",
            cursor.block_index,
            cursor.leading_drop
        );

        Ok(Self { keys, key, cursor })
    }

    #[must_use]
    pub fn cursor(&self) -> &BlockCursor {
        &self.cursor
    }

    /// Consumes an encrypted chunk and returns the plaintext for every block
    /// completed by it. Any trailing partial block is kept until the next
    /// call or [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Returns an error if a block fails to decrypt.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Bytes> {
        let mut output = BytesMut::with_capacity(self.cursor.carry.len() + chunk.len());
        let mut input = chunk;
        let mut block: Block = [0; BLOCK_SIZE];

        // Complete the carried partial block first.
        if !self.cursor.carry.is_empty() {
            let wanted = BLOCK_SIZE - self.cursor.carry.len();
            let (head, tail) = input.split_at(wanted.min(input.len()));
            self.cursor.carry.extend_from_slice(head);
            input = tail;

            if self.cursor.carry.len() < BLOCK_SIZE {
                return Ok(output.freeze());
            }

            block.copy_from_slice(&self.cursor.carry);
            self.cursor.carry.clear();
            self.process(&mut block, &mut output)?;
        }

        let mut blocks = input.chunks_exact(BLOCK_SIZE);
        for chunk in blocks.by_ref() {
            block.copy_from_slice(chunk);
            self.process(&mut block, &mut output)?;
        }
        self.cursor.carry.extend_from_slice(blocks.remainder());

        Ok(output.freeze())
    }

    /// Returns the carried partial block at the end of the stream, with any
    /// pending leading bytes dropped. The partial block is passed through as
    /// is: it is never decrypted.
    pub fn flush(&mut self) -> Bytes {
        let drop = std::mem::take(&mut self.cursor.leading_drop).min(self.cursor.carry.len());
        let tail = Bytes::copy_from_slice(&self.cursor.carry[drop..]);
        self.cursor.carry.clear();
        tail
    }

    fn process(&mut self, block: &mut Block, output: &mut BytesMut) -> Result<()> {
        if self.cursor.is_encrypted() {
            self.keys.decrypt_block(&self.key, block)?;
        }
        self.cursor.block_index += 1;

        let drop = std::mem::take(&mut self.cursor.leading_drop);
        output.extend_from_slice(&block[drop..]);

        Ok(())
    }
}
