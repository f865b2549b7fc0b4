//! Content identifiers: version + content-codec + multihash (hash-codec +
//! digest). Binary form per spec.md §6.3:
//! `version-varint | content-codec-varint | hash-codec-varint |
//! digest-length-varint | digest`. Varints are unsigned LEB128
//! (`unsigned-varint`, the same crate the wider multiformats-on-Rust
//! ecosystem uses for this).

use crate::multibase::{self, Base};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

/// Content codec: what kind of bytes are hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentCodec {
    /// Raw bytes, no structure.
    Raw,
    /// A `Node` serialized with the DAG-CBOR codec.
    DagCbor,
}

impl ContentCodec {
    fn code(self) -> u64 {
        match self {
            ContentCodec::Raw => 0x55,
            ContentCodec::DagCbor => 0x71,
        }
    }

    fn from_code(code: u64) -> Option<ContentCodec> {
        match code {
            0x55 => Some(ContentCodec::Raw),
            0x71 => Some(ContentCodec::DagCbor),
            _ => None,
        }
    }
}

/// Hash codec: how the digest was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashCodec {
    /// No hashing; the "digest" bytes are the content itself.
    Identity,
    /// 32-byte BLAKE2b digest.
    Blake2b256,
}

impl HashCodec {
    fn code(self) -> u64 {
        match self {
            HashCodec::Identity => 0x00,
            HashCodec::Blake2b256 => 0xb220,
        }
    }

    fn from_code(code: u64) -> Option<HashCodec> {
        match code {
            0x00 => Some(HashCodec::Identity),
            0xb220 => Some(HashCodec::Blake2b256),
            _ => None,
        }
    }
}

/// The maximum digest length for which an identity-hash CID is permitted to
/// inline the content instead of requiring a real hash. A policy choice
/// (see SPEC_FULL.md / Open Questions): kept small so identity CIDs stay
/// cheap to carry around, matching the "small values" language in spec.md.
pub const MAX_INLINE_IDENTITY_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidError {
    #[error("truncated CID")]
    Truncated,
    #[error("unsupported CID version {0}")]
    UnsupportedVersion(u64),
    #[error("unknown content codec {0:#x}")]
    UnknownContentCodec(u64),
    #[error("unknown hash codec {0:#x}")]
    UnknownHashCodec(u64),
    #[error("digest length mismatch: header says {expected}, got {actual}")]
    DigestLengthMismatch { expected: usize, actual: usize },
    #[error("extra trailing bytes after CID")]
    TrailingBytes,
    #[error(transparent)]
    Multibase(#[from] multibase::MultibaseError),
    #[error("legacy base58 CID is malformed")]
    MalformedBase58,
}

/// A content identifier: `{version=1, content_codec, hash_codec, digest}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    content_codec: ContentCodec,
    hash_codec: HashCodec,
    digest: Vec<u8>,
}

impl Cid {
    pub fn content_codec(&self) -> ContentCodec {
        self.content_codec
    }

    pub fn hash_codec(&self) -> HashCodec {
        self.hash_codec
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Compute the digest of `content` and build the CID for it. Identity
    /// hashing stores `content` verbatim as the digest.
    pub fn calculate(content_codec: ContentCodec, content: &[u8], hash_codec: HashCodec) -> Cid {
        let digest = match hash_codec {
            HashCodec::Identity => content.to_vec(),
            HashCodec::Blake2b256 => {
                let mut hasher = Blake2b256::new();
                hasher.update(content);
                hasher.finalize().to_vec()
            }
        };
        Cid {
            content_codec,
            hash_codec,
            digest,
        }
    }

    /// Choose identity hashing if `content` is small enough to inline,
    /// otherwise BLAKE2b-256. This is the `Store::put` / `saveAsIPLD`
    /// sizing policy described in spec.md §4.3/§4.5/§9.
    pub fn calculate_with_policy(content_codec: ContentCodec, content: &[u8]) -> Cid {
        if content.len() <= MAX_INLINE_IDENTITY_LEN {
            Cid::calculate(content_codec, content, HashCodec::Identity)
        } else {
            Cid::calculate(content_codec, content, HashCodec::Blake2b256)
        }
    }

    /// If this CID uses identity hashing, the digest *is* the content; no
    /// store lookup is needed to materialize it.
    pub fn inline_content(&self) -> Option<&[u8]> {
        match self.hash_codec {
            HashCodec::Identity => Some(&self.digest),
            HashCodec::Blake2b256 => None,
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_varint(&mut out, 1); // version
        push_varint(&mut out, self.content_codec.code());
        push_varint(&mut out, self.hash_codec.code());
        push_varint(&mut out, self.digest.len() as u64);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Cid, CidError> {
        let (version, rest) = pop_varint(bytes)?;
        if version != 1 {
            return Err(CidError::UnsupportedVersion(version));
        }
        let (codec_code, rest) = pop_varint(rest)?;
        let content_codec =
            ContentCodec::from_code(codec_code).ok_or(CidError::UnknownContentCodec(codec_code))?;
        let (hash_code, rest) = pop_varint(rest)?;
        let hash_codec = HashCodec::from_code(hash_code).ok_or(CidError::UnknownHashCodec(hash_code))?;
        let (len, rest) = pop_varint(rest)?;
        let len = len as usize;
        if rest.len() < len {
            return Err(CidError::DigestLengthMismatch {
                expected: len,
                actual: rest.len(),
            });
        }
        if rest.len() > len {
            return Err(CidError::TrailingBytes);
        }
        Ok(Cid {
            content_codec,
            hash_codec,
            digest: rest.to_vec(),
        })
    }

    pub fn as_string(&self, base: Base) -> String {
        multibase::encode(base, &self.as_bytes())
    }

    /// Parses either the standard multibase-prefixed form, or the bare
    /// legacy base58btc form (no multibase prefix) some older tools emit.
    pub fn parse(s: &str) -> Result<Cid, CidError> {
        if let Ok((_, bytes)) = multibase::decode(s) {
            return Cid::from_bytes(&bytes);
        }
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| CidError::MalformedBase58)?;
        Cid::from_bytes(&bytes)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string(Base::Base32))
    }
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

fn pop_varint(bytes: &[u8]) -> Result<(u64, &[u8]), CidError> {
    unsigned_varint::decode::u64(bytes).map_err(|_| CidError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_every_base() {
        let cid = Cid::calculate(ContentCodec::Raw, b"hello", HashCodec::Blake2b256);
        for &base in Base::ALL {
            let text = cid.as_string(base);
            assert_eq!(Cid::parse(&text).unwrap(), cid);
        }
    }

    #[test]
    fn identity_hash_inlines_small_cbor_null() {
        // DAG-CBOR encoding of `null` is the single byte 0xF6.
        let cid = Cid::calculate(ContentCodec::DagCbor, &[0xF6], HashCodec::Identity);
        assert_eq!(cid.as_bytes(), vec![0x01, 0x71, 0x00, 0x01, 0xF6]);
    }

    #[test]
    fn blake2b_hash_of_null_matches_known_vector() {
        let cid = Cid::calculate(ContentCodec::Raw, &[0xF6], HashCodec::Blake2b256);
        let bytes = cid.as_bytes();
        assert_eq!(&bytes[..6], &[0x01, 0x55, 0xA0, 0xE4, 0x02, 0x20]);
        assert_eq!(bytes.len(), 6 + 32);
    }

    #[test]
    fn zero_byte_raw_content_round_trips() {
        let cid = Cid::calculate_with_policy(ContentCodec::Raw, &[]);
        assert_eq!(Cid::from_bytes(&cid.as_bytes()).unwrap(), cid);
    }

    #[test]
    fn unknown_codec_fails_to_parse() {
        let bytes = vec![0x01, 0x99, 0x00, 0x01, 0x00];
        assert_eq!(
            Cid::from_bytes(&bytes),
            Err(CidError::UnknownContentCodec(0x99))
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let cid = Cid::calculate(ContentCodec::Raw, b"x", HashCodec::Identity);
        let mut bytes = cid.as_bytes();
        bytes.push(0xAA);
        assert_eq!(Cid::from_bytes(&bytes), Err(CidError::TrailingBytes));
    }

    #[test]
    fn digest_shorter_than_declared_length_rejected() {
        let mut bytes = vec![0x01, 0x55, 0x00, 0x05];
        bytes.extend_from_slice(b"ab");
        assert_eq!(
            Cid::from_bytes(&bytes),
            Err(CidError::DigestLengthMismatch {
                expected: 5,
                actual: 2
            })
        );
    }
}
