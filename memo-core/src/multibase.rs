//! Text <-> bytes codecs, one single-character scheme prefix per base.
//!
//! Every family except proquint is built from a `data_encoding::Encoding`
//! constructed from a `Specification`; that crate already implements the
//! bit-packing, padding, and "permissive trailing bits" behavior the RFC4648
//! families need, so there is no hand-rolled bit-twiddling here for them.
//! Proquint has no available crate and is implemented directly.

use data_encoding::{Encoding, Specification};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultibaseError {
    #[error("empty multibase string")]
    Empty,
    #[error("unknown multibase prefix {0:?}")]
    UnknownPrefix(char),
    #[error("invalid characters for this base")]
    InvalidCharacters,
}

/// One supported multibase family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    Base2,
    Base8,
    Base16,
    Base16Upper,
    Base32,
    Base32Upper,
    Base32Pad,
    Base32PadUpper,
    Base32Hex,
    Base32HexUpper,
    Base32HexPad,
    Base32HexPadUpper,
    Base32Z,
    Base64,
    Base64Pad,
    Base64Url,
    Base64UrlPad,
    Proquint,
}

impl Base {
    pub const ALL: &'static [Base] = &[
        Base::Base2,
        Base::Base8,
        Base::Base16,
        Base::Base16Upper,
        Base::Base32,
        Base::Base32Upper,
        Base::Base32Pad,
        Base::Base32PadUpper,
        Base::Base32Hex,
        Base::Base32HexUpper,
        Base::Base32HexPad,
        Base::Base32HexPadUpper,
        Base::Base32Z,
        Base::Base64,
        Base::Base64Pad,
        Base::Base64Url,
        Base::Base64UrlPad,
        Base::Proquint,
    ];

    pub fn prefix(self) -> char {
        match self {
            Base::Base2 => '0',
            Base::Base8 => '7',
            Base::Base16 => 'f',
            Base::Base16Upper => 'F',
            Base::Base32 => 'b',
            Base::Base32Upper => 'B',
            Base::Base32Pad => 'c',
            Base::Base32PadUpper => 'C',
            Base::Base32Hex => 'v',
            Base::Base32HexUpper => 'V',
            Base::Base32HexPad => 't',
            Base::Base32HexPadUpper => 'T',
            Base::Base32Z => 'h',
            Base::Base64 => 'm',
            Base::Base64Pad => 'M',
            Base::Base64Url => 'u',
            Base::Base64UrlPad => 'U',
            Base::Proquint => 'p',
        }
    }

    pub fn from_prefix(c: char) -> Option<Base> {
        Base::ALL.iter().copied().find(|b| b.prefix() == c)
    }

    /// Encode bytes using this base, including the scheme prefix.
    pub fn encode(self, bytes: &[u8]) -> String {
        let mut out = String::new();
        out.push(self.prefix());
        out.push_str(&self.encode_without_prefix(bytes));
        out
    }

    pub fn encode_without_prefix(self, bytes: &[u8]) -> String {
        match self {
            Base::Proquint => proquint::encode(bytes),
            _ => encoding_for(self).encode(bytes),
        }
    }

    pub fn decode_without_prefix(self, text: &str) -> Result<Vec<u8>, MultibaseError> {
        match self {
            Base::Proquint => proquint::decode(text),
            _ => encoding_for(self)
                .decode(text.as_bytes())
                .map_err(|_| MultibaseError::InvalidCharacters),
        }
    }
}

/// Decode any multibase string, dispatching on its leading scheme character.
pub fn decode(s: &str) -> Result<(Base, Vec<u8>), MultibaseError> {
    let mut chars = s.chars();
    let prefix = chars.next().ok_or(MultibaseError::Empty)?;
    let base = Base::from_prefix(prefix).ok_or(MultibaseError::UnknownPrefix(prefix))?;
    let rest = chars.as_str();
    let bytes = base.decode_without_prefix(rest)?;
    Ok((base, bytes))
}

pub fn encode(base: Base, bytes: &[u8]) -> String {
    base.encode(bytes)
}

fn encoding_for(base: Base) -> &'static Encoding {
    match base {
        Base::Base2 => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("01");
                spec.encoding().expect("base2 spec is valid")
            })
        }
        Base::Base8 => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("01234567");
                spec.check_trailing_bits = false;
                spec.encoding().expect("base8 spec is valid")
            })
        }
        Base::Base16 => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("0123456789abcdef");
                spec.encoding().expect("base16 spec is valid")
            })
        }
        Base::Base16Upper => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("0123456789ABCDEF");
                spec.encoding().expect("base16upper spec is valid")
            })
        }
        Base::Base32 => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32 spec is valid")
            })
        }
        Base::Base32Upper => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32upper spec is valid")
            })
        }
        Base::Base32Pad => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
                spec.padding = Some('=');
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32pad spec is valid")
            })
        }
        Base::Base32PadUpper => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
                spec.padding = Some('=');
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32padupper spec is valid")
            })
        }
        Base::Base32Hex => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("0123456789abcdefghijklmnopqrstuv");
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32hex spec is valid")
            })
        }
        Base::Base32HexUpper => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("0123456789ABCDEFGHIJKLMNOPQRSTUV");
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32hexupper spec is valid")
            })
        }
        Base::Base32HexPad => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("0123456789abcdefghijklmnopqrstuv");
                spec.padding = Some('=');
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32hexpad spec is valid")
            })
        }
        Base::Base32HexPadUpper => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("0123456789ABCDEFGHIJKLMNOPQRSTUV");
                spec.padding = Some('=');
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32hexpadupper spec is valid")
            })
        }
        Base::Base32Z => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str("ybndrfg8ejkmcpqxot1uwisza345h769");
                spec.check_trailing_bits = false;
                spec.encoding().expect("base32z spec is valid")
            })
        }
        Base::Base64 => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str(
                    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
                );
                spec.check_trailing_bits = false;
                spec.encoding().expect("base64 spec is valid")
            })
        }
        Base::Base64Pad => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str(
                    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
                );
                spec.padding = Some('=');
                spec.check_trailing_bits = false;
                spec.encoding().expect("base64pad spec is valid")
            })
        }
        Base::Base64Url => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str(
                    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_",
                );
                spec.check_trailing_bits = false;
                spec.encoding().expect("base64url spec is valid")
            })
        }
        Base::Base64UrlPad => {
            static E: OnceLock<Encoding> = OnceLock::new();
            E.get_or_init(|| {
                let mut spec = Specification::new();
                spec.symbols.push_str(
                    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_",
                );
                spec.padding = Some('=');
                spec.check_trailing_bits = false;
                spec.encoding().expect("base64urlpad spec is valid")
            })
        }
        Base::Proquint => unreachable!("proquint has its own codec"),
    }
}

/// Proquint readable identifiers (consonant-vowel-consonant-vowel-consonant
/// syllables separated by `-`), with a leading `ro` marker, per the scheme
/// referenced in spec.md. No crate implements this, so it's hand-rolled.
mod proquint {
    use super::MultibaseError;

    const CONSONANTS: &[u8; 16] = b"bdfghjklmnprstvz";
    const VOWELS: &[u8; 4] = b"aiou";

    pub fn encode(bytes: &[u8]) -> String {
        let mut out = String::from("ro");
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            let n = ((pair[0] as u16) << 8) | pair[1] as u16;
            out.push('-');
            push_quint(&mut out, n);
        }
        let rem = chunks.remainder();
        if let [b] = *rem {
            out.push('-');
            push_half_quint(&mut out, b);
        }
        out
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, MultibaseError> {
        let s = s
            .strip_prefix("ro")
            .ok_or(MultibaseError::InvalidCharacters)?;
        let mut out = Vec::new();
        if s.is_empty() {
            return Ok(out);
        }
        for syllable in s.strip_prefix('-').unwrap_or(s).split('-') {
            let chars: Vec<char> = syllable.chars().collect();
            match chars.len() {
                5 => out.extend_from_slice(&parse_quint(&chars)?.to_be_bytes()),
                3 => out.push(parse_half_quint(&chars)?),
                _ => return Err(MultibaseError::InvalidCharacters),
            }
        }
        Ok(out)
    }

    fn push_quint(out: &mut String, n: u16) {
        let c1 = (n >> 12) & 0xF;
        let v1 = (n >> 10) & 0x3;
        let c2 = (n >> 6) & 0xF;
        let v2 = (n >> 4) & 0x3;
        let c3 = n & 0xF;
        out.push(CONSONANTS[c1 as usize] as char);
        out.push(VOWELS[v1 as usize] as char);
        out.push(CONSONANTS[c2 as usize] as char);
        out.push(VOWELS[v2 as usize] as char);
        out.push(CONSONANTS[c3 as usize] as char);
    }

    /// A trailing odd byte is encoded as consonant+vowel+vowel (8 bits:
    /// 4+2+2), a policy local to this implementation since proquint has no
    /// native notion of an odd-length tail.
    fn push_half_quint(out: &mut String, b: u8) {
        let c = (b >> 4) & 0xF;
        let v1 = (b >> 2) & 0x3;
        let v2 = b & 0x3;
        out.push(CONSONANTS[c as usize] as char);
        out.push(VOWELS[v1 as usize] as char);
        out.push(VOWELS[v2 as usize] as char);
    }

    fn parse_quint(chars: &[char]) -> Result<u16, MultibaseError> {
        let c1 = consonant(chars[0])?;
        let v1 = vowel(chars[1])?;
        let c2 = consonant(chars[2])?;
        let v2 = vowel(chars[3])?;
        let c3 = consonant(chars[4])?;
        Ok(((c1 as u16) << 12)
            | ((v1 as u16) << 10)
            | ((c2 as u16) << 6)
            | ((v2 as u16) << 4)
            | c3 as u16)
    }

    fn parse_half_quint(chars: &[char]) -> Result<u8, MultibaseError> {
        let c = consonant(chars[0])?;
        let v1 = vowel(chars[1])?;
        let v2 = vowel(chars[2])?;
        Ok((c << 4) | (v1 << 2) | v2)
    }

    fn consonant(c: char) -> Result<u8, MultibaseError> {
        CONSONANTS
            .iter()
            .position(|&b| b as char == c)
            .map(|i| i as u8)
            .ok_or(MultibaseError::InvalidCharacters)
    }

    fn vowel(c: char) -> Result<u8, MultibaseError> {
        VOWELS
            .iter()
            .position(|&b| b as char == c)
            .map(|i| i as u8)
            .ok_or(MultibaseError::InvalidCharacters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_bases() {
        let samples: &[&[u8]] = &[b"", b"\x00", b"hello world", &[0xff; 17], &[0; 5]];
        for &base in Base::ALL {
            for &sample in samples {
                let encoded = encode(base, sample);
                let (decoded_base, decoded) = decode(&encoded).unwrap();
                assert_eq!(decoded_base, base);
                assert_eq!(decoded, sample, "base {:?} sample {:?}", base, sample);
            }
        }
    }

    #[test]
    fn empty_base32_is_prefix_only() {
        assert_eq!(encode(Base::Base32, b""), "b");
    }

    #[test]
    fn base64pad_matches_known_vector() {
        assert_eq!(encode(Base::Base64Pad, &[0x00]), "MAA==");
        let (_, bytes) = decode("MAA==").unwrap();
        assert_eq!(bytes, vec![0x00]);
    }

    #[test]
    fn unknown_prefix_errors() {
        assert_eq!(decode("?abc"), Err(MultibaseError::UnknownPrefix('?')));
    }

    #[test]
    fn empty_string_errors() {
        assert_eq!(decode(""), Err(MultibaseError::Empty));
    }
}
