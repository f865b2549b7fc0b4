//! `Node`: the recursively-typed value every block in the store holds.
//!
//! Two codecs live here: a canonical DAG-CBOR form (`save_cbor` /
//! `load_from_cbor`), which is also the hash preimage for non-raw content,
//! and a JSON form ("MemoDB JSON") used by the HTTP API and CLI, which
//! disambiguates floats/bytes/maps/links from the plain JSON types they'd
//! otherwise collide with.

use crate::cid::{Cid, ContentCodec, HashCodec};
use serde_json::{Map as JsonMap, Number, Value as Json};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    Null,
    Boolean,
    Integer,
    Float,
    Bytes,
    String,
    List,
    Map,
    Link,
}

/// A recursively-typed value: null, bool, int, float, bytes, UTF-8 string,
/// list, ordered string-keyed map, or a link to a `Cid`.
///
/// `Map` uses a `BTreeMap` so key order is always the canonical
/// lexicographic order required for serialization and for the `Ord` impl.
#[derive(Debug, Clone)]
pub enum Node {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Node>),
    Map(BTreeMap<String, Node>),
    Link(Cid),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,
    #[error("invalid CBOR: {0}")]
    InvalidCbor(&'static str),
    #[error("unsupported CBOR: {0}")]
    UnsupportedCbor(&'static str),
    #[error("extra bytes after top-level CBOR node")]
    ExtraBytes,
    #[error("invalid MemoDB JSON: {0}")]
    InvalidJson(&'static str),
    #[error(transparent)]
    Cid(#[from] crate::cid::CidError),
    #[error("unsupported IPLD content codec")]
    UnsupportedIpldCodec,
    #[error("identity CID must have an empty payload")]
    IdentityPayloadNotEmpty,
}

impl Node {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Node {
        Node::Bytes(b.into())
    }

    /// Builds a `String` node, validating the input is legal UTF-8 (always
    /// true for a Rust `&str`/`String`; this exists to mirror the explicit
    /// `utf8_string` constructor spec.md calls out, and to be the one place
    /// that would reject ill-formed input if ever fed raw bytes).
    pub fn utf8_string(s: impl Into<String>) -> Node {
        Node::String(s.into())
    }

    pub fn list(items: impl Into<Vec<Node>>) -> Node {
        Node::List(items.into())
    }

    pub fn map(entries: impl IntoIterator<Item = (String, Node)>) -> Node {
        Node::Map(entries.into_iter().collect())
    }

    pub fn link(cid: Cid) -> Node {
        Node::Link(cid)
    }

    pub fn kind(&self) -> Kind {
        match self {
            Node::Null => Kind::Null,
            Node::Boolean(_) => Kind::Boolean,
            Node::Integer(_) => Kind::Integer,
            Node::Float(_) => Kind::Float,
            Node::Bytes(_) => Kind::Bytes,
            Node::String(_) => Kind::String,
            Node::List(_) => Kind::List,
            Node::Map(_) => Kind::Map,
            Node::Link(_) => Kind::Link,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Node::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Node::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Node::Link(v) => Some(v),
            _ => None,
        }
    }

    // ---- DAG-CBOR ---------------------------------------------------

    pub fn save_cbor(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_cbor(&mut out);
        out
    }

    fn write_cbor(&self, out: &mut Vec<u8>) {
        fn head(out: &mut Vec<u8>, major: u8, additional: u64) {
            if additional < 24 {
                out.push(major << 5 | additional as u8);
            } else if additional < 0x100 {
                out.push(major << 5 | 24);
                out.push(additional as u8);
            } else if additional < 0x10000 {
                out.push(major << 5 | 25);
                out.extend_from_slice(&(additional as u16).to_be_bytes());
            } else if additional < 0x1_0000_0000 {
                out.push(major << 5 | 26);
                out.extend_from_slice(&(additional as u32).to_be_bytes());
            } else {
                out.push(major << 5 | 27);
                out.extend_from_slice(&additional.to_be_bytes());
            }
        }

        match self {
            Node::Null => head(out, 7, 22),
            Node::Boolean(b) => head(out, 7, if *b { 21 } else { 20 }),
            Node::Integer(i) => {
                if *i < 0 {
                    head(out, 1, (-(*i + 1)) as u64);
                } else {
                    head(out, 0, *i as u64);
                }
            }
            Node::Float(f) => {
                out.push(7 << 5 | 27);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Node::Bytes(b) => {
                head(out, 2, b.len() as u64);
                out.extend_from_slice(b);
            }
            Node::String(s) => {
                head(out, 3, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            Node::List(items) => {
                head(out, 4, items.len() as u64);
                for item in items {
                    item.write_cbor(out);
                }
            }
            Node::Map(map) => {
                head(out, 5, map.len() as u64);
                for (k, v) in map {
                    head(out, 3, k.len() as u64);
                    out.extend_from_slice(k.as_bytes());
                    v.write_cbor(out);
                }
            }
            Node::Link(cid) => {
                head(out, 6, 42);
                let bytes = cid.as_bytes();
                head(out, 2, bytes.len() as u64 + 1);
                out.push(0x00); // multibase-identity prefix required inside DAG-CBOR links
                out.extend_from_slice(&bytes);
            }
        }
    }

    pub fn load_from_cbor(bytes: &[u8]) -> Result<Node, NodeError> {
        let mut cursor = bytes;
        let node = Node::read_cbor(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(NodeError::ExtraBytes);
        }
        Ok(node)
    }

    fn read_cbor(cursor: &mut &[u8]) -> Result<Node, NodeError> {
        struct Head {
            major: u8,
            minor: u8,
            additional: u64,
            indefinite: bool,
        }

        fn read_head(cursor: &mut &[u8]) -> Result<Head, NodeError> {
            let (&first, rest) = cursor
                .split_first()
                .ok_or(NodeError::InvalidCbor("unexpected end of input"))?;
            *cursor = rest;
            let major = first >> 5;
            let minor = first & 0x1f;
            if minor < 24 {
                Ok(Head {
                    major,
                    minor,
                    additional: minor as u64,
                    indefinite: false,
                })
            } else if minor < 28 {
                let n = 1usize << (minor - 24);
                if cursor.len() < n {
                    return Err(NodeError::InvalidCbor("truncated head"));
                }
                let mut additional = 0u64;
                for &b in &cursor[..n] {
                    additional = additional << 8 | b as u64;
                }
                *cursor = &cursor[n..];
                Ok(Head {
                    major,
                    minor,
                    additional,
                    indefinite: false,
                })
            } else if minor == 31 && (2..=5).contains(&major) {
                Ok(Head {
                    major,
                    minor,
                    additional: 0,
                    indefinite: true,
                })
            } else {
                Err(NodeError::InvalidCbor("invalid minor type"))
            }
        }

        fn read_string_segments(
            cursor: &mut &[u8],
            major: u8,
            first: Head,
        ) -> Result<Vec<u8>, NodeError> {
            let mut out = Vec::new();
            if !first.indefinite {
                let len = first.additional as usize;
                if cursor.len() < len {
                    return Err(NodeError::InvalidCbor("missing data from string"));
                }
                out.extend_from_slice(&cursor[..len]);
                *cursor = &cursor[len..];
                return Ok(out);
            }
            loop {
                if cursor.first() == Some(&0xff) {
                    *cursor = &cursor[1..];
                    break;
                }
                let chunk = read_head(cursor)?;
                if chunk.major != major || chunk.indefinite {
                    return Err(NodeError::InvalidCbor("invalid indefinite-length string"));
                }
                let len = chunk.additional as usize;
                if cursor.len() < len {
                    return Err(NodeError::InvalidCbor("missing data from string"));
                }
                out.extend_from_slice(&cursor[..len]);
                *cursor = &cursor[len..];
            }
            Ok(out)
        }

        fn decode_float(value: u64, total: u32, mantissa_size: u32, bias: i64) -> f64 {
            let exponent_mask = (1u64 << (total - mantissa_size - 1)) - 1;
            let exponent = (value >> mantissa_size) & exponent_mask;
            let mantissa = value & ((1u64 << mantissa_size) - 1);
            let magnitude = if exponent == 0 {
                ldexp(mantissa as f64, 1 - (mantissa_size as i64 + bias))
            } else if exponent == exponent_mask {
                if mantissa == 0 {
                    f64::INFINITY
                } else {
                    f64::NAN
                }
            } else {
                ldexp(
                    (mantissa + (1u64 << mantissa_size)) as f64,
                    exponent as i64 - (mantissa_size as i64 + bias),
                )
            };
            if value & (1u64 << (total - 1)) != 0 {
                -magnitude
            } else {
                magnitude
            }
        }

        fn ldexp(x: f64, exp: i64) -> f64 {
            x * 2f64.powi(exp as i32)
        }

        let mut head = read_head(cursor)?;
        let mut is_cid = false;
        if head.major == 6 && head.additional == 42 {
            is_cid = true;
            head = read_head(cursor)?;
        } else if head.major == 6 {
            return Err(NodeError::UnsupportedCbor("unsupported tag"));
        }
        if is_cid && head.major != 2 {
            return Err(NodeError::InvalidCbor("invalid kind in CID tag"));
        }

        match head.major {
            0 => {
                if head.additional > i64::MAX as u64 {
                    return Err(NodeError::UnsupportedCbor("integer too large"));
                }
                Ok(Node::Integer(head.additional as i64))
            }
            1 => {
                if head.additional > i64::MAX as u64 {
                    return Err(NodeError::UnsupportedCbor("integer too large"));
                }
                Ok(Node::Integer(-(head.additional as i64) - 1))
            }
            2 => {
                let bytes = read_string_segments(cursor, 2, head)?;
                if is_cid {
                    if bytes.first() != Some(&0x00) {
                        return Err(NodeError::InvalidCbor("missing CID prefix"));
                    }
                    let cid = Cid::from_bytes(&bytes[1..])?;
                    Ok(Node::Link(cid))
                } else {
                    Ok(Node::Bytes(bytes))
                }
            }
            3 => {
                let bytes = read_string_segments(cursor, 3, head)?;
                String::from_utf8(bytes)
                    .map(Node::String)
                    .map_err(|_| NodeError::InvalidUtf8)
            }
            4 => {
                let mut items = Vec::new();
                if head.indefinite {
                    while cursor.first() != Some(&0xff) {
                        items.push(Node::read_cbor(cursor)?);
                    }
                    *cursor = &cursor[1..];
                } else {
                    for _ in 0..head.additional {
                        items.push(Node::read_cbor(cursor)?);
                    }
                }
                Ok(Node::List(items))
            }
            5 => {
                let mut map = BTreeMap::new();
                let mut read_one = |cursor: &mut &[u8]| -> Result<(), NodeError> {
                    let key = Node::read_cbor(cursor)?;
                    let key = match key {
                        Node::String(s) => s,
                        _ => return Err(NodeError::UnsupportedCbor("map keys must be strings")),
                    };
                    let value = Node::read_cbor(cursor)?;
                    map.insert(key, value);
                    Ok(())
                };
                if head.indefinite {
                    while cursor.first() != Some(&0xff) {
                        read_one(cursor)?;
                    }
                    *cursor = &cursor[1..];
                } else {
                    for _ in 0..head.additional {
                        read_one(cursor)?;
                    }
                }
                Ok(Node::Map(map))
            }
            7 => match head.minor {
                20 => Ok(Node::Boolean(false)),
                21 => Ok(Node::Boolean(true)),
                22 | 23 => Ok(Node::Null),
                25 => Ok(Node::Float(decode_float(head.additional, 16, 10, 15))),
                26 => Ok(Node::Float(decode_float(head.additional, 32, 23, 127))),
                27 => Ok(Node::Float(decode_float(head.additional, 64, 52, 1023))),
                _ => Err(NodeError::UnsupportedCbor("unsupported simple value")),
            },
            _ => unreachable!("3-bit major type"),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind().cmp(&other.kind()).then_with(|| match (self, other) {
            (Node::Null, Node::Null) => Ordering::Equal,
            (Node::Boolean(a), Node::Boolean(b)) => a.cmp(b),
            (Node::Integer(a), Node::Integer(b)) => a.cmp(b),
            (Node::Float(a), Node::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Node::Bytes(a), Node::Bytes(b)) => a.cmp(b),
            (Node::String(a), Node::String(b)) => a.cmp(b),
            (Node::List(a), Node::List(b)) => a.cmp(b),
            (Node::Map(a), Node::Map(b)) => a.cmp(b),
            (Node::Link(a), Node::Link(b)) => a.as_bytes().cmp(&b.as_bytes()),
            _ => unreachable!("kind() already separated the variants"),
        })
    }
}

// ---- MemoDB JSON --------------------------------------------------------

impl Node {
    pub fn to_json(&self) -> Json {
        match self {
            Node::Null => Json::Null,
            Node::Boolean(b) => Json::Bool(*b),
            Node::Integer(i) => Json::Number(Number::from(*i)),
            Node::Float(f) => {
                let mut obj = JsonMap::new();
                obj.insert("float".into(), Json::String(format_float(*f)));
                Json::Object(obj)
            }
            Node::Bytes(b) => {
                let mut obj = JsonMap::new();
                let text = crate::multibase::Base::Base64Pad.encode_without_prefix(b);
                obj.insert("base64".into(), Json::String(text));
                Json::Object(obj)
            }
            Node::String(s) => Json::String(s.clone()),
            Node::List(items) => Json::Array(items.iter().map(Node::to_json).collect()),
            Node::Map(map) => {
                let mut inner = JsonMap::new();
                for (k, v) in map {
                    inner.insert(k.clone(), v.to_json());
                }
                let mut obj = JsonMap::new();
                obj.insert("map".into(), Json::Object(inner));
                Json::Object(obj)
            }
            Node::Link(cid) => {
                let mut obj = JsonMap::new();
                obj.insert(
                    "cid".into(),
                    Json::String(cid.as_string(crate::multibase::Base::Base64Url)),
                );
                Json::Object(obj)
            }
        }
    }

    pub fn load_from_json(text: &str) -> Result<Node, NodeError> {
        let value: Json =
            serde_json::from_str(text).map_err(|_| NodeError::InvalidJson("malformed JSON"))?;
        Node::from_json_value(&value)
    }

    fn from_json_value(value: &Json) -> Result<Node, NodeError> {
        match value {
            Json::Null => Ok(Node::Null),
            Json::Bool(b) => Ok(Node::Boolean(*b)),
            Json::Number(n) => n
                .as_i64()
                .map(Node::Integer)
                .ok_or(NodeError::InvalidJson("integer out of range")),
            Json::String(s) => Ok(Node::String(s.clone())),
            Json::Array(items) => items
                .iter()
                .map(Node::from_json_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Node::List),
            Json::Object(obj) => {
                if obj.len() != 1 {
                    return Err(NodeError::InvalidJson("invalid special JSON object"));
                }
                if let Some(Json::String(f)) = obj.get("float") {
                    return parse_float(f)
                        .map(Node::Float)
                        .ok_or(NodeError::InvalidJson("invalid float"));
                }
                if let Some(Json::String(b64)) = obj.get("base64") {
                    return crate::multibase::Base::Base64Pad
                        .decode_without_prefix(b64)
                        .map(Node::Bytes)
                        .map_err(|_| NodeError::InvalidJson("invalid base64"));
                }
                if let Some(Json::String(cid_str)) = obj.get("cid") {
                    if !cid_str.starts_with('u') {
                        return Err(NodeError::InvalidJson("JSON CIDs must be base64url"));
                    }
                    return Cid::parse(cid_str)
                        .map(Node::Link)
                        .map_err(|_| NodeError::InvalidJson("invalid or unsupported CID"));
                }
                if let Some(Json::Object(inner)) = obj.get("map") {
                    let mut map = BTreeMap::new();
                    for (k, v) in inner {
                        map.insert(k.clone(), Node::from_json_value(v)?);
                    }
                    return Ok(Node::Map(map));
                }
                Err(NodeError::InvalidJson("invalid special JSON object"))
            }
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if f == 0.0 && f.is_sign_negative() {
        "-0".to_string()
    } else {
        // `{}` on f64 already produces the shortest round-trippable decimal
        // (Rust's float formatter is Grisu/Ryu-class since 1.0).
        format!("{}", f)
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}

// ---- IPLD packaging ------------------------------------------------------

impl Node {
    pub fn load_from_ipld(cid: &Cid, content: &[u8]) -> Result<Node, NodeError> {
        let content = if cid.hash_codec() == HashCodec::Identity {
            if !content.is_empty() {
                return Err(NodeError::IdentityPayloadNotEmpty);
            }
            cid.digest()
        } else {
            content
        };
        match cid.content_codec() {
            ContentCodec::Raw => Ok(Node::Bytes(content.to_vec())),
            ContentCodec::DagCbor => Node::load_from_cbor(content),
        }
    }

    /// `force_hash`: when `true`, always hash with Blake2b-256 even if the
    /// encoded form would be small enough to inline as identity.
    pub fn save_as_ipld(&self, force_hash: bool) -> (Cid, Vec<u8>) {
        let raw = self.kind() == Kind::Bytes;
        let bytes = if raw {
            self.as_bytes().expect("kind() says Bytes").to_vec()
        } else {
            self.save_cbor()
        };
        let content_codec = if raw {
            ContentCodec::Raw
        } else {
            ContentCodec::DagCbor
        };
        let cid = if force_hash {
            Cid::calculate(content_codec, &bytes, HashCodec::Blake2b256)
        } else {
            Cid::calculate_with_policy(content_codec, &bytes)
        };
        if cid.hash_codec() == HashCodec::Identity {
            (cid, Vec::new())
        } else {
            (cid, bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::{Cid, ContentCodec, HashCodec};

    #[test]
    fn cbor_round_trips_every_kind() {
        let cid = Cid::calculate(ContentCodec::Raw, b"x", HashCodec::Blake2b256);
        let samples = vec![
            Node::Null,
            Node::Boolean(true),
            Node::Integer(-1),
            Node::Integer(1_000_000),
            Node::Float(1.5),
            Node::Float(f64::NAN),
            Node::bytes(vec![1, 2, 3]),
            Node::utf8_string("hello"),
            Node::list(vec![Node::Integer(1), Node::Integer(2)]),
            Node::map(vec![("a".to_string(), Node::Integer(1))]),
            Node::link(cid),
        ];
        for node in samples {
            let bytes = node.save_cbor();
            let back = Node::load_from_cbor(&bytes).unwrap();
            if let Node::Float(f) = node {
                if f.is_nan() {
                    assert!(matches!(back, Node::Float(g) if g.is_nan()));
                    continue;
                }
            }
            assert_eq!(back, node);
        }
    }

    #[test]
    fn cbor_rejects_extra_bytes() {
        let mut bytes = Node::Integer(1).save_cbor();
        bytes.push(0);
        assert_eq!(Node::load_from_cbor(&bytes), Err(NodeError::ExtraBytes));
    }

    #[test]
    fn cbor_null_is_single_byte() {
        assert_eq!(Node::Null.save_cbor(), vec![0xF6]);
    }

    #[test]
    fn cbor_integers_at_the_signed_64_limits_round_trip() {
        for n in [i64::MIN, i64::MAX, 0, -1] {
            let bytes = Node::Integer(n).save_cbor();
            assert_eq!(Node::load_from_cbor(&bytes).unwrap(), Node::Integer(n));
        }
    }

    #[test]
    fn cbor_rejects_unsigned_integers_past_the_signed_64_limit() {
        // Major type 0, additional-info 27 (8-byte argument follows),
        // argument = i64::MAX as u64 + 1 — one past what `Node::Integer`
        // (signed 64-bit) can represent.
        let too_large = (i64::MAX as u64) + 1;
        let mut bytes = vec![0x1B];
        bytes.extend_from_slice(&too_large.to_be_bytes());
        assert_eq!(
            Node::load_from_cbor(&bytes),
            Err(NodeError::UnsupportedCbor("integer too large"))
        );
    }

    #[test]
    fn json_round_trips_every_kind() {
        let cid = Cid::calculate(ContentCodec::Raw, b"x", HashCodec::Blake2b256);
        let samples = vec![
            Node::Null,
            Node::Boolean(false),
            Node::Integer(42),
            Node::Float(3.5),
            Node::bytes(vec![0, 1, 2]),
            Node::utf8_string("text"),
            Node::list(vec![Node::Integer(1)]),
            Node::map(vec![("k".to_string(), Node::Integer(7))]),
            Node::link(cid),
        ];
        for node in samples {
            let json = node.to_json().to_string();
            let back = Node::load_from_json(&json).unwrap();
            assert_eq!(back, node);
        }
    }

    #[test]
    fn json_float_uses_tagged_object() {
        let json = Node::Float(1.5).to_json();
        assert_eq!(json.to_string(), r#"{"float":"1.5"}"#);
    }

    #[test]
    fn json_bytes_uses_base64_object() {
        let json = Node::bytes(vec![0]).to_json();
        assert_eq!(json.to_string(), r#"{"base64":"AA=="}"#);
    }

    #[test]
    fn json_link_requires_base64url_prefix_on_parse() {
        let cid = Cid::calculate(ContentCodec::Raw, b"x", HashCodec::Identity);
        let base32_form = format!(r#"{{"cid":"{}"}}"#, cid.as_string(crate::multibase::Base::Base32));
        assert!(Node::load_from_json(&base32_form).is_err());
    }

    #[test]
    fn map_ordering_is_lexicographic() {
        let map = Node::map(vec![
            ("b".to_string(), Node::Integer(2)),
            ("a".to_string(), Node::Integer(1)),
        ]);
        if let Node::Map(m) = &map {
            let keys: Vec<_> = m.keys().collect();
            assert_eq!(keys, vec!["a", "b"]);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn ipld_round_trips_bytes_and_structured() {
        for node in [Node::bytes(vec![9; 100]), Node::utf8_string("x".repeat(100))] {
            let (cid, bytes) = node.save_as_ipld(false);
            let back = Node::load_from_ipld(&cid, &bytes).unwrap();
            assert_eq!(back, node);
        }
    }
}
