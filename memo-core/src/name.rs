//! `Name`: the tagged union of everything a store can resolve to a CID —
//! a bare `Cid`, a mutable `Head`, or a memoized function `Call`.

use crate::cid::Cid;
use crate::uri::Uri;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    pub name: String,
    pub args: Vec<Cid>,
}

impl Call {
    pub fn new(name: impl Into<String>, args: Vec<Cid>) -> Call {
        Call {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    Cid(Cid),
    Head(String),
    Call(Call),
}

impl Name {
    pub fn head(name: impl Into<String>) -> Name {
        Name::Head(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Cid>) -> Name {
        Name::Call(Call::new(name, args))
    }

    /// `/cid/<multibase>`, `/head/<non-empty path>`, or
    /// `/call/<non-empty func>/<comma-separated CIDs>`.
    pub fn parse(s: &str) -> Option<Name> {
        let uri = Uri::parse(s)?;
        if !uri.scheme.is_empty()
            || !uri.host.is_empty()
            || uri.port != 0
            || uri.path_segments.is_empty()
            || uri.rootless
            || !uri.query_params.is_empty()
            || !uri.fragment.is_empty()
        {
            return None;
        }
        match uri.path_segments[0].as_str() {
            "head" if uri.path_segments.len() >= 2 => {
                let name = uri.path_string(1);
                if name.is_empty() {
                    None
                } else {
                    Some(Name::Head(name))
                }
            }
            "cid" if uri.path_segments.len() == 2 => {
                Cid::parse(&uri.path_segments[1]).ok().map(Name::Cid)
            }
            "call" if uri.path_segments.len() == 3 => {
                let func_name = &uri.path_segments[1];
                if func_name.is_empty() {
                    return None;
                }
                let mut args = Vec::new();
                for arg_str in uri.path_segments[2].split(',') {
                    args.push(Cid::parse(arg_str).ok()?);
                }
                Some(Name::Call(Call::new(func_name.clone(), args)))
            }
            _ => None,
        }
    }

    pub fn to_uri(&self) -> Uri {
        let mut uri = Uri::default();
        match self {
            Name::Cid(cid) => {
                uri.path_segments = vec![
                    "cid".to_string(),
                    cid.as_string(crate::multibase::Base::Base64Url),
                ];
            }
            Name::Head(name) => {
                uri.path_segments = vec!["head".to_string(), name.clone()];
                uri.escape_slashes_in_segments = false;
            }
            Name::Call(call) => {
                let args = call
                    .args
                    .iter()
                    .map(|cid| cid.as_string(crate::multibase::Base::Base64Url))
                    .collect::<Vec<_>>()
                    .join(",");
                uri.path_segments = vec!["call".to_string(), call.name.clone(), args];
            }
        }
        uri
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri().encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::{ContentCodec, HashCodec};

    #[test]
    fn round_trips_cid_name() {
        let cid = Cid::calculate(ContentCodec::Raw, b"x", HashCodec::Blake2b256);
        let name = Name::Cid(cid);
        let text = name.to_string();
        assert_eq!(Name::parse(&text), Some(name));
    }

    #[test]
    fn round_trips_head_with_slashes() {
        let name = Name::head("a/b/c");
        let text = name.to_string();
        assert_eq!(Name::parse(&text), Some(name));
    }

    #[test]
    fn round_trips_call_with_args() {
        let cid1 = Cid::calculate(ContentCodec::Raw, b"1", HashCodec::Identity);
        let cid2 = Cid::calculate(ContentCodec::Raw, b"2", HashCodec::Identity);
        let name = Name::call("square", vec![cid1, cid2]);
        let text = name.to_string();
        assert_eq!(Name::parse(&text), Some(name));
    }

    #[test]
    fn rejects_empty_head_name() {
        assert_eq!(Name::parse("/head/"), None);
    }

    #[test]
    fn rejects_call_with_empty_func_name() {
        assert_eq!(Name::parse("/call//abc"), None);
    }

    #[test]
    fn rejects_non_name_uris() {
        assert_eq!(Name::parse("http://host/cid/xyz"), None);
        assert_eq!(Name::parse("/unknown/thing"), None);
    }
}
