//! A generic URI, parsed into scheme/host/port/path/query/fragment. Handles
//! `file:`, `http(s):`, and similar schemes; userinfo is rejected outright
//! and empty hosts/fragments are not distinguished from missing ones.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: u32,
    pub rootless: bool,
    pub path_segments: Vec<String>,
    pub query_params: Vec<String>,
    pub fragment: String,
    pub escape_slashes_in_segments: bool,
}

impl Default for Uri {
    fn default() -> Self {
        Uri {
            scheme: String::new(),
            host: String::new(),
            port: 0,
            rootless: false,
            path_segments: Vec::new(),
            query_params: Vec::new(),
            fragment: String::new(),
            escape_slashes_in_segments: true,
        }
    }
}

impl Uri {
    pub fn parse(s: &str) -> Option<Uri> {
        Uri::parse_with_dot_segments(s, false)
    }

    pub fn parse_with_dot_segments(s: &str, allow_dot_segments: bool) -> Option<Uri> {
        let mut uri = Uri::default();
        let mut rest = s;

        if let Some(colon) = rest.find(':') {
            uri.scheme = rest[..colon].to_lowercase();
            rest = &rest[colon + 1..];
        }

        let mut host_ref = "";
        let mut port_ref = "";
        if let Some(after_slashes) = rest.strip_prefix("//") {
            let end = after_slashes
                .find(['/', '?', '#'])
                .unwrap_or(after_slashes.len());
            let authority = &after_slashes[..end];
            rest = &after_slashes[end..];
            if authority.contains('@') {
                return None; // userinfo is not supported
            }
            if let Some(bracket) = authority.strip_prefix('[') {
                let close = bracket.find(']')?;
                host_ref = &authority[..close + 2];
                let after = &authority[close + 2..];
                if !after.is_empty() && !after.starts_with(':') {
                    return None;
                }
                port_ref = after.strip_prefix(':').unwrap_or("");
            } else if let Some(colon) = authority.find(':') {
                host_ref = &authority[..colon];
                port_ref = &authority[colon + 1..];
            } else {
                host_ref = authority;
            }
        }

        let (before_fragment, fragment_ref) = match rest.split_once('#') {
            Some((a, b)) => (a, b),
            None => (rest, ""),
        };
        let (path_ref, query_ref) = match before_fragment.split_once('?') {
            Some((a, b)) => (a, b),
            None => (before_fragment, ""),
        };

        let mut decode_error = false;
        let percent_decode = |s: &str, err: &mut bool| -> String {
            let mut out = Vec::new();
            let bytes = s.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'%' {
                    if i + 3 <= bytes.len()
                        && bytes[i + 1].is_ascii_hexdigit()
                        && bytes[i + 2].is_ascii_hexdigit()
                    {
                        let hi = (bytes[i + 1] as char).to_digit(16).unwrap();
                        let lo = (bytes[i + 2] as char).to_digit(16).unwrap();
                        out.push((hi * 16 + lo) as u8);
                        i += 3;
                    } else {
                        *err = true;
                        break;
                    }
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            String::from_utf8_lossy(&out).into_owned()
        };

        uri.host = percent_decode(host_ref, &mut decode_error).to_lowercase();
        if !port_ref.is_empty() {
            uri.port = port_ref.parse().ok()?;
        }
        uri.fragment = percent_decode(fragment_ref, &mut decode_error);

        uri.rootless = true;
        if !path_ref.is_empty() {
            let path_ref = if let Some(stripped) = path_ref.strip_prefix('/') {
                uri.rootless = false;
                stripped
            } else {
                path_ref
            };
            for segment in path_ref.split('/') {
                let decoded = percent_decode(segment, &mut decode_error);
                if !allow_dot_segments && (decoded == "." || decoded == "..") {
                    return None;
                }
                uri.path_segments.push(decoded);
            }
        }

        if !query_ref.is_empty() {
            for param in query_ref.split('&') {
                uri.query_params.push(percent_decode(param, &mut decode_error));
            }
        }

        if decode_error {
            return None;
        }
        Some(uri)
    }

    /// `path_segments[first_index:]` joined by `/`; if `first_index` is 0
    /// and the URI isn't rootless, there's a leading `/`.
    pub fn path_string(&self, first_index: usize) -> String {
        let mut result = String::new();
        if first_index == 0 && !self.rootless {
            result.push('/');
        }
        for segment in self.path_segments.iter().skip(first_index) {
            result.push_str(segment);
            result.push('/');
        }
        if !self.path_segments.is_empty() {
            result.pop();
        }
        result
    }

    pub fn encode(&self) -> String {
        const HOST_ALLOWED: &str =
            "!$&'()*+,-.0123456789:;=ABCDEFGHIJKLMNOPQRSTUVWXYZ[]_abcdefghijklmnopqrstuvwxyz~";
        const PATH_ALLOWED: &str =
            "!$&'()*+,-.0123456789:;=@ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";
        const PATH_ALLOWED_WITH_SLASH: &str =
            "!$&'()*+,-./0123456789:;=@ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";
        const QUERY_ALLOWED: &str =
            "!$'()*+,-./0123456789:;=?@ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";
        const FRAGMENT_ALLOWED: &str =
            "!$&'()*+,-./0123456789:;=?@ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";

        fn percent_encode(out: &mut String, s: &str, allowed: &str) {
            for b in s.bytes() {
                if allowed.as_bytes().contains(&b) {
                    out.push(b as char);
                } else {
                    out.push('%');
                    out.push_str(&format!("{:02X}", b));
                }
            }
        }

        let mut out = String::new();
        if !self.scheme.is_empty() {
            out.push_str(&self.scheme.to_lowercase());
            out.push(':');
        }
        if !self.host.is_empty() || self.port != 0 {
            out.push_str("//");
            percent_encode(&mut out, &self.host.to_lowercase(), HOST_ALLOWED);
            if self.port != 0 {
                out.push(':');
                out.push_str(&self.port.to_string());
            }
        }
        if !self.rootless {
            out.push('/');
        }
        if !self.path_segments.is_empty() {
            let allowed = if self.escape_slashes_in_segments {
                PATH_ALLOWED
            } else {
                PATH_ALLOWED_WITH_SLASH
            };
            for segment in &self.path_segments {
                percent_encode(&mut out, segment, allowed);
                out.push('/');
            }
            out.pop();
        }
        if !self.query_params.is_empty() {
            out.push('?');
            for param in &self.query_params {
                percent_encode(&mut out, param, QUERY_ALLOWED);
                out.push('&');
            }
            out.pop();
        }
        if !self.fragment.is_empty() {
            out.push('#');
            percent_encode(&mut out, &self.fragment, FRAGMENT_ALLOWED);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_port_path() {
        let uri = Uri::parse("http://Example.COM:8080/a/b?x&y#frag").unwrap();
        assert_eq!(uri.scheme, "http");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 8080);
        assert_eq!(uri.path_segments, vec!["a", "b"]);
        assert_eq!(uri.query_params, vec!["x", "y"]);
        assert_eq!(uri.fragment, "frag");
    }

    #[test]
    fn percent_decodes_path_segments() {
        let uri = Uri::parse("x:/y/foo%2Fbar").unwrap();
        assert_eq!(uri.path_segments, vec!["y", "foo/bar"]);
    }

    #[test]
    fn rejects_userinfo() {
        assert!(Uri::parse("http://user@host/path").is_none());
    }

    #[test]
    fn rejects_dot_segments_unless_allowed() {
        assert!(Uri::parse("x:/a/../b").is_none());
        assert!(Uri::parse_with_dot_segments("x:/a/../b", true).is_some());
    }

    #[test]
    fn encode_round_trips_simple_path() {
        let uri = Uri::parse("/head/my%2Fname").unwrap();
        assert_eq!(uri.path_segments, vec!["head", "my/name"]);
        let reencoded = uri.encode();
        assert_eq!(Uri::parse(&reencoded).unwrap(), uri);
    }

    #[test]
    fn rootless_path_has_no_leading_slash() {
        let uri = Uri::parse("mailto:foo").unwrap();
        assert!(uri.rootless);
        assert_eq!(uri.encode(), "mailto:foo");
    }
}
