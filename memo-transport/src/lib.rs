//! Transport-level request/response types shared by `memo-server` (which
//! produces responses) and `memo-client` (which produces requests). Kept
//! independent of any particular HTTP library so both the `axum`-based
//! server and the `reqwest`-based client speak the same small vocabulary.

use bytes::Bytes;
use std::fmt;

pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Body {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Body {
    pub fn cbor(bytes: Vec<u8>) -> Body {
        Body {
            bytes: Bytes::from(bytes),
            content_type: CBOR_CONTENT_TYPE.to_string(),
        }
    }

    pub fn text(s: impl Into<String>) -> Body {
        Body {
            bytes: Bytes::from(s.into().into_bytes()),
            content_type: "text/plain".to_string(),
        }
    }

    pub fn is_cbor(&self) -> bool {
        self.content_type == CBOR_CONTENT_TYPE
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub body: Option<Body>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Request {
        Request {
            method,
            uri: uri.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Body) -> Request {
        self.body = Some(body);
        self
    }
}

/// HTTP status codes actually produced by the wire protocol (§6.2): no
/// general-purpose status registry, just the handful that matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    Accepted,
    NoContent,
    NotFound,
    BadRequest,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::Accepted => 202,
            Status::NoContent => 204,
            Status::NotFound => 404,
            Status::BadRequest => 400,
        }
    }

    pub fn from_code(code: u16) -> Option<Status> {
        match code {
            200 => Some(Status::Ok),
            201 => Some(Status::Created),
            202 => Some(Status::Accepted),
            204 => Some(Status::NoContent),
            404 => Some(Status::NotFound),
            400 => Some(Status::BadRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub location: Option<String>,
    pub body: Option<Body>,
}

impl Response {
    pub fn new(status: Status) -> Response {
        Response {
            status,
            location: None,
            body: None,
        }
    }

    pub fn with_body(mut self, body: Body) -> Response {
        self.body = Some(body);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Response {
        self.location = Some(location.into());
        self
    }

    pub fn not_found(message: &str) -> Response {
        Response::new(Status::NotFound).with_body(Body::text(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            Status::Ok,
            Status::Created,
            Status::Accepted,
            Status::NoContent,
            Status::NotFound,
            Status::BadRequest,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn not_found_response_is_not_cbor() {
        let resp = Response::not_found("no such route");
        assert!(!resp.body.unwrap().is_cbor());
    }
}
