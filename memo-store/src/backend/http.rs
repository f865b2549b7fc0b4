//! The `http:`/`https:` remote backend: a thin `reqwest::blocking::Client`
//! wrapper speaking the wire protocol from spec.md §6.2. Every `Store`
//! method maps to exactly one request; there is no local caching layer
//! here (the server is the source of truth).

use crate::{Store, StoreError};
use memo_core::{Call, Cid, Name, Node};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;

pub struct HttpStore {
    client: Client,
    base_url: String,
}

fn args_path(args: &[Cid]) -> String {
    args.iter()
        .map(|cid| cid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn name_path(name: &Name) -> String {
    match name {
        Name::Cid(cid) => format!("cid/{}", cid.to_string()),
        Name::Head(n) => format!("head/{}", n),
        Name::Call(call) => format!("call/{}/{}", call.name, args_path(&call.args)),
    }
}

impl HttpStore {
    pub fn new(uri: &str) -> Result<HttpStore, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(StoreError::Http)?;
        Ok(HttpStore {
            client,
            base_url: uri.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Fetches a CID from a response whose body is a CID-encoded node
    /// (the wire protocol's representation of head/call resolution
    /// results, per §6.2's "body = CID-node" rows).
    fn cid_from_response(resp: reqwest::blocking::Response) -> Result<Cid, StoreError> {
        let bytes = resp.bytes().map_err(StoreError::Http)?;
        let node = Node::load_from_cbor(&bytes)?;
        node.as_link().cloned().ok_or(StoreError::Protocol)
    }
}

impl Store for HttpStore {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>, StoreError> {
        if let Some(inline) = cid.inline_content() {
            return Ok(Some(Node::load_from_ipld(cid, inline)?));
        }
        let resp = self
            .client
            .get(self.url(&format!("cid/{}", cid.to_string())))
            .send()
            .map_err(StoreError::Http)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(StoreError::Http)?;
        let bytes = resp.bytes().map_err(StoreError::Http)?;
        Ok(Some(Node::load_from_ipld(cid, &bytes)?))
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>, StoreError> {
        if let Name::Cid(cid) = name {
            return Ok(Some(cid.clone()));
        }
        let resp = self
            .client
            .get(self.url(&name_path(name)))
            .send()
            .map_err(StoreError::Http)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(StoreError::Http)?;
        Ok(Some(HttpStore::cid_from_response(resp)?))
    }

    fn put(&self, value: &Node) -> Result<Cid, StoreError> {
        let (cid, bytes) = value.save_as_ipld(false);
        if cid.hash_codec() == memo_core::HashCodec::Identity {
            return Ok(cid);
        }
        let resp = self
            .client
            .post(self.url("cid"))
            .header("content-type", "application/cbor")
            .body(bytes)
            .send()
            .map_err(StoreError::Http)?;
        resp.error_for_status().map_err(StoreError::Http)?;
        Ok(cid)
    }

    fn set(&self, name: &Name, cid: &Cid) -> Result<(), StoreError> {
        if matches!(name, Name::Cid(_)) {
            return Err(StoreError::SetOnCidName);
        }
        let body = Node::link(cid.clone()).save_cbor();
        let resp = self
            .client
            .put(self.url(&name_path(name)))
            .header("content-type", "application/cbor")
            .body(body)
            .send()
            .map_err(StoreError::Http)?;
        resp.error_for_status().map_err(StoreError::Http)?;
        Ok(())
    }

    fn list_names_using(&self, _cid: &Cid) -> Result<Vec<Name>, StoreError> {
        // Not part of the wire protocol (§6.2 has no reverse-lookup route);
        // a remote store cannot answer this without server-side support.
        Ok(Vec::new())
    }

    fn list_funcs(&self) -> Result<Vec<String>, StoreError> {
        let resp = self
            .client
            .get(self.url("call"))
            .send()
            .map_err(StoreError::Http)?
            .error_for_status()
            .map_err(StoreError::Http)?;
        let uris: Vec<String> = resp.json().map_err(StoreError::Http)?;
        Ok(uris
            .iter()
            .filter_map(|u| u.strip_prefix("/call/"))
            .map(|s| s.to_string())
            .collect())
    }

    fn each_head(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<(), StoreError> {
        let resp = self
            .client
            .get(self.url("head"))
            .send()
            .map_err(StoreError::Http)?
            .error_for_status()
            .map_err(StoreError::Http)?;
        let uris: Vec<String> = resp.json().map_err(StoreError::Http)?;
        for uri in uris {
            if let Some(name) = uri.strip_prefix("/head/") {
                if f(name) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<(), StoreError> {
        let resp = self
            .client
            .get(self.url(&format!("call/{}", func)))
            .send()
            .map_err(StoreError::Http)?
            .error_for_status()
            .map_err(StoreError::Http)?;
        let uris: Vec<String> = resp.json().map_err(StoreError::Http)?;
        for uri in uris {
            if let Some(name) = Name::parse(&uri) {
                if let Name::Call(call) = name {
                    if f(&call) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn head_delete(&self, name: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.url(&format!("head/{}", name)))
            .send()
            .map_err(StoreError::Http)?;
        resp.error_for_status().map_err(StoreError::Http)?;
        Ok(())
    }

    fn call_invalidate(&self, func: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.url(&format!("call/{}", func)))
            .send()
            .map_err(StoreError::Http)?;
        resp.error_for_status().map_err(StoreError::Http)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_path_matches_wire_protocol_layout() {
        let head = Name::head("latest");
        assert_eq!(name_path(&head), "head/latest");
    }

    #[test]
    fn args_path_is_comma_separated() {
        let a = Cid::calculate_with_policy(memo_core::ContentCodec::DagCbor, b"a");
        let b = Cid::calculate_with_policy(memo_core::ContentCodec::DagCbor, b"b");
        let joined = args_path(&[a.clone(), b.clone()]);
        assert_eq!(joined, format!("{},{}", a.to_string(), b.to_string()));
    }
}
