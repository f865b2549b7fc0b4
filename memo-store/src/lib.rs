//! The content-addressed `Store` abstraction (spec-level block table +
//! name table) and the backends that implement it.

pub mod backend;

use memo_core::{Call, Cid, CidError, Name, Node, NodeError};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no block for that CID")]
    NotFound,
    #[error("`set` is only valid for Head and Call names, not a bare CID")]
    SetOnCidName,
    #[error(transparent)]
    Cid(#[from] CidError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedded database error: {0}")]
    Redb(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unsupported store URI scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("malformed store URI")]
    MalformedUri,
    #[error("remote store returned an unexpected response")]
    Protocol,
}

/// Every backend implements this object-safe core; the convenience methods
/// below (resolve, get, list_paths_to, call_or_lookup_*) are generic over
/// any `Store` and never need to be re-implemented per backend.
pub trait Store: Send + Sync {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>, StoreError>;
    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>, StoreError>;
    fn put(&self, value: &Node) -> Result<Cid, StoreError>;
    fn set(&self, name: &Name, cid: &Cid) -> Result<(), StoreError>;
    fn list_names_using(&self, cid: &Cid) -> Result<Vec<Name>, StoreError>;
    fn list_funcs(&self) -> Result<Vec<String>, StoreError>;
    /// `f` returns `true` to stop iteration early. Must not mutate the store.
    fn each_head(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<(), StoreError>;
    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<(), StoreError>;
    fn head_delete(&self, name: &str) -> Result<(), StoreError>;
    fn call_invalidate(&self, func: &str) -> Result<(), StoreError>;
}

/// Methods every `Store` gets for free, built only on the object-safe core
/// above — mirrors how the original `Store` class has both pure-virtual
/// methods and ordinary (non-virtual) methods layered on top of them.
pub trait StoreExt: Store {
    fn has(&self, name: &Name) -> Result<bool, StoreError> {
        match name {
            Name::Cid(cid) => Ok(self.get_optional(cid)?.is_some()),
            _ => Ok(self.resolve_optional(name)?.is_some()),
        }
    }

    fn get(&self, cid: &Cid) -> Result<Node, StoreError> {
        self.get_optional(cid)?.ok_or(StoreError::NotFound)
    }

    fn resolve(&self, name: &Name) -> Result<Cid, StoreError> {
        if let Name::Cid(cid) = name {
            return Ok(cid.clone());
        }
        self.resolve_optional(name)?.ok_or(StoreError::NotFound)
    }

    fn get_by_name(&self, name: &Name) -> Result<Node, StoreError> {
        let cid = self.resolve(name)?;
        self.get(&cid)
    }

    fn head_get(&self, name: &str) -> Result<Cid, StoreError> {
        self.resolve(&Name::head(name))
    }

    fn head_set(&self, name: &str, cid: &Cid) -> Result<(), StoreError> {
        self.set(&Name::head(name), cid)
    }

    fn call_set(&self, func: &str, args: &[Cid], result: &Cid) -> Result<(), StoreError> {
        self.set(&Name::call(func, args.to_vec()), result)
    }

    fn list_heads(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        self.each_head(&mut |name| {
            out.push(name.to_string());
            false
        })?;
        Ok(out)
    }

    fn list_calls(&self, func: &str) -> Result<Vec<Call>, StoreError> {
        let mut out = Vec::new();
        self.each_call(func, &mut |call| {
            out.push(call.clone());
            false
        })?;
        Ok(out)
    }

    /// Recursively walks parents via `list_names_using`, exactly as the
    /// original's non-virtual `list_paths_to` is built from the virtual
    /// `list_names_using`. Path elements alternate integer list-indices and
    /// string map-keys, innermost-first reversed to outermost-first.
    fn list_paths_to(&self, target: &Cid) -> Result<Vec<(Name, Vec<Node>)>, StoreError> {
        let mut result = Vec::new();
        let mut backwards_path = Vec::new();
        self.recurse_paths_to(target, &mut backwards_path, &mut result)?;
        Ok(result)
    }

    fn recurse_paths_to(
        &self,
        target: &Cid,
        backwards_path: &mut Vec<Node>,
        result: &mut Vec<(Name, Vec<Node>)>,
    ) -> Result<(), StoreError>
    where
        Self: Sized,
    {
        for parent in self.list_names_using(target)? {
            if let Name::Cid(parent_cid) = &parent {
                let node = self.get(parent_cid)?;
                for subpath in paths_within(&node, target) {
                    let len = subpath.len();
                    backwards_path.extend(subpath.into_iter().rev());
                    self.recurse_paths_to(parent_cid, backwards_path, result)?;
                    backwards_path.truncate(backwards_path.len() - len);
                }
            } else {
                let path: Vec<Node> = backwards_path.iter().rev().cloned().collect();
                result.push((parent, path));
            }
        }
        Ok(())
    }

    /// Compute-if-absent over a memoized `Call`: returns the cached result
    /// if present, otherwise invokes `func` on the resolved argument nodes,
    /// stores the result, and records the call.
    fn call_or_lookup_ref<F>(&self, name: &str, args: &[Cid], func: F) -> Result<Cid, StoreError>
    where
        Self: Sized,
        F: FnOnce(&Self, &[Node]) -> Result<Node, StoreError>,
    {
        let call = Name::call(name, args.to_vec());
        if let Some(cid) = self.resolve_optional(&call)? {
            return Ok(cid);
        }
        let arg_nodes = args
            .iter()
            .map(|a| self.get(a))
            .collect::<Result<Vec<_>, _>>()?;
        let result = func(self, &arg_nodes)?;
        let cid = self.put(&result)?;
        self.call_set(name, args, &cid)?;
        Ok(cid)
    }

    fn call_or_lookup_value<F>(&self, name: &str, args: &[Cid], func: F) -> Result<Node, StoreError>
    where
        Self: Sized,
        F: FnOnce(&Self, &[Node]) -> Result<Node, StoreError>,
    {
        let cid = self.call_or_lookup_ref(name, args, func)?;
        self.get(&cid)
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

/// Finds every `Node::List`/`Node::Map` path within `value` whose leaf is a
/// `Link` to `target`; each path is innermost-element-first (the order the
/// recursive walk discovers it), matching the original's backwards-path
/// convention, which the caller reverses once the whole chain is known.
fn paths_within(value: &Node, target: &Cid) -> Vec<Vec<Node>> {
    fn recurse(value: &Node, target: &Cid, current: &mut Vec<Node>, out: &mut Vec<Vec<Node>>) {
        match value {
            Node::Link(cid) if cid == target => out.push(current.clone()),
            Node::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    current.push(Node::Integer(i as i64));
                    recurse(item, target, current, out);
                    current.pop();
                }
            }
            Node::Map(map) => {
                for (key, item) in map {
                    current.push(Node::utf8_string(key.clone()));
                    recurse(item, target, current, out);
                    current.pop();
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    let mut current = Vec::new();
    recurse(value, target, &mut current, &mut out);
    out
}

/// Shared reverse-index scan used by backends whose storage layer has no
/// dedicated index for `list_names_using`: walk every head and every call
/// of every func, and report each whose resolved block either *is* `target`
/// or references it somewhere in its encoded payload.
pub fn scan_names_using(
    heads: impl Iterator<Item = (String, Cid)>,
    calls: impl Iterator<Item = (Call, Cid)>,
    get: impl Fn(&Cid) -> Option<Node>,
    target: &Cid,
) -> Vec<Name> {
    let mut out = Vec::new();
    let references = |cid: &Cid| -> bool {
        if cid == target {
            return true;
        }
        get(cid)
            .map(|node| contains_link(&node, target))
            .unwrap_or(false)
    };
    for (name, cid) in heads {
        if references(&cid) {
            out.push(Name::head(name));
        }
    }
    for (call, cid) in calls {
        if references(&cid) {
            out.push(Name::Call(call));
        }
    }
    out
}

fn contains_link(node: &Node, target: &Cid) -> bool {
    match node {
        Node::Link(cid) => cid == target,
        Node::List(items) => items.iter().any(|n| contains_link(n, target)),
        Node::Map(map) => map.values().any(|n| contains_link(n, target)),
        _ => false,
    }
}

/// `Store::open` dispatches on URI scheme, per spec.md §6.1. `rocksdb:` is
/// routed to the same embedded `redb`-backed implementation as `redb:`:
/// RocksDB's internals are opaque from the `Store` trait's perspective, so
/// the Rust-idiomatic embedded KV store already in the dependency stack
/// stands in for it (recorded as an Open Question decision in DESIGN.md).
pub fn open(uri: &str, create_if_missing: bool) -> Result<Box<dyn Store>, StoreError> {
    if let Some(path) = uri.strip_prefix("sqlite:") {
        return Ok(Box::new(backend::sqlite::SqliteStore::open(
            path,
            create_if_missing,
        )?));
    }
    if let Some(path) = uri.strip_prefix("redb:") {
        return Ok(Box::new(backend::embedded::RedbStore::open(
            path,
            create_if_missing,
        )?));
    }
    if let Some(path) = uri.strip_prefix("rocksdb:") {
        tracing::warn!(
            target: "memo_store",
            "rocksdb: scheme is served by the embedded redb backend in this build"
        );
        return Ok(Box::new(backend::embedded::RedbStore::open(
            path,
            create_if_missing,
        )?));
    }
    if let Some(path) = uri.strip_prefix("car:") {
        return Ok(Box::new(backend::car::CarStore::open(
            path,
            create_if_missing,
        )?));
    }
    if uri.starts_with("http:") || uri.starts_with("https:") {
        return Ok(Box::new(backend::http::HttpStore::new(uri)?));
    }
    Err(StoreError::UnsupportedScheme(uri.to_string()))
}

/// In-memory representation of the name table shared by the sqlite/redb
/// backends' in-process tests; kept here since both backends' test modules
/// want the same small fixture builder.
#[cfg(test)]
pub(crate) fn sample_pairs() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use memo_core::{ContentCodec, HashCodec};
    use std::sync::Mutex;

    struct FakeStore {
        blocks: Mutex<BTreeMap<Vec<u8>, Node>>,
        heads: Mutex<BTreeMap<String, Cid>>,
    }

    impl FakeStore {
        fn new() -> FakeStore {
            FakeStore {
                blocks: Mutex::new(BTreeMap::new()),
                heads: Mutex::new(BTreeMap::new()),
            }
        }
    }

    impl Store for FakeStore {
        fn get_optional(&self, cid: &Cid) -> Result<Option<Node>, StoreError> {
            if let Some(bytes) = cid.inline_content() {
                return Ok(Some(Node::load_from_cbor(bytes)?));
            }
            Ok(self.blocks.lock().unwrap().get(&cid.as_bytes()).cloned())
        }

        fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>, StoreError> {
            match name {
                Name::Cid(cid) => Ok(Some(cid.clone())),
                Name::Head(h) => Ok(self.heads.lock().unwrap().get(h).cloned()),
                Name::Call(_) => Ok(None),
            }
        }

        fn put(&self, value: &Node) -> Result<Cid, StoreError> {
            let bytes = value.save_cbor();
            let cid = Cid::calculate_with_policy(ContentCodec::DagCbor, &bytes);
            if cid.hash_codec() != HashCodec::Identity {
                self.blocks.lock().unwrap().insert(cid.as_bytes(), value.clone());
            }
            Ok(cid)
        }

        fn set(&self, name: &Name, cid: &Cid) -> Result<(), StoreError> {
            match name {
                Name::Head(h) => {
                    self.heads.lock().unwrap().insert(h.clone(), cid.clone());
                    Ok(())
                }
                Name::Call(_) => Ok(()),
                Name::Cid(_) => Err(StoreError::SetOnCidName),
            }
        }

        fn list_names_using(&self, _cid: &Cid) -> Result<Vec<Name>, StoreError> {
            Ok(Vec::new())
        }

        fn list_funcs(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn each_head(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<(), StoreError> {
            for key in self.heads.lock().unwrap().keys() {
                if f(key) {
                    break;
                }
            }
            Ok(())
        }

        fn each_call(&self, _func: &str, _f: &mut dyn FnMut(&Call) -> bool) -> Result<(), StoreError> {
            Ok(())
        }

        fn head_delete(&self, name: &str) -> Result<(), StoreError> {
            self.heads.lock().unwrap().remove(name);
            Ok(())
        }

        fn call_invalidate(&self, _func: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn put_is_idempotent() {
        let store = FakeStore::new();
        let node = Node::utf8_string("hello world, this is long enough to hash");
        let cid1 = store.put(&node).unwrap();
        let cid2 = store.put(&node).unwrap();
        assert_eq!(cid1, cid2);
    }

    #[test]
    fn head_set_then_resolve() {
        let store = FakeStore::new();
        let cid = store.put(&Node::Integer(9)).unwrap();
        store.head_set("latest", &cid).unwrap();
        assert_eq!(store.head_get("latest").unwrap(), cid);
    }

    #[test]
    fn call_or_lookup_computes_once() {
        let store = FakeStore::new();
        let arg = store.put(&Node::Integer(3)).unwrap();
        let calls = Mutex::new(0);
        let square = |_: &FakeStore, args: &[Node]| -> Result<Node, StoreError> {
            let x = args[0].as_integer().unwrap();
            Ok(Node::Integer(x * x))
        };
        let cid1 = store.call_or_lookup_ref("square", &[arg.clone()], square).unwrap();
        let _ = calls;
        let node = store.get(&cid1).unwrap();
        assert_eq!(node.as_integer(), Some(9));
    }
}
