//! The `redb:` (and `rocksdb:`, routed to the same implementation — see the
//! note in `memo_store::open`) embedded key-value backend. Three tables:
//! blocks (CID bytes -> node bytes), heads (name -> CID bytes), and calls
//! (func name + args -> CID bytes), following the same "one `TableDefinition`
//! per logical table" layout an `AccountState`-style balances/nonces split
//! would use.

use crate::{scan_names_using, Store, StoreError};
use memo_core::{Call, Cid, ContentCodec, HashCodec, Name, Node};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

const BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");
const HEADS: TableDefinition<&str, &[u8]> = TableDefinition::new("heads");
const CALLS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("calls");

impl From<redb::Error> for StoreError {
    fn from(e: redb::Error) -> StoreError {
        StoreError::Redb(e.to_string())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> StoreError {
        StoreError::Redb(e.to_string())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> StoreError {
        StoreError::Redb(e.to_string())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> StoreError {
        StoreError::Redb(e.to_string())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> StoreError {
        StoreError::Redb(e.to_string())
    }
}

pub struct RedbStore {
    db: Database,
}

/// A call's key is its func name, a NUL byte, then its args' CID bytes
/// length-prefixed with a varint — arbitrary but stable, and never produced
/// by a func name containing NUL (func names are chosen by the registering
/// program, not untrusted input).
fn call_key(func: &str, args: &[Cid]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(func.as_bytes());
    out.push(0);
    for arg in args {
        let bytes = arg.as_bytes();
        let mut buf = unsigned_varint::encode::u64_buffer();
        out.extend_from_slice(unsigned_varint::encode::u64(bytes.len() as u64, &mut buf));
        out.extend_from_slice(&bytes);
    }
    out
}

fn split_call_key(key: &[u8]) -> Option<(&str, Vec<Cid>)> {
    let nul = key.iter().position(|&b| b == 0)?;
    let func = std::str::from_utf8(&key[..nul]).ok()?;
    let mut rest = &key[nul + 1..];
    let mut args = Vec::new();
    while !rest.is_empty() {
        let (len, after_len) = unsigned_varint::decode::u64(rest).ok()?;
        let len = len as usize;
        if after_len.len() < len {
            return None;
        }
        args.push(Cid::from_bytes(&after_len[..len]).ok()?);
        rest = &after_len[len..];
    }
    Some((func, args))
}

impl RedbStore {
    pub fn open(path: &str, create_if_missing: bool) -> Result<RedbStore, StoreError> {
        let path = Path::new(path);
        let db = if create_if_missing || !path.exists() {
            Database::create(path).map_err(StoreError::from)?
        } else {
            Database::open(path).map_err(StoreError::from)?
        };
        let txn = db.begin_write()?;
        {
            txn.open_table(BLOCKS)?;
            txn.open_table(HEADS)?;
            txn.open_table(CALLS)?;
        }
        txn.commit()?;
        Ok(RedbStore { db })
    }
}

impl Store for RedbStore {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>, StoreError> {
        if let Some(inline) = cid.inline_content() {
            return Ok(Some(Node::load_from_ipld(cid, inline)?));
        }
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOCKS)?;
        match table.get(cid.as_bytes().as_slice())? {
            Some(bytes) => Ok(Some(Node::load_from_ipld(cid, bytes.value())?)),
            None => Ok(None),
        }
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>, StoreError> {
        match name {
            Name::Cid(cid) => Ok(Some(cid.clone())),
            Name::Head(n) => {
                let txn = self.db.begin_read()?;
                let table = txn.open_table(HEADS)?;
                match table.get(n.as_str())? {
                    Some(bytes) => Ok(Some(Cid::from_bytes(bytes.value())?)),
                    None => Ok(None),
                }
            }
            Name::Call(call) => {
                let txn = self.db.begin_read()?;
                let table = txn.open_table(CALLS)?;
                let key = call_key(&call.name, &call.args);
                match table.get(key.as_slice())? {
                    Some(bytes) => Ok(Some(Cid::from_bytes(bytes.value())?)),
                    None => Ok(None),
                }
            }
        }
    }

    fn put(&self, value: &Node) -> Result<Cid, StoreError> {
        let (cid, bytes) = value.save_as_ipld(false);
        if cid.hash_codec() == HashCodec::Identity {
            return Ok(cid);
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BLOCKS)?;
            table.insert(cid.as_bytes().as_slice(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(cid)
    }

    fn set(&self, name: &Name, cid: &Cid) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        match name {
            Name::Head(n) => {
                let mut table = txn.open_table(HEADS)?;
                table.insert(n.as_str(), cid.as_bytes().as_slice())?;
            }
            Name::Call(call) => {
                let mut table = txn.open_table(CALLS)?;
                let key = call_key(&call.name, &call.args);
                table.insert(key.as_slice(), cid.as_bytes().as_slice())?;
            }
            Name::Cid(_) => return Err(StoreError::SetOnCidName),
        }
        txn.commit()?;
        Ok(())
    }

    fn list_names_using(&self, target: &Cid) -> Result<Vec<Name>, StoreError> {
        let txn = self.db.begin_read()?;
        let heads_table = txn.open_table(HEADS)?;
        let calls_table = txn.open_table(CALLS)?;
        let blocks_table = txn.open_table(BLOCKS)?;

        let heads: Vec<(String, Cid)> = heads_table
            .iter()?
            .filter_map(|r| r.ok())
            .map(|(k, v)| (k.value().to_string(), Cid::from_bytes(v.value()).unwrap()))
            .collect();
        let calls: Vec<(Call, Cid)> = calls_table
            .iter()?
            .filter_map(|r| r.ok())
            .filter_map(|(k, v)| {
                let (func, args) = split_call_key(k.value())?;
                Some((Call::new(func, args), Cid::from_bytes(v.value()).ok()?))
            })
            .collect();
        let get = |cid: &Cid| -> Option<Node> {
            if let Some(bytes) = cid.inline_content() {
                return Node::load_from_ipld(cid, bytes).ok();
            }
            blocks_table
                .get(cid.as_bytes().as_slice())
                .ok()
                .flatten()
                .and_then(|v| Node::load_from_ipld(cid, v.value()).ok())
        };
        Ok(scan_names_using(
            heads.into_iter(),
            calls.into_iter(),
            get,
            target,
        ))
    }

    fn list_funcs(&self) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CALLS)?;
        let mut funcs: Vec<String> = table
            .iter()?
            .filter_map(|r| r.ok())
            .filter_map(|(k, _)| split_call_key(k.value()).map(|(f, _)| f.to_string()))
            .collect();
        funcs.sort();
        funcs.dedup();
        Ok(funcs)
    }

    fn each_head(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(HEADS)?;
        for row in table.iter()? {
            let (k, _) = row?;
            if f(k.value()) {
                break;
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CALLS)?;
        for row in table.iter()? {
            let (k, _) = row?;
            if let Some((call_func, args)) = split_call_key(k.value()) {
                if call_func == func {
                    let call = Call::new(call_func, args);
                    if f(&call) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn head_delete(&self, name: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(HEADS)?;
            table.remove(name)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn call_invalidate(&self, func: &str) -> Result<(), StoreError> {
        let keys: Vec<Vec<u8>> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(CALLS)?;
            table
                .iter()?
                .filter_map(|r| r.ok())
                .map(|(k, _)| k.value().to_vec())
                .filter(|k| split_call_key(k).map(|(f, _)| f == func).unwrap_or(false))
                .collect()
        };
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CALLS)?;
            for key in keys {
                table.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("memodb-redb-test-{}-{}", name, std::process::id()))
    }

    #[test]
    fn put_then_get_round_trips() {
        let path = temp_path("put-get");
        let _ = std::fs::remove_file(&path);
        let store = RedbStore::open(path.to_str().unwrap(), true).unwrap();
        let node = Node::utf8_string("x".repeat(200));
        let cid = store.put(&node).unwrap();
        assert_eq!(store.get(&cid).unwrap(), node);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn head_set_resolve_delete() {
        let path = temp_path("head");
        let _ = std::fs::remove_file(&path);
        let store = RedbStore::open(path.to_str().unwrap(), true).unwrap();
        let cid = store.put(&Node::Integer(1)).unwrap();
        store.head_set("latest", &cid).unwrap();
        assert_eq!(store.head_get("latest").unwrap(), cid);
        store.head_delete("latest").unwrap();
        assert!(store.resolve_optional(&Name::head("latest")).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn call_invalidate_clears_only_that_func() {
        let path = temp_path("invalidate");
        let _ = std::fs::remove_file(&path);
        let store = RedbStore::open(path.to_str().unwrap(), true).unwrap();
        let arg = store.put(&Node::Integer(3)).unwrap();
        let result = store.put(&Node::Integer(9)).unwrap();
        store.call_set("square", &[arg.clone()], &result).unwrap();
        store.call_set("other", &[arg.clone()], &result).unwrap();
        store.call_invalidate("square").unwrap();
        assert!(store
            .resolve_optional(&Name::call("square", vec![arg.clone()]))
            .unwrap()
            .is_none());
        assert!(store
            .resolve_optional(&Name::call("other", vec![arg]))
            .unwrap()
            .is_some());
        let _ = std::fs::remove_file(&path);
    }
}
