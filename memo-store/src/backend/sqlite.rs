//! The `sqlite:` backend. Schema mirrors the embedded `redb` backend's three
//! logical tables one-for-one, just with SQL instead of typed tables —
//! `blocks(cid, content)`, `heads(name, cid)`, `calls(func, args, cid)` with
//! `args` the comma-free binary encoding used by [`super::embedded::RedbStore`]
//! before it was split apart (kept here as plain columns instead, since SQL
//! can index `func` directly, which blob-concatenation could not).
//!
//! `sqlite:<path>?mode=memory` opens an in-memory database, useful for tests
//! and the HTTP server's `--store sqlite::memory:` development mode.

use crate::{scan_names_using, Store, StoreError};
use memo_core::{Call, Cid, HashCodec, Name, Node};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(uri_rest: &str, create_if_missing: bool) -> Result<SqliteStore, StoreError> {
        let (path, memory) = parse_uri_rest(uri_rest);
        let conn = if memory {
            Connection::open_in_memory()?
        } else if create_if_missing {
            Connection::open(path)?
        } else {
            Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE)?
        };
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (cid BLOB PRIMARY KEY, content BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS heads (name TEXT PRIMARY KEY, cid BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS calls (
                func TEXT NOT NULL,
                args BLOB NOT NULL,
                cid BLOB NOT NULL,
                PRIMARY KEY (func, args)
             );",
        )?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_uri_rest(rest: &str) -> (&str, bool) {
    match rest.split_once('?') {
        Some((path, query)) if query.contains("mode=memory") => (path, true),
        _ => (rest, false),
    }
}

fn encode_args(args: &[Cid]) -> Vec<u8> {
    let mut out = Vec::new();
    for arg in args {
        let bytes = arg.as_bytes();
        let mut buf = unsigned_varint::encode::u64_buffer();
        out.extend_from_slice(unsigned_varint::encode::u64(bytes.len() as u64, &mut buf));
        out.extend_from_slice(&bytes);
    }
    out
}

fn decode_args(bytes: &[u8]) -> Option<Vec<Cid>> {
    let mut rest = bytes;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (len, after_len) = unsigned_varint::decode::u64(rest).ok()?;
        let len = len as usize;
        if after_len.len() < len {
            return None;
        }
        out.push(Cid::from_bytes(&after_len[..len]).ok()?);
        rest = &after_len[len..];
    }
    Some(out)
}

impl Store for SqliteStore {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>, StoreError> {
        if let Some(inline) = cid.inline_content() {
            return Ok(Some(Node::load_from_ipld(cid, inline)?));
        }
        let conn = self.conn.lock().unwrap();
        let content: Option<Vec<u8>> = conn
            .query_row(
                "SELECT content FROM blocks WHERE cid = ?1",
                params![cid.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        match content {
            Some(bytes) => Ok(Some(Node::load_from_ipld(cid, &bytes)?)),
            None => Ok(None),
        }
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match name {
            Name::Cid(cid) => Ok(Some(cid.clone())),
            Name::Head(n) => {
                let bytes: Option<Vec<u8>> = conn
                    .query_row("SELECT cid FROM heads WHERE name = ?1", params![n], |row| {
                        row.get(0)
                    })
                    .optional()?;
                bytes.map(|b| Cid::from_bytes(&b)).transpose().map_err(Into::into)
            }
            Name::Call(call) => {
                let args = encode_args(&call.args);
                let bytes: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT cid FROM calls WHERE func = ?1 AND args = ?2",
                        params![call.name, args],
                        |row| row.get(0),
                    )
                    .optional()?;
                bytes.map(|b| Cid::from_bytes(&b)).transpose().map_err(Into::into)
            }
        }
    }

    fn put(&self, value: &Node) -> Result<Cid, StoreError> {
        let (cid, bytes) = value.save_as_ipld(false);
        if cid.hash_codec() == HashCodec::Identity {
            return Ok(cid);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO blocks (cid, content) VALUES (?1, ?2)",
            params![cid.as_bytes(), bytes],
        )?;
        Ok(cid)
    }

    fn set(&self, name: &Name, cid: &Cid) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        match name {
            Name::Head(n) => {
                conn.execute(
                    "INSERT INTO heads (name, cid) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET cid = excluded.cid",
                    params![n, cid.as_bytes()],
                )?;
                Ok(())
            }
            Name::Call(call) => {
                let args = encode_args(&call.args);
                conn.execute(
                    "INSERT INTO calls (func, args, cid) VALUES (?1, ?2, ?3)
                     ON CONFLICT(func, args) DO UPDATE SET cid = excluded.cid",
                    params![call.name, args, cid.as_bytes()],
                )?;
                Ok(())
            }
            Name::Cid(_) => Err(StoreError::SetOnCidName),
        }
    }

    fn list_names_using(&self, target: &Cid) -> Result<Vec<Name>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut heads_stmt = conn.prepare("SELECT name, cid FROM heads")?;
        let heads: Vec<(String, Cid)> = heads_stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let cid: Vec<u8> = row.get(1)?;
                Ok((name, cid))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(name, bytes)| Some((name, Cid::from_bytes(&bytes).ok()?)))
            .collect();
        let mut calls_stmt = conn.prepare("SELECT func, args, cid FROM calls")?;
        let calls: Vec<(Call, Cid)> = calls_stmt
            .query_map([], |row| {
                let func: String = row.get(0)?;
                let args: Vec<u8> = row.get(1)?;
                let cid: Vec<u8> = row.get(2)?;
                Ok((func, args, cid))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(func, args_bytes, cid_bytes)| {
                Some((
                    Call::new(func, decode_args(&args_bytes)?),
                    Cid::from_bytes(&cid_bytes).ok()?,
                ))
            })
            .collect();
        let get = |cid: &Cid| -> Option<Node> {
            if let Some(inline) = cid.inline_content() {
                return Node::load_from_ipld(cid, inline).ok();
            }
            let content: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT content FROM blocks WHERE cid = ?1",
                    params![cid.as_bytes()],
                    |row| row.get(0),
                )
                .optional()
                .ok()
                .flatten();
            content.and_then(|bytes| Node::load_from_ipld(cid, &bytes).ok())
        };
        Ok(scan_names_using(
            heads.into_iter(),
            calls.into_iter(),
            get,
            target,
        ))
    }

    fn list_funcs(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT func FROM calls ORDER BY func")?;
        let funcs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(funcs)
    }

    fn each_head(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM heads ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        drop(stmt);
        drop(conn);
        for name in names {
            if f(&name) {
                break;
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT args FROM calls WHERE func = ?1")?;
        let all_args: Vec<Vec<u8>> = stmt
            .query_map(params![func], |row| row.get::<_, Vec<u8>>(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);
        for args_bytes in all_args {
            if let Some(args) = decode_args(&args_bytes) {
                let call = Call::new(func, args);
                if f(&call) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn head_delete(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM heads WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn call_invalidate(&self, func: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM calls WHERE func = ?1", params![func])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;

    fn memory_store() -> SqliteStore {
        SqliteStore::open(":memory:?mode=memory", true).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = memory_store();
        let node = Node::utf8_string("hello sqlite".repeat(10));
        let cid = store.put(&node).unwrap();
        assert_eq!(store.get(&cid).unwrap(), node);
    }

    #[test]
    fn call_set_then_resolve() {
        let store = memory_store();
        let arg = store.put(&Node::Integer(3)).unwrap();
        let result = store.put(&Node::Integer(9)).unwrap();
        store.call_set("square", &[arg.clone()], &result).unwrap();
        assert_eq!(
            store
                .resolve_optional(&Name::call("square", vec![arg]))
                .unwrap(),
            Some(result)
        );
    }

    #[test]
    fn each_call_enumerates_exactly_one() {
        let store = memory_store();
        let arg = store.put(&Node::Integer(4)).unwrap();
        let result = store.put(&Node::Integer(16)).unwrap();
        store.call_set("square", &[arg], &result).unwrap();
        let calls = store.list_calls("square").unwrap();
        assert_eq!(calls.len(), 1);
    }
}
