//! The `car:` backend: a flat, append-only content-addressable archive file,
//! as named (but left unspecified) by spec.md §6.1/§9 and `include/memodb/CAR.h`
//! in the original. Every mutation — a new block, a head set/delete, a call
//! set/invalidate — is appended as one record; `open` replays the whole file
//! to rebuild the in-memory block/name index. Never rewrites or truncates an
//! existing record, which is what keeps "deleting a Head never affects
//! blocks" (spec.md §3) trivially true: blocks are never touched by anything
//! but a block-append.

use crate::{scan_names_using, Store, StoreError};
use memo_core::{Call, Cid, HashCodec, Name, Node};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

const TAG_BLOCK: u8 = 0x00;
const TAG_HEAD_SET: u8 = 0x01;
const TAG_HEAD_DELETE: u8 = 0x02;
const TAG_CALL_SET: u8 = 0x03;
const TAG_CALL_INVALIDATE: u8 = 0x04;

#[derive(Default)]
struct Index {
    blocks: BTreeMap<Vec<u8>, Vec<u8>>,
    heads: BTreeMap<String, Cid>,
    calls: BTreeMap<String, BTreeMap<Vec<u8>, Cid>>,
}

pub struct CarStore {
    file: Mutex<File>,
    index: Mutex<Index>,
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    push_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn read_varint(cursor: &mut &[u8]) -> Option<u64> {
    let (value, rest) = unsigned_varint::decode::u64(cursor).ok()?;
    *cursor = rest;
    Some(value)
}

fn read_bytes<'a>(cursor: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = read_varint(cursor)? as usize;
    if cursor.len() < len {
        return None;
    }
    let (taken, rest) = cursor.split_at(len);
    *cursor = rest;
    Some(taken)
}

fn encode_args(args: &[Cid]) -> Vec<u8> {
    let mut out = Vec::new();
    push_varint(&mut out, args.len() as u64);
    for arg in args {
        push_bytes(&mut out, &arg.as_bytes());
    }
    out
}

fn decode_args(cursor: &mut &[u8]) -> Option<Vec<Cid>> {
    let count = read_varint(cursor)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(Cid::from_bytes(read_bytes(cursor)?).ok()?);
    }
    Some(out)
}

impl CarStore {
    pub fn open(path: &str, create_if_missing: bool) -> Result<CarStore, StoreError> {
        let exists = std::path::Path::new(path).exists();
        if !exists && !create_if_missing {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.to_string(),
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let index = replay(&contents)?;
        file.seek(SeekFrom::End(0))?;
        Ok(CarStore {
            file: Mutex::new(file),
            index: Mutex::new(index),
        })
    }

    fn append(&self, record: &[u8]) -> Result<(), StoreError> {
        let mut file = self.file.lock().unwrap();
        file.write_all(record)?;
        file.flush()?;
        Ok(())
    }
}

fn replay(contents: &[u8]) -> Result<Index, StoreError> {
    let mut index = Index::default();
    let mut cursor = contents;
    while !cursor.is_empty() {
        let tag = cursor[0];
        cursor = &cursor[1..];
        match tag {
            TAG_BLOCK => {
                let cid_bytes = read_bytes(&mut cursor)
                    .ok_or_else(|| corrupt("truncated block record"))?;
                let content = read_bytes(&mut cursor)
                    .ok_or_else(|| corrupt("truncated block content"))?;
                index.blocks.insert(cid_bytes.to_vec(), content.to_vec());
            }
            TAG_HEAD_SET => {
                let name = read_bytes(&mut cursor).ok_or_else(|| corrupt("truncated head name"))?;
                let cid_bytes = read_bytes(&mut cursor).ok_or_else(|| corrupt("truncated head cid"))?;
                let name = String::from_utf8(name.to_vec()).map_err(|_| corrupt("non-utf8 head name"))?;
                let cid = Cid::from_bytes(cid_bytes)?;
                index.heads.insert(name, cid);
            }
            TAG_HEAD_DELETE => {
                let name = read_bytes(&mut cursor).ok_or_else(|| corrupt("truncated head name"))?;
                let name = String::from_utf8(name.to_vec()).map_err(|_| corrupt("non-utf8 head name"))?;
                index.heads.remove(&name);
            }
            TAG_CALL_SET => {
                let func = read_bytes(&mut cursor).ok_or_else(|| corrupt("truncated call func"))?;
                let func = String::from_utf8(func.to_vec()).map_err(|_| corrupt("non-utf8 func name"))?;
                let args = decode_args(&mut cursor).ok_or_else(|| corrupt("truncated call args"))?;
                let cid_bytes = read_bytes(&mut cursor).ok_or_else(|| corrupt("truncated call result"))?;
                let cid = Cid::from_bytes(cid_bytes)?;
                index
                    .calls
                    .entry(func)
                    .or_default()
                    .insert(encode_args(&args), cid);
            }
            TAG_CALL_INVALIDATE => {
                let func = read_bytes(&mut cursor).ok_or_else(|| corrupt("truncated invalidate func"))?;
                let func = String::from_utf8(func.to_vec()).map_err(|_| corrupt("non-utf8 func name"))?;
                index.calls.remove(&func);
            }
            _ => return Err(corrupt("unknown CAR record tag")),
        }
    }
    Ok(index)
}

fn corrupt(msg: &'static str) -> StoreError {
    StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

impl Store for CarStore {
    fn get_optional(&self, cid: &Cid) -> Result<Option<Node>, StoreError> {
        if let Some(inline) = cid.inline_content() {
            return Ok(Some(Node::load_from_ipld(cid, inline)?));
        }
        let index = self.index.lock().unwrap();
        match index.blocks.get(&cid.as_bytes()) {
            Some(bytes) => Ok(Some(Node::load_from_ipld(cid, bytes)?)),
            None => Ok(None),
        }
    }

    fn resolve_optional(&self, name: &Name) -> Result<Option<Cid>, StoreError> {
        let index = self.index.lock().unwrap();
        match name {
            Name::Cid(cid) => Ok(Some(cid.clone())),
            Name::Head(n) => Ok(index.heads.get(n).cloned()),
            Name::Call(call) => {
                let key = encode_args(&call.args);
                Ok(index
                    .calls
                    .get(&call.name)
                    .and_then(|m| m.get(&key))
                    .cloned())
            }
        }
    }

    fn put(&self, value: &Node) -> Result<Cid, StoreError> {
        let (cid, bytes) = value.save_as_ipld(false);
        if cid.hash_codec() == HashCodec::Identity {
            return Ok(cid);
        }
        {
            let index = self.index.lock().unwrap();
            if index.blocks.contains_key(&cid.as_bytes()) {
                return Ok(cid);
            }
        }
        let mut record = vec![TAG_BLOCK];
        push_bytes(&mut record, &cid.as_bytes());
        push_bytes(&mut record, &bytes);
        self.append(&record)?;
        self.index
            .lock()
            .unwrap()
            .blocks
            .insert(cid.as_bytes(), bytes);
        Ok(cid)
    }

    fn set(&self, name: &Name, cid: &Cid) -> Result<(), StoreError> {
        match name {
            Name::Head(n) => {
                let mut record = vec![TAG_HEAD_SET];
                push_bytes(&mut record, n.as_bytes());
                push_bytes(&mut record, &cid.as_bytes());
                self.append(&record)?;
                self.index.lock().unwrap().heads.insert(n.clone(), cid.clone());
                Ok(())
            }
            Name::Call(call) => {
                let mut record = vec![TAG_CALL_SET];
                push_bytes(&mut record, call.name.as_bytes());
                record.extend_from_slice(&encode_args(&call.args));
                push_bytes(&mut record, &cid.as_bytes());
                self.append(&record)?;
                self.index
                    .lock()
                    .unwrap()
                    .calls
                    .entry(call.name.clone())
                    .or_default()
                    .insert(encode_args(&call.args), cid.clone());
                Ok(())
            }
            Name::Cid(_) => Err(StoreError::SetOnCidName),
        }
    }

    fn list_names_using(&self, target: &Cid) -> Result<Vec<Name>, StoreError> {
        let index = self.index.lock().unwrap();
        let heads = index.heads.iter().map(|(n, c)| (n.clone(), c.clone()));
        let calls = index.calls.iter().flat_map(|(func, by_args)| {
            by_args.iter().map(move |(args_key, cid)| {
                let mut cursor: &[u8] = args_key;
                let args = decode_args(&mut cursor).unwrap_or_default();
                (Call::new(func.clone(), args), cid.clone())
            })
        });
        let get = |cid: &Cid| -> Option<Node> {
            if let Some(inline) = cid.inline_content() {
                return Node::load_from_ipld(cid, inline).ok();
            }
            index
                .blocks
                .get(&cid.as_bytes())
                .and_then(|bytes| Node::load_from_ipld(cid, bytes).ok())
        };
        Ok(scan_names_using(heads, calls, get, target))
    }

    fn list_funcs(&self) -> Result<Vec<String>, StoreError> {
        let index = self.index.lock().unwrap();
        Ok(index.calls.keys().cloned().collect())
    }

    fn each_head(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<(), StoreError> {
        let index = self.index.lock().unwrap();
        for name in index.heads.keys() {
            if f(name) {
                break;
            }
        }
        Ok(())
    }

    fn each_call(&self, func: &str, f: &mut dyn FnMut(&Call) -> bool) -> Result<(), StoreError> {
        let index = self.index.lock().unwrap();
        if let Some(by_args) = index.calls.get(func) {
            for args_key in by_args.keys() {
                let mut cursor: &[u8] = args_key;
                if let Some(args) = decode_args(&mut cursor) {
                    let call = Call::new(func, args);
                    if f(&call) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn head_delete(&self, name: &str) -> Result<(), StoreError> {
        let mut record = vec![TAG_HEAD_DELETE];
        push_bytes(&mut record, name.as_bytes());
        self.append(&record)?;
        self.index.lock().unwrap().heads.remove(name);
        Ok(())
    }

    fn call_invalidate(&self, func: &str) -> Result<(), StoreError> {
        let mut record = vec![TAG_CALL_INVALIDATE];
        push_bytes(&mut record, func.as_bytes());
        self.append(&record)?;
        self.index.lock().unwrap().calls.remove(func);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("memodb-car-test-{}-{}.car", name, std::process::id()))
    }

    #[test]
    fn put_then_get_round_trips() {
        let path = temp_path("put-get");
        let _ = std::fs::remove_file(&path);
        let store = CarStore::open(path.to_str().unwrap(), true).unwrap();
        let node = Node::utf8_string("car archive content".repeat(10));
        let cid = store.put(&node).unwrap();
        assert_eq!(store.get(&cid).unwrap(), node);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopening_replays_the_archive() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);
        let cid;
        {
            let store = CarStore::open(path.to_str().unwrap(), true).unwrap();
            let node = Node::utf8_string("persisted across reopen".repeat(5));
            cid = store.put(&node).unwrap();
            store.head_set("latest", &cid).unwrap();
        }
        {
            let store = CarStore::open(path.to_str().unwrap(), false).unwrap();
            assert_eq!(store.head_get("latest").unwrap(), cid);
            assert!(store.has(&Name::Cid(cid)).unwrap());
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn head_delete_never_touches_blocks() {
        let path = temp_path("delete");
        let _ = std::fs::remove_file(&path);
        let store = CarStore::open(path.to_str().unwrap(), true).unwrap();
        let node = Node::utf8_string("still here after head delete".repeat(5));
        let cid = store.put(&node).unwrap();
        store.head_set("latest", &cid).unwrap();
        store.head_delete("latest").unwrap();
        assert_eq!(store.get(&cid).unwrap(), node);
        let _ = std::fs::remove_file(&path);
    }
}
