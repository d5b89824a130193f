//! Commitment pipeline: touch accumulator, hex-patricia driver, periodic
//! trie-state checkpoints, and the merge-time rewrite of branch records
//! that embed references into account/storage value files.
//!
//! A *short key* is `file_step_be_u16 || minimal_be(offset)` pointing at a
//! record inside a `.kv` file; a *long key* is the raw 20-byte address or
//! 52-byte address||slot.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::{
    domain::Domain,
    ef::{put_uvarint, take_uvarint},
    error::{Result, StrataError},
    files::FileItem,
    kv::{KvRead, RwTxn},
};

pub const ADDR_LEN: usize = 20;
pub const HASH_LEN: usize = 32;
pub const STORAGE_KEY_LEN: usize = ADDR_LEN + HASH_LEN;

/// Reserved domain key under which trie state checkpoints are stored.
pub const STATE_KEY: &[u8] = b"state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentMode {
    Disabled,
    /// The trie re-reads current values for every touched key.
    Direct,
    /// The trie consumes structured updates decoded at touch time.
    Update,
}

pub mod flags {
    pub const BALANCE: u8 = 1;
    pub const NONCE: u8 = 2;
    pub const CODE: u8 = 4;
    pub const STORAGE: u8 = 8;
    pub const DELETE: u8 = 16;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitmentUpdate {
    pub flags: u8,
    pub nonce: u64,
    pub balance: Vec<u8>,
    pub code_hash: [u8; HASH_LEN],
    pub storage: Vec<u8>,
}

/// Account payload layout shared with the execution engine: nonce varint,
/// then a length-prefixed balance.
pub fn encode_account(nonce: u64, balance: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(balance.len() + 10);
    put_uvarint(&mut out, nonce);
    put_uvarint(&mut out, balance.len() as u64);
    out.extend_from_slice(balance);
    out
}

pub fn decode_account(raw: &[u8]) -> Result<(u64, Vec<u8>)> {
    let mut pos = 0usize;
    let nonce = take_uvarint(raw, &mut pos)?;
    let balance_len = take_uvarint(raw, &mut pos)? as usize;
    let end = pos
        .checked_add(balance_len)
        .filter(|&e| e <= raw.len())
        .ok_or_else(|| StrataError::Corruption("account payload truncated".into()))?;
    Ok((nonce, raw[pos..end].to_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchKind {
    Account,
    Storage,
    Code,
}

impl TouchKind {
    pub fn bit(self) -> u8 {
        match self {
            Self::Account => 1,
            Self::Storage => 2,
            Self::Code => 4,
        }
    }
}

#[derive(Debug, Clone)]
struct CommitmentItem {
    plain_key: Vec<u8>,
    update: CommitmentUpdate,
    kinds: u8,
}

fn keccak(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `keccak(addr) || keccak(slot)` (slot part only for composite keys),
/// spread into one nibble per output byte.
pub fn hash_and_nibblize(key: &[u8]) -> Vec<u8> {
    let addr_part = &key[..key.len().min(ADDR_LEN)];
    let mut hashed = keccak(addr_part).to_vec();
    if key.len() > ADDR_LEN {
        hashed.extend_from_slice(&keccak(&key[ADDR_LEN..]));
    }
    let mut nibblized = Vec::with_capacity(hashed.len() * 2);
    for byte in hashed {
        nibblized.push(byte >> 4);
        nibblized.push(byte & 0x0f);
    }
    nibblized
}

/// Branch record payload: the account and storage references under one
/// trie branch. References are long keys when they originate from MDB
/// rows and short keys once rewritten against value files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchData {
    pub account_keys: Vec<Vec<u8>>,
    pub storage_keys: Vec<Vec<u8>>,
}

impl BranchData {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_uvarint(&mut out, self.account_keys.len() as u64);
        for key in &self.account_keys {
            put_uvarint(&mut out, key.len() as u64);
            out.extend_from_slice(key);
        }
        put_uvarint(&mut out, self.storage_keys.len() as u64);
        for key in &self.storage_keys {
            put_uvarint(&mut out, key.len() as u64);
            out.extend_from_slice(key);
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let mut take_list = |pos: &mut usize| -> Result<Vec<Vec<u8>>> {
            let count = take_uvarint(raw, pos)? as usize;
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                let len = take_uvarint(raw, pos)? as usize;
                let end = pos
                    .checked_add(len)
                    .filter(|&e| e <= raw.len())
                    .ok_or_else(|| StrataError::Corruption("branch key truncated".into()))?;
                keys.push(raw[*pos..end].to_vec());
                *pos = end;
            }
            Ok(keys)
        };
        let account_keys = take_list(&mut pos)?;
        let storage_keys = take_list(&mut pos)?;
        if pos != raw.len() {
            return Err(StrataError::Corruption("trailing bytes in branch record".into()));
        }
        Ok(Self {
            account_keys,
            storage_keys,
        })
    }
}

/// Minimal-length big-endian encoding, 1 to 8 bytes.
pub fn encode_u64_min(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    bytes[skip..].to_vec()
}

pub fn encode_shortened_key(file_step: u16, offset: u64) -> Vec<u8> {
    let mut out = file_step.to_be_bytes().to_vec();
    out.extend_from_slice(&encode_u64_min(offset));
    out
}

pub fn decode_shortened_key(raw: &[u8]) -> Result<(u16, u64)> {
    if raw.len() < 3 || raw.len() > 10 {
        return Err(StrataError::Corruption(format!(
            "shortened key must be 3..=10 bytes, got {}",
            raw.len()
        )));
    }
    let file_step = u16::from_be_bytes(raw[..2].try_into().expect("2-byte prefix"));
    let mut offset = 0u64;
    for &byte in &raw[2..] {
        offset = (offset << 8) | u64::from(byte);
    }
    Ok((file_step, offset))
}

/// Deterministic nibble trie over hashed keys. Stands in for the external
/// hex-patricia trie: same driver contract (process updates, root hash,
/// encode/set state, branch records carrying plain-key references),
/// without Ethereum's node encoding.
#[derive(Debug, Default)]
pub struct HexPatriciaTrie {
    leaves: BTreeMap<Vec<u8>, TrieLeaf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrieLeaf {
    value_hash: [u8; HASH_LEN],
    plain_key: Vec<u8>,
}

fn update_digest(update: &CommitmentUpdate) -> [u8; HASH_LEN] {
    let mut buf = Vec::new();
    buf.push(update.flags);
    put_uvarint(&mut buf, update.nonce);
    put_uvarint(&mut buf, update.balance.len() as u64);
    buf.extend_from_slice(&update.balance);
    buf.extend_from_slice(&update.code_hash);
    put_uvarint(&mut buf, update.storage.len() as u64);
    buf.extend_from_slice(&update.storage);
    keccak(&buf)
}

impl HexPatriciaTrie {
    pub fn process_updates(
        &mut self,
        plain_keys: &[Vec<u8>],
        hashed_keys: &[Vec<u8>],
        updates: &[CommitmentUpdate],
    ) -> Result<([u8; HASH_LEN], BTreeMap<Vec<u8>, BranchData>)> {
        let mut touched_prefixes = std::collections::BTreeSet::new();
        for ((plain, hashed), update) in plain_keys.iter().zip(hashed_keys).zip(updates) {
            touched_prefixes.insert(vec![hashed[0]]);
            if update.flags & flags::DELETE != 0 {
                self.leaves.remove(hashed);
            } else {
                self.leaves.insert(
                    hashed.clone(),
                    TrieLeaf {
                        value_hash: update_digest(update),
                        plain_key: plain.clone(),
                    },
                );
            }
        }
        let mut branches = BTreeMap::new();
        for prefix in touched_prefixes {
            let mut branch = BranchData::default();
            for leaf in self
                .leaves
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(_, leaf)| leaf)
            {
                if leaf.plain_key.len() == STORAGE_KEY_LEN {
                    branch.storage_keys.push(leaf.plain_key.clone());
                } else {
                    branch.account_keys.push(leaf.plain_key.clone());
                }
            }
            branches.insert(prefix, branch);
        }
        Ok((self.root_hash(), branches))
    }

    pub fn root_hash(&self) -> [u8; HASH_LEN] {
        let entries: Vec<(&Vec<u8>, &TrieLeaf)> = self.leaves.iter().collect();
        Self::node_hash(&entries, 0)
    }

    fn node_hash(entries: &[(&Vec<u8>, &TrieLeaf)], depth: usize) -> [u8; HASH_LEN] {
        if entries.is_empty() {
            return keccak(&[]);
        }
        if entries.len() == 1 {
            let (key, leaf) = entries[0];
            let mut buf = Vec::with_capacity(1 + key.len() + HASH_LEN);
            buf.push(0x00);
            buf.extend_from_slice(key);
            buf.extend_from_slice(&leaf.value_hash);
            return keccak(&buf);
        }
        let mut buf = vec![0x01];
        let mut start = 0usize;
        while start < entries.len() {
            let nibble = entries[start].0.get(depth).copied().unwrap_or(0);
            let mut end = start;
            while end < entries.len() && entries[end].0.get(depth).copied().unwrap_or(0) == nibble {
                end += 1;
            }
            buf.push(nibble);
            buf.extend_from_slice(&Self::node_hash(&entries[start..end], depth + 1));
            start = end;
        }
        keccak(&buf)
    }

    pub fn reset(&mut self) {
        self.leaves.clear();
    }

    pub fn encode_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_uvarint(&mut out, self.leaves.len() as u64);
        for (key, leaf) in &self.leaves {
            put_uvarint(&mut out, key.len() as u64);
            out.extend_from_slice(key);
            out.extend_from_slice(&leaf.value_hash);
            put_uvarint(&mut out, leaf.plain_key.len() as u64);
            out.extend_from_slice(&leaf.plain_key);
        }
        out
    }

    pub fn set_state(&mut self, raw: &[u8]) -> Result<()> {
        let mut leaves = BTreeMap::new();
        let mut pos = 0usize;
        let count = take_uvarint(raw, &mut pos)? as usize;
        for _ in 0..count {
            let key_len = take_uvarint(raw, &mut pos)? as usize;
            let key_end = pos
                .checked_add(key_len)
                .filter(|&e| e <= raw.len())
                .ok_or_else(|| StrataError::Corruption("trie state truncated".into()))?;
            let key = raw[pos..key_end].to_vec();
            pos = key_end;
            let hash_end = pos
                .checked_add(HASH_LEN)
                .filter(|&e| e <= raw.len())
                .ok_or_else(|| StrataError::Corruption("trie state truncated".into()))?;
            let mut value_hash = [0u8; HASH_LEN];
            value_hash.copy_from_slice(&raw[pos..hash_end]);
            pos = hash_end;
            let plain_len = take_uvarint(raw, &mut pos)? as usize;
            let plain_end = pos
                .checked_add(plain_len)
                .filter(|&e| e <= raw.len())
                .ok_or_else(|| StrataError::Corruption("trie state truncated".into()))?;
            let plain_key = raw[pos..plain_end].to_vec();
            pos = plain_end;
            leaves.insert(key, TrieLeaf { value_hash, plain_key });
        }
        if pos != raw.len() {
            return Err(StrataError::Corruption("trailing bytes in trie state".into()));
        }
        self.leaves = leaves;
        Ok(())
    }
}

/// Checkpoint record: `txnum_be8 || blocknum_be8 || len_be2 || trie_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentState {
    pub tx_num: u64,
    pub block_num: u64,
    pub trie_state: Vec<u8>,
}

impl CommitmentState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u16::try_from(self.trie_state.len()).map_err(|_| {
            StrataError::Invariant(format!(
                "trie state of {} bytes exceeds checkpoint record limit",
                self.trie_state.len()
            ))
        })?;
        let mut out = Vec::with_capacity(18 + self.trie_state.len());
        out.extend_from_slice(&self.tx_num.to_be_bytes());
        out.extend_from_slice(&self.block_num.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.trie_state);
        Ok(out)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 18 {
            return Err(StrataError::Corruption(format!(
                "commitment state record too short: {} bytes",
                raw.len()
            )));
        }
        let tx_num = u64::from_be_bytes(raw[..8].try_into().expect("8 bytes"));
        let block_num = u64::from_be_bytes(raw[8..16].try_into().expect("8 bytes"));
        let len = u16::from_be_bytes(raw[16..18].try_into().expect("2 bytes")) as usize;
        if raw.len() != 18 + len {
            return Err(StrataError::Corruption(format!(
                "commitment state length mismatch: header says {len}, payload has {}",
                raw.len() - 18
            )));
        }
        Ok(Self {
            tx_num,
            block_num,
            trie_state: raw[18..].to_vec(),
        })
    }
}

/// The commitment domain: a `Domain` holding branch records and trie
/// checkpoints, plus the writer-owned touch accumulator and trie.
pub struct CommitmentDomain {
    pub domain: Domain,
    mode: Mutex<CommitmentMode>,
    accumulator: Mutex<BTreeMap<Vec<u8>, CommitmentItem>>,
    trie: Mutex<HexPatriciaTrie>,
}

impl CommitmentDomain {
    pub fn new(domain: Domain, mode: CommitmentMode) -> Self {
        Self {
            domain,
            mode: Mutex::new(mode),
            accumulator: Mutex::new(BTreeMap::new()),
            trie: Mutex::new(HexPatriciaTrie::default()),
        }
    }

    pub fn mode(&self) -> CommitmentMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: CommitmentMode) {
        *self.mode.lock() = mode;
    }

    /// Marks `plain_key` as updated. In `Update` mode, `value` is decoded
    /// into a structured update and merged with any earlier touch of the
    /// same hashed key.
    pub fn touch_plain_key(&self, plain_key: &[u8], value: &[u8], kind: TouchKind) -> Result<()> {
        let mode = self.mode();
        if mode == CommitmentMode::Disabled {
            return Ok(());
        }
        let hashed = hash_and_nibblize(plain_key);
        let mut accumulator = self.accumulator.lock();
        let existing = accumulator.get(&hashed);
        let mut item = CommitmentItem {
            plain_key: plain_key.to_vec(),
            update: CommitmentUpdate::default(),
            kinds: existing.map(|it| it.kinds).unwrap_or(0) | kind.bit(),
        };
        if mode == CommitmentMode::Update {
            let existing = existing.map(|it| it.update.clone());
            item.update = decode_touch(kind, value, existing.as_ref())?;
        }
        accumulator.insert(hashed, item);
        Ok(())
    }

    fn drain(&self) -> Vec<(Vec<u8>, Vec<u8>, CommitmentUpdate, u8)> {
        let mut accumulator = self.accumulator.lock();
        std::mem::take(&mut *accumulator)
            .into_iter()
            .map(|(hashed, item)| (item.plain_key, hashed, item.update, item.kinds))
            .collect()
    }

    /// Drains the accumulator in hashed-key order. Cleared regardless of
    /// mode.
    pub fn touched_key_list(&self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>, Vec<CommitmentUpdate>) {
        let mut plain = Vec::new();
        let mut hashed = Vec::new();
        let mut updates = Vec::new();
        for (plain_key, hashed_key, update, _) in self.drain() {
            plain.push(plain_key);
            hashed.push(hashed_key);
            updates.push(update);
        }
        (plain, hashed, updates)
    }

    /// Evaluates the trie over the accumulated touches. `fetch` supplies
    /// the structured update for a plain key in `Direct` mode, given the
    /// bitmask of touch kinds recorded for it.
    pub fn compute_commitment(
        &self,
        fetch: &dyn Fn(&[u8], u8) -> Result<CommitmentUpdate>,
    ) -> Result<([u8; HASH_LEN], BTreeMap<Vec<u8>, BranchData>)> {
        let mode = self.mode();
        let drained = self.drain();
        if drained.is_empty() {
            return Ok((self.trie.lock().root_hash(), BTreeMap::new()));
        }
        let mut plain = Vec::with_capacity(drained.len());
        let mut hashed = Vec::with_capacity(drained.len());
        let mut updates = Vec::with_capacity(drained.len());
        for (plain_key, hashed_key, update, kinds) in drained {
            let update = match mode {
                CommitmentMode::Direct => fetch(&plain_key, kinds)?,
                CommitmentMode::Update => update,
                CommitmentMode::Disabled => {
                    return Err(StrataError::Invariant(
                        "compute_commitment called with commitment disabled".into(),
                    ));
                }
            };
            plain.push(plain_key);
            hashed.push(hashed_key);
            updates.push(update);
        }
        self.trie.lock().process_updates(&plain, &hashed, &updates)
    }

    /// Persists the trie state under the reserved key, sub-keyed by step.
    pub fn store_commitment_state(
        &self,
        txn: &mut RwTxn,
        block_num: u64,
        tx_num: u64,
    ) -> Result<()> {
        let state = CommitmentState {
            tx_num,
            block_num,
            trie_state: self.trie.lock().encode_state(),
        };
        let step = (tx_num / self.domain.step_size) as u16;
        self.domain
            .put(txn, STATE_KEY, &step.to_be_bytes(), tx_num, &state.encode()?)
    }

    /// Scans upward in step units from `since_tx - 1` and restores the
    /// highest checkpoint whose decoded txnum matches its step. Returns
    /// the checkpoint's `(tx_num, block_num)`, `None` when no checkpoint
    /// exists, and `Corruption` when one exists but cannot be decoded.
    pub fn seek_commitment(
        &self,
        reader: &dyn KvRead,
        since_tx: u64,
    ) -> Result<Option<(u64, u64)>> {
        let step_size = self.domain.step_size;
        let mut step = (since_tx / step_size).saturating_sub(1);
        let mut latest: Option<Vec<u8>> = None;
        loop {
            let mut key = STATE_KEY.to_vec();
            key.extend_from_slice(&(step as u16).to_be_bytes());
            let Some(raw) = self.domain.get_latest(&key, reader)? else {
                break;
            };
            if raw.len() < 8 {
                break;
            }
            let tx_num = u64::from_be_bytes(raw[..8].try_into().expect("8 bytes"));
            if tx_num / step_size != step {
                break;
            }
            latest = Some(raw);
            step = tx_num / step_size + 1;
        }
        let Some(raw) = latest else {
            return Ok(None);
        };
        let state = CommitmentState::decode(&raw)?;
        self.trie.lock().set_state(&state.trie_state)?;
        Ok(Some((state.tx_num, state.block_num)))
    }

    pub fn root_hash(&self) -> [u8; HASH_LEN] {
        self.trie.lock().root_hash()
    }

    /// Resolves a short key against `files`. Short keys encode the step
    /// their file ends at, and live file ranges are disjoint, so at most
    /// one file is the legitimate target; an offset outside that file is
    /// corruption, not a miss. `Ok(None)` means no live file ends at the
    /// encoded step.
    pub fn lookup_shortened_key(
        &self,
        reference: &[u8],
        files: &[Arc<FileItem>],
    ) -> Result<Option<Vec<u8>>> {
        let (file_step, offset) = decode_shortened_key(reference)?;
        let expected_tx = u64::from(file_step) * self.domain.step_size;
        for file in files {
            if file.end_tx != expected_tx {
                continue;
            }
            if offset >= file.data.size() {
                return Err(StrataError::Corruption(format!(
                    "shortened key offset {offset} outside {}-byte file ending at {}",
                    file.data.size(),
                    file.end_tx
                )));
            }
            let mut getter = file.data.getter();
            getter.reset(offset);
            return Ok(Some(getter.next()?.to_vec()));
        }
        Ok(None)
    }

    /// Re-encodes a long key as a short key into one of `files`.
    pub fn replace_key_with_reference(
        &self,
        long_key: &[u8],
        files: &[Arc<FileItem>],
    ) -> Option<Vec<u8>> {
        for file in files {
            if let Some(offset) = file.index.lookup(long_key) {
                let file_step = (file.end_tx / self.domain.step_size) as u16;
                return Some(encode_shortened_key(file_step, offset));
            }
        }
        None
    }

    /// Rewrites every embedded reference in a branch record: resolve to
    /// the long key against the outgoing files, then re-shorten against
    /// the merged files. A short key that resolves into no outgoing file
    /// has already lost its target and fails the merge as corruption;
    /// long keys with no slot in the merged files stay long.
    pub fn commitment_val_transform(
        &self,
        raw: &[u8],
        old_accounts: &[Arc<FileItem>],
        old_storage: &[Arc<FileItem>],
        new_accounts: &[Arc<FileItem>],
        new_storage: &[Arc<FileItem>],
    ) -> Result<Vec<u8>> {
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let mut branch = BranchData::decode(raw)?;
        for key in &mut branch.account_keys {
            *key = self.transform_reference(key, ADDR_LEN, old_accounts, new_accounts)?;
        }
        for key in &mut branch.storage_keys {
            *key = self.transform_reference(key, STORAGE_KEY_LEN, old_storage, new_storage)?;
        }
        Ok(branch.encode())
    }

    fn transform_reference(
        &self,
        reference: &[u8],
        long_len: usize,
        old_files: &[Arc<FileItem>],
        new_files: &[Arc<FileItem>],
    ) -> Result<Vec<u8>> {
        let long_key = if reference.len() == long_len {
            reference.to_vec()
        } else {
            // The outgoing files are about to be retired; a reference
            // none of them can resolve would dangle forever.
            self.lookup_shortened_key(reference, old_files)?
                .ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "branch reference {} resolves into no outgoing file",
                        hex::encode(reference)
                    ))
                })?
        };
        Ok(self
            .replace_key_with_reference(&long_key, new_files)
            .unwrap_or(long_key))
    }
}

pub(crate) fn decode_touch(
    kind: TouchKind,
    value: &[u8],
    existing: Option<&CommitmentUpdate>,
) -> Result<CommitmentUpdate> {
    let mut update = CommitmentUpdate::default();
    match kind {
        TouchKind::Account => {
            if value.is_empty() {
                update.flags = flags::DELETE;
                return Ok(update);
            }
            let (nonce, balance) = decode_account(value)?;
            update.nonce = nonce;
            update.balance = balance;
            update.flags = flags::BALANCE | flags::NONCE;
            // An earlier code touch on the same key keeps its code hash.
            if let Some(existing) = existing {
                if existing.flags & flags::CODE != 0 {
                    update.flags |= flags::CODE;
                    update.code_hash = existing.code_hash;
                }
            }
        }
        TouchKind::Storage => {
            if value.is_empty() {
                update.flags = flags::DELETE;
            } else {
                update.flags = flags::STORAGE;
                update.storage = value.to_vec();
            }
        }
        TouchKind::Code => {
            update.flags = flags::CODE;
            update.code_hash = keccak(value);
            if let Some(existing) = existing {
                if existing.flags & flags::BALANCE != 0 {
                    update.flags |= flags::BALANCE;
                    update.balance = existing.balance.clone();
                }
                if existing.flags & flags::NONCE != 0 {
                    update.flags |= flags::NONCE;
                    update.nonce = existing.nonce;
                }
                if existing.flags == flags::DELETE && value.is_empty() {
                    update.flags = flags::DELETE;
                }
            }
        }
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Mdb;
    use tempfile::tempdir;

    fn new_commitment(dir: &std::path::Path, mode: CommitmentMode) -> CommitmentDomain {
        let domain = Domain::new(dir.join("snapshots"), "commitment", 4).unwrap();
        CommitmentDomain::new(domain, mode)
    }

    fn addr(tag: u8) -> Vec<u8> {
        vec![tag; ADDR_LEN]
    }

    fn storage_key(tag: u8) -> Vec<u8> {
        vec![tag; STORAGE_KEY_LEN]
    }

    #[test]
    fn shortened_key_round_trip() {
        for offset in [0u64, 1, 255, 256, 65_536, 1 << 40, u64::MAX] {
            let short = encode_shortened_key(7, offset);
            assert!(short.len() >= 3 && short.len() <= 10);
            assert_eq!(decode_shortened_key(&short).unwrap(), (7, offset));
        }
        assert!(decode_shortened_key(&[0, 1]).is_err());
        assert!(decode_shortened_key(&[0; 11]).is_err());
    }

    #[test]
    fn commitment_state_record_round_trip() {
        let state = CommitmentState {
            tx_num: 42,
            block_num: 7,
            trie_state: b"trie".to_vec(),
        };
        let encoded = state.encode().unwrap();
        assert_eq!(CommitmentState::decode(&encoded).unwrap(), state);
        assert!(CommitmentState::decode(&encoded[..10]).is_err());
        let mut bad = encoded.clone();
        bad.push(0);
        assert!(CommitmentState::decode(&bad).is_err());
    }

    #[test]
    fn account_and_code_touches_merge() {
        let dir = tempdir().unwrap();
        let commitment = new_commitment(dir.path(), CommitmentMode::Update);
        let key = addr(0xaa);

        commitment
            .touch_plain_key(&key, b"contract code", TouchKind::Code)
            .unwrap();
        commitment
            .touch_plain_key(&key, &encode_account(3, b"\x64"), TouchKind::Account)
            .unwrap();

        let (plain, hashed, updates) = commitment.touched_key_list();
        assert_eq!(plain, vec![key.clone()]);
        assert_eq!(hashed[0], hash_and_nibblize(&key));
        let update = &updates[0];
        assert_eq!(
            update.flags,
            flags::BALANCE | flags::NONCE | flags::CODE,
            "later account touch keeps the earlier code hash"
        );
        assert_eq!(update.nonce, 3);
        assert_eq!(update.code_hash, keccak(b"contract code"));

        // The drain cleared the accumulator.
        assert!(commitment.touched_key_list().0.is_empty());
    }

    #[test]
    fn direct_and_update_modes_agree_on_root() {
        let dir = tempdir().unwrap();
        let balance = b"\x0a".to_vec();
        let account = addr(0x11);
        let slot = storage_key(0x22);
        let code_owner = addr(0x33);

        let account_value = encode_account(1, &balance);
        let fetch = |key: &[u8], _kinds: u8| -> Result<CommitmentUpdate> {
            if key == account.as_slice() {
                decode_touch(TouchKind::Account, &account_value, None)
            } else if key == slot.as_slice() {
                decode_touch(TouchKind::Storage, b"sv", None)
            } else {
                decode_touch(TouchKind::Code, b"code", None)
            }
        };

        let direct = new_commitment(&dir.path().join("direct"), CommitmentMode::Direct);
        direct.touch_plain_key(&account, &account_value, TouchKind::Account).unwrap();
        direct.touch_plain_key(&slot, b"sv", TouchKind::Storage).unwrap();
        direct.touch_plain_key(&code_owner, b"code", TouchKind::Code).unwrap();
        let (direct_root, direct_branches) = direct.compute_commitment(&fetch).unwrap();

        let update = new_commitment(&dir.path().join("update"), CommitmentMode::Update);
        update.touch_plain_key(&account, &account_value, TouchKind::Account).unwrap();
        update.touch_plain_key(&slot, b"sv", TouchKind::Storage).unwrap();
        update.touch_plain_key(&code_owner, b"code", TouchKind::Code).unwrap();
        let (update_root, _) = update.compute_commitment(&fetch).unwrap();

        assert_eq!(direct_root, update_root);
        assert!(!direct_branches.is_empty());
        // Idempotent root once drained: recomputing without touches keeps it.
        let (again, branches) = direct.compute_commitment(&fetch).unwrap();
        assert_eq!(again, direct_root);
        assert!(branches.is_empty());
    }

    #[test]
    fn checkpoint_store_and_seek() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let commitment = new_commitment(dir.path(), CommitmentMode::Update);

        commitment
            .touch_plain_key(&addr(0x55), &encode_account(1, b"\x01"), TouchKind::Account)
            .unwrap();
        let fetch = |_: &[u8], _: u8| -> Result<CommitmentUpdate> { unreachable!("update mode") };
        let (root, _) = commitment.compute_commitment(&fetch).unwrap();

        let mut txn = mdb.write();
        commitment.store_commitment_state(&mut txn, 2, 7).unwrap();
        txn.commit().unwrap();

        // A fresh trie restores the checkpointed state.
        let reopened = new_commitment(dir.path(), CommitmentMode::Update);
        let ro = mdb.read();
        let found = reopened.seek_commitment(&ro, 8).unwrap();
        assert_eq!(found, Some((7, 2)));
        assert_eq!(reopened.root_hash(), root);

        // No checkpoint at all is None, not an error.
        let empty_dir = tempdir().unwrap();
        let empty_mdb = Mdb::open(&empty_dir.path().join("mdb")).unwrap();
        let empty = new_commitment(empty_dir.path(), CommitmentMode::Update);
        assert_eq!(empty.seek_commitment(&empty_mdb.read(), 8).unwrap(), None);
    }

    #[test]
    fn seek_commitment_surfaces_corruption() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let commitment = new_commitment(dir.path(), CommitmentMode::Update);

        // A record long enough to carry a txnum but with a broken payload.
        let mut bogus = 9u64.to_be_bytes().to_vec();
        bogus.extend_from_slice(&[0xff; 4]);
        let step: u16 = 2; // 9 / 4
        let mut txn = mdb.write();
        commitment
            .domain
            .put(&mut txn, STATE_KEY, &step.to_be_bytes(), 9, &bogus)
            .unwrap();
        txn.commit().unwrap();

        let err = commitment.seek_commitment(&mdb.read(), 12).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }

    #[test]
    fn branch_data_round_trip() {
        let branch = BranchData {
            account_keys: vec![addr(1), encode_shortened_key(0, 5)],
            storage_keys: vec![storage_key(2)],
        };
        let decoded = BranchData::decode(&branch.encode()).unwrap();
        assert_eq!(decoded, branch);
    }

    fn make_value_file(
        dir: &std::path::Path,
        start: u64,
        end: u64,
        key: &[u8],
    ) -> (Arc<FileItem>, u64) {
        use crate::files::{OffsetIndex, SegmentWriter};
        let mut writer =
            SegmentWriter::create(dir, &format!("accounts.{start}-{end}.kv")).unwrap();
        let offset = writer.add_word(key).unwrap();
        writer.add_word(b"value").unwrap();
        let data = writer.finish().unwrap();
        let index = OffsetIndex::build(
            dir,
            &format!("accounts.{start}-{end}.kvi"),
            &[(key.to_vec(), offset)],
        )
        .unwrap();
        (FileItem::open(data, index, start, end).unwrap(), offset)
    }

    #[test]
    fn lookup_shortened_key_validates_offsets() {
        let dir = tempdir().unwrap();
        let commitment = new_commitment(dir.path(), CommitmentMode::Update);
        let key = addr(0x44);
        let (file, offset) = make_value_file(dir.path(), 0, 4, &key);
        let files = vec![file];

        let good = encode_shortened_key(1, offset);
        assert_eq!(
            commitment.lookup_shortened_key(&good, &files).unwrap(),
            Some(key.clone())
        );

        // An offset past the end of the matched file is corruption, not a
        // miss to fall through.
        let bogus = encode_shortened_key(1, 1 << 20);
        let err = commitment.lookup_shortened_key(&bogus, &files).unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));

        // A step no live file ends at is a miss.
        assert_eq!(
            commitment
                .lookup_shortened_key(&encode_shortened_key(9, 0), &files)
                .unwrap(),
            None
        );
    }

    #[test]
    fn merge_transform_fails_on_dangling_reference() {
        let dir = tempdir().unwrap();
        let commitment = new_commitment(dir.path(), CommitmentMode::Update);

        // A short key pointing at a retired file generation cannot be
        // resolved and must fail the merge.
        let branch = BranchData {
            account_keys: vec![encode_shortened_key(9, 0)],
            storage_keys: Vec::new(),
        };
        let err = commitment
            .commitment_val_transform(&branch.encode(), &[], &[], &[], &[])
            .unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));

        // Long keys with no slot in the merged files stay long.
        let branch = BranchData {
            account_keys: vec![addr(0x55)],
            storage_keys: vec![storage_key(0x66)],
        };
        let out = commitment
            .commitment_val_transform(&branch.encode(), &[], &[], &[], &[])
            .unwrap();
        assert_eq!(BranchData::decode(&out).unwrap(), branch);

        // An out-of-range offset inside a live file surfaces through the
        // transform as well.
        let key = addr(0x77);
        let (file, _) = make_value_file(dir.path(), 0, 4, &key);
        let branch = BranchData {
            account_keys: vec![encode_shortened_key(1, 1 << 20)],
            storage_keys: Vec::new(),
        };
        let err = commitment
            .commitment_val_transform(&branch.encode(), &[file], &[], &[], &[])
            .unwrap_err();
        assert!(matches!(err, StrataError::Corruption(_)));
    }
}
