//! Ordered-table abstraction over RocksDB.
//!
//! Logical tables share one keyspace: every row key is
//! `table || 0x1F || key`. Dup-sorted tables are emulated by folding the
//! duplicate value into the key suffix, which keeps every cursor pattern
//! the components rely on (seek-both-range becomes a plain range seek).

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    path::Path,
    sync::Arc,
};

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::error::{Result, StrataError};

const SEP: u8 = 0x1F;
const SEQUENCES_TABLE: &str = "sequences";

/// Fixed table names for one history-bearing component.
#[derive(Debug, Clone)]
pub struct Tables {
    pub keys: String,
    pub idx: String,
    pub history_vals: String,
    pub settings: String,
}

impl Tables {
    pub fn for_component(base: &str) -> Self {
        Self {
            keys: format!("{base}.keys"),
            idx: format!("{base}.idx"),
            history_vals: format!("{base}.history_vals"),
            settings: format!("{base}.settings"),
        }
    }
}

pub fn full_key(table: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(table.len() + 1 + key.len());
    out.extend_from_slice(table.as_bytes());
    out.push(SEP);
    out.extend_from_slice(key);
    out
}

/// Smallest byte string strictly greater than every string with `prefix`.
/// `None` means the prefix is all 0xff and has no upper bound.
fn next_subtree(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

pub struct Mdb {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Arc<Mutex<()>>,
}

impl Mdb {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)?;
        Ok(Arc::new(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }))
    }

    pub fn open_read_only(path: &Path) -> Result<Arc<Self>> {
        let options = Options::default();
        let db = DBWithThreadMode::<MultiThreaded>::open_for_read_only(&options, path, false)?;
        Ok(Arc::new(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }))
    }

    /// Read view over currently committed state.
    pub fn read(self: &Arc<Self>) -> RoTxn {
        RoTxn {
            mdb: Arc::clone(self),
        }
    }

    /// Write transaction. Takes the store-wide write lock; at most one
    /// writer exists at a time and readers are never blocked.
    pub fn write(self: &Arc<Self>) -> RwTxn {
        let guard = Mutex::lock_arc(&self.write_lock);
        RwTxn {
            mdb: Arc::clone(self),
            _guard: guard,
            pending: BTreeMap::new(),
            last_append: HashMap::new(),
        }
    }

    fn raw_get(&self, full: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(full)?)
    }

    fn raw_iter(
        &self,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        reverse: bool,
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_ {
        let mode_key;
        let mode = if reverse {
            match &end {
                // Exclusive upper bound: start just below it.
                Bound::Excluded(k) | Bound::Included(k) => {
                    mode_key = k.clone();
                    IteratorMode::From(&mode_key, Direction::Reverse)
                }
                Bound::Unbounded => IteratorMode::End,
            }
        } else {
            match &start {
                Bound::Included(k) | Bound::Excluded(k) => {
                    mode_key = k.clone();
                    IteratorMode::From(&mode_key, Direction::Forward)
                }
                Bound::Unbounded => IteratorMode::Start,
            }
        };
        let (start2, end2) = (start.clone(), end.clone());
        self.db
            .iterator(mode)
            .map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(StrataError::from)
            })
            .take_while(move |item| match item {
                Err(_) => true,
                // The rocksdb iterator runs to the end of the keyspace;
                // stop once past the window.
                Ok((k, _)) => !past_window(k, &start2, &end2, reverse),
            })
            .filter(move |item| match item {
                Err(_) => true,
                Ok((k, _)) => in_bounds(k, &start, &end),
            })
    }
}

fn in_bounds(key: &[u8], start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> bool {
    let lower_ok = match start {
        Bound::Included(s) => key >= s.as_slice(),
        Bound::Excluded(s) => key > s.as_slice(),
        Bound::Unbounded => true,
    };
    let upper_ok = match end {
        Bound::Included(e) => key <= e.as_slice(),
        Bound::Excluded(e) => key < e.as_slice(),
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok
}

fn past_window(key: &[u8], start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>, reverse: bool) -> bool {
    if reverse {
        match start {
            Bound::Included(s) => key < s.as_slice(),
            Bound::Excluded(s) => key <= s.as_slice(),
            Bound::Unbounded => false,
        }
    } else {
        match end {
            Bound::Included(e) => key > e.as_slice(),
            Bound::Excluded(e) => key >= e.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

/// Narrow read capability shared by committed views and the writer's own
/// transaction, so "with recent" read paths can observe uncommitted rows.
pub trait KvRead {
    fn get_one(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ascending scan of `[from, to)` within a table. `None` bounds are
    /// open. `limit < 0` means unbounded.
    fn range_ascend(
        &self,
        table: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Descending scan: keys strictly below `below`, down to `down_to`
    /// (inclusive). `None` bounds are open. `limit < 0` means unbounded.
    fn range_descend(
        &self,
        table: &str,
        below: Option<&[u8]>,
        down_to: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn has(&self, table: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get_one(table, key)?.is_some())
    }

    fn prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end = next_subtree(prefix);
        self.range_ascend(table, Some(prefix), end.as_deref(), -1)
    }

    fn first_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        let mut rows = self.range_ascend(table, None, None, 1)?;
        Ok(rows.pop().map(|(k, _)| k))
    }

    fn last_key(&self, table: &str) -> Result<Option<Vec<u8>>> {
        let mut rows = self.range_descend(table, None, None, 1)?;
        Ok(rows.pop().map(|(k, _)| k))
    }

    fn read_sequence(&self, table: &str) -> Result<u64> {
        let current = self.get_one(SEQUENCES_TABLE, table.as_bytes())?;
        Ok(current
            .map(|v| u64::from_be_bytes(v.as_slice().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0))
    }
}

pub struct RoTxn {
    mdb: Arc<Mdb>,
}

impl RoTxn {
    fn table_bounds(
        &self,
        table: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
    ) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let start = match from {
            Some(f) => Bound::Included(full_key(table, f)),
            None => Bound::Included(full_key(table, &[])),
        };
        let end = match to {
            Some(t) => Bound::Excluded(full_key(table, t)),
            None => match next_subtree(&full_key(table, &[])) {
                Some(e) => Bound::Excluded(e),
                None => Bound::Unbounded,
            },
        };
        (start, end)
    }

    fn scan(
        &self,
        table: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        limit: i64,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (start, end) = self.table_bounds(table, from, to);
        let strip = table.len() + 1;
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        for item in self.mdb.raw_iter(start, end, reverse) {
            let (k, v) = item?;
            out.push((k[strip..].to_vec(), v));
            if limit > 0 && out.len() as i64 >= limit {
                break;
            }
        }
        Ok(out)
    }
}

impl KvRead for RoTxn {
    fn get_one(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.mdb.raw_get(&full_key(table, key))
    }

    fn range_ascend(
        &self,
        table: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(table, from, to, limit, false)
    }

    fn range_descend(
        &self,
        table: &str,
        below: Option<&[u8]>,
        down_to: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(table, down_to, below, limit, true)
    }
}

/// Write transaction with read-your-writes semantics. Mutations collect in
/// a sorted pending overlay and reach RocksDB in one `WriteBatch` on
/// commit. Dropping the transaction without committing discards them.
pub struct RwTxn {
    mdb: Arc<Mdb>,
    _guard: ArcMutexGuard<RawMutex, ()>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    last_append: HashMap<String, Vec<u8>>,
}

impl RwTxn {
    pub fn put(&mut self, table: &str, key: &[u8], value: &[u8]) {
        self.pending
            .insert(full_key(table, key), Some(value.to_vec()));
    }

    pub fn delete(&mut self, table: &str, key: &[u8]) {
        self.pending.insert(full_key(table, key), None);
    }

    /// Append requires the key to be strictly greater than everything
    /// already in the table.
    pub fn append(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let tail = match self.last_append.get(table) {
            Some(t) => Some(t.clone()),
            None => self.last_key(table)?,
        };
        if let Some(tail) = tail {
            if key <= tail.as_slice() {
                return Err(StrataError::Invariant(format!(
                    "append out of order in table {table}: {} <= {}",
                    hex::encode(key),
                    hex::encode(&tail)
                )));
            }
        }
        self.last_append.insert(table.to_string(), key.to_vec());
        self.put(table, key, value);
        Ok(())
    }

    /// Dup-sort append: the duplicate value is folded into the key suffix,
    /// and the composite must be strictly increasing.
    pub fn append_dup(&mut self, table: &str, key: &[u8], dup: &[u8]) -> Result<()> {
        let mut composite = key.to_vec();
        composite.extend_from_slice(dup);
        self.append(table, &composite, &[])
    }

    pub fn increment_sequence(&mut self, table: &str, amount: u64) -> Result<u64> {
        let base = self.read_sequence(table)?;
        self.put(
            SEQUENCES_TABLE,
            table.as_bytes(),
            &(base + amount).to_be_bytes(),
        );
        Ok(base)
    }

    pub fn commit(mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let mut batch = WriteBatch::default();
        for (key, value) in pending {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        self.mdb.db.write(batch)?;
        Ok(())
    }

    fn scan(
        &self,
        table: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        limit: i64,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let ro = RoTxn {
            mdb: Arc::clone(&self.mdb),
        };
        let (start, end) = ro.table_bounds(table, from, to);
        let strip = table.len() + 1;

        // Merge the committed rows with the pending overlay; overlay wins.
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.mdb.raw_iter(start.clone(), end.clone(), false) {
            let (k, v) = item?;
            merged.insert(k, v);
        }
        for (k, v) in self.pending.range((start, end)) {
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }

        let mut out = Vec::new();
        let take = if limit < 0 { usize::MAX } else { limit as usize };
        if reverse {
            for (k, v) in merged.into_iter().rev().take(take) {
                out.push((k[strip..].to_vec(), v));
            }
        } else {
            for (k, v) in merged.into_iter().take(take) {
                out.push((k[strip..].to_vec(), v));
            }
        }
        Ok(out)
    }
}

impl KvRead for RwTxn {
    fn get_one(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let full = full_key(table, key);
        if let Some(pending) = self.pending.get(&full) {
            return Ok(pending.clone());
        }
        self.mdb.raw_get(&full)
    }

    fn range_ascend(
        &self,
        table: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(table, from, to, limit, false)
    }

    fn range_descend(
        &self,
        table: &str,
        below: Option<&[u8]>,
        down_to: Option<&[u8]>,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(table, down_to, below, limit, true)
    }
}
