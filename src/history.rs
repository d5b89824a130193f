//! Previous-value log over a companion inverted index.
//!
//! Every change of a key at txnum `T` records the value the key held just
//! before `T`. "Value as of ts" resolves by finding the smallest change
//! `T' >= ts` and returning the value recorded there; no such change means
//! the caller falls back to the current value.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use parking_lot::RwLock;
use tracing::warn;

use crate::{
    error::{Result, StrataError},
    files::{
        check_cancelled, files_in_range, scan_step_files, step_file_name, FileItem, FileMap,
        OffsetIndex, SegmentWriter,
    },
    inverted_index::{cursor_heap, IndexCollation, InvertedIndex, InvertedIndexContext},
    kv::{KvRead, RwTxn, Tables},
};

pub const V_EXT: &str = "v";
pub const VI_EXT: &str = "vi";

pub fn vals_row(key: &[u8], txnum: u64) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + 8);
    row.extend_from_slice(key);
    row.extend_from_slice(&txnum.to_be_bytes());
    row
}

pub struct History {
    pub name: String,
    pub dir: PathBuf,
    pub step_size: u64,
    pub ii: InvertedIndex,
    pub vals_table: String,
    pub settings_table: String,
    files: RwLock<FileMap>,
}

pub struct HistoryCollation {
    pub index: IndexCollation,
    pub values: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

pub struct HistoryFiles {
    pub index: Arc<FileItem>,
    pub history: Arc<FileItem>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryRanges {
    pub index: Option<(u64, u64)>,
    pub history: Option<(u64, u64)>,
}

impl HistoryRanges {
    pub fn any(&self) -> bool {
        self.index.is_some() || self.history.is_some()
    }
}

impl History {
    pub fn new(dir: PathBuf, name: &str, step_size: u64, tables: Tables) -> Result<Self> {
        let ii = InvertedIndex::new(dir.clone(), name, step_size, tables.keys, tables.idx)?;
        let files = scan_step_files(&dir, name, V_EXT, VI_EXT, step_size)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            step_size,
            ii,
            vals_table: tables.history_vals,
            settings_table: tables.settings,
            files: RwLock::new(files),
        })
    }

    /// Records that `key` held `prev` just before the change at `txnum`.
    pub fn add_prev_value(&self, txn: &mut RwTxn, key: &[u8], txnum: u64, prev: &[u8]) {
        self.ii.add(txn, key, txnum);
        txn.put(&self.vals_table, &vals_row(key, txnum), prev);
    }

    pub fn collate(
        &self,
        reader: &dyn KvRead,
        tx_from: u64,
        tx_to: u64,
    ) -> Result<HistoryCollation> {
        let index = self.ii.collate(reader, tx_from, tx_to)?;
        let mut values = std::collections::BTreeMap::new();
        for (key, bitmap) in &index {
            for txnum in bitmap {
                let composite = vals_row(key, txnum);
                let prev = reader.get_one(&self.vals_table, &composite)?.ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "history row missing for indexed change {}@{txnum}",
                        hex::encode(key)
                    ))
                })?;
                values.insert(composite, prev);
            }
        }
        Ok(HistoryCollation { index, values })
    }

    pub fn build_files(
        &self,
        step: u64,
        collation: &HistoryCollation,
        cancel: &AtomicBool,
    ) -> Result<HistoryFiles> {
        let index = self.ii.build_files(step, &collation.index, cancel)?;
        let start_tx = step * self.step_size;
        let end_tx = (step + 1) * self.step_size;
        let history =
            self.build_values_range(start_tx, end_tx, collation.values.iter(), cancel)?;
        Ok(HistoryFiles { index, history })
    }

    fn build_values_range<'a>(
        &self,
        start_tx: u64,
        end_tx: u64,
        entries: impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>,
        cancel: &AtomicBool,
    ) -> Result<Arc<FileItem>> {
        let data_name = step_file_name(&self.name, self.step_size, start_tx, end_tx, V_EXT);
        let index_name = step_file_name(&self.name, self.step_size, start_tx, end_tx, VI_EXT);
        let mut writer = SegmentWriter::create(&self.dir, &data_name)?;
        let mut index_entries = Vec::new();
        for (composite, prev) in entries {
            check_cancelled(cancel)?;
            let offset = writer.add_word(composite)?;
            writer.add_word(prev)?;
            index_entries.push((composite.clone(), offset));
        }
        let data_path = writer.finish()?;
        let index_path = match OffsetIndex::build(&self.dir, &index_name, &index_entries) {
            Ok(path) => path,
            Err(err) => {
                let _ = std::fs::remove_file(&data_path);
                return Err(err);
            }
        };
        FileItem::open(data_path, index_path, start_tx, end_tx)
    }

    pub fn integrate_files(&self, files: HistoryFiles) {
        self.ii.integrate_files(files.index);
        self.files
            .write()
            .insert((files.history.start_tx, files.history.end_tx), files.history);
    }

    pub fn end_tx_num_minimax(&self) -> u64 {
        let own = self
            .files
            .read()
            .keys()
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0);
        own.min(self.ii.end_tx_num_minimax())
    }

    pub fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> HistoryRanges {
        let index = self.ii.find_merge_range(max_end_tx, max_span);
        let history = index.filter(|&(start, end)| {
            let files = self.files.read();
            let covered: u64 = files_in_range(&files, start, end)
                .iter()
                .map(|f| f.end_tx - f.start_tx)
                .sum();
            covered == end - start
        });
        HistoryRanges { index, history }
    }

    pub fn files_in_range(&self, start_tx: u64, end_tx: u64) -> Vec<Arc<FileItem>> {
        files_in_range(&self.files.read(), start_tx, end_tx)
    }

    pub fn merge_files(
        &self,
        index_outs: &[Arc<FileItem>],
        history_outs: &[Arc<FileItem>],
        ranges: HistoryRanges,
        cancel: &AtomicBool,
    ) -> Result<(Option<Arc<FileItem>>, Option<Arc<FileItem>>)> {
        let mut index_in = None;
        let mut history_in = None;
        if let Some((start, end)) = ranges.index {
            index_in = Some(self.ii.merge_files(index_outs, start, end, cancel)?);
        }
        if let Some((start, end)) = ranges.history {
            // (key, txnum) pairs are unique across disjoint ranges, so the
            // multi-way merge is a plain sorted union.
            let mut heap = cursor_heap(history_outs)?;
            let data_name = step_file_name(&self.name, self.step_size, start, end, V_EXT);
            let index_name = step_file_name(&self.name, self.step_size, start, end, VI_EXT);
            let mut writer = SegmentWriter::create(&self.dir, &data_name)?;
            let mut index_entries = Vec::new();
            while let Some(std::cmp::Reverse(mut cursor)) = heap.pop() {
                check_cancelled(cancel)?;
                let offset = writer.add_word(&cursor.key)?;
                writer.add_word(&cursor.value)?;
                index_entries.push((cursor.key.clone(), offset));
                if cursor.advance()? {
                    heap.push(std::cmp::Reverse(cursor));
                }
            }
            let data_path = writer.finish()?;
            let index_path = OffsetIndex::build(&self.dir, &index_name, &index_entries)?;
            history_in = Some(FileItem::open(data_path, index_path, start, end)?);
        }
        Ok((index_in, history_in))
    }

    pub fn integrate_merged_files(
        &self,
        index_outs: &[Arc<FileItem>],
        history_outs: &[Arc<FileItem>],
        index_in: Option<Arc<FileItem>>,
        history_in: Option<Arc<FileItem>>,
    ) {
        if let Some(index_in) = index_in {
            self.ii.integrate_merged_files(index_outs, index_in);
        }
        if let Some(history_in) = history_in {
            let mut files = self.files.write();
            for out in history_outs {
                files.remove(&(out.start_tx, out.end_tx));
            }
            files.insert((history_in.start_tx, history_in.end_tx), history_in);
        }
    }

    pub fn delete_files(&self, index_outs: &[Arc<FileItem>], history_outs: &[Arc<FileItem>]) {
        self.ii.delete_files(index_outs);
        for out in history_outs {
            out.mark_deleted();
        }
    }

    /// Deletes up to `limit` changes in `[tx_from, tx_to)` from all three
    /// MDB tables, handing each `(txnum, key, prev)` to `f` first.
    pub fn prune_with(
        &self,
        txn: &mut RwTxn,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &AtomicBool,
        mut f: impl FnMut(u64, &[u8], &[u8]) -> Result<()>,
    ) -> Result<u64> {
        let rows = txn.range_ascend(
            &self.ii.keys_table,
            Some(&tx_from.to_be_bytes()),
            Some(&tx_to.to_be_bytes()),
            if limit == u64::MAX { -1 } else { limit as i64 },
        )?;
        let mut pruned = 0u64;
        for (row, _) in rows {
            if pruned % 1024 == 0 {
                check_cancelled(cancel)?;
            }
            if row.len() < 8 {
                return Err(StrataError::Corruption("short row in keys table".into()));
            }
            let txnum = u64::from_be_bytes(row[..8].try_into().expect("8-byte prefix"));
            let key = row[8..].to_vec();
            let composite = vals_row(&key, txnum);
            let prev = txn.get_one(&self.vals_table, &composite)?.unwrap_or_default();
            f(txnum, &key, &prev)?;
            txn.delete(&self.ii.keys_table, &row);
            txn.delete(&self.ii.idx_table, &crate::inverted_index::idx_row(&key, txnum));
            txn.delete(&self.vals_table, &composite);
            pruned += 1;
        }
        Ok(pruned)
    }

    pub fn prune(
        &self,
        txn: &mut RwTxn,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &AtomicBool,
    ) -> Result<u64> {
        self.prune_with(txn, tx_from, tx_to, limit, cancel, |_, _, _| Ok(()))
    }

    /// Budgeted scan of the hot tables, priming the page cache.
    pub fn warmup(&self, reader: &dyn KvRead, tx_from: u64, limit: u64) -> Result<u64> {
        let rows = reader.range_ascend(
            &self.ii.keys_table,
            Some(&tx_from.to_be_bytes()),
            None,
            limit as i64,
        )?;
        let mut touched = 0u64;
        for (row, _) in &rows {
            if row.len() >= 8 {
                let txnum = u64::from_be_bytes(row[..8].try_into().expect("8-byte prefix"));
                let key = &row[8..];
                let _ = reader.get_one(&self.vals_table, &vals_row(key, txnum))?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    pub fn make_context(&self) -> HistoryContext {
        HistoryContext {
            ii: self.ii.make_context(),
            files: self.files.read().values().cloned().collect(),
            vals_table: self.vals_table.clone(),
            keys_table: self.ii.keys_table.clone(),
        }
    }

    /// One read snapshot per compacted step-range with both file kinds
    /// indexed, newest last.
    pub fn make_steps(&self, to_tx: u64) -> Vec<HistoryStep> {
        let history_files = self.files.read();
        let mut steps = Vec::new();
        for index_file in self.ii.make_context().files() {
            if index_file.end_tx > to_tx {
                continue;
            }
            match history_files.get(&(index_file.start_tx, index_file.end_tx)) {
                Some(history_file) => steps.push(HistoryStep {
                    index_file: Arc::clone(index_file),
                    history_file: Arc::clone(history_file),
                }),
                None => warn!(
                    name = %self.name,
                    start = index_file.start_tx,
                    end = index_file.end_tx,
                    "index file without history pair, skipping step"
                ),
            }
        }
        steps
    }
}

/// Read snapshot of the history's cold files plus its companion index.
pub struct HistoryContext {
    pub ii: InvertedIndexContext,
    files: Vec<Arc<FileItem>>,
    vals_table: String,
    keys_table: String,
}

impl HistoryContext {
    /// Value of `key` as of `ts`, from cold files only. Returns the value
    /// and the txnum of the change that recorded it.
    pub fn get_no_state(&self, key: &[u8], ts: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let Some((txnum, _)) = self.ii.seek_in_files(key, ts)? else {
            return Ok(None);
        };
        let value = self.value_at(key, txnum)?;
        Ok(Some((value, txnum)))
    }

    fn value_at(&self, key: &[u8], txnum: u64) -> Result<Vec<u8>> {
        for file in &self.files {
            if file.start_tx <= txnum && txnum < file.end_tx {
                if let Some(value) = file.lookup_value(&vals_row(key, txnum))? {
                    return Ok(value);
                }
            }
        }
        Err(StrataError::Corruption(format!(
            "history value missing for indexed change {}@{txnum}",
            hex::encode(key)
        )))
    }

    /// Same as `get_no_state`, but also sees hot MDB rows through `reader`
    /// (including a writer's uncommitted batch).
    pub fn get_no_state_with_recent(
        &self,
        key: &[u8],
        ts: u64,
        reader: &dyn KvRead,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        if let Some(found) = self.get_no_state(key, ts)? {
            return Ok(Some(found));
        }
        let rows = reader.range_ascend(
            &self.vals_table,
            Some(&vals_row(key, ts)),
            Some(&vals_row(key, u64::MAX)),
            -1,
        )?;
        for (row, value) in rows {
            if row.len() == key.len() + 8 && row.starts_with(key) {
                let txnum =
                    u64::from_be_bytes(row[key.len()..].try_into().expect("8-byte suffix"));
                return Ok(Some((value, txnum)));
            }
        }
        Ok(None)
    }

    /// `(key, value as of start_tx)` for keys in `[from, to)` that existed
    /// at that time and changed afterwards. Empty `to` means unbounded.
    pub fn walk_as_of(
        &self,
        reader: &dyn KvRead,
        start_tx: u64,
        from: &[u8],
        to: &[u8],
        amount: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for key in self.known_keys(reader)? {
            if amount >= 0 && out.len() as i64 >= amount {
                break;
            }
            if key.as_slice() < from || (!to.is_empty() && key.as_slice() >= to) {
                continue;
            }
            if let Some((value, _)) = self.get_no_state_with_recent(&key, start_tx, reader)? {
                if !value.is_empty() {
                    out.push((key, value));
                }
            }
        }
        Ok(out)
    }

    /// `(key, value before its first change in the window)` for every key
    /// changed in `[start_tx, end_tx)`.
    pub fn iterate_changed(
        &self,
        reader: &dyn KvRead,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for key in self.known_keys(reader)? {
            if let Some((value, txnum)) = self.get_no_state_with_recent(&key, start_tx, reader)? {
                if txnum < end_tx {
                    out.push((key, value));
                }
            }
        }
        Ok(out)
    }

    fn known_keys(&self, reader: &dyn KvRead) -> Result<BTreeSet<Vec<u8>>> {
        let mut keys = BTreeSet::new();
        for file in self.ii.files() {
            for key in file.index.keys() {
                keys.insert(key.to_vec());
            }
        }
        for (row, _) in reader.range_ascend(&self.keys_table, None, None, -1)? {
            if row.len() >= 8 {
                keys.insert(row[8..].to_vec());
            }
        }
        Ok(keys)
    }
}

/// Per-step read snapshot for parallel reconstitution. Cheap to clone for
/// work stealing.
#[derive(Clone, Debug)]
pub struct HistoryStep {
    pub index_file: Arc<FileItem>,
    pub history_file: Arc<FileItem>,
}

impl HistoryStep {
    pub fn tx_range(&self) -> (u64, u64) {
        (self.index_file.start_tx, self.index_file.end_tx)
    }

    pub fn get_no_state(&self, key: &[u8], ts: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let Some(raw) = self.index_file.lookup_value(key)? else {
            return Ok(None);
        };
        let postings = crate::ef::EliasFano::decode(&raw)?;
        let Some(txnum) = postings.search(ts) else {
            return Ok(None);
        };
        let value = self
            .history_file
            .lookup_value(&vals_row(key, txnum))?
            .ok_or_else(|| {
                StrataError::Corruption(format!(
                    "history value missing for indexed change {}@{txnum}",
                    hex::encode(key)
                ))
            })?;
        Ok(Some((value, txnum)))
    }

    /// Largest txnum at which `key` changed inside this step.
    pub fn max_tx_num(&self, key: &[u8]) -> Result<Option<u64>> {
        let Some(raw) = self.index_file.lookup_value(key)? else {
            return Ok(None);
        };
        Ok(crate::ef::EliasFano::decode(&raw)?.max())
    }

    /// Every distinct txnum with a change in this step, ascending.
    pub fn iterate_txs(&self) -> Result<Vec<u64>> {
        let mut txs = BTreeSet::new();
        let mut getter = self.index_file.data.getter();
        while getter.has_next() {
            let _key = getter.next()?;
            let postings = crate::ef::EliasFano::decode(getter.next()?)?;
            txs.extend(postings.iter());
        }
        Ok(txs.into_iter().collect())
    }

    /// `(key, value before its first change >= ts)` for keys this step
    /// touched at or after `ts`.
    pub fn iterate_history_before_tx_num(&self, ts: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut getter = self.index_file.data.getter();
        while getter.has_next() {
            let key = getter.next()?.to_vec();
            let postings = crate::ef::EliasFano::decode(getter.next()?)?;
            if let Some(txnum) = postings.search(ts) {
                let value = self
                    .history_file
                    .lookup_value(&vals_row(&key, txnum))?
                    .ok_or_else(|| {
                        StrataError::Corruption(format!(
                            "history value missing for indexed change {}@{txnum}",
                            hex::encode(&key)
                        ))
                    })?;
                out.push((key, value));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Mdb;
    use tempfile::tempdir;

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn new_history(dir: &std::path::Path) -> History {
        History::new(
            dir.join("snapshots"),
            "accounts",
            4,
            Tables::for_component("accounts"),
        )
        .expect("new history")
    }

    /// Three changes: v1@1 (no previous), v2@5 (prev v1), v3@9 (prev v2).
    fn seed(mdb: &Arc<Mdb>, hist: &History) {
        let mut txn = mdb.write();
        hist.add_prev_value(&mut txn, b"\xaa", 1, b"");
        hist.add_prev_value(&mut txn, b"\xaa", 5, b"v1");
        hist.add_prev_value(&mut txn, b"\xaa", 9, b"v2");
        txn.commit().unwrap();
    }

    fn build_steps(mdb: &Arc<Mdb>, hist: &History, steps: std::ops::Range<u64>) {
        let ro = mdb.read();
        for step in steps {
            let collation = hist.collate(&ro, step * 4, (step + 1) * 4).unwrap();
            let files = hist.build_files(step, &collation, &no_cancel()).unwrap();
            hist.integrate_files(files);
        }
    }

    fn as_of(ctx: &HistoryContext, reader: &dyn KvRead, ts: u64) -> Option<Vec<u8>> {
        ctx.get_no_state_with_recent(b"\xaa", ts, reader)
            .unwrap()
            .map(|(v, _)| v)
    }

    #[test]
    fn round_trip_against_hot_rows() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let hist = new_history(dir.path());
        seed(&mdb, &hist);

        let ro = mdb.read();
        let ctx = hist.make_context();
        // Before the first change the key did not exist.
        assert_eq!(as_of(&ctx, &ro, 0), Some(b"".to_vec()));
        assert_eq!(as_of(&ctx, &ro, 1), Some(b"".to_vec()));
        // history.get(k, T) == value before the change at T.
        assert_eq!(as_of(&ctx, &ro, 5), Some(b"v1".to_vec()));
        assert_eq!(as_of(&ctx, &ro, 9), Some(b"v2".to_vec()));
        // Between changes the answer is constant.
        assert_eq!(as_of(&ctx, &ro, 2), as_of(&ctx, &ro, 5));
        assert_eq!(as_of(&ctx, &ro, 6), as_of(&ctx, &ro, 9));
        // Past the last change the caller falls back to the latest value.
        assert_eq!(as_of(&ctx, &ro, 10), None);
    }

    #[test]
    fn reads_are_identical_after_build_and_prune() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let hist = new_history(dir.path());
        seed(&mdb, &hist);
        build_steps(&mdb, &hist, 0..3);
        let mut txn = mdb.write();
        hist.prune(&mut txn, 0, 12, u64::MAX, &no_cancel()).unwrap();
        txn.commit().unwrap();

        let ro = mdb.read();
        let ctx = hist.make_context();
        for (ts, want) in [
            (0u64, Some(b"".to_vec())),
            (5, Some(b"v1".to_vec())),
            (9, Some(b"v2".to_vec())),
            (10, None),
        ] {
            assert_eq!(as_of(&ctx, &ro, ts), want, "ts={ts}");
            // Cold-only reads agree once everything is in files.
            assert_eq!(
                ctx.get_no_state(b"\xaa", ts).unwrap().map(|(v, _)| v),
                want,
                "cold ts={ts}"
            );
        }
    }

    #[test]
    fn equal_value_puts_still_record_a_change() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let hist = new_history(dir.path());

        let mut txn = mdb.write();
        hist.add_prev_value(&mut txn, b"k", 2, b"same");
        hist.add_prev_value(&mut txn, b"k", 4, b"same");
        txn.commit().unwrap();

        let ro = mdb.read();
        let ctx = hist.make_context();
        let changed = ctx.iterate_changed(&ro, 0, 10).unwrap();
        assert_eq!(changed, vec![(b"k".to_vec(), b"same".to_vec())]);
        assert_eq!(
            ctx.get_no_state_with_recent(b"k", 3, &ro).unwrap(),
            Some((b"same".to_vec(), 4))
        );
    }

    #[test]
    fn walk_as_of_merges_files_and_db() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let hist = new_history(dir.path());

        let mut txn = mdb.write();
        hist.add_prev_value(&mut txn, b"a", 2, b"a0");
        hist.add_prev_value(&mut txn, b"b", 3, b"b0");
        hist.add_prev_value(&mut txn, b"c", 6, b"c0");
        txn.commit().unwrap();
        build_steps(&mdb, &hist, 0..1);
        let mut txn = mdb.write();
        hist.prune(&mut txn, 0, 4, u64::MAX, &no_cancel()).unwrap();
        txn.commit().unwrap();

        let ro = mdb.read();
        let ctx = hist.make_context();
        let walked = ctx.walk_as_of(&ro, 1, b"", b"", -1).unwrap();
        assert_eq!(
            walked,
            vec![
                (b"a".to_vec(), b"a0".to_vec()),
                (b"b".to_vec(), b"b0".to_vec()),
                (b"c".to_vec(), b"c0".to_vec()),
            ]
        );
        let bounded = ctx.walk_as_of(&ro, 1, b"b", b"c", -1).unwrap();
        assert_eq!(bounded, vec![(b"b".to_vec(), b"b0".to_vec())]);
        let limited = ctx.walk_as_of(&ro, 1, b"", b"", 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn steps_expose_per_range_reads() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let hist = new_history(dir.path());
        seed(&mdb, &hist);
        build_steps(&mdb, &hist, 0..3);

        let steps = hist.make_steps(12);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].tx_range(), (0, 4));
        assert_eq!(steps[1].get_no_state(b"\xaa", 4).unwrap(), Some((b"v1".to_vec(), 5)));
        assert_eq!(steps[1].max_tx_num(b"\xaa").unwrap(), Some(5));
        assert_eq!(steps[2].iterate_txs().unwrap(), vec![9]);
        let before = steps[2].iterate_history_before_tx_num(8).unwrap();
        assert_eq!(before, vec![(b"\xaa".to_vec(), b"v2".to_vec())]);
        // Clones are independent snapshots over the same files.
        let clone = steps[1].clone();
        assert_eq!(clone.tx_range(), (4, 8));
    }
}
