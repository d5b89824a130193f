//! Inverted index: for each key, the sorted set of txNums at which it was
//! touched. Recent touches live in two MDB tables (`keys`:
//! `txnum_be || key`, `idx`: `key || txnum_be`); completed steps are
//! compacted into `.ef`/`.efi` file pairs and merged up the ladder.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, BTreeMap},
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use parking_lot::RwLock;
use roaring::RoaringTreemap;
use tracing::debug;

use crate::{
    ef::EliasFano,
    error::{Result, StrataError},
    files::{
        check_cancelled, files_in_range, find_merge_range, scan_step_files, step_file_name,
        FileItem, FileMap, Getter, OffsetIndex, SegmentWriter,
    },
    kv::{KvRead, RwTxn},
    locality::LocalityIndex,
};

pub const EF_EXT: &str = "ef";
pub const EFI_EXT: &str = "efi";

pub type IndexCollation = BTreeMap<Vec<u8>, RoaringTreemap>;

pub struct InvertedIndex {
    pub name: String,
    pub dir: PathBuf,
    pub step_size: u64,
    pub keys_table: String,
    pub idx_table: String,
    files: RwLock<FileMap>,
    locality: RwLock<Option<Arc<LocalityIndex>>>,
}

fn split_keys_row(row: &[u8]) -> Result<(u64, &[u8])> {
    if row.len() < 8 {
        return Err(StrataError::Corruption("short row in keys table".into()));
    }
    let txnum = u64::from_be_bytes(row[..8].try_into().expect("8-byte prefix"));
    Ok((txnum, &row[8..]))
}

pub fn idx_row(key: &[u8], txnum: u64) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + 8);
    row.extend_from_slice(key);
    row.extend_from_slice(&txnum.to_be_bytes());
    row
}

pub fn keys_row(txnum: u64, key: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + 8);
    row.extend_from_slice(&txnum.to_be_bytes());
    row.extend_from_slice(key);
    row
}

impl InvertedIndex {
    pub fn new(
        dir: PathBuf,
        name: &str,
        step_size: u64,
        keys_table: String,
        idx_table: String,
    ) -> Result<Self> {
        let files = scan_step_files(&dir, name, EF_EXT, EFI_EXT, step_size)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            step_size,
            keys_table,
            idx_table,
            files: RwLock::new(files),
            locality: RwLock::new(None),
        })
    }

    /// Records a touch of `key` at `txnum` in both MDB tables. Idempotent
    /// for the same pair.
    pub fn add(&self, txn: &mut RwTxn, key: &[u8], txnum: u64) {
        txn.put(&self.keys_table, &keys_row(txnum, key), &[]);
        txn.put(&self.idx_table, &idx_row(key, txnum), &[]);
    }

    /// Groups the `[tx_from, tx_to)` window of the keys table by key.
    pub fn collate(
        &self,
        reader: &dyn KvRead,
        tx_from: u64,
        tx_to: u64,
    ) -> Result<IndexCollation> {
        let rows = reader.range_ascend(
            &self.keys_table,
            Some(&tx_from.to_be_bytes()),
            Some(&tx_to.to_be_bytes()),
            -1,
        )?;
        let mut collation = IndexCollation::new();
        for (row, _) in rows {
            let (txnum, key) = split_keys_row(&row)?;
            collation.entry(key.to_vec()).or_default().insert(txnum);
        }
        Ok(collation)
    }

    /// Writes the step's `.ef` data and `.efi` index.
    pub fn build_files(
        &self,
        step: u64,
        collation: &IndexCollation,
        cancel: &AtomicBool,
    ) -> Result<Arc<FileItem>> {
        let start_tx = step * self.step_size;
        let end_tx = (step + 1) * self.step_size;
        self.build_range(start_tx, end_tx, collation.iter().map(|(k, b)| (k, b)), cancel)
    }

    fn build_range<'a>(
        &self,
        start_tx: u64,
        end_tx: u64,
        entries: impl Iterator<Item = (&'a Vec<u8>, &'a RoaringTreemap)>,
        cancel: &AtomicBool,
    ) -> Result<Arc<FileItem>> {
        let data_name = step_file_name(&self.name, self.step_size, start_tx, end_tx, EF_EXT);
        let index_name = step_file_name(&self.name, self.step_size, start_tx, end_tx, EFI_EXT);
        let mut writer = SegmentWriter::create(&self.dir, &data_name)?;
        let mut index_entries = Vec::new();
        for (key, bitmap) in entries {
            check_cancelled(cancel)?;
            let postings: Vec<u64> = bitmap.iter().collect();
            let offset = writer.add_word(key)?;
            writer.add_word(&EliasFano::from_sorted(&postings).encode())?;
            index_entries.push((key.clone(), offset));
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

    pub fn integrate_files(&self, item: Arc<FileItem>) {
        self.files
            .write()
            .insert((item.start_tx, item.end_tx), item);
    }

    pub fn end_tx_num_minimax(&self) -> u64 {
        self.files
            .read()
            .keys()
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0)
    }

    pub fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> Option<(u64, u64)> {
        find_merge_range(&self.files.read(), max_end_tx, max_span, self.step_size)
    }

    pub fn files_in_range(&self, start_tx: u64, end_tx: u64) -> Vec<Arc<FileItem>> {
        files_in_range(&self.files.read(), start_tx, end_tx)
    }

    /// Unions the postings of `items` into one `[start_tx, end_tx)` pair.
    pub fn merge_files(
        &self,
        items: &[Arc<FileItem>],
        start_tx: u64,
        end_tx: u64,
        cancel: &AtomicBool,
    ) -> Result<Arc<FileItem>> {
        let mut merged: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        for item in items {
            check_cancelled(cancel)?;
            let mut getter = item.data.getter();
            while getter.has_next() {
                let key = getter.next()?.to_vec();
                let ef = EliasFano::decode(getter.next()?)?;
                let bitmap = merged.entry(key).or_default();
                for tx in ef.iter() {
                    bitmap.insert(tx);
                }
            }
        }
        debug!(
            name = %self.name,
            start_tx,
            end_tx,
            keys = merged.len(),
            "merging inverted index files"
        );
        self.build_range(start_tx, end_tx, merged.iter(), cancel)
    }

    /// Swaps `outs` for `merged` in the live set and retires the outgoing
    /// physical files once unreferenced.
    pub fn integrate_merged_files(&self, outs: &[Arc<FileItem>], merged: Arc<FileItem>) {
        let mut files = self.files.write();
        for out in outs {
            files.remove(&(out.start_tx, out.end_tx));
        }
        files.insert((merged.start_tx, merged.end_tx), merged);
    }

    pub fn delete_files(&self, outs: &[Arc<FileItem>]) {
        for out in outs {
            out.mark_deleted();
        }
    }

    /// Deletes up to `limit` touch rows with txnum in `[tx_from, tx_to)`
    /// from both tables. Safe to re-run; safe to interrupt.
    pub fn prune(
        &self,
        txn: &mut RwTxn,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &AtomicBool,
    ) -> Result<u64> {
        let rows = txn.range_ascend(
            &self.keys_table,
            Some(&tx_from.to_be_bytes()),
            Some(&tx_to.to_be_bytes()),
            if limit == u64::MAX { -1 } else { limit as i64 },
        )?;
        let mut pruned = 0u64;
        for (row, _) in rows {
            if pruned % 1024 == 0 {
                check_cancelled(cancel)?;
            }
            let (txnum, key) = split_keys_row(&row)?;
            txn.delete(&self.keys_table, &row);
            txn.delete(&self.idx_table, &idx_row(key, txnum));
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Budgeted scan of the hot keys table, priming the page cache.
    pub fn warmup(&self, reader: &dyn KvRead, tx_from: u64, limit: u64) -> Result<u64> {
        let rows = reader.range_ascend(
            &self.keys_table,
            Some(&tx_from.to_be_bytes()),
            None,
            limit as i64,
        )?;
        Ok(rows.len() as u64)
    }

    pub fn make_context(&self) -> InvertedIndexContext {
        InvertedIndexContext {
            idx_table: self.idx_table.clone(),
            files: self.files.read().values().cloned().collect(),
            locality: self.locality.read().clone(),
        }
    }

    /// Rebuilds the advisory locality bitmap over the biggest files.
    pub fn build_locality(&self, biggest_span: u64, cancel: &AtomicBool) -> Result<()> {
        let big: Vec<Arc<FileItem>> = self
            .files
            .read()
            .values()
            .filter(|f| f.end_tx - f.start_tx == biggest_span)
            .cloned()
            .collect();
        if big.is_empty() {
            return Ok(());
        }
        let li = LocalityIndex::build(&self.dir, &self.name, &big, cancel)?;
        *self.locality.write() = Some(Arc::new(li));
        Ok(())
    }

    pub fn locality(&self) -> Option<Arc<LocalityIndex>> {
        self.locality.read().clone()
    }
}

/// Read snapshot over the live file set.
pub struct InvertedIndexContext {
    idx_table: String,
    files: Vec<Arc<FileItem>>,
    locality: Option<Arc<LocalityIndex>>,
}

impl InvertedIndexContext {
    pub fn files(&self) -> &[Arc<FileItem>] {
        &self.files
    }

    /// Postings of `key` within a window, merged across files and MDB.
    ///
    /// Ascending: emits `t` with `from_ts <= t < to_ts`. Descending:
    /// `from_ts` is an exclusive upper bound and `to_ts` an inclusive
    /// lower bound. Either bound may be -1 for unbounded; `limit < 0`
    /// means unbounded. Duplicates across the DB/file boundary collapse.
    pub fn iterate_range(
        &self,
        reader: &dyn KvRead,
        key: &[u8],
        from_ts: i64,
        to_ts: i64,
        asc: bool,
        limit: i64,
    ) -> Result<InvertedRangeIter> {
        // Rows below the files frontier are already captured in files, so
        // the MDB source is clamped to the frontier to keep the merged
        // output sorted and duplicate-free even before pruning runs.
        let frontier = self.files.iter().map(|f| f.end_tx).max().unwrap_or(0);
        let mut sources: Vec<Vec<u64>> = Vec::new();
        if asc {
            let lo = if from_ts < 0 { 0 } else { from_ts as u64 };
            let hi = if to_ts < 0 { u64::MAX } else { to_ts as u64 };
            if lo < hi {
                for file in &self.files {
                    if file.end_tx <= lo || file.start_tx >= hi {
                        continue;
                    }
                    if let Some(li) = &self.locality {
                        if li.covers(file) && !li.may_contain(key, file) {
                            continue;
                        }
                    }
                    if let Some(postings) = self.file_postings(file, key)? {
                        sources.push(
                            postings
                                .iter()
                                .skip_while(|&t| t < lo)
                                .take_while(|&t| t < hi)
                                .collect(),
                        );
                    }
                }
                let db_lo = lo.max(frontier);
                if db_lo < hi {
                    let rows = reader.range_ascend(
                        &self.idx_table,
                        Some(&idx_row(key, db_lo)),
                        Some(&idx_row(key, hi)),
                        -1,
                    )?;
                    sources.push(db_txnums(rows, key));
                }
            }
        } else {
            let hi = if from_ts < 0 { u64::MAX } else { from_ts as u64 };
            let lo = if to_ts < 0 { 0 } else { to_ts as u64 };
            if lo < hi {
                let db_lo = lo.max(frontier);
                if db_lo < hi {
                    let rows = reader.range_descend(
                        &self.idx_table,
                        Some(&idx_row(key, hi)),
                        Some(&idx_row(key, db_lo)),
                        -1,
                    )?;
                    sources.push(db_txnums(rows, key));
                }
                for file in self.files.iter().rev() {
                    if file.end_tx <= lo || file.start_tx >= hi {
                        continue;
                    }
                    if let Some(li) = &self.locality {
                        if li.covers(file) && !li.may_contain(key, file) {
                            continue;
                        }
                    }
                    if let Some(postings) = self.file_postings(file, key)? {
                        let mut window: Vec<u64> = postings
                            .iter()
                            .skip_while(|&t| t < lo)
                            .take_while(|&t| t < hi)
                            .collect();
                        window.reverse();
                        sources.push(window);
                    }
                }
            }
        }
        Ok(InvertedRangeIter::new(sources, limit))
    }

    fn file_postings(&self, file: &FileItem, key: &[u8]) -> Result<Option<EliasFano>> {
        let Some(raw) = file.lookup_value(key)? else {
            return Ok(None);
        };
        Ok(Some(EliasFano::decode(&raw)?))
    }

    /// Smallest posting >= `ts` across files only (cold history lookups).
    pub fn seek_in_files(&self, key: &[u8], ts: u64) -> Result<Option<(u64, Arc<FileItem>)>> {
        for file in &self.files {
            if file.end_tx <= ts {
                continue;
            }
            if let Some(li) = &self.locality {
                if li.covers(file) && !li.may_contain(key, file) {
                    continue;
                }
            }
            if let Some(postings) = self.file_postings(file, key)? {
                if let Some(found) = postings.search(ts) {
                    return Ok(Some((found, Arc::clone(file))));
                }
            }
        }
        Ok(None)
    }
}

fn db_txnums(rows: Vec<(Vec<u8>, Vec<u8>)>, key: &[u8]) -> Vec<u64> {
    rows.into_iter()
        .filter_map(|(row, _)| {
            if row.len() == key.len() + 8 && row.starts_with(key) {
                Some(u64::from_be_bytes(
                    row[key.len()..].try_into().expect("8-byte suffix"),
                ))
            } else {
                None
            }
        })
        .collect()
}

pub struct InvertedRangeIter {
    sources: std::iter::Flatten<std::vec::IntoIter<std::vec::IntoIter<u64>>>,
    last: Option<u64>,
    remaining: Option<usize>,
}

impl InvertedRangeIter {
    fn new(sources: Vec<Vec<u64>>, limit: i64) -> Self {
        let sources: Vec<std::vec::IntoIter<u64>> =
            sources.into_iter().map(|s| s.into_iter()).collect();
        Self {
            sources: sources.into_iter().flatten(),
            last: None,
            remaining: if limit < 0 { None } else { Some(limit as usize) },
        }
    }
}

impl Iterator for InvertedRangeIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == Some(0) {
            return None;
        }
        loop {
            let t = self.sources.next()?;
            if self.last == Some(t) {
                continue;
            }
            self.last = Some(t);
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            return Some(t);
        }
    }
}

/// Cursor over one file's `(key, postings)` words, ordered for multi-way
/// merges: smallest key first, and among equal keys the file with the
/// larger `end_tx` wins the top of the heap.
pub struct HeapCursor<'a> {
    pub getter: Getter<'a>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub end_tx: u64,
}

impl HeapCursor<'_> {
    pub fn advance(&mut self) -> Result<bool> {
        if !self.getter.has_next() {
            return Ok(false);
        }
        self.key = self.getter.next()?.to_vec();
        self.value = self.getter.next()?.to_vec();
        Ok(true)
    }
}

impl PartialEq for HeapCursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.end_tx == other.end_tx
    }
}
impl Eq for HeapCursor<'_> {}
impl PartialOrd for HeapCursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapCursor<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.end_tx.cmp(&self.end_tx))
    }
}

/// Builds a min-heap of cursors, one per file with at least one word.
pub fn cursor_heap<'a>(items: &'a [Arc<FileItem>]) -> Result<BinaryHeap<Reverse<HeapCursor<'a>>>> {
    let mut heap = BinaryHeap::new();
    for item in items {
        let mut cursor = HeapCursor {
            getter: item.data.getter(),
            key: Vec::new(),
            value: Vec::new(),
            end_tx: item.end_tx,
        };
        if cursor.advance()? {
            heap.push(Reverse(cursor));
        }
    }
    Ok(heap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Mdb;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn new_index(dir: &std::path::Path) -> InvertedIndex {
        InvertedIndex::new(
            dir.join("snapshots"),
            "logaddrs",
            4,
            "logaddrs.keys".into(),
            "logaddrs.idx".into(),
        )
        .expect("new index")
    }

    fn collect(iter: InvertedRangeIter) -> Vec<u64> {
        iter.collect()
    }

    #[test]
    fn add_collate_and_range_from_db() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let ii = new_index(dir.path());

        let mut txn = mdb.write();
        for tx in [3u64, 7, 11, 19] {
            ii.add(&mut txn, b"\xca\xfe", tx);
        }
        ii.add(&mut txn, b"\xbe\xef", 5);
        txn.commit().unwrap();

        let ro = mdb.read();
        let collation = ii.collate(&ro, 0, 8).unwrap();
        assert_eq!(collation.len(), 2);
        assert_eq!(
            collation[b"\xca\xfe".as_slice()].iter().collect::<Vec<_>>(),
            vec![3, 7]
        );

        let ctx = ii.make_context();
        let got = collect(ctx.iterate_range(&ro, b"\xca\xfe", 5, 15, true, -1).unwrap());
        assert_eq!(got, vec![7, 11]);
        let got = collect(ctx.iterate_range(&ro, b"\xca\xfe", 15, 5, false, 1).unwrap());
        assert_eq!(got, vec![11]);
    }

    #[test]
    fn range_spans_files_and_db_without_duplicates() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let ii = new_index(dir.path());

        let mut txn = mdb.write();
        for tx in [3u64, 7, 11, 19] {
            ii.add(&mut txn, b"\xca\xfe", tx);
        }
        txn.commit().unwrap();

        // Build steps 0 and 1 into files but only prune step 0, leaving
        // txnum 7 both in its file and in the MDB.
        let ro = mdb.read();
        for step in 0..2u64 {
            let collation = ii.collate(&ro, step * 4, (step + 1) * 4).unwrap();
            let item = ii.build_files(step, &collation, &no_cancel()).unwrap();
            ii.integrate_files(item);
        }
        let mut txn = mdb.write();
        ii.prune(&mut txn, 0, 4, u64::MAX, &no_cancel()).unwrap();
        txn.commit().unwrap();

        let ro = mdb.read();
        let ctx = ii.make_context();
        let all = collect(ctx.iterate_range(&ro, b"\xca\xfe", -1, -1, true, -1).unwrap());
        assert_eq!(all, vec![3, 7, 11, 19]);
        let desc = collect(ctx.iterate_range(&ro, b"\xca\xfe", -1, -1, false, -1).unwrap());
        assert_eq!(desc, vec![19, 11, 7, 3]);
        let window = collect(ctx.iterate_range(&ro, b"\xca\xfe", 5, 15, true, -1).unwrap());
        assert_eq!(window, vec![7, 11]);
    }

    #[test]
    fn range_boundary_behavior() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let ii = new_index(dir.path());

        let mut txn = mdb.write();
        for tx in [3u64, 7] {
            ii.add(&mut txn, b"k", tx);
        }
        txn.commit().unwrap();

        let ro = mdb.read();
        let ctx = ii.make_context();
        assert!(collect(ctx.iterate_range(&ro, b"k", 5, 5, true, -1).unwrap()).is_empty());
        assert!(collect(ctx.iterate_range(&ro, b"k", 9, 2, false, 0).unwrap()).is_empty());
        assert!(collect(ctx.iterate_range(&ro, b"absent", -1, -1, true, -1).unwrap()).is_empty());
    }

    #[test]
    fn prune_is_idempotent() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let ii = new_index(dir.path());

        let mut txn = mdb.write();
        for tx in [1u64, 2, 5] {
            ii.add(&mut txn, b"k", tx);
        }
        txn.commit().unwrap();

        let mut txn = mdb.write();
        assert_eq!(ii.prune(&mut txn, 0, 4, u64::MAX, &no_cancel()).unwrap(), 2);
        txn.commit().unwrap();
        let mut txn = mdb.write();
        assert_eq!(ii.prune(&mut txn, 0, 4, u64::MAX, &no_cancel()).unwrap(), 0);
        txn.commit().unwrap();

        let ro = mdb.read();
        let ctx = ii.make_context();
        assert_eq!(collect(ctx.iterate_range(&ro, b"k", -1, -1, true, -1).unwrap()), vec![5]);
    }

    #[test]
    fn merge_preserves_every_read() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let ii = new_index(dir.path());

        let mut txn = mdb.write();
        for tx in [0u64, 3, 5, 6] {
            ii.add(&mut txn, b"a", tx);
        }
        ii.add(&mut txn, b"b", 2);
        txn.commit().unwrap();

        let ro = mdb.read();
        for step in 0..2u64 {
            let collation = ii.collate(&ro, step * 4, (step + 1) * 4).unwrap();
            let item = ii.build_files(step, &collation, &no_cancel()).unwrap();
            ii.integrate_files(item);
        }
        let mut txn = mdb.write();
        ii.prune(&mut txn, 0, 8, u64::MAX, &no_cancel()).unwrap();
        txn.commit().unwrap();

        let before: Vec<u64> = {
            let ro = mdb.read();
            collect(ii.make_context().iterate_range(&ro, b"a", -1, -1, true, -1).unwrap())
        };

        let (start, end) = ii.find_merge_range(8, 16).expect("range");
        assert_eq!((start, end), (0, 8));
        let outs = ii.files_in_range(start, end);
        let merged = ii.merge_files(&outs, start, end, &no_cancel()).unwrap();
        ii.integrate_merged_files(&outs, merged);
        ii.delete_files(&outs);

        let ro = mdb.read();
        let ctx = ii.make_context();
        assert_eq!(ctx.files().len(), 1);
        assert_eq!(collect(ctx.iterate_range(&ro, b"a", -1, -1, true, -1).unwrap()), before);
        assert_eq!(collect(ctx.iterate_range(&ro, b"b", -1, -1, true, -1).unwrap()), vec![2]);
    }
}
