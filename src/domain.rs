//! Domain: History plus a latest-value tier.
//!
//! The hot latest values live in MDB rows `key || !step_be` (inverted step,
//! so a prefix seek returns the newest step first); compacted ranges live
//! in `.kv`/`.kvi` files holding, per key changed in the range, the value
//! as of the range's end.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use parking_lot::RwLock;

use crate::{
    error::Result,
    files::{
        check_cancelled, files_in_range, find_merge_range, scan_step_files, step_file_name,
        FileItem, FileMap, OffsetIndex, SegmentWriter,
    },
    history::{History, HistoryCollation, HistoryContext, HistoryFiles, HistoryRanges, HistoryStep},
    inverted_index::cursor_heap,
    kv::{KvRead, RwTxn, Tables},
};

pub const KV_EXT: &str = "kv";
pub const KVI_EXT: &str = "kvi";

pub(crate) fn step_suffixed(key: &[u8], step: u64) -> Vec<u8> {
    let mut row = Vec::with_capacity(key.len() + 8);
    row.extend_from_slice(key);
    row.extend_from_slice(&(!step).to_be_bytes());
    row
}

pub struct Domain {
    pub name: String,
    pub dir: PathBuf,
    pub step_size: u64,
    pub history: History,
    pub vals_table: String,
    files: RwLock<FileMap>,
}

pub struct DomainCollation {
    pub history: HistoryCollation,
    pub values: BTreeMap<Vec<u8>, Vec<u8>>,
}

pub struct DomainFiles {
    pub history: HistoryFiles,
    pub values: Arc<FileItem>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DomainRanges {
    pub history: HistoryRanges,
    pub values: Option<(u64, u64)>,
}

impl DomainRanges {
    pub fn any(&self) -> bool {
        self.history.any() || self.values.is_some()
    }
}

impl Domain {
    pub fn new(dir: PathBuf, name: &str, step_size: u64) -> Result<Self> {
        let history = History::new(dir.clone(), name, step_size, Tables::for_component(name))?;
        let files = scan_step_files(&dir, name, KV_EXT, KVI_EXT, step_size)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            step_size,
            history,
            vals_table: format!("{name}.vals"),
            files: RwLock::new(files),
        })
    }

    /// Writes the new latest value at `txnum`, recording the displaced
    /// value in History first. `k2` extends composite keys (storage slots,
    /// commitment sub-keys); pass empty for plain keys.
    pub fn put(
        &self,
        txn: &mut RwTxn,
        k1: &[u8],
        k2: &[u8],
        txnum: u64,
        value: &[u8],
    ) -> Result<()> {
        let mut key = k1.to_vec();
        key.extend_from_slice(k2);
        let prev = self.get_latest(&key, txn)?.unwrap_or_default();
        self.history.add_prev_value(txn, &key, txnum, &prev);
        txn.put(
            &self.vals_table,
            &step_suffixed(&key, txnum / self.step_size),
            value,
        );
        Ok(())
    }

    /// Deletion is an empty-value tombstone; History records the displaced
    /// value like any other change.
    pub fn delete(&self, txn: &mut RwTxn, k1: &[u8], k2: &[u8], txnum: u64) -> Result<()> {
        self.put(txn, k1, k2, txnum, &[])
    }

    /// Latest value: hot MDB rows first, then value files newest-first.
    /// Empty values read as absent.
    pub fn get_latest(&self, key: &[u8], reader: &dyn KvRead) -> Result<Option<Vec<u8>>> {
        for (row, value) in reader.prefix(&self.vals_table, key)? {
            if row.len() == key.len() + 8 && row.starts_with(key) {
                return Ok((!value.is_empty()).then_some(value));
            }
        }
        let files = self.files.read();
        for file in files.values().rev() {
            if let Some(value) = file.lookup_value(key)? {
                return Ok((!value.is_empty()).then_some(value));
            }
        }
        Ok(None)
    }

    pub fn collate(
        &self,
        reader: &dyn KvRead,
        step: u64,
        tx_from: u64,
        tx_to: u64,
    ) -> Result<DomainCollation> {
        let history = self.history.collate(reader, tx_from, tx_to)?;
        let mut values = BTreeMap::new();
        for key in history.index.keys() {
            if let Some(value) = reader.get_one(&self.vals_table, &step_suffixed(key, step))? {
                values.insert(key.clone(), value);
            }
        }
        Ok(DomainCollation { history, values })
    }

    pub fn build_files(
        &self,
        step: u64,
        collation: &DomainCollation,
        cancel: &AtomicBool,
    ) -> Result<DomainFiles> {
        let history = self.history.build_files(step, &collation.history, cancel)?;
        let start_tx = step * self.step_size;
        let end_tx = (step + 1) * self.step_size;
        let data_name = step_file_name(&self.name, self.step_size, start_tx, end_tx, KV_EXT);
        let index_name = step_file_name(&self.name, self.step_size, start_tx, end_tx, KVI_EXT);
        let mut writer = SegmentWriter::create(&self.dir, &data_name)?;
        let mut index_entries = Vec::new();
        for (key, value) in &collation.values {
            check_cancelled(cancel)?;
            let offset = writer.add_word(key)?;
            writer.add_word(value)?;
            index_entries.push((key.clone(), offset));
        }
        let data_path = writer.finish()?;
        let index_path = OffsetIndex::build(&self.dir, &index_name, &index_entries)?;
        let values = FileItem::open(data_path, index_path, start_tx, end_tx)?;
        Ok(DomainFiles { history, values })
    }

    pub fn integrate_files(&self, files: DomainFiles) {
        self.history.integrate_files(files.history);
        self.files
            .write()
            .insert((files.values.start_tx, files.values.end_tx), files.values);
    }

    pub fn end_tx_num_minimax(&self) -> u64 {
        let own = self
            .files
            .read()
            .keys()
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0);
        own.min(self.history.end_tx_num_minimax())
    }

    pub fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> DomainRanges {
        DomainRanges {
            history: self.history.find_merge_range(max_end_tx, max_span),
            values: find_merge_range(&self.files.read(), max_end_tx, max_span, self.step_size),
        }
    }

    pub fn files_in_range(&self, start_tx: u64, end_tx: u64) -> Vec<Arc<FileItem>> {
        files_in_range(&self.files.read(), start_tx, end_tx)
    }

    /// Merges value files: the newest range wins per key, and a merge that
    /// reaches back to genesis drops tombstones. `transform(key, value)`
    /// rewrites the winning value before it lands in the merged file
    /// (commitment's short-key rewriting hooks in here; identity
    /// elsewhere).
    pub fn merge_files(
        &self,
        values_outs: &[Arc<FileItem>],
        index_outs: &[Arc<FileItem>],
        history_outs: &[Arc<FileItem>],
        ranges: DomainRanges,
        cancel: &AtomicBool,
        transform: &dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>>,
    ) -> Result<(Option<Arc<FileItem>>, Option<Arc<FileItem>>, Option<Arc<FileItem>>)> {
        let (index_in, history_in) =
            self.history
                .merge_files(index_outs, history_outs, ranges.history, cancel)?;
        let mut values_in = None;
        if let Some((start, end)) = ranges.values {
            let mut heap = cursor_heap(values_outs)?;
            let data_name = step_file_name(&self.name, self.step_size, start, end, KV_EXT);
            let index_name = step_file_name(&self.name, self.step_size, start, end, KVI_EXT);
            let mut writer = SegmentWriter::create(&self.dir, &data_name)?;
            let mut index_entries = Vec::new();
            while let Some(std::cmp::Reverse(mut top)) = heap.pop() {
                check_cancelled(cancel)?;
                let key = top.key.clone();
                // The heap orders duplicates newest-range-first, so the
                // popped cursor holds the winning value.
                let value = top.value.clone();
                if top.advance()? {
                    heap.push(std::cmp::Reverse(top));
                }
                loop {
                    let same_key = matches!(heap.peek(), Some(std::cmp::Reverse(dup)) if dup.key == key);
                    if !same_key {
                        break;
                    }
                    let std::cmp::Reverse(mut dup) = heap.pop().expect("peeked");
                    if dup.advance()? {
                        heap.push(std::cmp::Reverse(dup));
                    }
                }
                if start == 0 && value.is_empty() {
                    continue;
                }
                let value = transform(&key, &value)?;
                let offset = writer.add_word(&key)?;
                writer.add_word(&value)?;
                index_entries.push((key, offset));
            }
            let data_path = writer.finish()?;
            let index_path = OffsetIndex::build(&self.dir, &index_name, &index_entries)?;
            values_in = Some(FileItem::open(data_path, index_path, start, end)?);
        }
        Ok((values_in, index_in, history_in))
    }

    pub fn integrate_merged_files(
        &self,
        values_outs: &[Arc<FileItem>],
        index_outs: &[Arc<FileItem>],
        history_outs: &[Arc<FileItem>],
        values_in: Option<Arc<FileItem>>,
        index_in: Option<Arc<FileItem>>,
        history_in: Option<Arc<FileItem>>,
    ) {
        self.history
            .integrate_merged_files(index_outs, history_outs, index_in, history_in);
        if let Some(values_in) = values_in {
            let mut files = self.files.write();
            for out in values_outs {
                files.remove(&(out.start_tx, out.end_tx));
            }
            files.insert((values_in.start_tx, values_in.end_tx), values_in);
        }
    }

    pub fn delete_files(
        &self,
        values_outs: &[Arc<FileItem>],
        index_outs: &[Arc<FileItem>],
        history_outs: &[Arc<FileItem>],
    ) {
        self.history.delete_files(index_outs, history_outs);
        for out in values_outs {
            out.mark_deleted();
        }
    }

    /// Removes captured hot rows: history rows through `History::prune`
    /// plus this domain's per-step latest rows.
    pub fn prune(
        &self,
        txn: &mut RwTxn,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        cancel: &AtomicBool,
    ) -> Result<u64> {
        let step_size = self.step_size;
        let vals_table = self.vals_table.clone();
        let mut stale = Vec::new();
        let pruned = self
            .history
            .prune_with(txn, tx_from, tx_to, limit, cancel, |txnum, key, _prev| {
                stale.push(step_suffixed(key, txnum / step_size));
                Ok(())
            })?;
        for row in stale {
            txn.delete(&vals_table, &row);
        }
        Ok(pruned)
    }

    pub fn make_context(&self) -> DomainContext {
        DomainContext {
            history: self.history.make_context(),
            files: self.files.read().values().cloned().collect(),
            vals_table: self.vals_table.clone(),
        }
    }

    pub fn make_steps(&self, to_tx: u64) -> Vec<HistoryStep> {
        self.history.make_steps(to_tx)
    }
}

/// Read snapshot of a domain's value files plus its history.
pub struct DomainContext {
    pub history: HistoryContext,
    files: Vec<Arc<FileItem>>,
    vals_table: String,
}

impl DomainContext {
    /// Value of `key` as of `ts`: History first, latest value as the
    /// fallback. `None` means the key did not exist at `ts`.
    pub fn get_as_of(
        &self,
        key: &[u8],
        ts: u64,
        reader: &dyn KvRead,
    ) -> Result<Option<Vec<u8>>> {
        if let Some((value, _)) = self.history.get_no_state_with_recent(key, ts, reader)? {
            return Ok((!value.is_empty()).then_some(value));
        }
        self.get_latest(key, reader)
    }

    pub fn get_latest(&self, key: &[u8], reader: &dyn KvRead) -> Result<Option<Vec<u8>>> {
        for (row, value) in reader.prefix(&self.vals_table, key)? {
            if row.len() == key.len() + 8 && row.starts_with(key) {
                return Ok((!value.is_empty()).then_some(value));
            }
        }
        for file in self.files.iter().rev() {
            if let Some(value) = file.lookup_value(key)? {
                return Ok((!value.is_empty()).then_some(value));
            }
        }
        Ok(None)
    }

    pub fn value_files(&self) -> &[Arc<FileItem>] {
        &self.files
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

    fn new_domain(dir: &std::path::Path) -> Domain {
        Domain::new(dir.join("snapshots"), "accounts", 4).expect("new domain")
    }

    fn seed(mdb: &Arc<Mdb>, domain: &Domain) {
        let mut txn = mdb.write();
        domain.put(&mut txn, b"\xaa", b"", 1, b"v1").unwrap();
        domain.put(&mut txn, b"\xaa", b"", 5, b"v2").unwrap();
        domain.put(&mut txn, b"\xaa", b"", 9, b"v3").unwrap();
        txn.commit().unwrap();
    }

    fn build_and_prune(mdb: &Arc<Mdb>, domain: &Domain, steps: std::ops::Range<u64>) {
        let ro = mdb.read();
        for step in steps.clone() {
            let collation = domain
                .collate(&ro, step, step * 4, (step + 1) * 4)
                .unwrap();
            let files = domain.build_files(step, &collation, &no_cancel()).unwrap();
            domain.integrate_files(files);
        }
        drop(ro);
        let mut txn = mdb.write();
        domain
            .prune(&mut txn, steps.start * 4, steps.end * 4, u64::MAX, &no_cancel())
            .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn put_records_displaced_value_and_latest() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let domain = new_domain(dir.path());
        seed(&mdb, &domain);

        let ro = mdb.read();
        let ctx = domain.make_context();
        assert_eq!(domain.get_latest(b"\xaa", &ro).unwrap(), Some(b"v3".to_vec()));
        // history.get(k, T) == value before the change at T; past the last
        // change the domain falls back to the latest value.
        assert_eq!(ctx.get_as_of(b"\xaa", 5, &ro).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(ctx.get_as_of(b"\xaa", 9, &ro).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(ctx.get_as_of(b"\xaa", 10, &ro).unwrap(), Some(b"v3".to_vec()));
        assert_eq!(ctx.get_as_of(b"\xaa", 0, &ro).unwrap(), None);
    }

    #[test]
    fn reads_survive_build_and_merge() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let domain = new_domain(dir.path());
        seed(&mdb, &domain);
        build_and_prune(&mdb, &domain, 0..2);

        let probe = |domain: &Domain| {
            let ro = mdb.read();
            let ctx = domain.make_context();
            (
                ctx.get_latest(b"\xaa", &ro).unwrap(),
                ctx.get_as_of(b"\xaa", 5, &ro).unwrap(),
                ctx.get_as_of(b"\xaa", 6, &ro).unwrap(),
            )
        };
        let before = probe(&domain);
        assert_eq!(before.0, Some(b"v3".to_vec()));

        let ranges = domain.find_merge_range(8, 16);
        assert_eq!(ranges.values, Some((0, 8)));
        let values_outs = domain.files_in_range(0, 8);
        let index_outs = domain.history.ii.files_in_range(0, 8);
        let history_outs = domain.history.files_in_range(0, 8);
        let (values_in, index_in, history_in) = domain
            .merge_files(
                &values_outs,
                &index_outs,
                &history_outs,
                ranges,
                &no_cancel(),
                &|_, v| Ok(v.to_vec()),
            )
            .unwrap();
        domain.integrate_merged_files(
            &values_outs,
            &index_outs,
            &history_outs,
            values_in,
            index_in,
            history_in,
        );
        domain.delete_files(&values_outs, &index_outs, &history_outs);

        assert_eq!(probe(&domain), before);
        assert_eq!(domain.files_in_range(0, 8).len(), 1);
    }

    #[test]
    fn tombstones_read_as_absent_and_merge_away_from_genesis() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let domain = new_domain(dir.path());

        let mut txn = mdb.write();
        domain.put(&mut txn, b"\xbb", b"", 1, b"x").unwrap();
        domain.delete(&mut txn, b"\xbb", b"", 5).unwrap();
        txn.commit().unwrap();

        let ro = mdb.read();
        assert_eq!(domain.get_latest(b"\xbb", &ro).unwrap(), None);
        drop(ro);

        build_and_prune(&mdb, &domain, 0..2);
        let ranges = domain.find_merge_range(8, 16);
        let values_outs = domain.files_in_range(0, 8);
        let index_outs = domain.history.ii.files_in_range(0, 8);
        let history_outs = domain.history.files_in_range(0, 8);
        let (values_in, index_in, history_in) = domain
            .merge_files(
                &values_outs,
                &index_outs,
                &history_outs,
                ranges,
                &no_cancel(),
                &|_, v| Ok(v.to_vec()),
            )
            .unwrap();
        let merged = values_in.clone().expect("values merged");
        assert_eq!(merged.index.lookup(b"\xbb"), None, "tombstone dropped");
        domain.integrate_merged_files(
            &values_outs,
            &index_outs,
            &history_outs,
            values_in,
            index_in,
            history_in,
        );
        domain.delete_files(&values_outs, &index_outs, &history_outs);

        let ro = mdb.read();
        assert_eq!(domain.get_latest(b"\xbb", &ro).unwrap(), None);
        // The deletion is still visible to as-of reads via history.
        let ctx = domain.make_context();
        assert_eq!(ctx.get_as_of(b"\xbb", 3, &ro).unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn storage_style_composite_keys() {
        let dir = tempdir().unwrap();
        let mdb = Mdb::open(&dir.path().join("mdb")).unwrap();
        let domain = Domain::new(dir.path().join("snapshots"), "storage", 4).unwrap();

        let mut txn = mdb.write();
        domain.put(&mut txn, b"\xaa\xaa", b"\x01", 1, b"slot1").unwrap();
        domain.put(&mut txn, b"\xaa\xaa", b"\x02", 1, b"slot2").unwrap();
        txn.commit().unwrap();

        let ro = mdb.read();
        assert_eq!(
            domain.get_latest(b"\xaa\xaa\x01", &ro).unwrap(),
            Some(b"slot1".to_vec())
        );
        assert_eq!(
            domain.get_latest(b"\xaa\xaa\x02", &ro).unwrap(),
            Some(b"slot2".to_vec())
        );
        assert_eq!(domain.get_latest(b"\xaa\xaa\x03", &ro).unwrap(), None);
    }
}
