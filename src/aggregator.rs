//! The aggregator owns every domain and inverted index as one atomic
//! whole: it fans writer calls out to the components, runs the
//! collate -> build -> integrate -> merge -> prune pipeline in the
//! background, and hands out read snapshots (`AggregatorContext`,
//! `AggregatorStep`) that never observe a partial file swap.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{
    commitment::{
        decode_touch, CommitmentDomain, CommitmentMode, CommitmentUpdate, TouchKind, STATE_KEY,
    },
    config::StoreConfig,
    domain::{step_suffixed, Domain, DomainContext, DomainFiles, DomainRanges},
    error::{Result, StrataError},
    etl::Collector,
    files::FileItem,
    history::HistoryStep,
    inverted_index::{InvertedIndex, InvertedIndexContext, InvertedRangeIter},
    kv::{KvRead, Mdb, RoTxn, RwTxn},
};

pub struct Aggregator {
    inner: Arc<AggregatorInner>,
    scheduler: Scheduler,
}

pub struct AggregatorInner {
    pub step_size: u64,
    keep_in_db: u64,
    steps_in_biggest_file: u64,
    mdb: Arc<Mdb>,
    pub accounts: Domain,
    pub storage: Domain,
    pub code: Domain,
    pub commitment: CommitmentDomain,
    pub log_addrs: InvertedIndex,
    pub log_topics: InvertedIndex,
    pub traces_from: InvertedIndex,
    pub traces_to: InvertedIndex,
    tx_num: AtomicU64,
    max_tx_num: AtomicU64,
    cancel: AtomicBool,
}

struct StaticFiles {
    accounts: DomainFiles,
    storage: DomainFiles,
    code: DomainFiles,
    commitment: Option<DomainFiles>,
    log_addrs: Arc<FileItem>,
    log_topics: Arc<FileItem>,
    traces_from: Arc<FileItem>,
    traces_to: Arc<FileItem>,
}

#[derive(Debug, Clone, Copy, Default)]
struct MergeRanges {
    accounts: DomainRanges,
    storage: DomainRanges,
    code: DomainRanges,
    commitment: DomainRanges,
    log_addrs: Option<(u64, u64)>,
    log_topics: Option<(u64, u64)>,
    traces_from: Option<(u64, u64)>,
    traces_to: Option<(u64, u64)>,
}

impl MergeRanges {
    fn any(&self) -> bool {
        self.accounts.any()
            || self.storage.any()
            || self.code.any()
            || self.commitment.any()
            || self.log_addrs.is_some()
            || self.log_topics.is_some()
            || self.traces_from.is_some()
            || self.traces_to.is_some()
    }
}

impl Aggregator {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        cfg.ensure_data_dir()?;
        let mdb = Mdb::open(&cfg.mdb_path())?;
        let dir = cfg.snapshots_dir();
        let step = cfg.aggregation_step;
        let inner = Arc::new(AggregatorInner {
            step_size: step,
            keep_in_db: cfg.keep_in_db,
            steps_in_biggest_file: cfg.steps_in_biggest_file,
            mdb,
            accounts: Domain::new(dir.clone(), "accounts", step)?,
            storage: Domain::new(dir.clone(), "storage", step)?,
            code: Domain::new(dir.clone(), "code", step)?,
            commitment: CommitmentDomain::new(
                Domain::new(dir.clone(), "commitment", step)?,
                cfg.commitment_mode,
            ),
            log_addrs: InvertedIndex::new(
                dir.clone(),
                "logaddrs",
                step,
                "logaddrs.keys".into(),
                "logaddrs.idx".into(),
            )?,
            log_topics: InvertedIndex::new(
                dir.clone(),
                "logtopics",
                step,
                "logtopics.keys".into(),
                "logtopics.idx".into(),
            )?,
            traces_from: InvertedIndex::new(
                dir.clone(),
                "tracesfrom",
                step,
                "tracesfrom.keys".into(),
                "tracesfrom.idx".into(),
            )?,
            traces_to: InvertedIndex::new(
                dir,
                "tracesto",
                step,
                "tracesto.keys".into(),
                "tracesto.idx".into(),
            )?,
            tx_num: AtomicU64::new(0),
            max_tx_num: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
        });
        inner.recalc_max_tx_num();
        let scheduler = Scheduler::spawn(Arc::clone(&inner));
        Ok(Self { inner, scheduler })
    }

    pub fn mdb(&self) -> &Arc<Mdb> {
        &self.inner.mdb
    }

    pub fn begin_rw(&self) -> RwTxn {
        self.inner.mdb.write()
    }

    /// Advances the writer's logical clock. Must be non-decreasing within
    /// a writing session.
    pub fn set_tx_num(&self, tx_num: u64) {
        self.inner.tx_num.store(tx_num, Ordering::Release);
    }

    pub fn tx_num(&self) -> u64 {
        self.inner.tx_num.load(Ordering::Acquire)
    }

    /// The files frontier: reads below this are served by cold files.
    pub fn max_tx_num(&self) -> u64 {
        self.inner.max_tx_num.load(Ordering::Acquire)
    }

    pub fn put_account(&self, txn: &mut RwTxn, addr: &[u8], value: &[u8]) -> Result<()> {
        let tx_num = self.tx_num();
        self.inner.accounts.put(txn, addr, &[], tx_num, value)?;
        self.inner
            .commitment
            .touch_plain_key(addr, value, TouchKind::Account)
    }

    pub fn delete_account(&self, txn: &mut RwTxn, addr: &[u8]) -> Result<()> {
        self.put_account(txn, addr, &[])
    }

    pub fn put_storage(&self, txn: &mut RwTxn, addr: &[u8], loc: &[u8], value: &[u8]) -> Result<()> {
        let tx_num = self.tx_num();
        self.inner.storage.put(txn, addr, loc, tx_num, value)?;
        let mut key = addr.to_vec();
        key.extend_from_slice(loc);
        self.inner
            .commitment
            .touch_plain_key(&key, value, TouchKind::Storage)
    }

    pub fn put_code(&self, txn: &mut RwTxn, addr: &[u8], code: &[u8]) -> Result<()> {
        let tx_num = self.tx_num();
        self.inner.code.put(txn, addr, &[], tx_num, code)?;
        self.inner
            .commitment
            .touch_plain_key(addr, code, TouchKind::Code)
    }

    pub fn add_log_addr(&self, txn: &mut RwTxn, addr: &[u8]) {
        self.inner.log_addrs.add(txn, addr, self.tx_num());
    }

    pub fn add_log_topic(&self, txn: &mut RwTxn, topic: &[u8]) {
        self.inner.log_topics.add(txn, topic, self.tx_num());
    }

    pub fn add_trace_from(&self, txn: &mut RwTxn, addr: &[u8]) {
        self.inner.traces_from.add(txn, addr, self.tx_num());
    }

    pub fn add_trace_to(&self, txn: &mut RwTxn, addr: &[u8]) {
        self.inner.traces_to.add(txn, addr, self.tx_num());
    }

    /// Evaluates the commitment trie over the accumulated touches and
    /// writes the resulting branch records into the commitment domain.
    pub fn compute_commitment(&self, txn: &mut RwTxn, trace: bool) -> Result<[u8; 32]> {
        let inner = &self.inner;
        let reader: &RwTxn = txn;
        let fetch = |key: &[u8], kinds: u8| -> Result<CommitmentUpdate> {
            inner.fetch_update(key, kinds, reader)
        };
        let (root, branches) = inner.commitment.compute_commitment(&fetch)?;
        if trace {
            debug!(root = %hex::encode(root), branches = branches.len(), "computed commitment");
        }
        let tx_num = self.tx_num();
        for (prefix, branch) in branches {
            inner
                .commitment
                .domain
                .put(txn, &prefix, &[], tx_num, &branch.encode())?;
        }
        Ok(root)
    }

    pub fn store_commitment_state(&self, txn: &mut RwTxn, block_num: u64) -> Result<()> {
        self.inner
            .commitment
            .store_commitment_state(txn, block_num, self.tx_num())
    }

    /// Restores the latest usable checkpoint; see
    /// [`CommitmentDomain::seek_commitment`].
    pub fn seek_commitment(&self, since_tx: u64) -> Result<Option<(u64, u64)>> {
        let ro = self.inner.mdb.read();
        self.inner.commitment.seek_commitment(&ro, since_tx)
    }

    /// Builds every pending step synchronously. Fails fast; a failed step
    /// leaves MDB untouched and is retried on the next call.
    pub fn build_files(&self) -> Result<()> {
        self.inner.build_files()
    }

    /// Edge-triggered: enqueues a background build unless one is already
    /// queued or running. Merging and locality rebuilds chain after it.
    pub fn build_files_in_background(&self) {
        if !self.inner.can_build() {
            return;
        }
        self.scheduler.enqueue(Job::Build);
    }

    pub fn merge_loop(&self) -> Result<()> {
        self.inner.merge_loop()
    }

    pub fn can_prune(&self, reader: &dyn KvRead) -> Result<bool> {
        Ok(self.inner.can_prune_from(reader)? < self.max_tx_num())
    }

    /// Removes up to `limit` rows per component that are durably captured
    /// in files. Safe to interrupt and re-run.
    pub fn prune(&self, txn: &mut RwTxn, limit: u64) -> Result<()> {
        self.inner.prune(txn, limit)
    }

    pub fn prune_in_background(&self, limit: u64) {
        self.scheduler.enqueue(Job::Prune { limit });
    }

    pub fn warmup_in_background(&self, tx_from: u64, limit: u64) {
        self.scheduler.enqueue(Job::Warmup { tx_from, limit });
    }

    /// Rewinds domains to `tx_unwind_to`: accounts and storage stream
    /// their displaced values through `loader` (oldest change wins per
    /// key), code and commitment rewind silently, and the four inverted
    /// indices drop rows at or above the target. Call only with no
    /// background work in flight.
    pub fn unwind(
        &self,
        txn: &mut RwTxn,
        tx_unwind_to: u64,
        loader: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.inner.unwind(txn, tx_unwind_to, loader)
    }

    pub fn make_context(&self) -> AggregatorContext {
        AggregatorContext {
            accounts: self.inner.accounts.make_context(),
            storage: self.inner.storage.make_context(),
            code: self.inner.code.make_context(),
            commitment: self.inner.commitment.domain.make_context(),
            log_addrs: self.inner.log_addrs.make_context(),
            log_topics: self.inner.log_topics.make_context(),
            traces_from: self.inner.traces_from.make_context(),
            traces_to: self.inner.traces_to.make_context(),
            ro: self.inner.mdb.read(),
        }
    }

    /// One read snapshot per compacted step, aligned across accounts,
    /// storage and code. Unequal counts mean the caller must merge first.
    pub fn make_steps(&self) -> Result<Vec<AggregatorStep>> {
        let to = self.max_tx_num();
        let accounts = self.inner.accounts.make_steps(to);
        let storage = self.inner.storage.make_steps(to);
        let code = self.inner.code.make_steps(to);
        if accounts.len() != storage.len() || storage.len() != code.len() {
            return Err(StrataError::Misaligned {
                accounts: accounts.len(),
                storage: storage.len(),
                code: code.len(),
            });
        }
        Ok(accounts
            .into_iter()
            .zip(storage)
            .zip(code)
            .map(|((accounts, storage), code)| AggregatorStep {
                accounts,
                storage,
                code,
            })
            .collect())
    }

    /// Cancels background work and stops the scheduler. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.store(true, Ordering::Release);
        self.scheduler.shutdown();
    }

    #[cfg(test)]
    fn inner(&self) -> &AggregatorInner {
        &self.inner
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.close();
    }
}

impl AggregatorInner {
    fn commitment_enabled(&self) -> bool {
        self.commitment.mode() != CommitmentMode::Disabled
    }

    fn recalc_max_tx_num(&self) {
        let mut min = self
            .accounts
            .end_tx_num_minimax()
            .min(self.storage.end_tx_num_minimax())
            .min(self.code.end_tx_num_minimax())
            .min(self.log_addrs.end_tx_num_minimax())
            .min(self.log_topics.end_tx_num_minimax())
            .min(self.traces_from.end_tx_num_minimax())
            .min(self.traces_to.end_tx_num_minimax());
        if self.commitment_enabled() {
            min = min.min(self.commitment.domain.end_tx_num_minimax());
        }
        self.max_tx_num.store(min, Ordering::Release);
    }

    fn can_build(&self) -> bool {
        // Leave one step worth of data plus the retention slack in MDB.
        self.tx_num.load(Ordering::Acquire) + 1
            > self.max_tx_num.load(Ordering::Acquire) + self.step_size + self.keep_in_db
    }

    fn last_id_in_db(&self) -> Result<u64> {
        let ro = self.mdb.read();
        let last = ro.last_key(&self.accounts.history.ii.keys_table)?;
        Ok(last
            .filter(|row| row.len() >= 8)
            .map(|row| u64::from_be_bytes(row[..8].try_into().expect("8-byte prefix")))
            .unwrap_or(0))
    }

    fn build_files(&self) -> Result<()> {
        if !self.can_build() {
            return Ok(());
        }
        // Build as many small step files as the MDB already holds; new
        // commits may land while we work, so re-read the frontier each
        // iteration.
        let mut step = self.max_tx_num.load(Ordering::Acquire) / self.step_size;
        while step < self.last_id_in_db()? / self.step_size {
            info!(step, "building step files");
            let sf = self.build_step(step)?;
            self.integrate_files(sf);
            step += 1;
        }
        Ok(())
    }

    fn build_step(&self, step: u64) -> Result<StaticFiles> {
        let tx_from = step * self.step_size;
        let tx_to = (step + 1) * self.step_size;
        let cancel = &self.cancel;
        let mut built: Vec<Arc<FileItem>> = Vec::new();
        let result = (|| {
            let ro = self.mdb.read();
            let mut build_domain = |domain: &Domain| -> Result<DomainFiles> {
                let collation = domain.collate(&ro, step, tx_from, tx_to)?;
                let files = domain.build_files(step, &collation, cancel)?;
                built.extend([
                    Arc::clone(&files.values),
                    Arc::clone(&files.history.index),
                    Arc::clone(&files.history.history),
                ]);
                Ok(files)
            };
            let accounts = build_domain(&self.accounts)?;
            let storage = build_domain(&self.storage)?;
            let code = build_domain(&self.code)?;
            let commitment = if self.commitment_enabled() {
                Some(build_domain(&self.commitment.domain)?)
            } else {
                None
            };
            drop(build_domain);
            let mut build_index = |ii: &InvertedIndex| -> Result<Arc<FileItem>> {
                let collation = ii.collate(&ro, tx_from, tx_to)?;
                let item = ii.build_files(step, &collation, cancel)?;
                built.push(Arc::clone(&item));
                Ok(item)
            };
            Ok(StaticFiles {
                accounts,
                storage,
                code,
                commitment,
                log_addrs: build_index(&self.log_addrs)?,
                log_topics: build_index(&self.log_topics)?,
                traces_from: build_index(&self.traces_from)?,
                traces_to: build_index(&self.traces_to)?,
            })
        })();
        if result.is_err() {
            // Nothing was integrated; drop the half-built artifacts.
            for item in &built {
                item.mark_deleted();
            }
        }
        result
    }

    fn integrate_files(&self, sf: StaticFiles) {
        self.accounts.integrate_files(sf.accounts);
        self.storage.integrate_files(sf.storage);
        self.code.integrate_files(sf.code);
        if let Some(commitment) = sf.commitment {
            self.commitment.domain.integrate_files(commitment);
        }
        self.log_addrs.integrate_files(sf.log_addrs);
        self.log_topics.integrate_files(sf.log_topics);
        self.traces_from.integrate_files(sf.traces_from);
        self.traces_to.integrate_files(sf.traces_to);
        self.recalc_max_tx_num();
    }

    fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> MergeRanges {
        MergeRanges {
            accounts: self.accounts.find_merge_range(max_end_tx, max_span),
            storage: self.storage.find_merge_range(max_end_tx, max_span),
            code: self.code.find_merge_range(max_end_tx, max_span),
            commitment: if self.commitment_enabled() {
                self.commitment.domain.find_merge_range(max_end_tx, max_span)
            } else {
                DomainRanges::default()
            },
            log_addrs: self.log_addrs.find_merge_range(max_end_tx, max_span),
            log_topics: self.log_topics.find_merge_range(max_end_tx, max_span),
            traces_from: self.traces_from.find_merge_range(max_end_tx, max_span),
            traces_to: self.traces_to.find_merge_range(max_end_tx, max_span),
        }
    }

    fn merge_domain(
        &self,
        domain: &Domain,
        ranges: DomainRanges,
        transform: &dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>>,
    ) -> Result<Option<Vec<Arc<FileItem>>>> {
        if !ranges.any() {
            return Ok(None);
        }
        let values_outs = ranges
            .values
            .map(|(s, e)| domain.files_in_range(s, e))
            .unwrap_or_default();
        let index_outs = ranges
            .history
            .index
            .map(|(s, e)| domain.history.ii.files_in_range(s, e))
            .unwrap_or_default();
        let history_outs = ranges
            .history
            .history
            .map(|(s, e)| domain.history.files_in_range(s, e))
            .unwrap_or_default();
        let (values_in, index_in, history_in) = domain.merge_files(
            &values_outs,
            &index_outs,
            &history_outs,
            ranges,
            &self.cancel,
            transform,
        )?;
        domain.integrate_merged_files(
            &values_outs,
            &index_outs,
            &history_outs,
            values_in,
            index_in,
            history_in,
        );
        domain.delete_files(&values_outs, &index_outs, &history_outs);
        Ok(Some(values_outs))
    }

    fn merge_index(&self, ii: &InvertedIndex, range: Option<(u64, u64)>) -> Result<()> {
        let Some((start, end)) = range else {
            return Ok(());
        };
        let outs = ii.files_in_range(start, end);
        let merged = ii.merge_files(&outs, start, end, &self.cancel)?;
        ii.integrate_merged_files(&outs, merged);
        ii.delete_files(&outs);
        Ok(())
    }

    /// One rung of the merge ladder. Errors are fatal for the whole step;
    /// partially merged components stay integrated (they are equivalent
    /// reads) and the rest retries on the next loop.
    fn merge_loop_step(&self) -> Result<bool> {
        let max_span = self.step_size * self.steps_in_biggest_file;
        let ranges = self.find_merge_range(self.max_tx_num.load(Ordering::Acquire), max_span);
        if !ranges.any() {
            return Ok(false);
        }
        debug!(?ranges, "merging files");
        let identity = |_: &[u8], value: &[u8]| -> Result<Vec<u8>> { Ok(value.to_vec()) };
        let old_accounts = self
            .merge_domain(&self.accounts, ranges.accounts, &identity)?
            .unwrap_or_default();
        let old_storage = self
            .merge_domain(&self.storage, ranges.storage, &identity)?
            .unwrap_or_default();
        self.merge_domain(&self.code, ranges.code, &identity)?;
        self.merge_index(&self.log_addrs, ranges.log_addrs)?;
        self.merge_index(&self.log_topics, ranges.log_topics)?;
        self.merge_index(&self.traces_from, ranges.traces_from)?;
        self.merge_index(&self.traces_to, ranges.traces_to)?;
        if self.commitment_enabled() {
            // Account/storage offsets moved; rewrite embedded references
            // against the post-merge live files.
            let new_accounts = self.accounts.files_in_range(0, u64::MAX);
            let new_storage = self.storage.files_in_range(0, u64::MAX);
            let commitment = &self.commitment;
            let transform = |key: &[u8], value: &[u8]| -> Result<Vec<u8>> {
                if key.starts_with(STATE_KEY) {
                    return Ok(value.to_vec());
                }
                commitment.commitment_val_transform(
                    value,
                    &old_accounts,
                    &old_storage,
                    &new_accounts,
                    &new_storage,
                )
            };
            self.merge_domain(&self.commitment.domain, ranges.commitment, &transform)?;
        }
        Ok(true)
    }

    fn merge_loop(&self) -> Result<()> {
        while self.merge_loop_step()? {}
        Ok(())
    }

    fn build_locality(&self) -> Result<()> {
        let biggest_span = self.step_size * self.steps_in_biggest_file;
        for domain in [&self.accounts, &self.storage, &self.code] {
            domain.history.ii.build_locality(biggest_span, &self.cancel)?;
        }
        Ok(())
    }

    fn can_prune_from(&self, reader: &dyn KvRead) -> Result<u64> {
        let mut from = u64::MAX;
        for table in [
            &self.traces_to.keys_table,
            &self.storage.history.ii.keys_table,
        ] {
            if let Some(row) = reader.first_key(table)? {
                if row.len() >= 8 {
                    from = from.min(u64::from_be_bytes(
                        row[..8].try_into().expect("8-byte prefix"),
                    ));
                }
            }
        }
        Ok(from)
    }

    fn prune(&self, txn: &mut RwTxn, limit: u64) -> Result<()> {
        let to = self.max_tx_num.load(Ordering::Acquire);
        let cancel = &self.cancel;
        self.accounts.prune(txn, 0, to, limit, cancel)?;
        self.storage.prune(txn, 0, to, limit, cancel)?;
        self.code.prune(txn, 0, to, limit, cancel)?;
        if self.commitment_enabled() {
            self.commitment.domain.prune(txn, 0, to, limit, cancel)?;
        }
        self.log_addrs.prune(txn, 0, to, limit, cancel)?;
        self.log_topics.prune(txn, 0, to, limit, cancel)?;
        self.traces_from.prune(txn, 0, to, limit, cancel)?;
        self.traces_to.prune(txn, 0, to, limit, cancel)?;
        Ok(())
    }

    fn unwind(
        &self,
        txn: &mut RwTxn,
        tx_unwind_to: u64,
        loader: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let cancel = AtomicBool::new(false);
        let mut collector = Collector::new();
        self.unwind_domain(txn, &self.accounts, tx_unwind_to, Some(&mut collector))?;
        self.unwind_domain(txn, &self.storage, tx_unwind_to, Some(&mut collector))?;
        collector.load(|key, value| loader(key, value))?;
        self.unwind_domain(txn, &self.code, tx_unwind_to, None)?;
        if self.commitment_enabled() {
            self.unwind_domain(txn, &self.commitment.domain, tx_unwind_to, None)?;
        }
        for ii in [
            &self.log_addrs,
            &self.log_topics,
            &self.traces_from,
            &self.traces_to,
        ] {
            ii.prune(txn, tx_unwind_to, u64::MAX, u64::MAX, &cancel)?;
        }
        Ok(())
    }

    /// Deletes a domain's changes at or above `tx_to` and reinstates, per
    /// touched key, the value it held just before the unwind point.
    fn unwind_domain(
        &self,
        txn: &mut RwTxn,
        domain: &Domain,
        tx_to: u64,
        mut collector: Option<&mut Collector>,
    ) -> Result<()> {
        let cancel = AtomicBool::new(false);
        let step_size = self.step_size;
        let unwind_step = tx_to / step_size;
        let mut restores: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = Default::default();
        let mut stale = Vec::new();
        domain
            .history
            .prune_with(txn, tx_to, u64::MAX, u64::MAX, &cancel, |txnum, key, prev| {
                // The first change at or above the target carries the
                // value as of the unwind point.
                restores.entry(key.to_vec()).or_insert_with(|| prev.to_vec());
                stale.push(step_suffixed(key, txnum / step_size));
                Ok(())
            })?;
        for row in stale {
            txn.delete(&domain.vals_table, &row);
        }
        for (key, prev) in &restores {
            if let Some(collector) = collector.as_deref_mut() {
                collector.collect(key, prev);
            }
            if !prev.is_empty() {
                txn.put(&domain.vals_table, &step_suffixed(key, unwind_step), prev);
            }
        }
        Ok(())
    }

    fn warmup(&self, tx_from: u64, limit: u64) -> Result<()> {
        let ro = self.mdb.read();
        let mut rows = 0u64;
        for domain in [&self.accounts, &self.storage, &self.code] {
            rows += domain.history.warmup(&ro, tx_from, limit)?;
        }
        for ii in [
            &self.log_addrs,
            &self.log_topics,
            &self.traces_from,
            &self.traces_to,
        ] {
            rows += ii.warmup(&ro, tx_from, limit)?;
        }
        debug!(tx_from, rows, "warmup pass complete");
        Ok(())
    }

    fn fetch_update(&self, key: &[u8], kinds: u8, reader: &dyn KvRead) -> Result<CommitmentUpdate> {
        let mut update: Option<CommitmentUpdate> = None;
        if kinds & TouchKind::Code.bit() != 0 {
            let code = self.code.get_latest(key, reader)?.unwrap_or_default();
            update = Some(decode_touch(TouchKind::Code, &code, update.as_ref())?);
        }
        if kinds & TouchKind::Account.bit() != 0 {
            let account = self.accounts.get_latest(key, reader)?.unwrap_or_default();
            update = Some(decode_touch(TouchKind::Account, &account, update.as_ref())?);
        }
        if kinds & TouchKind::Storage.bit() != 0 {
            let value = self.storage.get_latest(key, reader)?.unwrap_or_default();
            update = Some(decode_touch(TouchKind::Storage, &value, update.as_ref())?);
        }
        update.ok_or_else(|| StrataError::Invariant("commitment touch without a kind".into()))
    }
}

/// Read snapshot over every component's live file set plus a read view of
/// the MDB. Safe to hold across any number of queries.
pub struct AggregatorContext {
    pub accounts: DomainContext,
    pub storage: DomainContext,
    pub code: DomainContext,
    pub commitment: DomainContext,
    pub log_addrs: InvertedIndexContext,
    pub log_topics: InvertedIndexContext,
    pub traces_from: InvertedIndexContext,
    pub traces_to: InvertedIndexContext,
    ro: RoTxn,
}

impl AggregatorContext {
    fn storage_key(addr: &[u8], loc: &[u8]) -> Vec<u8> {
        let mut key = addr.to_vec();
        key.extend_from_slice(loc);
        key
    }

    pub fn read_account_data_no_state(&self, addr: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.accounts.history.get_no_state(addr, ts)?.map(|(v, _)| v))
    }

    pub fn read_account_data_with_recent(&self, addr: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .accounts
            .history
            .get_no_state_with_recent(addr, ts, &self.ro)?
            .map(|(v, _)| v))
    }

    pub fn read_account_storage_no_state(
        &self,
        addr: &[u8],
        loc: &[u8],
        ts: u64,
    ) -> Result<Option<Vec<u8>>> {
        let key = Self::storage_key(addr, loc);
        Ok(self.storage.history.get_no_state(&key, ts)?.map(|(v, _)| v))
    }

    pub fn read_account_storage_with_recent(
        &self,
        addr: &[u8],
        loc: &[u8],
        ts: u64,
    ) -> Result<Option<Vec<u8>>> {
        let key = Self::storage_key(addr, loc);
        Ok(self
            .storage
            .history
            .get_no_state_with_recent(&key, ts, &self.ro)?
            .map(|(v, _)| v))
    }

    pub fn read_account_code_no_state(&self, addr: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.code.history.get_no_state(addr, ts)?.map(|(v, _)| v))
    }

    pub fn read_account_code_with_recent(&self, addr: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .code
            .history
            .get_no_state_with_recent(addr, ts, &self.ro)?
            .map(|(v, _)| v))
    }

    pub fn read_account_code_size_with_recent(&self, addr: &[u8], ts: u64) -> Result<Option<usize>> {
        Ok(self
            .read_account_code_with_recent(addr, ts)?
            .map(|code| code.len()))
    }

    /// Value of an account as of `ts`, falling back to the latest value
    /// when it has not changed since.
    pub fn account_as_of(&self, addr: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        self.accounts.get_as_of(addr, ts, &self.ro)
    }

    pub fn storage_as_of(&self, addr: &[u8], loc: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        self.storage.get_as_of(&Self::storage_key(addr, loc), ts, &self.ro)
    }

    pub fn account_latest(&self, addr: &[u8]) -> Result<Option<Vec<u8>>> {
        self.accounts.get_latest(addr, &self.ro)
    }

    pub fn storage_latest(&self, addr: &[u8], loc: &[u8]) -> Result<Option<Vec<u8>>> {
        self.storage.get_latest(&Self::storage_key(addr, loc), &self.ro)
    }

    pub fn log_addr_iterator(
        &self,
        addr: &[u8],
        from_ts: i64,
        to_ts: i64,
        asc: bool,
        limit: i64,
    ) -> Result<InvertedRangeIter> {
        self.log_addrs.iterate_range(&self.ro, addr, from_ts, to_ts, asc, limit)
    }

    pub fn log_topic_iterator(
        &self,
        topic: &[u8],
        from_ts: i64,
        to_ts: i64,
        asc: bool,
        limit: i64,
    ) -> Result<InvertedRangeIter> {
        self.log_topics.iterate_range(&self.ro, topic, from_ts, to_ts, asc, limit)
    }

    pub fn trace_from_iterator(
        &self,
        addr: &[u8],
        from_ts: i64,
        to_ts: i64,
        asc: bool,
        limit: i64,
    ) -> Result<InvertedRangeIter> {
        self.traces_from.iterate_range(&self.ro, addr, from_ts, to_ts, asc, limit)
    }

    pub fn trace_to_iterator(
        &self,
        addr: &[u8],
        from_ts: i64,
        to_ts: i64,
        asc: bool,
        limit: i64,
    ) -> Result<InvertedRangeIter> {
        self.traces_to.iterate_range(&self.ro, addr, from_ts, to_ts, asc, limit)
    }

    pub fn account_history_idx_iterator(
        &self,
        addr: &[u8],
        from_ts: i64,
        to_ts: i64,
        asc: bool,
        limit: i64,
    ) -> Result<InvertedRangeIter> {
        self.accounts
            .history
            .ii
            .iterate_range(&self.ro, addr, from_ts, to_ts, asc, limit)
    }

    pub fn account_history_iterate_changed(
        &self,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.accounts.history.iterate_changed(&self.ro, start_tx, end_tx)
    }

    pub fn storage_history_iterate_changed(
        &self,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.storage.history.iterate_changed(&self.ro, start_tx, end_tx)
    }

    pub fn account_historical_state_range(
        &self,
        start_tx: u64,
        from: &[u8],
        to: &[u8],
        amount: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.accounts.history.walk_as_of(&self.ro, start_tx, from, to, amount)
    }

    pub fn storage_historical_state_range(
        &self,
        start_tx: u64,
        from: &[u8],
        to: &[u8],
        amount: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.storage.history.walk_as_of(&self.ro, start_tx, from, to, amount)
    }
}

/// Per-step read snapshot across accounts, storage and code, used for
/// parallel history reconstitution. Clones share the same file handles.
#[derive(Clone, Debug)]
pub struct AggregatorStep {
    pub accounts: HistoryStep,
    pub storage: HistoryStep,
    pub code: HistoryStep,
}

impl AggregatorStep {
    pub fn tx_num_range(&self) -> (u64, u64) {
        self.accounts.tx_range()
    }

    pub fn read_account_data_no_state(
        &self,
        addr: &[u8],
        ts: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        self.accounts.get_no_state(addr, ts)
    }

    pub fn read_account_storage_no_state(
        &self,
        addr: &[u8],
        loc: &[u8],
        ts: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let mut key = addr.to_vec();
        key.extend_from_slice(loc);
        self.storage.get_no_state(&key, ts)
    }

    pub fn read_account_code_no_state(
        &self,
        addr: &[u8],
        ts: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        self.code.get_no_state(addr, ts)
    }

    pub fn max_tx_num_accounts(&self, addr: &[u8]) -> Result<Option<u64>> {
        self.accounts.max_tx_num(addr)
    }

    pub fn max_tx_num_storage(&self, addr: &[u8], loc: &[u8]) -> Result<Option<u64>> {
        let mut key = addr.to_vec();
        key.extend_from_slice(loc);
        self.storage.max_tx_num(&key)
    }

    pub fn max_tx_num_code(&self, addr: &[u8]) -> Result<Option<u64>> {
        self.code.max_tx_num(addr)
    }

    pub fn iterate_accounts_txs(&self) -> Result<Vec<u64>> {
        self.accounts.iterate_txs()
    }

    pub fn iterate_storage_txs(&self) -> Result<Vec<u64>> {
        self.storage.iterate_txs()
    }

    pub fn iterate_code_txs(&self) -> Result<Vec<u64>> {
        self.code.iterate_txs()
    }

    pub fn iterate_accounts_history(&self, ts: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.accounts.iterate_history_before_tx_num(ts)
    }

    pub fn iterate_storage_history(&self, ts: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.storage.iterate_history_before_tx_num(ts)
    }

    pub fn iterate_code_history(&self, ts: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.code.iterate_history_before_tx_num(ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobKind {
    Build,
    Merge,
    BuildLocality,
    Prune,
    Warmup,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Build,
    Merge,
    BuildLocality,
    Prune { limit: u64 },
    Warmup { tx_from: u64, limit: u64 },
}

impl Job {
    fn kind(&self) -> JobKind {
        match self {
            Job::Build => JobKind::Build,
            Job::Merge => JobKind::Merge,
            Job::BuildLocality => JobKind::BuildLocality,
            Job::Prune { .. } => JobKind::Prune,
            Job::Warmup { .. } => JobKind::Warmup,
        }
    }
}

struct SchedulerState {
    queue: VecDeque<Job>,
    busy: HashSet<JobKind>,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    condvar: Condvar,
}

/// Single worker thread with a category-deduplicated job queue: at most
/// one Build, one Merge, etc. queued or running at any time.
struct Scheduler {
    shared: Arc<SchedulerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    fn spawn(inner: Arc<AggregatorInner>) -> Self {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                busy: HashSet::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("strata-scheduler".into())
            .spawn(move || Self::run(worker_shared, inner))
            .expect("spawn scheduler thread");
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn enqueue_on(shared: &SchedulerShared, job: Job) {
        let mut state = shared.state.lock();
        if state.shutdown || !state.busy.insert(job.kind()) {
            return;
        }
        state.queue.push_back(job);
        shared.condvar.notify_one();
    }

    fn enqueue(&self, job: Job) {
        Self::enqueue_on(&self.shared, job);
    }

    fn run(shared: Arc<SchedulerShared>, inner: Arc<AggregatorInner>) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    shared.condvar.wait(&mut state);
                }
            };
            let result = match job {
                Job::Build => inner.build_files(),
                Job::Merge => inner.merge_loop(),
                Job::BuildLocality => inner.build_locality(),
                Job::Prune { limit } => {
                    let mut txn = inner.mdb.write();
                    inner.prune(&mut txn, limit).and_then(|()| txn.commit())
                }
                Job::Warmup { tx_from, limit } => inner.warmup(tx_from, limit),
            };
            shared.state.lock().busy.remove(&job.kind());
            match result {
                Ok(()) => match job {
                    // Builds roll into merges, merges into locality.
                    Job::Build => Self::enqueue_on(&shared, Job::Merge),
                    Job::Merge => Self::enqueue_on(&shared, Job::BuildLocality),
                    _ => {}
                },
                Err(err) if err.is_cancelled() => {}
                Err(err) => warn!(?job, %err, "background job failed"),
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.condvar.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::encode_account;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, mode: CommitmentMode) -> StoreConfig {
        StoreConfig {
            data_dir: dir.to_path_buf(),
            aggregation_step: 4,
            keep_in_db: 0,
            steps_in_biggest_file: 4,
            workers: 1,
            commitment_mode: mode,
        }
    }

    fn open(dir: &std::path::Path, mode: CommitmentMode) -> Aggregator {
        Aggregator::new(&test_config(dir, mode)).expect("open aggregator")
    }

    /// Changes of key 0xAA: v1@1 (no previous), v2@5, v3@9.
    fn seed_account_history(agg: &Aggregator) {
        let mut txn = agg.begin_rw();
        agg.set_tx_num(1);
        agg.put_account(&mut txn, b"\xaa", b"v1").unwrap();
        agg.set_tx_num(5);
        agg.put_account(&mut txn, b"\xaa", b"v2").unwrap();
        agg.set_tx_num(9);
        agg.put_account(&mut txn, b"\xaa", b"v3").unwrap();
        txn.commit().unwrap();
    }

    fn account_file_ranges(agg: &Aggregator) -> Vec<(u64, u64)> {
        agg.inner()
            .accounts
            .files_in_range(0, u64::MAX)
            .iter()
            .map(|f| (f.start_tx, f.end_tx))
            .collect()
    }

    fn assert_account_history(agg: &Aggregator) {
        let ctx = agg.make_context();
        // Before the first change the key did not exist.
        assert_eq!(
            ctx.read_account_data_with_recent(b"\xaa", 0).unwrap(),
            Some(Vec::new())
        );
        assert_eq!(
            ctx.read_account_data_with_recent(b"\xaa", 1).unwrap(),
            Some(Vec::new())
        );
        // The value before each change, per the history contract.
        assert_eq!(
            ctx.read_account_data_with_recent(b"\xaa", 5).unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(
            ctx.read_account_data_with_recent(b"\xaa", 8).unwrap(),
            Some(b"v2".to_vec())
        );
        assert_eq!(
            ctx.read_account_data_with_recent(b"\xaa", 9).unwrap(),
            Some(b"v2".to_vec())
        );
        // No change at or after 10: fall back to the latest value.
        assert_eq!(ctx.read_account_data_with_recent(b"\xaa", 10).unwrap(), None);
        assert_eq!(ctx.account_as_of(b"\xaa", 10).unwrap(), Some(b"v3".to_vec()));
        assert_eq!(ctx.account_as_of(b"\xaa", 0).unwrap(), None);
        assert_eq!(ctx.account_latest(b"\xaa").unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn history_round_trip() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Disabled);
        seed_account_history(&agg);
        assert_account_history(&agg);
    }

    #[test]
    fn build_merge_and_prune_preserve_reads() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Disabled);
        seed_account_history(&agg);
        let mut txn = agg.begin_rw();
        agg.set_tx_num(13);
        agg.put_account(&mut txn, b"\xbb", b"x").unwrap();
        txn.commit().unwrap();

        agg.build_files().unwrap();
        assert_eq!(account_file_ranges(&agg), vec![(0, 4), (4, 8), (8, 12)]);
        assert_eq!(agg.max_tx_num(), 12);
        assert_account_history(&agg);

        agg.merge_loop().unwrap();
        assert_eq!(account_file_ranges(&agg), vec![(0, 8), (8, 12)]);
        assert_account_history(&agg);

        let mut txn = agg.begin_rw();
        agg.prune(&mut txn, u64::MAX).unwrap();
        txn.commit().unwrap();
        assert_account_history(&agg);

        // Prune again: same live files, same rows, same reads.
        let before = account_file_ranges(&agg);
        let mut txn = agg.begin_rw();
        agg.prune(&mut txn, u64::MAX).unwrap();
        txn.commit().unwrap();
        assert_eq!(account_file_ranges(&agg), before);
        assert_account_history(&agg);

        // The hot tail (txnum 13) stayed in MDB.
        let ctx = agg.make_context();
        assert_eq!(ctx.account_latest(b"\xbb").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn inverted_range_across_build_and_merge() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Disabled);
        let mut txn = agg.begin_rw();
        for tx in [3u64, 7, 11, 19] {
            agg.set_tx_num(tx);
            agg.add_log_addr(&mut txn, b"\xca\xfe");
            agg.put_account(&mut txn, b"\xaa", b"v").unwrap();
        }
        txn.commit().unwrap();

        agg.build_files().unwrap();
        agg.merge_loop().unwrap();

        let ctx = agg.make_context();
        let asc: Vec<u64> = ctx.log_addr_iterator(b"\xca\xfe", 5, 15, true, -1).unwrap().collect();
        assert_eq!(asc, vec![7, 11]);
        let desc: Vec<u64> = ctx.log_addr_iterator(b"\xca\xfe", 15, 5, false, 1).unwrap().collect();
        assert_eq!(desc, vec![11]);
    }

    #[test]
    fn unwind_restores_prior_state() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Disabled);
        seed_account_history(&agg);
        agg.set_tx_num(13);

        // The value as of the unwind point equals history.get(k, 6).
        let expected = agg
            .make_context()
            .read_account_data_with_recent(b"\xaa", 6)
            .unwrap();
        assert_eq!(expected, Some(b"v2".to_vec()));

        let mut txn = agg.begin_rw();
        let mut received = Vec::new();
        agg.unwind(&mut txn, 6, &mut |key, value| {
            received.push((key.to_vec(), value.to_vec()));
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();

        assert_eq!(received, vec![(b"\xaa".to_vec(), b"v2".to_vec())]);
        let ctx = agg.make_context();
        assert_eq!(ctx.account_latest(b"\xaa").unwrap(), Some(b"v2".to_vec()));
        // Changes at or above the target are gone from history.
        assert_eq!(ctx.read_account_data_with_recent(b"\xaa", 6).unwrap(), None);
        assert_eq!(
            ctx.read_account_data_with_recent(b"\xaa", 5).unwrap(),
            Some(b"v1".to_vec())
        );
    }

    #[test]
    fn steps_align_across_domains_or_error() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Disabled);
        seed_account_history(&agg);
        let mut txn = agg.begin_rw();
        agg.set_tx_num(13);
        agg.put_account(&mut txn, b"\xbb", b"x").unwrap();
        txn.commit().unwrap();
        agg.build_files().unwrap();

        let steps = agg.make_steps().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].tx_num_range(), (0, 4));
        assert_eq!(
            steps[1].read_account_data_no_state(b"\xaa", 4).unwrap(),
            Some((b"v1".to_vec(), 5))
        );
        assert_eq!(steps[2].max_tx_num_accounts(b"\xaa").unwrap(), Some(9));
        let clone = steps[1].clone();
        assert_eq!(clone.tx_num_range(), (4, 8));

        // Merge accounts ahead of the others: step counts diverge.
        let inner = agg.inner();
        let ranges = inner.accounts.find_merge_range(12, 16);
        let identity = |_: &[u8], value: &[u8]| -> Result<Vec<u8>> { Ok(value.to_vec()) };
        inner.merge_domain(&inner.accounts, ranges, &identity).unwrap();
        let err = agg.make_steps().unwrap_err();
        assert!(matches!(
            err,
            StrataError::Misaligned {
                accounts: 2,
                storage: 3,
                code: 3
            }
        ));
    }

    #[test]
    fn direct_and_update_commitments_agree() {
        let addr = vec![0x11u8; 20];
        let account_value = encode_account(1, b"\x64");
        let roots: Vec<[u8; 32]> = [CommitmentMode::Direct, CommitmentMode::Update]
            .into_iter()
            .map(|mode| {
                let dir = tempdir().unwrap();
                let agg = open(dir.path(), mode);
                let mut txn = agg.begin_rw();
                agg.set_tx_num(1);
                agg.put_account(&mut txn, &addr, &account_value).unwrap();
                agg.put_storage(&mut txn, &addr, &[0x22; 32], b"sv").unwrap();
                agg.put_code(&mut txn, &addr, b"code").unwrap();
                let root = agg.compute_commitment(&mut txn, false).unwrap();
                txn.commit().unwrap();
                root
            })
            .collect();
        assert_eq!(roots[0], roots[1]);
    }

    #[test]
    fn short_keys_survive_a_merge() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Update);
        let addr = vec![0x11u8; 20];
        let slot = [0x22u8; 32];
        let mut storage_key = addr.clone();
        storage_key.extend_from_slice(&slot);

        let mut txn = agg.begin_rw();
        agg.set_tx_num(1);
        agg.put_account(&mut txn, &addr, &encode_account(1, b"\x64")).unwrap();
        agg.put_storage(&mut txn, &addr, &slot, b"sv1").unwrap();
        agg.set_tx_num(2);
        agg.compute_commitment(&mut txn, false).unwrap();
        agg.set_tx_num(5);
        agg.put_account(&mut txn, &addr, &encode_account(2, b"\x65")).unwrap();
        agg.put_storage(&mut txn, &addr, &slot, b"sv2").unwrap();
        agg.set_tx_num(6);
        agg.compute_commitment(&mut txn, false).unwrap();
        agg.set_tx_num(13);
        agg.put_account(&mut txn, &vec![0x33u8; 20], &encode_account(1, b"\x01")).unwrap();
        txn.commit().unwrap();

        agg.build_files().unwrap();
        agg.merge_loop().unwrap();

        let inner = agg.inner();
        let merged = inner.commitment.domain.files_in_range(0, 8);
        assert_eq!(merged.len(), 1);
        let new_accounts = inner.accounts.files_in_range(0, u64::MAX);
        let new_storage = inner.storage.files_in_range(0, u64::MAX);

        let mut getter = merged[0].data.getter();
        let mut references = 0usize;
        while getter.has_next() {
            let key = getter.next().unwrap().to_vec();
            let value = getter.next().unwrap().to_vec();
            if key.starts_with(STATE_KEY) || value.is_empty() {
                continue;
            }
            let branch = crate::commitment::BranchData::decode(&value).unwrap();
            for reference in &branch.account_keys {
                assert_ne!(reference.len(), 20, "reference was not shortened");
                let resolved = inner
                    .commitment
                    .lookup_shortened_key(reference, &new_accounts)
                    .unwrap()
                    .expect("short key resolves in merged file");
                assert_eq!(resolved, addr);
                references += 1;
            }
            for reference in &branch.storage_keys {
                assert_ne!(reference.len(), 52, "reference was not shortened");
                let resolved = inner
                    .commitment
                    .lookup_shortened_key(reference, &new_storage)
                    .unwrap()
                    .expect("short key resolves in merged file");
                assert_eq!(resolved, storage_key);
                references += 1;
            }
        }
        assert!(references > 0, "merged branch records carry references");
    }

    #[test]
    fn background_build_is_edge_triggered() {
        let dir = tempdir().unwrap();
        let agg = open(dir.path(), CommitmentMode::Disabled);
        seed_account_history(&agg);
        let mut txn = agg.begin_rw();
        agg.set_tx_num(13);
        agg.put_account(&mut txn, b"\xbb", b"x").unwrap();
        txn.commit().unwrap();

        agg.build_files_in_background();
        agg.build_files_in_background(); // no-op while one is in flight

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while account_file_ranges(&agg).len() < 2 {
            assert!(std::time::Instant::now() < deadline, "background build timed out");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        // The chained merge eventually coalesces the ladder.
        while account_file_ranges(&agg) != vec![(0, 8), (8, 12)] {
            assert!(std::time::Instant::now() < deadline, "background merge timed out");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_account_history(&agg);
        agg.close();
        agg.close(); // idempotent
    }
}
