//! Immutable cold-file artifacts.
//!
//! A compacted `[start_tx, end_tx)` range is a data file of
//! varint-length-prefixed words (key word, value word alternating) plus a
//! key-to-offset index. Files are named `<base>.<startStep>-<endStep>.<ext>`
//! and written through a temp file so a crash never leaves a half-built
//! artifact under the final name.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::{
    ef::{put_uvarint, take_uvarint},
    error::{Result, StrataError},
};

pub fn step_file_name(base: &str, step_size: u64, start_tx: u64, end_tx: u64, ext: &str) -> String {
    format!(
        "{base}.{}-{}.{ext}",
        start_tx / step_size,
        end_tx / step_size
    )
}

pub fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(StrataError::Cancelled)
    } else {
        Ok(())
    }
}

/// Writes a segment data file word by word, returning each word's offset.
pub struct SegmentWriter {
    tmp: NamedTempFile,
    target: PathBuf,
    offset: u64,
    words: u64,
}

impl SegmentWriter {
    pub fn create(dir: &Path, file_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            tmp: NamedTempFile::new_in(dir)?,
            target: dir.join(file_name),
            offset: 0,
            words: 0,
        })
    }

    /// Appends one word and returns the offset it starts at.
    pub fn add_word(&mut self, word: &[u8]) -> Result<u64> {
        let offset = self.offset;
        let mut frame = Vec::with_capacity(word.len() + 9);
        put_uvarint(&mut frame, word.len() as u64);
        frame.extend_from_slice(word);
        self.tmp.write_all(&frame)?;
        self.offset += frame.len() as u64;
        self.words += 1;
        Ok(offset)
    }

    pub fn words(&self) -> u64 {
        self.words
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.tmp.flush()?;
        self.tmp
            .persist(&self.target)
            .map_err(|err| StrataError::Io(err.error))?;
        Ok(self.target)
    }
}

/// Read-only view over a segment data file.
#[derive(Debug)]
pub struct SegmentReader {
    // None for empty files: zero-length mappings are not portable.
    mmap: Option<Mmap>,
    size: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let size = file.metadata()?.len();
        let mmap = if size == 0 {
            None
        } else {
            // Safety: segment files are immutable once persisted.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { mmap, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn getter(&self) -> Getter<'_> {
        Getter {
            data: self.data(),
            pos: 0,
        }
    }
}

/// Sequential word reader, resettable to any word offset.
pub struct Getter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Getter<'a> {
    pub fn reset(&mut self, offset: u64) {
        self.pos = offset as usize;
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    pub fn next(&mut self) -> Result<&'a [u8]> {
        let len = take_uvarint(self.data, &mut self.pos)? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| StrataError::Corruption("segment word overruns file".into()))?;
        let word = &self.data[self.pos..end];
        self.pos = end;
        Ok(word)
    }
}

/// Key-to-offset index for one segment file. Serves the minimal-perfect-
/// hash contract with a sorted key table and binary search.
#[derive(Debug)]
pub struct OffsetIndex {
    entries: Vec<(Vec<u8>, u64)>,
}

impl OffsetIndex {
    pub fn build(dir: &Path, file_name: &str, entries: &[(Vec<u8>, u64)]) -> Result<PathBuf> {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        let mut buf = Vec::new();
        put_uvarint(&mut buf, entries.len() as u64);
        for (key, offset) in entries {
            put_uvarint(&mut buf, key.len() as u64);
            buf.extend_from_slice(key);
            put_uvarint(&mut buf, *offset);
        }
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&buf)?;
        tmp.flush()?;
        let target = dir.join(file_name);
        tmp.persist(&target)
            .map_err(|err| StrataError::Io(err.error))?;
        Ok(target)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let buf = fs::read(path)?;
        let mut pos = 0usize;
        let count = take_uvarint(&buf, &mut pos)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = take_uvarint(&buf, &mut pos)? as usize;
            let end = pos
                .checked_add(key_len)
                .filter(|&e| e <= buf.len())
                .ok_or_else(|| StrataError::Corruption("index key overruns file".into()))?;
            let key = buf[pos..end].to_vec();
            pos = end;
            let offset = take_uvarint(&buf, &mut pos)?;
            entries.push((key, offset));
        }
        if pos != buf.len() {
            return Err(StrataError::Corruption(format!(
                "trailing bytes in index file {}",
                path.display()
            )));
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|(k, _)| k.as_slice())
    }
}

/// One live cold-file artifact. Shared between the aggregator and any read
/// contexts; when a merge retires it, the physical files are removed only
/// after the last holder drops its handle.
#[derive(Debug)]
pub struct FileItem {
    pub start_tx: u64,
    pub end_tx: u64,
    pub data: SegmentReader,
    pub index: OffsetIndex,
    data_path: PathBuf,
    index_path: PathBuf,
    deleted: AtomicBool,
}

impl FileItem {
    pub fn open(data_path: PathBuf, index_path: PathBuf, start_tx: u64, end_tx: u64) -> Result<Arc<Self>> {
        let data = SegmentReader::open(&data_path)?;
        let index = OffsetIndex::open(&index_path)?;
        Ok(Arc::new(Self {
            start_tx,
            end_tx,
            data,
            index,
            data_path,
            index_path,
            deleted: AtomicBool::new(false),
        }))
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Value word for `key`, if the file holds it.
    pub fn lookup_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(offset) = self.index.lookup(key) else {
            return Ok(None);
        };
        let mut getter = self.data.getter();
        getter.reset(offset);
        let stored = getter.next()?;
        if stored != key {
            return Err(StrataError::Corruption(format!(
                "index points at mismatched key in {}",
                self.data_path.display()
            )));
        }
        Ok(Some(getter.next()?.to_vec()))
    }
}

impl Drop for FileItem {
    fn drop(&mut self) {
        if self.deleted.load(Ordering::Acquire) {
            for path in [&self.data_path, &self.index_path] {
                if let Err(err) = fs::remove_file(path) {
                    warn!(path = %path.display(), %err, "failed to remove retired file");
                }
            }
        }
    }
}

pub type FileMap = BTreeMap<(u64, u64), Arc<FileItem>>;

/// Smallest mergeable range per the power-of-two ladder: a file ending at
/// step `e` may close a span of `lowbit(e)` steps (capped at `max_span`);
/// the range is chosen at the lowest start that strictly extends a file.
pub fn find_merge_range(files: &FileMap, max_end_tx: u64, max_span: u64, step_size: u64) -> Option<(u64, u64)> {
    let mut found: Option<(u64, u64)> = None;
    for &(start, end) in files.keys() {
        if end > max_end_tx {
            continue;
        }
        let end_step = end / step_size;
        let span_step = end_step & end_step.wrapping_neg();
        let span = (span_step * step_size).min(max_span);
        let range_start = end.saturating_sub(span);
        if range_start < start {
            match found {
                Some((s, _)) if range_start >= s => {}
                _ => found = Some((range_start, end)),
            }
        }
    }
    found
}

/// Reopens existing `<base>.<s>-<e>.<data_ext>` artifacts in `dir` that
/// have a matching index file.
pub fn scan_step_files(
    dir: &Path,
    base: &str,
    data_ext: &str,
    index_ext: &str,
    step_size: u64,
) -> Result<FileMap> {
    let mut files = FileMap::new();
    if !dir.exists() {
        return Ok(files);
    }
    let prefix = format!("{base}.");
    let suffix = format!(".{data_ext}");
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(middle) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
        else {
            continue;
        };
        let Some((start_step, end_step)) = middle.split_once('-') else {
            continue;
        };
        let (Ok(start_step), Ok(end_step)) = (start_step.parse::<u64>(), end_step.parse::<u64>())
        else {
            continue;
        };
        let start_tx = start_step * step_size;
        let end_tx = end_step * step_size;
        let index_path = dir.join(step_file_name(base, step_size, start_tx, end_tx, index_ext));
        if !index_path.exists() {
            warn!(file = name, "data file without index, skipping");
            continue;
        }
        let item = FileItem::open(entry.path(), index_path, start_tx, end_tx)?;
        files.insert((start_tx, end_tx), item);
    }
    Ok(files)
}

/// Live files fully contained in `[start_tx, end_tx)`.
pub fn files_in_range(files: &FileMap, start_tx: u64, end_tx: u64) -> Vec<Arc<FileItem>> {
    files
        .values()
        .filter(|f| f.start_tx >= start_tx && f.end_tx <= end_tx)
        .cloned()
        .collect()
}
