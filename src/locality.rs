//! Advisory locality index: for each key, a 32-bit bitmap of which
//! biggest-span files contain at least one posting. A clear bit proves
//! absence; a set bit still requires consulting the file. Rebuilt lazily
//! in the background after merges.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::{
    ef::{put_uvarint, take_uvarint},
    error::{Result, StrataError},
    files::{check_cancelled, FileItem},
};

pub const LI_EXT: &str = "li";

pub struct LocalityIndex {
    /// Covered big-file ranges in ascending order; the position is the
    /// bitmap bit for that file.
    spans: Vec<(u64, u64)>,
    map: BTreeMap<Vec<u8>, u32>,
}

impl LocalityIndex {
    pub fn build(
        dir: &Path,
        base: &str,
        big_files: &[Arc<FileItem>],
        cancel: &AtomicBool,
    ) -> Result<Self> {
        let mut files: Vec<&Arc<FileItem>> = big_files.iter().collect();
        files.sort_by_key(|f| f.start_tx);
        if files.len() > 32 {
            return Err(StrataError::Invariant(format!(
                "locality bitmap limited to 32 big files, got {}",
                files.len()
            )));
        }
        let mut spans = Vec::with_capacity(files.len());
        let mut map: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
        for (ordinal, file) in files.iter().enumerate() {
            spans.push((file.start_tx, file.end_tx));
            for (i, key) in file.index.keys().enumerate() {
                if i % 1024 == 0 {
                    check_cancelled(cancel)?;
                }
                *map.entry(key.to_vec()).or_default() |= 1u32 << ordinal;
            }
        }
        let li = Self { spans, map };
        li.persist(dir, base)?;
        debug!(base, files = li.spans.len(), keys = li.map.len(), "built locality index");
        Ok(li)
    }

    fn file_name(&self, base: &str) -> String {
        let start = self.spans.first().map(|&(s, _)| s).unwrap_or(0);
        let end = self.spans.last().map(|&(_, e)| e).unwrap_or(0);
        format!("{base}.{start}-{end}.{LI_EXT}")
    }

    fn persist(&self, dir: &Path, base: &str) -> Result<()> {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, self.spans.len() as u64);
        for &(start, end) in &self.spans {
            put_uvarint(&mut buf, start);
            put_uvarint(&mut buf, end);
        }
        put_uvarint(&mut buf, self.map.len() as u64);
        for (key, bitmap) in &self.map {
            put_uvarint(&mut buf, key.len() as u64);
            buf.extend_from_slice(key);
            put_uvarint(&mut buf, u64::from(*bitmap));
        }
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&buf)?;
        tmp.flush()?;
        let target = dir.join(self.file_name(base));
        tmp.persist(&target)
            .map_err(|err| StrataError::Io(err.error))?;
        // Older generations are superseded wholesale.
        remove_stale(dir, base, &target);
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let buf = fs::read(path)?;
        let mut pos = 0usize;
        let span_count = take_uvarint(&buf, &mut pos)? as usize;
        let mut spans = Vec::with_capacity(span_count);
        for _ in 0..span_count {
            let start = take_uvarint(&buf, &mut pos)?;
            let end = take_uvarint(&buf, &mut pos)?;
            spans.push((start, end));
        }
        let entry_count = take_uvarint(&buf, &mut pos)? as usize;
        let mut map = BTreeMap::new();
        for _ in 0..entry_count {
            let key_len = take_uvarint(&buf, &mut pos)? as usize;
            let end = pos
                .checked_add(key_len)
                .filter(|&e| e <= buf.len())
                .ok_or_else(|| StrataError::Corruption("locality key overruns file".into()))?;
            let key = buf[pos..end].to_vec();
            pos = end;
            let bitmap = take_uvarint(&buf, &mut pos)?;
            let bitmap = u32::try_from(bitmap)
                .map_err(|_| StrataError::Corruption("locality bitmap exceeds 32 bits".into()))?;
            map.insert(key, bitmap);
        }
        Ok(Self { spans, map })
    }

    /// Whether this index covers `file` at all.
    pub fn covers(&self, file: &FileItem) -> bool {
        self.ordinal(file).is_some()
    }

    fn ordinal(&self, file: &FileItem) -> Option<usize> {
        self.spans
            .iter()
            .position(|&(s, e)| s == file.start_tx && e == file.end_tx)
    }

    /// False means `file` provably has no postings for `key`.
    pub fn may_contain(&self, key: &[u8], file: &FileItem) -> bool {
        let Some(ordinal) = self.ordinal(file) else {
            // Not covered; no claim either way.
            return true;
        };
        self.map
            .get(key)
            .map(|bitmap| bitmap & (1u32 << ordinal) != 0)
            .unwrap_or(false)
    }

    pub fn bitmap(&self, key: &[u8]) -> u32 {
        self.map.get(key).copied().unwrap_or(0)
    }
}

fn remove_stale(dir: &Path, base: &str, keep: &Path) {
    let prefix = format!("{base}.");
    let suffix = format!(".{LI_EXT}");
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if path == keep {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            let _ = fs::remove_file(&path);
        }
    }
}
