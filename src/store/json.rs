//! JSON file store under a data directory.
//!
//! Layout:
//!
//! - `techniques.json`: id to technique map, rewritten on every save
//! - `history.jsonl`: one history entry per line, append-only
//! - `patterns.jsonl`: one pattern record per line, append-only

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Persistence, StorageError};
use crate::schema::{HistoryEntry, PatternRecord, Technique};

const TECHNIQUES_FILE: &str = "techniques.json";
const HISTORY_FILE: &str = "history.jsonl";
const PATTERNS_FILE: &str = "patterns.jsonl";

/// File-backed store.
#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
    techniques: BTreeMap<String, Technique>,
    versions: BTreeSet<u64>,
}

impl JsonStore {
    /// Open (creating if needed) a store in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let techniques_path = dir.join(TECHNIQUES_FILE);
        let techniques = if techniques_path.exists() {
            let content = fs::read_to_string(&techniques_path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        let versions = read_lines::<PatternRecord>(&dir.join(PATTERNS_FILE))?
            .into_iter()
            .map(|r| r.version)
            .collect();

        Ok(Self {
            dir,
            techniques,
            versions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the technique map via a temporary file so a crash never leaves
    /// a truncated document.
    fn flush_techniques(&self, techniques: &BTreeMap<String, Technique>) -> Result<(), StorageError> {
        let path = self.dir.join(TECHNIQUES_FILE);
        let tmp = self.dir.join(format!("{}.tmp", TECHNIQUES_FILE));
        let json = serde_json::to_string_pretty(techniques)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl Persistence for JsonStore {
    fn load_all_techniques(&self) -> Result<BTreeMap<String, Technique>, StorageError> {
        Ok(self.techniques.clone())
    }

    fn save_technique(&mut self, technique: &Technique) -> Result<(), StorageError> {
        let mut next = self.techniques.clone();
        next.insert(technique.id.clone(), technique.clone());
        self.flush_techniques(&next)?;
        self.techniques = next;
        Ok(())
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<(), StorageError> {
        append_line(&self.dir.join(HISTORY_FILE), entry)
    }

    fn record_pattern(&mut self, record: &PatternRecord) -> Result<(), StorageError> {
        if self.versions.contains(&record.version) {
            return Err(StorageError::DuplicateVersion(record.version));
        }
        if let Some(parent) = record.parent
            && !self.versions.contains(&parent)
        {
            return Err(StorageError::UnknownParent {
                version: record.version,
                parent,
            });
        }
        append_line(&self.dir.join(PATTERNS_FILE), record)?;
        self.versions.insert(record.version);
        Ok(())
    }

    fn load_patterns(&self) -> Result<Vec<PatternRecord>, StorageError> {
        read_lines(&self.dir.join(PATTERNS_FILE))
    }

    fn load_history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        read_lines(&self.dir.join(HISTORY_FILE))
    }
}

/// Append one JSON line. A torn final line is terminated first so the new
/// record starts on a line of its own.
fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    if !ends_with_newline(&mut file)? {
        line.insert(0, '\n');
    }
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// True for an empty file or one whose last byte is a newline.
fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Parse a JSON-lines file. Unparseable lines (e.g. a torn final write) are
/// logged and skipped.
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut values = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(v) => values.push(v),
            Err(e) => warn!("Skipping {}:{}: {}", path.display(), n + 1, e),
        }
    }
    Ok(values)
}
