//! Durable output and resume state.
//!
//! `findings.csv` holds the records, `completed.jsonl` the keys whose records
//! are durably in the CSV, `skipped.jsonl` the keys the upstream does not
//! have. A key is written to `completed.jsonl` only after its rows are
//! flushed and synced, and each completion entry remembers the CSV length at
//! that point. On open, anything in the CSV past the last completion entry
//! is an interrupted commit and is cut off.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cli::{ResetArgs, StatusArgs};
use crate::formats::{CompletionEntry, FINDINGS_COLUMNS, RunSummary, SkipEntry};
use crate::key::{Key, State};
use crate::parse::Record;

pub const FINDINGS_FILE: &str = "findings.csv";
pub const COMPLETED_FILE: &str = "completed.jsonl";
pub const SKIPPED_FILE: &str = "skipped.jsonl";
pub const SUMMARY_FILE: &str = "run-summary.json";

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint is inconsistent: {detail}")]
    Inconsistent { detail: String },
}

trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T, WriteError>;
}

impl<T, E: Into<io::Error>> IoContext<T> for Result<T, E> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T, WriteError> {
        self.map_err(|err| WriteError::Io {
            context: context(),
            source: err.into(),
        })
    }
}

/// Proof that a key's rows are synced to the CSV but not yet logged as complete.
#[derive(Debug)]
#[must_use = "a key is not complete until its receipt is passed to `mark_complete`"]
pub struct AppendReceipt {
    key: Key,
    records: usize,
    output_end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub key: Key,
    pub records: usize,
    pub output_end: u64,
}

/// Single writer for the output directory. Only one should exist per directory.
pub struct CheckpointStore {
    dir: PathBuf,
    output: csv::Writer<File>,
    completed_log: File,
    skipped_log: File,
    completed: HashSet<Key>,
    skipped: HashSet<Key>,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, WriteError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .io_context(|| format!("create output dir: {}", dir.display()))?;

        let completed_path = dir.join(COMPLETED_FILE);
        let (completed_entries, completed_log) = open_log::<CompletionEntry>(&completed_path)?;
        let skipped_path = dir.join(SKIPPED_FILE);
        let (skipped_entries, skipped_log) = open_log::<SkipEntry>(&skipped_path)?;

        let committed_end = completed_entries
            .iter()
            .map(|entry| entry.output_end)
            .max()
            .unwrap_or(0);
        let output = open_output(&dir.join(FINDINGS_FILE), committed_end)?;

        let completed = completed_entries
            .iter()
            .map(CompletionEntry::key)
            .collect::<HashSet<_>>();
        let skipped = skipped_entries
            .iter()
            .map(SkipEntry::key)
            .collect::<HashSet<_>>();
        tracing::info!(
            dir = %dir.display(),
            completed = completed.len(),
            skipped = skipped.len(),
            "opened checkpoint store"
        );

        Ok(Self {
            dir,
            output,
            completed_log,
            skipped_log,
            completed,
            skipped,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_completed(&self, key: &Key) -> bool {
        self.completed.contains(key)
    }

    pub fn is_skipped(&self, key: &Key) -> bool {
        self.skipped.contains(key)
    }

    /// Whether an earlier run already reached a terminal, persisted state for `key`.
    pub fn is_done(&self, key: &Key) -> bool {
        self.is_completed(key) || self.is_skipped(key)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Appends records, then marks the key complete.
    pub fn commit(&mut self, key: &Key, records: &[Record]) -> Result<Ack, WriteError> {
        let receipt = self.append_records(key, records)?;
        self.mark_complete(receipt)
    }

    /// First half of [`CheckpointStore::commit`]: rows are synced to the CSV.
    pub fn append_records(
        &mut self,
        key: &Key,
        records: &[Record],
    ) -> Result<AppendReceipt, WriteError> {
        if self.is_done(key) {
            return Err(WriteError::Inconsistent {
                detail: format!("{key} already has a terminal entry"),
            });
        }
        if let Some(stray) = records.iter().find(|record| &record.key != key) {
            return Err(WriteError::Inconsistent {
                detail: format!("record for {} committed under {key}", stray.key),
            });
        }

        for record in records {
            self.output
                .serialize(record.to_row())
                .io_context(|| format!("write findings row for {key}"))?;
        }
        self.output
            .flush()
            .io_context(|| format!("flush {FINDINGS_FILE}"))?;
        let file = self.output.get_ref();
        file.sync_data()
            .io_context(|| format!("sync {FINDINGS_FILE}"))?;
        let output_end = file
            .metadata()
            .io_context(|| format!("stat {FINDINGS_FILE}"))?
            .len();

        Ok(AppendReceipt {
            key: key.clone(),
            records: records.len(),
            output_end,
        })
    }

    /// Second half of [`CheckpointStore::commit`]: the key enters the completion log.
    pub fn mark_complete(&mut self, receipt: AppendReceipt) -> Result<Ack, WriteError> {
        let AppendReceipt {
            key,
            records,
            output_end,
        } = receipt;
        let entry = CompletionEntry {
            state: key.state,
            unit: key.unit.clone(),
            year: key.year,
            records,
            output_end,
            completed_at: Utc::now().to_rfc3339(),
        };
        append_line(&mut self.completed_log, &entry, COMPLETED_FILE)?;
        self.completed.insert(key.clone());

        Ok(Ack {
            key,
            records,
            output_end,
        })
    }

    /// Persists a key the upstream reported as absent so later runs leave it alone.
    pub fn mark_skipped(&mut self, key: &Key, status: u16) -> Result<(), WriteError> {
        if self.is_done(key) {
            return Ok(());
        }
        let entry = SkipEntry {
            state: key.state,
            unit: key.unit.clone(),
            year: key.year,
            status,
            skipped_at: Utc::now().to_rfc3339(),
        };
        append_line(&mut self.skipped_log, &entry, SKIPPED_FILE)?;
        self.skipped.insert(key.clone());
        Ok(())
    }
}

fn append_line<T: Serialize>(file: &mut File, value: &T, name: &str) -> Result<(), WriteError> {
    let mut line = serde_json::to_vec(value).io_context(|| format!("serialize {name} entry"))?;
    line.push(b'\n');
    file.write_all(&line)
        .io_context(|| format!("append {name}"))?;
    file.sync_data().io_context(|| format!("sync {name}"))?;
    Ok(())
}

/// Reads a JSONL log. A trailing line without a newline is a torn append
/// and is reported as `torn_at` instead of failing the read.
fn read_log<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, Option<u64>), WriteError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
        Err(err) => {
            return Err(WriteError::Io {
                context: format!("read {}", path.display()),
                source: err,
            });
        }
    };

    let mut entries = Vec::new();
    let mut offset = 0_u64;
    for (idx, chunk) in contents.split_inclusive('\n').enumerate() {
        if !chunk.ends_with('\n') {
            return Ok((entries, Some(offset)));
        }
        if !chunk.trim().is_empty() {
            let entry = serde_json::from_str(chunk).map_err(|err| WriteError::Inconsistent {
                detail: format!("{} line {}: {err}", path.display(), idx + 1),
            })?;
            entries.push(entry);
        }
        offset += chunk.len() as u64;
    }
    Ok((entries, None))
}

fn open_log<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, File), WriteError> {
    let (entries, torn_at) = read_log(path)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .io_context(|| format!("open {}", path.display()))?;
    if let Some(len) = torn_at {
        tracing::warn!(path = %path.display(), len, "discarding torn trailing log line");
        file.set_len(len)
            .io_context(|| format!("truncate {}", path.display()))?;
        file.sync_data()
            .io_context(|| format!("sync {}", path.display()))?;
    }
    Ok((entries, file))
}

fn open_output(path: &Path, committed_end: u64) -> Result<csv::Writer<File>, WriteError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .io_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .io_context(|| format!("stat {}", path.display()))?
        .len();

    if len < committed_end {
        return Err(WriteError::Inconsistent {
            detail: format!(
                "{} is {len} bytes but {COMPLETED_FILE} expects at least {committed_end}",
                path.display()
            ),
        });
    }
    if len > committed_end {
        tracing::warn!(
            path = %path.display(),
            len,
            committed_end,
            "discarding rows from an interrupted commit"
        );
        file.set_len(committed_end)
            .io_context(|| format!("truncate {}", path.display()))?;
        file.sync_data()
            .io_context(|| format!("sync {}", path.display()))?;
    }
    file.seek(SeekFrom::End(0))
        .io_context(|| format!("seek {}", path.display()))?;

    let mut output = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if committed_end == 0 {
        output
            .write_record(FINDINGS_COLUMNS)
            .io_context(|| format!("write header to {}", path.display()))?;
        output
            .flush()
            .io_context(|| format!("flush {}", path.display()))?;
        output
            .get_ref()
            .sync_data()
            .io_context(|| format!("sync {}", path.display()))?;
    }
    Ok(output)
}

/// Per-state view of an output directory's logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub completed: BTreeMap<State, usize>,
    pub skipped: BTreeMap<State, usize>,
    pub records: usize,
}

/// Reads the logs without repairing or locking anything.
pub fn load_status(dir: &Path) -> anyhow::Result<StatusReport> {
    let (completed, _) = read_log::<CompletionEntry>(&dir.join(COMPLETED_FILE))
        .context("read completion log")?;
    let (skipped, _) =
        read_log::<SkipEntry>(&dir.join(SKIPPED_FILE)).context("read skip log")?;

    let mut report = StatusReport::default();
    for entry in &completed {
        *report.completed.entry(entry.state).or_default() += 1;
        report.records += entry.records;
    }
    for entry in &skipped {
        *report.skipped.entry(entry.state).or_default() += 1;
    }
    Ok(report)
}

pub fn status(args: StatusArgs) -> anyhow::Result<()> {
    let dir = PathBuf::from(&args.out);
    let report = load_status(&dir)?;

    let mut states = report
        .completed
        .keys()
        .chain(report.skipped.keys())
        .copied()
        .collect::<Vec<_>>();
    states.sort();
    states.dedup();

    for state in states {
        println!(
            "{state}\tcompleted={}\tskipped={}",
            report.completed.get(&state).copied().unwrap_or(0),
            report.skipped.get(&state).copied().unwrap_or(0),
        );
    }
    println!(
        "total\tcompleted={}\tskipped={}\trecords={}",
        report.completed.values().sum::<usize>(),
        report.skipped.values().sum::<usize>(),
        report.records,
    );
    Ok(())
}

/// Explicit re-run reset: forgets all progress in the output directory.
pub fn reset(args: ResetArgs) -> anyhow::Result<()> {
    let dir = PathBuf::from(&args.out);
    for name in [FINDINGS_FILE, COMPLETED_FILE, SKIPPED_FILE, SUMMARY_FILE] {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove {}", path.display()));
            }
        }
    }
    Ok(())
}

pub async fn write_summary(dir: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    write_json_atomic(&dir.join(SUMMARY_FILE), summary).await
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
