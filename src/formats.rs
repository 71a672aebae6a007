use serde::{Deserialize, Serialize};

use crate::key::{Key, State};

/// One line of `completed.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEntry {
    pub state: State,
    pub unit: String,
    pub year: u16,
    pub records: usize,
    /// Length of `findings.csv` right after this key's rows were synced.
    pub output_end: u64,
    pub completed_at: String,
}

impl CompletionEntry {
    pub fn key(&self) -> Key {
        Key::new(self.state, self.unit.clone(), self.year)
    }
}

/// One line of `skipped.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipEntry {
    pub state: State,
    pub unit: String,
    pub year: u16,
    pub status: u16,
    pub skipped_at: String,
}

impl SkipEntry {
    pub fn key(&self) -> Key {
        Key::new(self.state, self.unit.clone(), self.year)
    }
}

/// One row of `findings.csv`. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRow {
    pub state: String,
    pub state_code: String,
    pub district: Option<String>,
    pub block: Option<String>,
    pub panchayat: Option<String>,
    pub unit: String,
    pub year: u16,
    pub audit_year: String,
    /// Date of the gram sabha that reported the finding, as labelled upstream.
    pub gs_date: Option<String>,
    pub row: usize,
    pub category: String,
    pub sub_category: Option<String>,
    pub finding: String,
    pub amount: Option<f64>,
    pub status: Option<String>,
}

pub const FINDINGS_COLUMNS: [&str; 15] = [
    "state",
    "state_code",
    "district",
    "block",
    "panchayat",
    "unit",
    "year",
    "audit_year",
    "gs_date",
    "row",
    "category",
    "sub_category",
    "finding",
    "amount",
    "status",
];

/// Contents of `run-summary.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Keys already completed or skipped by an earlier run.
    pub resumed: usize,
    pub records_written: usize,
    pub dropped_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<String>,
}
