//! Purge policy
//!
//! Reduces the target results of one board cycle to a pass/fail decision
//! and maps it through the configured purge mode to the PLC signal.

use inference_engine::{DefectCatalog, GOOD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the PLC signal relates to the classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeMode {
    /// Follow the result
    Normal,
    AllOk,
    AllNg,
    /// Alternate OK/NG by product count
    OkNg,
    /// Unrecognised code, treated as NG
    Unknown(i32),
}

impl PurgeMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PurgeMode::Normal,
            1 => PurgeMode::AllOk,
            2 => PurgeMode::AllNg,
            3 => PurgeMode::OkNg,
            other => PurgeMode::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            PurgeMode::Normal => 0,
            PurgeMode::AllOk => 1,
            PurgeMode::AllNg => 2,
            PurgeMode::OkNg => 3,
            PurgeMode::Unknown(c) => *c,
        }
    }
}

impl Default for PurgeMode {
    fn default() -> Self {
        PurgeMode::Normal
    }
}

/// Signal sent for one product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlcSignal {
    Ok,
    Ng,
}

impl PlcSignal {
    pub fn is_ok(&self) -> bool {
        *self == PlcSignal::Ok
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlcSignal::Ok => "OK",
            PlcSignal::Ng => "NG",
        }
    }
}

/// Signal for `is_ok` under `mode`
pub fn signal_for(mode: PurgeMode, is_ok: bool, product_count: u64) -> PlcSignal {
    match mode {
        PurgeMode::Normal if is_ok => PlcSignal::Ok,
        PurgeMode::Normal => PlcSignal::Ng,
        PurgeMode::AllOk => PlcSignal::Ok,
        PurgeMode::AllNg => PlcSignal::Ng,
        PurgeMode::OkNg => {
            if product_count.saturating_sub(1) % 2 == 0 {
                PlcSignal::Ok
            } else {
                PlcSignal::Ng
            }
        }
        PurgeMode::Unknown(_) => PlcSignal::Ng,
    }
}

/// Flat list of every target result
pub fn merge_results<'a>(results: impl IntoIterator<Item = &'a [i32]>) -> Vec<i32> {
    results.into_iter().flatten().copied().collect()
}

/// One result per distinct defect of the histogram, Good when empty
pub fn histogram_results(histogram: &BTreeMap<String, u64>, catalog: &DefectCatalog) -> Vec<i32> {
    let results: Vec<i32> = histogram
        .iter()
        .filter(|(_, count)| **count > 0)
        .filter_map(|(name, _)| catalog.code(name))
        .collect();
    if results.is_empty() {
        vec![GOOD]
    } else {
        results
    }
}

/// Drop Good entries
pub fn remove_good(results: &[i32]) -> Vec<i32> {
    results.iter().copied().filter(|r| *r != GOOD).collect()
}

/// Purge decision of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeDecision {
    /// Non-Good results
    pub defects: Vec<i32>,
    pub is_ok: bool,
    pub signal: PlcSignal,
}

impl PurgeDecision {
    /// Highest defect code, sent in PLC defect-class mode
    pub fn highest_defect(&self) -> Option<i32> {
        self.defects.iter().copied().max()
    }
}

pub fn decide(mode: PurgeMode, results: &[i32], product_count: u64) -> PurgeDecision {
    let defects = remove_good(results);
    let is_ok = defects.is_empty();
    PurgeDecision {
        signal: signal_for(mode, is_ok, product_count),
        defects,
        is_ok,
    }
}
