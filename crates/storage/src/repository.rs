//! Repository Implementation

use crate::StorageError;
use chrono::{DateTime, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Station code reported to MES
pub const PLC_CODE: &str = "F205-T";

/// Production shift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shift {
    /// 07:00 to 19:59
    Day,
    Night,
}

impl Shift {
    pub fn from_hour(hour: u32) -> Self {
        if (7..=19).contains(&hour) {
            Shift::Day
        } else {
            Shift::Night
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Shift::Day => "day",
            Shift::Night => "night",
        }
    }
}

/// Product, board and lot a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordKey {
    pub product: String,
    pub board: usize,
    pub lot: String,
}

impl RecordKey {
    pub fn new(product: &str, board: usize, lot: &str) -> Self {
        Self {
            product: product.to_string(),
            board,
            lot: lot.to_string(),
        }
    }
}

/// One defective product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectRecord {
    pub id: i64,
    pub time: DateTime<Local>,
    pub key: RecordKey,
    pub product_no: u64,
    /// Defect name to occurrence flag
    pub defects: BTreeMap<String, u32>,
}

/// One product reported to MES
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MesRecord {
    pub id: Uuid,
    pub time: DateTime<Local>,
    pub key: RecordKey,
    pub product_no: u64,
    pub plc_code: String,
    pub total: u64,
    pub total_defect: u64,
    pub shift: Shift,
    pub defects: BTreeMap<String, u32>,
}

/// Periodic board report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: i64,
    pub time: DateTime<Local>,
    pub key: RecordKey,
    pub total: u64,
    pub total_defect: u64,
    /// Defect name to count
    pub histogram: BTreeMap<String, u64>,
}

struct Tables {
    defects: VecDeque<DefectRecord>,
    mes: VecDeque<MesRecord>,
    reports: VecDeque<ReportRecord>,
    next_id: i64,
}

/// Repository for inspection results (in-memory, bounded)
pub struct Repository {
    tables: Mutex<Tables>,
    /// Max records kept per table
    max_records: usize,
}

fn flags(defects: &[String]) -> BTreeMap<String, u32> {
    defects.iter().map(|d| (d.clone(), 1)).collect()
}

fn push_bounded<T>(table: &mut VecDeque<T>, record: T, max: usize) {
    while table.len() >= max {
        table.pop_front();
    }
    table.push_back(record);
}

impl Repository {
    pub fn new() -> Self {
        Self::with_retention(100_000)
    }

    /// Repository keeping at most `max_records` per table
    pub fn with_retention(max_records: usize) -> Self {
        info!("Creating in-memory repository (retention {})", max_records);
        Self {
            tables: Mutex::new(Tables {
                defects: VecDeque::new(),
                mes: VecDeque::new(),
                reports: VecDeque::new(),
                next_id: 1,
            }),
            max_records: max_records.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
    }

    /// Record the defect names of one product
    pub fn record_defect_data(
        &self,
        key: &RecordKey,
        product_no: u64,
        defects: &[String],
    ) -> Result<i64, StorageError> {
        let mut t = self.lock()?;
        let id = t.next_id;
        t.next_id += 1;
        let record = DefectRecord {
            id,
            time: Local::now(),
            key: key.clone(),
            product_no,
            defects: flags(defects),
        };
        push_bounded(&mut t.defects, record, self.max_records);
        debug!("Inserted defect record {} for product {}", id, product_no);
        Ok(id)
    }

    /// Record one product for MES
    pub fn record_mes_data(
        &self,
        key: &RecordKey,
        product_no: u64,
        total: u64,
        total_defect: u64,
        defects: &[String],
    ) -> Result<Uuid, StorageError> {
        let time = Local::now();
        let record = MesRecord {
            id: Uuid::new_v4(),
            time,
            key: key.clone(),
            product_no,
            plc_code: PLC_CODE.to_string(),
            total,
            total_defect,
            shift: Shift::from_hour(time.hour()),
            defects: flags(defects),
        };
        let id = record.id;
        let mut t = self.lock()?;
        push_bounded(&mut t.mes, record, self.max_records);
        debug!("Inserted MES record {} for product {}", id, product_no);
        Ok(id)
    }

    /// Store a board report
    pub fn save_report(
        &self,
        key: &RecordKey,
        total: u64,
        total_defect: u64,
        histogram: BTreeMap<String, u64>,
    ) -> Result<i64, StorageError> {
        let mut t = self.lock()?;
        let id = t.next_id;
        t.next_id += 1;
        let record = ReportRecord {
            id,
            time: Local::now(),
            key: key.clone(),
            total,
            total_defect,
            histogram,
        };
        push_bounded(&mut t.reports, record, self.max_records);
        info!(
            "Saved report {} for {} board {} lot {}: {} / {}",
            id, key.product, key.board, key.lot, total_defect, total
        );
        Ok(id)
    }

    /// Most recent defect records, newest first
    pub fn defect_records(&self, limit: usize) -> Result<Vec<DefectRecord>, StorageError> {
        Ok(self.lock()?.defects.iter().rev().take(limit).cloned().collect())
    }

    pub fn mes_records(&self, limit: usize) -> Result<Vec<MesRecord>, StorageError> {
        Ok(self.lock()?.mes.iter().rev().take(limit).cloned().collect())
    }

    pub fn reports(&self, limit: usize) -> Result<Vec<ReportRecord>, StorageError> {
        Ok(self.lock()?.reports.iter().rev().take(limit).cloned().collect())
    }

    /// Latest report of a board
    pub fn latest_report(&self, board: usize) -> Result<ReportRecord, StorageError> {
        self.lock()?
            .reports
            .iter()
            .rev()
            .find(|r| r.key.board == board)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    pub fn defect_count(&self) -> usize {
        self.tables.lock().map(|t| t.defects.len()).unwrap_or(0)
    }

    pub fn mes_count(&self) -> usize {
        self.tables.lock().map(|t| t.mes.len()).unwrap_or(0)
    }

    /// Reports as a JSON array, newest first
    pub fn export_reports_json(&self, limit: usize) -> Result<String, StorageError> {
        let reports = self.reports(limit)?;
        serde_json::to_string(&reports).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        if let Ok(mut t) = self.tables.lock() {
            t.defects.clear();
            t.mes.clear();
            t.reports.clear();
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defect_insert_and_retrieve() {
        let repo = Repository::new();
        let key = RecordKey::new("P1", 0, "L1");
        let id = repo
            .record_defect_data(&key, 12, &["Dark".to_string(), "Stain".to_string()])
            .unwrap();
        assert_eq!(id, 1);

        let records = repo.defect_records(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].product_no, 12);
        assert_eq!(records[0].defects.get("Stain"), Some(&1));
    }

    #[test]
    fn test_mes_record() {
        let repo = Repository::new();
        let key = RecordKey::new("P1", 1, "L1");
        repo.record_mes_data(&key, 7, 100, 3, &["Bright".to_string()]).unwrap();
        let mes = repo.mes_records(1).unwrap();
        assert_eq!(mes[0].plc_code, PLC_CODE);
        assert_eq!(mes[0].total, 100);
        assert_eq!(mes[0].total_defect, 3);
        assert_eq!(mes[0].shift, Shift::from_hour(mes[0].time.hour()));
    }

    #[test]
    fn test_shift_boundaries() {
        assert_eq!(Shift::from_hour(6), Shift::Night);
        assert_eq!(Shift::from_hour(7), Shift::Day);
        assert_eq!(Shift::from_hour(19), Shift::Day);
        assert_eq!(Shift::from_hour(20), Shift::Night);
        assert_eq!(Shift::Night.as_str(), "night");
    }

    #[test]
    fn test_reports() {
        let repo = Repository::new();
        assert!(matches!(repo.latest_report(0), Err(StorageError::NotFound)));

        let mut histogram = BTreeMap::new();
        histogram.insert("Dark".to_string(), 2);
        repo.save_report(&RecordKey::new("P1", 0, "L1"), 10, 2, histogram).unwrap();
        repo.save_report(&RecordKey::new("P1", 1, "L1"), 5, 0, BTreeMap::new()).unwrap();

        assert_eq!(repo.latest_report(0).unwrap().total, 10);
        let json = repo.export_reports_json(10).unwrap();
        assert!(json.contains("\"Dark\":2"));
    }

    #[test]
    fn test_retention_limit() {
        let repo = Repository::with_retention(5);
        let key = RecordKey::new("P1", 0, "L1");
        for i in 0..10 {
            repo.record_defect_data(&key, i, &[]).unwrap();
        }
        assert_eq!(repo.defect_count(), 5);
        assert_eq!(repo.defect_records(1).unwrap()[0].product_no, 9);
    }
}
