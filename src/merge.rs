use rusqlite::{params, Connection, OptionalExtension};

use crate::db;
use crate::error::SyncError;
use crate::models::Record;

/// Absolute tolerance for amount comparison, to absorb floating-point
/// drift from cross-platform serialization.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
  pub inserted: usize,
  pub skipped: usize,
}

/// Looks up a stored record matching the incoming one on the business key
/// (day-start date, amount within tolerance, type, category, subCategory,
/// remark). `is_deleted` is not part of the key: a soft-deleted row still
/// counts as a duplicate.
pub fn find_duplicate(conn: &Connection, record: &Record) -> Result<Option<i64>, SyncError> {
  let id = conn
    .query_row(
      "SELECT id FROM records\n       WHERE date = ?1 AND ABS(amount - ?2) <= ?3 AND type = ?4\n         AND category = ?5 AND sub_category = ?6 AND remark = ?7\n       LIMIT 1",
      params![
        record.day_start_millis(),
        record.amount,
        AMOUNT_TOLERANCE,
        record.record_type,
        record.category,
        record.sub_category,
        record.remark,
      ],
      |row| row.get(0),
    )
    .optional()?;
  Ok(id)
}

/// Merges a batch of incoming records inside one transaction: duplicates
/// are skipped without overwriting, everything else is inserted with a
/// fresh id and a midnight-normalized date. Any failure rolls back the
/// whole batch.
pub fn merge_batch(conn: &mut Connection, records: &[Record]) -> Result<MergeOutcome, SyncError> {
  let tx = conn
    .transaction()
    .map_err(|err| SyncError::MergeTransaction(err.to_string()))?;

  let mut outcome = MergeOutcome::default();
  for record in records {
    let duplicate = find_duplicate(&tx, record).map_err(|err| SyncError::MergeTransaction(err.to_string()))?;
    if duplicate.is_some() {
      outcome.skipped += 1;
      continue;
    }
    db::insert_record(&tx, record).map_err(|err| SyncError::MergeTransaction(err.to_string()))?;
    outcome.inserted += 1;
  }

  tx.commit().map_err(|err| SyncError::MergeTransaction(err.to_string()))?;
  Ok(outcome)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  fn record(day: u32, amount: f64) -> Record {
    Record {
      id: None,
      date: Utc.with_ymd_and_hms(2024, 2, day, 12, 0, 0).unwrap(),
      amount,
      record_type: "Outcome".to_string(),
      category: "Food".to_string(),
      sub_category: "Lunch".to_string(),
      remark: String::new(),
      is_deleted: false,
    }
  }

  fn batch(count: u32) -> Vec<Record> {
    (0..count).map(|i| record(1 + i % 28, 10.0 + i as f64)).collect()
  }

  #[test]
  fn merge_is_idempotent() {
    let db = db::open_in_memory().unwrap();
    let records = batch(120);
    db::with_conn(&db, |conn| {
      let first = merge_batch(conn, &records)?;
      assert_eq!(first.inserted, 120);
      assert_eq!(first.skipped, 0);

      let second = merge_batch(conn, &records)?;
      assert_eq!(second.inserted, 0);
      assert_eq!(second.skipped, 120);
      assert_eq!(db::count_records(conn)?, 120);
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn amount_tolerance_boundary() {
    let db = db::open_in_memory().unwrap();
    db::with_conn(&db, |conn| {
      merge_batch(conn, &[record(3, 10.0)])?;

      // Within 0.01 either way: duplicate.
      let outcome = merge_batch(conn, &[record(3, 10.01), record(3, 9.99)])?;
      assert_eq!(outcome.inserted, 0);
      assert_eq!(outcome.skipped, 2);

      // 0.011 off either way: distinct records.
      let outcome = merge_batch(conn, &[record(3, 10.011)])?;
      assert_eq!(outcome.inserted, 1);
      let outcome = merge_batch(conn, &[record(3, 9.989)])?;
      assert_eq!(outcome.inserted, 1);
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn duplicate_detection_ignores_time_of_day() {
    let db = db::open_in_memory().unwrap();
    db::with_conn(&db, |conn| {
      let mut morning = record(9, 25.0);
      morning.date = Utc.with_ymd_and_hms(2024, 2, 9, 8, 0, 0).unwrap();
      let mut evening = record(9, 25.0);
      evening.date = Utc.with_ymd_and_hms(2024, 2, 9, 21, 45, 0).unwrap();

      merge_batch(conn, &[morning])?;
      let outcome = merge_batch(conn, &[evening])?;
      assert_eq!(outcome.skipped, 1);
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn duplicate_detection_ignores_soft_delete_flag() {
    let db = db::open_in_memory().unwrap();
    db::with_conn(&db, |conn| {
      let mut deleted = record(14, 8.0);
      deleted.is_deleted = true;
      merge_batch(conn, &[deleted])?;

      // A live record with the same business key is treated as the same
      // record and skipped, per the reference behavior.
      let outcome = merge_batch(conn, &[record(14, 8.0)])?;
      assert_eq!(outcome.inserted, 0);
      assert_eq!(outcome.skipped, 1);
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn failed_insert_rolls_back_whole_batch() {
    let db = db::open_in_memory().unwrap();
    let mut records = batch(120);
    // SQLite stores NaN as NULL, which trips the NOT NULL constraint on
    // amount partway through the batch.
    records[60].amount = f64::NAN;

    let result = db::with_conn(&db, |conn| merge_batch(conn, &records));
    assert!(matches!(result, Err(SyncError::MergeTransaction(_))));

    db::with_conn(&db, |conn| {
      assert_eq!(db::count_records(conn)?, 0);
      Ok(())
    })
    .unwrap();
  }
}
