use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::SyncError;
use crate::models::Record;

/// Local record store. One connection behind a mutex; the merge engine's
/// batch transaction is the only writer during a sync run.
pub struct Db {
  pub conn: Mutex<Connection>,
}

pub fn open(db_path: &Path) -> Result<Db, SyncError> {
  let mut conn = Connection::open(db_path)?;
  configure(&conn)?;
  run_migrations(&mut conn)?;
  Ok(Db {
    conn: Mutex::new(conn),
  })
}

pub fn open_in_memory() -> Result<Db, SyncError> {
  let mut conn = Connection::open_in_memory()?;
  configure(&conn)?;
  run_migrations(&mut conn)?;
  Ok(Db {
    conn: Mutex::new(conn),
  })
}

pub fn with_conn<T>(db: &Db, f: impl FnOnce(&mut Connection) -> Result<T, SyncError>) -> Result<T, SyncError> {
  let mut guard = db.conn.lock()?;
  f(&mut guard)
}

fn configure(conn: &Connection) -> Result<(), SyncError> {
  conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
  conn.busy_timeout(Duration::from_secs(5))?;
  Ok(())
}

fn run_migrations(conn: &mut Connection) -> Result<(), SyncError> {
  conn.execute_batch(
    "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
  )?;

  apply_migration(conn, "001_records", include_str!("../migrations/001_records.sql"))?;
  Ok(())
}

fn apply_migration(conn: &mut Connection, version: &str, sql: &str) -> Result<(), SyncError> {
  let exists: i64 = conn.query_row(
    "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
    params![version],
    |row| row.get(0),
  )?;
  if exists > 0 {
    return Ok(());
  }

  conn.execute_batch(sql)?;
  conn.execute(
    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
    params![version, Utc::now().to_rfc3339()],
  )?;
  Ok(())
}

pub fn count_records(conn: &Connection) -> Result<i64, SyncError> {
  let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
  Ok(count)
}

/// Reads one page of records in insertion order. `id` is the export
/// ordering for paged transfer on both directions.
pub fn list_page(conn: &Connection, offset: i64, limit: i64) -> Result<Vec<Record>, SyncError> {
  let mut stmt = conn.prepare(
    "SELECT id, date, amount, type, category, sub_category, remark, is_deleted\n     FROM records ORDER BY id ASC LIMIT ?1 OFFSET ?2",
  )?;
  let rows = stmt.query_map(params![limit, offset], |row| {
    Ok(Record {
      id: Some(row.get::<_, i64>(0)?),
      date: DateTime::<Utc>::from_timestamp_millis(row.get::<_, i64>(1)?).unwrap_or_default(),
      amount: row.get(2)?,
      record_type: row.get(3)?,
      category: row.get(4)?,
      sub_category: row.get(5)?,
      remark: row.get(6)?,
      is_deleted: row.get(7)?,
    })
  })?;

  let mut records = Vec::new();
  for row in rows {
    records.push(row?);
  }
  Ok(records)
}

/// Inserts a record, normalizing the date to midnight. The incoming `id`
/// is never bound; the store assigns its own.
pub fn insert_record(conn: &Connection, record: &Record) -> Result<i64, SyncError> {
  conn.execute(
    "INSERT INTO records (date, amount, type, category, sub_category, remark, is_deleted)\n     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    params![
      record.day_start_millis(),
      record.amount,
      record.record_type,
      record.category,
      record.sub_category,
      record.remark,
      record.is_deleted,
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn record(day: u32, amount: f64) -> Record {
    Record {
      id: None,
      date: Utc.with_ymd_and_hms(2024, 1, day, 9, 15, 0).unwrap(),
      amount,
      record_type: "Outcome".to_string(),
      category: "Food".to_string(),
      sub_category: String::new(),
      remark: String::new(),
      is_deleted: false,
    }
  }

  #[test]
  fn insert_assigns_own_id_and_normalizes_date() {
    let db = open_in_memory().unwrap();
    with_conn(&db, |conn| {
      let mut incoming = record(5, 10.0);
      incoming.id = Some(999);
      let id = insert_record(conn, &incoming)?;
      assert_ne!(id, 999);

      let stored = &list_page(conn, 0, 10)?[0];
      assert_eq!(stored.id, Some(id));
      let midnight = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
      assert_eq!(stored.date, midnight);
      Ok(())
    })
    .unwrap();
  }

  #[test]
  fn list_page_respects_order_and_offset() {
    let db = open_in_memory().unwrap();
    with_conn(&db, |conn| {
      for day in 1..=7 {
        insert_record(conn, &record(day, day as f64))?;
      }
      assert_eq!(count_records(conn)?, 7);

      let first = list_page(conn, 0, 3)?;
      let second = list_page(conn, 3, 3)?;
      let last = list_page(conn, 6, 3)?;
      assert_eq!(first.len(), 3);
      assert_eq!(second.len(), 3);
      assert_eq!(last.len(), 1);
      assert_eq!(first[0].amount, 1.0);
      assert_eq!(second[0].amount, 4.0);
      assert_eq!(last[0].amount, 7.0);
      Ok(())
    })
    .unwrap();
  }
}
