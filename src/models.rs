use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A single ledger record as it travels between devices.
///
/// `id` is assigned by whichever store the record lands in and is never
/// trusted across devices; duplicate detection runs on the business-key
/// fields only. `date` carries day granularity: it is truncated to UTC
/// midnight before storage or comparison, and crosses the wire as an
/// epoch-millisecond integer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Record {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub date: DateTime<Utc>,
  pub amount: f64,
  #[serde(rename = "type")]
  pub record_type: String,
  pub category: String,
  #[serde(rename = "subCategory")]
  pub sub_category: String,
  #[serde(default)]
  pub remark: String,
  #[serde(rename = "isDeleted", default)]
  pub is_deleted: bool,
}

impl Record {
  /// The record's date truncated to UTC midnight, as epoch milliseconds.
  pub fn day_start_millis(&self) -> i64 {
    day_start(self.date).timestamp_millis()
  }
}

/// Truncates an instant to the start of its UTC day.
pub fn day_start(date: DateTime<Utc>) -> DateTime<Utc> {
  date.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// One transfer unit of a sync run. `current_count` is cumulative and
/// includes this page; `total_records` is fixed for the whole run.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncPage {
  pub records: Vec<Record>,
  #[serde(rename = "currentCount")]
  pub current_count: i64,
  #[serde(rename = "totalRecords")]
  pub total_records: i64,
}

/// Reply to a posted page. `result` is the string `"true"` or `"false"`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PageResult {
  pub result: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub info: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub err: Option<String>,
}

impl PageResult {
  pub fn ok(info: impl Into<String>) -> Self {
    Self {
      result: "true".to_string(),
      info: Some(info.into()),
      err: None,
    }
  }

  pub fn fail(err: impl Into<String>) -> Self {
    Self {
      result: "false".to_string(),
      info: None,
      err: Some(err.into()),
    }
  }

  pub fn accepted(&self) -> bool {
    self.result == "true"
  }
}

/// Lifecycle of one sync run. Terminal states only leave via an explicit
/// reset back to `Prepare`; no transition skips `Running`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  Prepare,
  Running,
  Succeeded,
  Failed,
}

/// Transfer direction, chosen once per run and fixed for its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
  PullFromPeer,
  PushToPeer,
}
