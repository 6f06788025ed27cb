use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::client::{PeerNotice, SyncClient};
use crate::db::{self, Db};
use crate::discovery;
use crate::error::SyncError;
use crate::merge::{self, MergeOutcome};
use crate::models::{Record, SyncDirection, SyncPage, SyncPhase};
use crate::server::{self, ServerHandle};

pub const PULL_PAGE_SIZE: u32 = 50;
pub const PUSH_PAGE_SIZE: u32 = 100;

/// Push-style signal delivered to UI observers. Observers are passive:
/// events go over unbounded channels and never block the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
  Phase(SyncPhase),
  Progress(u8),
}

/// State shared between the session and its listener thread.
pub(crate) struct SessionShared {
  pub(crate) db: Arc<Db>,
  phase: Mutex<SyncPhase>,
  direction: Mutex<Option<SyncDirection>>,
  listeners: Mutex<Vec<mpsc::Sender<SyncEvent>>>,
}

impl SessionShared {
  pub(crate) fn phase(&self) -> SyncPhase {
    self.phase.lock().map(|guard| *guard).unwrap_or(SyncPhase::Failed)
  }

  pub(crate) fn set_phase(&self, phase: SyncPhase) {
    if let Ok(mut guard) = self.phase.lock() {
      *guard = phase;
    }
    self.emit(SyncEvent::Phase(phase));
  }

  pub(crate) fn emit(&self, event: SyncEvent) {
    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.retain(|tx| tx.send(event).is_ok());
    }
  }
}

/// Interim pull progress, deliberately capped below 100 so the final
/// transition to 100 stays visually distinct.
pub(crate) fn pull_progress(done: i64, total: i64) -> u8 {
  if total <= 0 {
    0
  } else {
    (done * 98 / total) as u8
  }
}

/// Push progress is uncapped and reaches 100 only on the true final page.
pub(crate) fn push_progress(done: i64, total: i64) -> u8 {
  if total <= 0 {
    100
  } else {
    (done * 100 / total) as u8
  }
}

/// One device's side of a record sync. Owns the transport in both roles:
/// the listener (server role, opened via `host`) and the HTTP client
/// (client role, configured from a scanned discovery token). At most one
/// run is active at a time.
pub struct SyncSession {
  shared: Arc<SessionShared>,
  client: SyncClient,
  running: AtomicBool,
  server: Mutex<Option<ServerHandle>>,
}

impl SyncSession {
  pub fn new(db: Arc<Db>) -> Result<Self, SyncError> {
    Ok(Self {
      shared: Arc::new(SessionShared {
        db,
        phase: Mutex::new(SyncPhase::Prepare),
        direction: Mutex::new(None),
        listeners: Mutex::new(Vec::new()),
      }),
      client: SyncClient::new()?,
      running: AtomicBool::new(false),
      server: Mutex::new(None),
    })
  }

  pub fn phase(&self) -> SyncPhase {
    self.shared.phase()
  }

  pub fn direction(&self) -> Option<SyncDirection> {
    self.shared.direction.lock().map(|guard| *guard).unwrap_or(None)
  }

  /// Registers a UI observer. Multiple independent listeners are fine;
  /// receivers that went away are dropped on the next emit.
  pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
    let (tx, rx) = mpsc::channel();
    if let Ok(mut listeners) = self.shared.listeners.lock() {
      listeners.push(tx);
    }
    rx
  }

  /// Returns the session to the prepare phase after a terminal state,
  /// typically when the user dismisses the sync UI. Ignored mid-run.
  pub fn reset(&self) {
    if self.running.load(Ordering::SeqCst) {
      return;
    }
    if let Ok(mut guard) = self.shared.direction.lock() {
      *guard = None;
    }
    self.shared.set_phase(SyncPhase::Prepare);
  }

  /// Points the client role at a peer endpoint URL.
  pub fn configure_peer(&self, url: &str) {
    self.client.configure(url);
  }

  /// Decodes a scanned token and configures the peer endpoint. Returns
  /// false for unrelated content, which callers ignore silently.
  pub fn connect_with_token(&self, token: &str) -> bool {
    match discovery::decode_endpoint(token) {
      Some(url) => {
        self.configure_peer(&url);
        true
      }
      None => false,
    }
  }

  /// Opens the listener on the LAN IPv4 address and returns the discovery
  /// token for the peer to scan. Fails when no LAN address is available.
  pub fn host(&self, port: u16) -> Result<String, SyncError> {
    let ip = discovery::local_lan_ipv4().ok_or(SyncError::NoLanAddress)?;
    self.host_at(&ip.to_string(), port)
  }

  /// Opens the listener on an explicit address. Port 0 binds an ephemeral
  /// port; the token carries the actual one. Re-opening first closes any
  /// previous listener.
  pub fn host_at(&self, ip: &str, port: u16) -> Result<String, SyncError> {
    let mut guard = self.server.lock()?;
    if let Some(mut previous) = guard.take() {
      previous.stop();
    }
    let handle = server::spawn_listener(ip, port, self.shared.clone())?;
    let token = discovery::encode_endpoint(ip, handle.port());
    log::info!("sync listener open on {}:{}", ip, handle.port());
    *guard = Some(handle);
    Ok(token)
  }

  /// Closes the listener if one is open. Safe to call repeatedly.
  pub fn close_listener(&self) -> Result<(), SyncError> {
    let mut guard = self.server.lock()?;
    if let Some(mut handle) = guard.take() {
      handle.stop();
      log::info!("sync listener closed");
    }
    Ok(())
  }

  /// Imports all records from the peer: fetches pages sequentially into a
  /// buffer, then persists the whole run in one merge transaction.
  pub fn pull_from_peer(&self) -> Result<MergeOutcome, SyncError> {
    self.begin_run(SyncDirection::PullFromPeer)?;
    let result = self.run_pull();
    self.finish_run(result)
  }

  /// Exports all local records to the peer, one page per request; the
  /// peer merges each page synchronously. Returns the records sent.
  pub fn push_to_peer(&self) -> Result<i64, SyncError> {
    self.begin_run(SyncDirection::PushToPeer)?;
    let result = self.run_push();
    self.finish_run(result)
  }

  fn begin_run(&self, direction: SyncDirection) -> Result<(), SyncError> {
    if !self.client.is_configured() {
      return Err(SyncError::ServiceUnconfigured);
    }
    if self.running.swap(true, Ordering::SeqCst) {
      return Err(SyncError::AlreadyRunning);
    }
    if self.shared.phase() != SyncPhase::Prepare {
      self.running.store(false, Ordering::SeqCst);
      return Err(SyncError::NotPrepared);
    }
    if let Ok(mut guard) = self.shared.direction.lock() {
      *guard = Some(direction);
    }
    self.shared.set_phase(SyncPhase::Running);
    self.notify_best_effort(PeerNotice::Start);
    log::debug!("sync run started: {:?}", direction);
    Ok(())
  }

  fn finish_run<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
    self.running.store(false, Ordering::SeqCst);
    match result {
      Ok(value) => {
        self.shared.set_phase(SyncPhase::Succeeded);
        self.notify_best_effort(PeerNotice::Success);
        log::debug!("sync run succeeded");
        Ok(value)
      }
      Err(err) => {
        self.shared.set_phase(SyncPhase::Failed);
        self.notify_best_effort(PeerNotice::Failed);
        log::debug!("sync run failed: {err}");
        Err(err)
      }
    }
  }

  fn notify_best_effort(&self, notice: PeerNotice) {
    if let Err(err) = self.client.notify(notice) {
      log::warn!("could not deliver {:?} notification to peer: {err}", notice);
    }
  }

  // The total is only learned from the first page reply (the protocol has
  // no count endpoint), so even a zero-record peer costs one request
  // before the loop can decide there is nothing to transfer.
  fn run_pull(&self) -> Result<MergeOutcome, SyncError> {
    let mut buffer: Vec<Record> = Vec::new();
    let mut page: u32 = 1;
    loop {
      let body = self.client.fetch_page(page, PULL_PAGE_SIZE)?;
      let total = body.total_records;
      if body.records.is_empty() && total > 0 {
        return Err(SyncError::DataEmpty(format!(
          "page {page} carried no records but totalRecords is {total}"
        )));
      }
      if !body.records.is_empty() && total == 0 {
        return Err(SyncError::DataEmpty(format!(
          "page {page} carried {} records but totalRecords is 0",
          body.records.len()
        )));
      }
      buffer.extend(body.records);
      let done = buffer.len() as i64;
      if done > total {
        return Err(SyncError::DataEmpty(format!(
          "peer sent {done} records but announced {total}"
        )));
      }
      self.shared.emit(SyncEvent::Progress(pull_progress(done, total)));
      if done >= total {
        break;
      }
      page += 1;
    }

    let outcome = db::with_conn(&self.shared.db, |conn| merge::merge_batch(conn, &buffer))?;
    self.shared.emit(SyncEvent::Progress(100));
    Ok(outcome)
  }

  fn run_push(&self) -> Result<i64, SyncError> {
    let total = db::with_conn(&self.shared.db, |conn| db::count_records(conn))?;
    let mut sent: i64 = 0;
    while sent < total {
      let batch = db::with_conn(&self.shared.db, |conn| {
        db::list_page(conn, sent, PUSH_PAGE_SIZE as i64)
      })?;
      if batch.is_empty() {
        return Err(SyncError::DataEmpty(format!(
          "local store returned no records at offset {sent} of {total}"
        )));
      }
      let current = sent + batch.len() as i64;
      let page = SyncPage {
        records: batch,
        current_count: current,
        total_records: total,
      };
      let result = self.client.post_page(&page)?;
      if !result.accepted() {
        return Err(SyncError::PageRejected(
          result.err.unwrap_or_else(|| "peer returned result false".to_string()),
        ));
      }
      sent = current;
      self.shared.emit(SyncEvent::Progress(push_progress(sent, total)));
    }

    if total == 0 {
      self.shared.emit(SyncEvent::Progress(100));
    }
    Ok(sent)
  }
}

impl Drop for SyncSession {
  fn drop(&mut self) {
    let _ = self.close_listener();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pull_progress_is_capped_at_98() {
    assert_eq!(pull_progress(0, 0), 0);
    assert_eq!(pull_progress(50, 120), 40);
    assert_eq!(pull_progress(100, 120), 81);
    assert_eq!(pull_progress(120, 120), 98);
    assert_eq!(pull_progress(1, 1), 98);
  }

  #[test]
  fn push_progress_reaches_100_on_final_page() {
    assert_eq!(push_progress(100, 120), 83);
    assert_eq!(push_progress(120, 120), 100);
    assert_eq!(push_progress(0, 0), 100);
  }

  #[test]
  fn page_loop_iteration_counts() {
    // ceil(total / page_size) iterations absent failures.
    let pages = |total: i64, limit: i64| (total + limit - 1) / limit;
    assert_eq!(pages(120, 50), 3);
    assert_eq!(pages(100, 100), 1);
    assert_eq!(pages(101, 100), 2);
    assert_eq!(pages(0, 50), 0);
  }

  #[test]
  fn run_requires_a_configured_peer() {
    let db = Arc::new(crate::db::open_in_memory().unwrap());
    let session = SyncSession::new(db).unwrap();
    assert!(matches!(session.pull_from_peer(), Err(SyncError::ServiceUnconfigured)));
    assert!(matches!(session.push_to_peer(), Err(SyncError::ServiceUnconfigured)));
    // Fails fast: the phase never left prepare.
    assert_eq!(session.phase(), SyncPhase::Prepare);
    assert_eq!(session.direction(), None);
  }
}
