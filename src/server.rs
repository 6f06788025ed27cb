use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::db;
use crate::error::SyncError;
use crate::merge;
use crate::models::{PageResult, SyncPage, SyncPhase};
use crate::session::{push_progress, SessionShared, SyncEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Serialize)]
struct Ack {
  result: bool,
}

/// Handle to a running listener thread. Stopping sets the shutdown flag
/// and joins; the thread polls with a timeout so it notices promptly.
pub(crate) struct ServerHandle {
  port: u16,
  shutdown: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
  pub(crate) fn port(&self) -> u16 {
    self.port
  }

  pub(crate) fn stop(&mut self) {
    self.shutdown.store(true, Ordering::SeqCst);
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}

impl Drop for ServerHandle {
  fn drop(&mut self) {
    self.stop();
  }
}

pub(crate) fn spawn_listener(
  ip: &str,
  port: u16,
  shared: Arc<SessionShared>,
) -> Result<ServerHandle, SyncError> {
  let server = Server::http((ip, port)).map_err(|err| SyncError::Network(err.to_string()))?;
  let port = server
    .server_addr()
    .to_ip()
    .map(|addr| addr.port())
    .unwrap_or(port);
  let shutdown = Arc::new(AtomicBool::new(false));
  let flag = shutdown.clone();

  let thread = std::thread::spawn(move || {
    while !flag.load(Ordering::SeqCst) {
      match server.recv_timeout(POLL_INTERVAL) {
        Ok(Some(request)) => handle_request(request, &shared),
        Ok(None) => {}
        Err(err) => {
          log::warn!("sync listener stopped: {err}");
          break;
        }
      }
    }
  });

  Ok(ServerHandle {
    port,
    shutdown,
    thread: Some(thread),
  })
}

fn handle_request(mut request: Request, shared: &SessionShared) {
  let method = request.method().clone();
  let url = request.url().to_string();
  let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
  let response = match (method, path) {
    (Method::Get, "/sync/records/start") => handle_notice(shared, SyncPhase::Running),
    (Method::Get, "/sync/records/success") => handle_notice(shared, SyncPhase::Succeeded),
    (Method::Get, "/sync/records/failed") => handle_notice(shared, SyncPhase::Failed),
    (Method::Get, "/sync/records/result") => handle_page_query(query, shared),
    (Method::Post, "/sync/records/result") => handle_page_upload(&mut request, shared),
    _ => json_error(StatusCode(404), "SYNC_NOT_FOUND", "route not found"),
  };
  let _ = request.respond(response);
}

/// Mirrors a peer phase notice onto the hosting session. Notices are
/// state mirroring, not commands: a terminal notice only lands on a run
/// that is actually in flight, and nothing skips `Running`. Out-of-order
/// notices are acknowledged and dropped.
fn handle_notice(shared: &SessionShared, phase: SyncPhase) -> Response<std::io::Cursor<Vec<u8>>> {
  let accepted = match phase {
    SyncPhase::Running => matches!(shared.phase(), SyncPhase::Prepare | SyncPhase::Running),
    SyncPhase::Succeeded | SyncPhase::Failed => shared.phase() == SyncPhase::Running,
    SyncPhase::Prepare => false,
  };
  if accepted {
    shared.set_phase(phase);
  } else {
    log::debug!("ignoring out-of-order peer notice: {:?}", phase);
  }
  json_response(StatusCode(200), &Ack { result: true })
}

/// Serves one export-ordered slice of the local record set for a pulling
/// peer. The total is recomputed per request; a store that mutates
/// mid-run is a documented limitation, not handled here.
fn handle_page_query(query: &str, shared: &SessionShared) -> Response<std::io::Cursor<Vec<u8>>> {
  let params = parse_query(query);
  let page = params.get("page").and_then(|v| v.parse::<i64>().ok()).filter(|p| *p >= 1);
  let limit = params.get("limit").and_then(|v| v.parse::<i64>().ok()).filter(|l| *l >= 1);
  // Both values come off the wire; the offset math must not overflow.
  let offset = page
    .zip(limit)
    .and_then(|(page, limit)| page.checked_sub(1)?.checked_mul(limit));
  let (limit, offset) = match (limit, offset) {
    (Some(limit), Some(offset)) => (limit, offset),
    _ => return json_error(StatusCode(400), "SYNC_PAGE_PARAMS", "page and limit must be positive integers"),
  };

  let result = db::with_conn(&shared.db, |conn| {
    let total = db::count_records(conn)?;
    let records = db::list_page(conn, offset, limit)?;
    Ok(SyncPage {
      current_count: offset.saturating_add(records.len() as i64),
      total_records: total,
      records,
    })
  });

  match result {
    Ok(body) => json_response(StatusCode(200), &body),
    Err(err) => json_error(StatusCode(500), "SYNC_PAGE_READ", &err.to_string()),
  }
}

/// Accepts one pushed page and merges it in its own transaction. Failures
/// come back as `result: "false"`; the pushing peer aborts its run and
/// notifies `/sync/records/failed`, so no phase change happens here.
fn handle_page_upload(request: &mut Request, shared: &SessionShared) -> Response<std::io::Cursor<Vec<u8>>> {
  let mut body = Vec::new();
  if request.as_reader().read_to_end(&mut body).is_err() {
    return json_response(StatusCode(200), &PageResult::fail("could not read page body"));
  }
  let page: SyncPage = match serde_json::from_slice(&body) {
    Ok(page) => page,
    Err(err) => return json_response(StatusCode(200), &PageResult::fail(format!("invalid page payload: {err}"))),
  };
  if page.records.is_empty() && page.total_records > 0 {
    return json_response(StatusCode(200), &PageResult::fail("empty page with nonzero totalRecords"));
  }

  let outcome = db::with_conn(&shared.db, |conn| merge::merge_batch(conn, &page.records));
  match outcome {
    Ok(outcome) => {
      let done = page.current_count.min(page.total_records);
      shared.emit(SyncEvent::Progress(push_progress(done, page.total_records)));
      json_response(
        StatusCode(200),
        &PageResult::ok(format!("{} inserted, {} skipped", outcome.inserted, outcome.skipped)),
      )
    }
    Err(err) => json_response(StatusCode(200), &PageResult::fail(err.to_string())),
  }
}

fn parse_query(query: &str) -> HashMap<String, String> {
  let mut params = HashMap::new();
  for pair in query.split('&') {
    if let Some((key, value)) = pair.split_once('=') {
      params.insert(key.to_string(), value.to_string());
    }
  }
  params
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<std::io::Cursor<Vec<u8>>> {
  let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
  let mut response = Response::from_data(body);
  response = response.with_status_code(status);
  response.add_header(json_header("Content-Type", "application/json"));
  response
}

fn json_error(status: StatusCode, code: &str, message: &str) -> Response<std::io::Cursor<Vec<u8>>> {
  json_response(
    status,
    &serde_json::json!({
      "code": code,
      "message": message,
    }),
  )
}

fn json_header(name: &str, value: &str) -> Header {
  Header::from_bytes(name, value).unwrap()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_query_extracts_pairs() {
    let params = parse_query("page=2&limit=50");
    assert_eq!(params.get("page").map(String::as_str), Some("2"));
    assert_eq!(params.get("limit").map(String::as_str), Some("50"));
    assert!(parse_query("").is_empty());
    assert!(parse_query("noequals").is_empty());
  }
}
