use std::sync::Mutex;
use std::time::Duration;

use crate::error::SyncError;
use crate::models::{PageResult, SyncPage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Phase notifications delivered to the peer over its listener.
#[derive(Debug, Clone, Copy)]
pub enum PeerNotice {
  Start,
  Success,
  Failed,
}

impl PeerNotice {
  fn path(self) -> &'static str {
    match self {
      PeerNotice::Start => "/sync/records/start",
      PeerNotice::Success => "/sync/records/success",
      PeerNotice::Failed => "/sync/records/failed",
    }
  }
}

/// HTTP side of a sync session: talks to the peer's listener once a base
/// URL has been configured (usually from a scanned discovery token).
pub struct SyncClient {
  http: reqwest::blocking::Client,
  base_url: Mutex<Option<String>>,
}

impl SyncClient {
  pub fn new() -> Result<Self, SyncError> {
    let http = reqwest::blocking::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()?;
    Ok(Self {
      http,
      base_url: Mutex::new(None),
    })
  }

  pub fn configure(&self, url: &str) {
    if let Ok(mut guard) = self.base_url.lock() {
      *guard = Some(url.trim_end_matches('/').to_string());
    }
  }

  pub fn is_configured(&self) -> bool {
    self.base_url.lock().map(|guard| guard.is_some()).unwrap_or(false)
  }

  fn base(&self) -> Result<String, SyncError> {
    self
      .base_url
      .lock()?
      .clone()
      .ok_or(SyncError::ServiceUnconfigured)
  }

  pub fn notify(&self, notice: PeerNotice) -> Result<(), SyncError> {
    let url = format!("{}{}", self.base()?, notice.path());
    self.http.get(&url).send()?.error_for_status()?;
    Ok(())
  }

  pub fn fetch_page(&self, page: u32, limit: u32) -> Result<SyncPage, SyncError> {
    let url = format!("{}/sync/records/result", self.base()?);
    let body = self
      .http
      .get(&url)
      .query(&[("page", page), ("limit", limit)])
      .send()?
      .error_for_status()?
      .json::<SyncPage>()?;
    Ok(body)
  }

  pub fn post_page(&self, page: &SyncPage) -> Result<PageResult, SyncError> {
    let url = format!("{}/sync/records/result", self.base()?);
    let result = self
      .http
      .post(&url)
      .json(page)
      .send()?
      .error_for_status()?
      .json::<PageResult>()?;
    Ok(result)
  }
}
