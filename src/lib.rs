pub mod client;
pub mod db;
pub mod discovery;
pub mod error;
pub mod merge;
pub mod models;
mod server;
pub mod session;

pub use error::SyncError;
pub use merge::MergeOutcome;
pub use models::{PageResult, Record, SyncDirection, SyncPage, SyncPhase};
pub use session::{SyncEvent, SyncSession, PULL_PAGE_SIZE, PUSH_PAGE_SIZE};
