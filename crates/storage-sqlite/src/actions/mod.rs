//! Action log, record state and sync progress persistence.

mod model;
mod repository;

pub use model::{DataActionDB, DataRecordDB, SyncProgressDB};
pub use repository::ActionLogRepository;

pub(crate) use model::{enum_from_db, enum_to_db};
