//! Watch registration persistence.

mod model;
mod repository;

pub use model::{WatchSubjectRegistrationDB, WatchTableRegistrationDB};
pub use repository::{WatchSubjectRepository, WatchTableRepository};
