//! SQLite persistence for CareSync: the action log, record state, sync
//! progress, directory data (users, groups, access rules) and watch/push
//! registrations.

pub mod actions;
pub mod db;
pub mod directory;
pub mod errors;
pub mod push;
pub mod schema;
pub mod watch;

pub use actions::ActionLogRepository;
pub use db::{create_in_memory_pool, create_pool, run_migrations, DbPool};
pub use directory::DirectoryRepository;
pub use errors::StorageError;
pub use push::PushRegistrationRepository;
pub use watch::{WatchSubjectRepository, WatchTableRepository};
