//! Directory persistence: users, access groups, project membership and
//! access rules.

mod model;
mod repository;

pub use model::{AccessGroupMemberDB, ProjectUserAccessDB, ProjectUserDB, UserDB};
pub use repository::DirectoryRepository;
