//! Push registration persistence.

mod model;
mod repository;

pub use model::PushRegistrationDB;
pub use repository::PushRegistrationRepository;
