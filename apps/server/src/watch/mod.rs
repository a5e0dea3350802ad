//! Long-poll watch hubs.
//!
//! Each persisted registration gets one in-memory entry owning its own
//! coordination state: a notify handle, a watch epoch for supersession and a
//! removed flag. Registrations from unrelated clients never share a monitor.

mod subject;
mod table;

pub use subject::SubjectWatchHub;
pub use table::TableWatchHub;
