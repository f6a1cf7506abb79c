//! Per-label unread counters, sync windows and the event cursor.

mod model;
mod repository;

pub use model::{LabelCounter, SyncWindow, clamp_unread};
pub use repository::CounterStore;
