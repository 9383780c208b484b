//! Pagination progress
//!
//! # Components
//!
//! - `PaginationCursor`: the per-page state machine that decides what to fetch next
//! - `CheckpointStore`: the atomically replaced JSON file that makes progress resumable

mod checkpoint;
mod cursor;

// Re-export main types
pub use checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
pub use cursor::{CursorError, CursorPhase, DoneReason, PaginationCursor};
