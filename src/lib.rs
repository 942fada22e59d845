//! Three-way reconciliation of bibliography collections.
//!
//! [`merge`] takes a common ancestor and two diverged copies of a collection
//! and returns the merged collection along with what was added, deleted and
//! contested on each side. It is pure: loading and saving snapshots lives in
//! [`store`] and is only used by the command-line tool.

pub mod error;
pub mod id;
pub mod merge;
pub mod model;
pub mod store;

pub use error::{Error, Result};
pub use merge::merge;
pub use model::{
    FieldConflict, IdentityKey, ItemConflict, MergeOptions, MergeResult, MergeStatus, Record,
    Resolution, Snapshot, TiePreference, Timestamp,
};
