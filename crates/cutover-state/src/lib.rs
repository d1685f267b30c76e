//! cutover-state: release store for cutover.
//!
//! Backed by [redb](https://docs.rs/redb) for release records and the
//! current pointer, and by the environment root on disk for release
//! workspaces, shared paths, and the `current` symlink.
//!
//! # Architecture
//!
//! Release records are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by the numeric release id. A pointer change swaps the symlink and
//! commits every affected record in one write transaction.
//!
//! The `ReleaseStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod layout;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use layout::Layout;
pub use store::{PruneReport, ReleaseStore, RetentionPolicy, Rollback};
