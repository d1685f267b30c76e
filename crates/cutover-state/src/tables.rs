//! redb table definitions for the release store.
//!
//! Release records are JSON-serialized into `&[u8]` values keyed by the
//! numeric release id, so iteration order is allocation order.

use redb::TableDefinition;

/// Release records keyed by release id.
pub const RELEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("releases");

/// Scalar bookkeeping: the current pointer and the id counter.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the current-pointer record in [`META`].
pub const CURRENT: &str = "current";

/// Key of the next release id in [`META`].
pub const NEXT_ID: &str = "next_id";
