//! # live-delta: Live Query Results
//!
//! live-delta keeps the result sets of read queries up to date as the
//! underlying tables change, and tells every interested caller exactly what
//! changed:
//! - **Deduplicated** - identical registrations share one query, one watch
//!   and one fetch
//! - **Minimal re-fetch** - unchanged rows are recognised by content hash
//!   and never re-transmitted
//! - **Row-level diffs** - callers receive added, changed and removed rows
//! - **Coalesced refreshes** - bursts of changes cost one refresh, not many
//!
//! ## Quick Start
//!
//! ```ignore
//! use live_delta::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let observer = TableObserver::new();
//!     let store = Arc::new(MemoryStore::with_observer(observer.clone()));
//!     store.create_table("t", "id");
//!     store.define_view(
//!         "SELECT * FROM t WHERE id < $1",
//!         View::scan("t").filter(Filter::lt("id", "$1")),
//!     );
//!
//!     let registry = QueryRegistry::new(
//!         store.clone(),
//!         store.clone(),
//!         Arc::new(observer),
//!         ObserverConfig::new().key_field("id"),
//!     )?;
//!
//!     let handle = registry
//!         .register("SELECT * FROM t WHERE id < $1", json!([3]), |_| true, |diff| {
//!             println!("added {:?}", diff.added);
//!             Ok(())
//!         })
//!         .await?;
//!
//!     store.insert("t", Row::new().with("id", 1).with("v", "a"))?;
//!
//!     handle.stop().await?;
//!     registry.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Registry** (`registry`) - deduplicates registrations and hands out
//!    handles
//! 2. **Live query** (`query_info`) - canonical rows, subscribers, refresh
//!    coalescing
//! 3. **Delta statement** (`delta`) - hash-filtered re-fetch
//! 4. **Differ** (`diff`) - keyed row diffs
//!
//! The store, the change feed and table extraction are collaborators behind
//! the [`QueryExecutor`], [`ChangeNotifier`] and [`TableExtractor`] traits.
//! [`MemoryStore`] and [`TableObserver`] implement them in process.

// Internal modules
mod error;
mod query_info;
mod subscriber;
mod types;

pub mod config;
pub mod delta;
pub mod diff;
pub mod executor;
pub mod extract;
pub mod memory;
pub mod notifier;
pub mod registry;
pub mod view;

// Public API exports
pub use config::{ObserverConfig, RegisterOptions};
pub use error::{BoxError, LiveError, LiveResult};
pub use registry::{LiveQueryHandle, QueryRegistry};
pub use subscriber::{DiffCallback, SubscriptionId};
pub use types::{
    ContentHash, DEFAULT_KEY_FIELD, HASH_FIELD, HASHES_PARAM, Params, QueryKey, Row, RowKey,
};

pub use delta::{DeltaQuery, KnownHashes};
pub use diff::{ChangedRow, DiffOptions, DiffRow, RowsDiff, rows_diff};
pub use executor::QueryExecutor;
pub use extract::{SqlTableExtractor, TableExtractor};
pub use memory::MemoryStore;
pub use notifier::{ChangeNotifier, ChangeOp, TableChange, TableObserver, WatchHandle, WatchOptions};
pub use view::{CompareOp, Filter, OrderBy, View};

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use live_delta::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ObserverConfig, RegisterOptions};
    pub use crate::error::{BoxError, LiveError, LiveResult};
    pub use crate::registry::{LiveQueryHandle, QueryRegistry};
    pub use crate::types::{Params, QueryKey, Row, RowKey};
    pub use serde_json::{Value as JsonValue, json};

    // Diff types
    pub use crate::diff::{ChangedRow, RowsDiff};

    // Collaborators
    pub use crate::executor::QueryExecutor;
    pub use crate::extract::{SqlTableExtractor, TableExtractor};
    pub use crate::notifier::{ChangeNotifier, ChangeOp, TableChange, TableObserver};

    // In-memory backend
    pub use crate::memory::MemoryStore;
    pub use crate::view::{Filter, View};
}
