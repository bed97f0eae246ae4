//! fleetgrid-state: device & campaign store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for targets, distribution sets, saved filters, rollouts, rollout
//! groups, actions and their append-only status logs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{rollout_id}:{controller_id}`, `{action_id}:{seq}`)
//! enable prefix scans for related records; entities only reference each
//! other by id.
//!
//! Every state change runs inside [`StateStore::write`], which commits the
//! closure's work as one redb write transaction or aborts all of it. Reads
//! run inside [`StateStore::read`] against a consistent snapshot. Both
//! scopes implement [`StoreView`].
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod view;

pub use error::{StateError, StateResult};
pub use store::{ReadScope, StateStore, WriteScope};
pub use tables::target_key;
pub use types::*;
pub use view::StoreView;
