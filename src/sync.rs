//! Device sync protocol.
//!
//! A device presents an opaque checkpoint; the reconciler answers with every entitlement
//! whose revision is past it and a new checkpoint. Nothing about the device is stored
//! server-side, so an exchange can be retried or resumed from any checkpoint.

mod entitlement;
mod reconciler;
mod token;

pub use entitlement::{Entitlement, RemovedEntitlement, SyncItem, render_delta};
pub use reconciler::{DeltaEntry, SyncDelta, SyncExchange, SyncReconciler, compute_delta};
pub use token::{SYNC_TOKEN_HEADER, SyncToken};
