//! Claim store for transcoding tasks.
//!
//! One row per task. Phases claim rows atomically, skipping rows that other
//! claimants hold locked, and drive the status state machine.

pub mod claim;
pub mod error;
pub mod memory;
pub mod postgres;

pub use claim::{Affinity, ClaimRequest, ClaimStore, RoutingBacklog};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryClaimStore;
pub use postgres::{PgClaimStore, PgStoreConfig};
