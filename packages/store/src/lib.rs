//! Shared mutable state of the orchestration core.
//!
//! Both types here are constructed once and passed around behind `Arc`:
//!
//! - `StatusStore` - work item records, locked per key
//! - `CredentialPool` - API credentials with per-credential cooldown state

mod credential_pool;
mod status_store;

pub use credential_pool::{Cooldown, CredentialPool, PoolError};
pub use status_store::{StatusStore, StoreError};
