//! Lease-based coordination of row-level work across processes.
//!
//! Request handlers in many processes serialize access to a named resource
//! by holding a lease in a shared KeyDB store.  A lease that is never
//! released is broken after a bounded wait, and the break is broadcast so
//! other processes can abort work that was waiting on it.  Every store call
//! goes through a failover guard that quarantines callers during an outage.

pub mod config;
pub mod coordination;
pub mod health;
pub mod metrics;

pub use coordination::keys::{LeaseKey, TimeoutNotification};
pub use coordination::Coordinator;
