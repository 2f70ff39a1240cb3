//! # Tally Sync
//!
//! Sync connector pulling accounting records out of a Tally instance
//! and reconciling them into a destination store.
//!
//! This crate provides:
//! - Transport abstraction over Tally's XML-over-HTTP port
//! - Liveness probing and a retry policy with jittered backoff
//! - Reconciliation of fetched records against committed state
//! - Atomic commits to a PostgreSQL (or in-memory) destination
//! - A connector state machine and a background scheduling worker
//!
//! ## Architecture
//!
//! The connector implements a **pull-only** model: Tally is the system
//! of record, and each cycle walks probe → fetch → reconcile → commit.
//! Records that vanish from Tally are marked stale in the destination,
//! never deleted.
//!
//! ## Key Invariants
//!
//! - Tally is authoritative; the destination is a mirror
//! - Commits are atomic: plan and sync state land together
//! - Reconciliation is idempotent against a freshly committed state
//! - Dependency order holds: companies, then ledgers, then vouchers
//! - Cancellation is honored at stage boundaries only

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod error;
mod http;
mod reconcile;
mod state;
mod store;
mod transport;
mod worker;

pub use config::{RetryConfig, SyncConfig};
pub use connector::{ConnectorState, ConnectorStatus, SyncConnector, SyncOutcome, SyncStats};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, UreqClient};
pub use reconcile::{reconcile, FetchSnapshot, PlanCounts, SyncOp, SyncPlan};
pub use state::{Known, SyncStateRecord};
pub use store::{MemoryStore, PostgresStore, RemoteStore};
pub use transport::{MockTransport, RawResponse, TallyTransport};
pub use worker::SyncWorker;
