//! Remote store abstraction and implementations.
//!
//! The connector commits a [`SyncPlan`] together with the resulting
//! [`SyncStateRecord`] through [`RemoteStore`]. A commit is atomic:
//! either every operation and the new state land, or nothing does.
//!
//! Two implementations are provided: [`MemoryStore`] for tests and
//! [`PostgresStore`] for production, the latter built on the sync
//! `postgres` crate with a single `Mutex<Client>` (the crate runs its
//! own internal runtime, so this works from any thread).

use crate::error::{SyncError, SyncResult};
use crate::reconcile::{SyncOp, SyncPlan};
use crate::state::SyncStateRecord;
use parking_lot::{Mutex, RwLock};
use postgres::{Client, NoTls};
use std::sync::atomic::{AtomicU64, Ordering};
use tally_protocol::{EntityKind, TallyRecord};
use tracing::{debug, info};

/// Destination for reconciled records and sync state.
pub trait RemoteStore: Send + Sync {
    /// Loads the last committed sync state. A store that has never
    /// been committed to returns the default (empty) record.
    fn load_state(&self) -> SyncResult<SyncStateRecord>;

    /// Atomically applies a plan and persists the state that results
    /// from it. On error nothing is persisted and the previous state
    /// remains authoritative.
    fn commit(&self, plan: &SyncPlan, next_state: &SyncStateRecord) -> SyncResult<()>;
}

/// In-memory store for tests.
///
/// Counts committed operations and can be scripted to fail the next
/// commit, to exercise the connector's error paths.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<SyncStateRecord>,
    fail_next: Mutex<Option<SyncError>>,
    commits: AtomicU64,
    ops_committed: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `commit` call fail with the given error.
    pub fn fail_next_commit(&self, error: SyncError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Number of successful commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Total operations applied across all commits.
    pub fn ops_committed(&self) -> u64 {
        self.ops_committed.load(Ordering::SeqCst)
    }

    /// Snapshot of the current state, for assertions.
    pub fn state(&self) -> SyncStateRecord {
        self.state.read().clone()
    }
}

impl RemoteStore for MemoryStore {
    fn load_state(&self) -> SyncResult<SyncStateRecord> {
        Ok(self.state.read().clone())
    }

    fn commit(&self, plan: &SyncPlan, next_state: &SyncStateRecord) -> SyncResult<()> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        *self.state.write() = next_state.clone();
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.ops_committed
            .fetch_add(plan.ops.len() as u64, Ordering::SeqCst);
        Ok(())
    }
}

/// Idempotent DDL for the destination tables (PostgreSQL dialect).
///
/// Amounts and dates are stored as TEXT to avoid lossy numeric
/// coercion; the typed views live in application code. `sync_state`
/// holds a single-row JSON snapshot committed in the same transaction
/// as the records it describes.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS companies (
    guid TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    stale BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS ledgers (
    guid TEXT PRIMARY KEY,
    company_guid TEXT NOT NULL REFERENCES companies(guid),
    name TEXT NOT NULL,
    opening_balance TEXT NOT NULL,
    closing_balance TEXT NOT NULL,
    extra_data TEXT NOT NULL DEFAULT '{}',
    stale BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS vouchers (
    guid TEXT PRIMARY KEY,
    ledger_guid TEXT NOT NULL REFERENCES ledgers(guid),
    voucher_date TEXT NOT NULL,
    amount TEXT NOT NULL,
    voucher_type TEXT NOT NULL,
    extra_data TEXT NOT NULL DEFAULT '{}',
    stale BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS idx_ledgers_company ON ledgers (company_guid);
CREATE INDEX IF NOT EXISTS idx_vouchers_ledger ON vouchers (ledger_guid);

CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version BIGINT NOT NULL,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// PostgreSQL-backed store.
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Connects with a libpq-style connection string (for example
    /// `"host=localhost dbname=tally user=postgres"`) and runs the
    /// idempotent DDL.
    pub fn open(connstr: &str) -> SyncResult<Self> {
        let mut client = Client::connect(connstr, NoTls).map_err(map_db_err)?;
        client.batch_execute(CREATE_TABLES).map_err(map_db_err)?;
        info!("connected to destination database");
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Connects with a bearer credential supplied by the identity
    /// provider, attached as the connection's `password` parameter.
    /// The store never mints credentials itself.
    pub fn open_with_credential(connstr: &str, credential: &str) -> SyncResult<Self> {
        Self::open(&format!(
            "{connstr} password='{}'",
            quote_conn_value(credential)
        ))
    }
}

/// Escapes a value for a quoted libpq connection-string parameter.
fn quote_conn_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

impl RemoteStore for PostgresStore {
    fn load_state(&self) -> SyncResult<SyncStateRecord> {
        let mut client = self.client.lock();
        let rows = client
            .query("SELECT state_json FROM sync_state WHERE id = 1", &[])
            .map_err(map_db_err)?;
        match rows.first() {
            Some(row) => {
                let json: String = row.get(0);
                Ok(SyncStateRecord::from_json(&json))
            }
            None => Ok(SyncStateRecord::default()),
        }
    }

    fn commit(&self, plan: &SyncPlan, next_state: &SyncStateRecord) -> SyncResult<()> {
        let mut client = self.client.lock();
        let mut txn = client.transaction().map_err(map_db_err)?;

        for op in &plan.ops {
            match op {
                SyncOp::Insert(record) | SyncOp::Update(record) => {
                    upsert_record(&mut txn, record)?;
                }
                SyncOp::Stale { kind, guid } => {
                    let statement = match kind {
                        EntityKind::Company => "UPDATE companies SET stale = TRUE WHERE guid = $1",
                        EntityKind::Ledger => "UPDATE ledgers SET stale = TRUE WHERE guid = $1",
                        EntityKind::Voucher => "UPDATE vouchers SET stale = TRUE WHERE guid = $1",
                    };
                    txn.execute(statement, &[guid]).map_err(map_db_err)?;
                }
            }
        }

        txn.execute(
            "INSERT INTO sync_state (id, version, state_json, updated_at) \
             VALUES (1, $1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET version = $1, state_json = $2, updated_at = $3",
            &[
                &(next_state.version as i64),
                &next_state.to_json(),
                &chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(map_db_err)?;

        txn.commit().map_err(map_db_err)?;
        debug!(ops = plan.ops.len(), version = next_state.version, "committed sync plan");
        Ok(())
    }
}

fn upsert_record(txn: &mut postgres::Transaction<'_>, record: &TallyRecord) -> SyncResult<()> {
    match record {
        TallyRecord::Company(c) => {
            txn.execute(
                "INSERT INTO companies (guid, name, stale) VALUES ($1, $2, FALSE) \
                 ON CONFLICT (guid) DO UPDATE SET name = $2, stale = FALSE",
                &[&c.guid, &c.name],
            )
            .map_err(map_db_err)?;
        }
        TallyRecord::Ledger(l) => {
            let extra = serde_json::to_string(&l.extra).unwrap_or_else(|_| "{}".to_string());
            txn.execute(
                "INSERT INTO ledgers \
                 (guid, company_guid, name, opening_balance, closing_balance, extra_data, stale) \
                 VALUES ($1, $2, $3, $4, $5, $6, FALSE) \
                 ON CONFLICT (guid) DO UPDATE SET company_guid = $2, name = $3, \
                 opening_balance = $4, closing_balance = $5, extra_data = $6, stale = FALSE",
                &[
                    &l.guid,
                    &l.company_guid,
                    &l.name,
                    &l.opening_balance.to_string(),
                    &l.closing_balance.to_string(),
                    &extra,
                ],
            )
            .map_err(map_db_err)?;
        }
        TallyRecord::Voucher(v) => {
            let extra = serde_json::to_string(&v.extra).unwrap_or_else(|_| "{}".to_string());
            txn.execute(
                "INSERT INTO vouchers \
                 (guid, ledger_guid, voucher_date, amount, voucher_type, extra_data, stale) \
                 VALUES ($1, $2, $3, $4, $5, $6, FALSE) \
                 ON CONFLICT (guid) DO UPDATE SET ledger_guid = $2, voucher_date = $3, \
                 amount = $4, voucher_type = $5, extra_data = $6, stale = FALSE",
                &[
                    &v.guid,
                    &v.ledger_guid,
                    &v.date.format("%Y-%m-%d").to_string(),
                    &v.amount.to_string(),
                    &v.voucher_type.as_str(),
                    &extra,
                ],
            )
            .map_err(map_db_err)?;
        }
    }
    Ok(())
}

/// SQLSTATE class 23 (integrity constraint violations) is not
/// retryable; everything else from the driver is treated as a
/// connection-level fault.
fn map_db_err(error: postgres::Error) -> SyncError {
    let constraint = error
        .code()
        .is_some_and(|code| code.code().starts_with("23"));
    if constraint {
        SyncError::ConstraintViolation(error.to_string())
    } else {
        SyncError::Connection(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{reconcile, FetchSnapshot};
    use chrono::Utc;
    use tally_protocol::CompanyRecord;

    fn plan_one_company() -> (SyncPlan, SyncStateRecord) {
        let mut snapshot = FetchSnapshot::new(Utc::now());
        snapshot
            .companies
            .push(CompanyRecord::new("c-1", "Acme Traders"));
        let previous = SyncStateRecord::default();
        let plan = reconcile(&snapshot, &previous);
        let next = plan.apply(&previous);
        (plan, next)
    }

    #[test]
    fn memory_store_round_trips_state() {
        let store = MemoryStore::new();
        assert!(store.load_state().unwrap().is_empty());

        let (plan, next) = plan_one_company();
        store.commit(&plan, &next).unwrap();

        let loaded = store.load_state().unwrap();
        assert_eq!(loaded, next);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.ops_committed(), 1);
    }

    #[test]
    fn injected_failure_leaves_state_untouched() {
        let store = MemoryStore::new();
        let (plan, next) = plan_one_company();

        store.fail_next_commit(SyncError::Connection("down".into()));
        let err = store.commit(&plan, &next).unwrap_err();
        assert!(err.is_retryable());
        assert!(store.load_state().unwrap().is_empty());

        // The failure is consumed; the retry succeeds.
        store.commit(&plan, &next).unwrap();
        assert_eq!(store.state().version, 1);
    }

    #[test]
    fn credential_is_escaped_for_the_connection_string() {
        assert_eq!(quote_conn_value("plain"), "plain");
        assert_eq!(quote_conn_value("it's"), "it\\'s");
        assert_eq!(quote_conn_value("a\\b"), "a\\\\b");
    }
}
