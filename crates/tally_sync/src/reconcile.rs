//! Reconciliation: decide what to push and in what order.
//!
//! Given the records of one fetch and the last committed sync state,
//! compute the minimal set of upserts, ordered so that referential
//! dependencies hold: companies before ledgers before vouchers.
//!
//! Records previously observed but absent from the current fetch are
//! marked stale, never deleted. There is no delete operation in the
//! plan's type, so a destructive sync is unrepresentable.

use crate::state::{Known, SyncStateRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tally_protocol::{EntityKind, ReportBatch, TallyRecord};
use tracing::warn;

/// Everything one cycle fetched from Tally, with its fetch timestamp.
///
/// The timestamp is taken once per cycle; within a fetch, a duplicate
/// GUID is resolved by position (the later record wins), which is
/// last-write-wins by fetch time since Tally exposes no reliable
/// per-record modification time.
#[derive(Debug, Clone)]
pub struct FetchSnapshot {
    /// When this fetch happened.
    pub fetched_at: DateTime<Utc>,
    /// Fetched companies, in response order.
    pub companies: Vec<tally_protocol::CompanyRecord>,
    /// Fetched ledgers, in response order.
    pub ledgers: Vec<tally_protocol::LedgerRecord>,
    /// Fetched vouchers, in response order.
    pub vouchers: Vec<tally_protocol::VoucherRecord>,
    /// Records dropped during parsing (per-record failures).
    pub skipped: u64,
}

impl FetchSnapshot {
    /// Creates an empty snapshot stamped with the given time.
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at,
            companies: Vec::new(),
            ledgers: Vec::new(),
            vouchers: Vec::new(),
            skipped: 0,
        }
    }

    /// Folds one parsed report batch into the snapshot.
    pub fn absorb(&mut self, batch: ReportBatch) {
        self.skipped += batch.skipped.len() as u64;
        for record in batch.records {
            match record {
                TallyRecord::Company(c) => self.companies.push(c),
                TallyRecord::Ledger(l) => self.ledgers.push(l),
                TallyRecord::Voucher(v) => self.vouchers.push(v),
            }
        }
    }
}

/// One operation in a sync plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncOp {
    /// A record not seen before.
    Insert(TallyRecord),
    /// A known record whose mutable fields changed, or a stale record
    /// that reappeared.
    Update(TallyRecord),
    /// A known record absent from the current fetch. Marked, not
    /// deleted.
    Stale {
        /// Entity type of the stale record.
        kind: EntityKind,
        /// GUID of the stale record.
        guid: String,
    },
}

impl SyncOp {
    /// The entity type this operation touches.
    pub fn kind(&self) -> EntityKind {
        match self {
            SyncOp::Insert(r) | SyncOp::Update(r) => r.kind(),
            SyncOp::Stale { kind, .. } => *kind,
        }
    }

    /// The GUID this operation touches.
    pub fn guid(&self) -> &str {
        match self {
            SyncOp::Insert(r) | SyncOp::Update(r) => r.guid(),
            SyncOp::Stale { guid, .. } => guid,
        }
    }
}

/// Operation counts of a plan, reported back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanCounts {
    /// Records planned for insertion.
    pub inserted: u64,
    /// Records planned for update.
    pub updated: u64,
    /// Records marked stale.
    pub stale: u64,
}

/// An ordered batch of operations produced by reconciliation.
///
/// Operations respect dependency order: all company operations come
/// first, then ledgers, then vouchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Fetch timestamp the plan was computed from.
    pub fetched_at: DateTime<Utc>,
    /// Operations in commit order.
    pub ops: Vec<SyncOp>,
}

impl SyncPlan {
    /// True when there is nothing to commit.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Counts per operation kind.
    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts::default();
        for op in &self.ops {
            match op {
                SyncOp::Insert(_) => counts.inserted += 1,
                SyncOp::Update(_) => counts.updated += 1,
                SyncOp::Stale { .. } => counts.stale += 1,
            }
        }
        counts
    }

    /// Produces the state record a successful commit of this plan
    /// results in. Pure: the caller persists the result atomically.
    pub fn apply(&self, previous: &SyncStateRecord) -> SyncStateRecord {
        let mut next = previous.clone();
        next.version += 1;
        for kind in EntityKind::ALL {
            next.last_synced.insert(kind, self.fetched_at);
        }
        for op in &self.ops {
            match op {
                SyncOp::Insert(record) | SyncOp::Update(record) => match record {
                    TallyRecord::Company(c) => {
                        next.companies.insert(c.guid.clone(), Known::fresh(c.clone()));
                    }
                    TallyRecord::Ledger(l) => {
                        next.ledgers.insert(l.guid.clone(), Known::fresh(l.clone()));
                    }
                    TallyRecord::Voucher(v) => {
                        next.vouchers.insert(v.guid.clone(), Known::fresh(v.clone()));
                    }
                },
                SyncOp::Stale { kind, guid } => {
                    let flag = match kind {
                        EntityKind::Company => {
                            next.companies.get_mut(guid).map(|k| &mut k.stale)
                        }
                        EntityKind::Ledger => next.ledgers.get_mut(guid).map(|k| &mut k.stale),
                        EntityKind::Voucher => next.vouchers.get_mut(guid).map(|k| &mut k.stale),
                    };
                    if let Some(stale) = flag {
                        *stale = true;
                    }
                }
            }
        }
        next
    }
}

/// Computes the sync plan for one fetch against the last committed
/// state.
///
/// Reconciliation itself cannot fail: a malformed previous state is the
/// caller's concern (it degrades to an empty record), and records whose
/// owner is neither committed nor planned are skipped with a warning
/// rather than planned into a guaranteed foreign-key violation.
pub fn reconcile(snapshot: &FetchSnapshot, previous: &SyncStateRecord) -> SyncPlan {
    let mut ops = Vec::new();

    // Companies.
    let companies = dedupe_last_wins(&snapshot.companies, |c| c.guid.as_str());
    let mut company_available: HashSet<&str> =
        previous.companies.keys().map(String::as_str).collect();
    for company in &companies {
        match previous.companies.get(&company.guid) {
            None => {
                company_available.insert(company.guid.as_str());
                ops.push(SyncOp::Insert(TallyRecord::Company((*company).clone())));
            }
            // Companies are immutable once observed; the only update a
            // company can need is clearing a stale marker after it
            // reappears.
            Some(known) if known.stale => {
                ops.push(SyncOp::Update(TallyRecord::Company((*company).clone())));
            }
            Some(_) => {}
        }
    }
    push_stale_markers(
        &mut ops,
        EntityKind::Company,
        previous.companies.iter().map(|(g, k)| (g.as_str(), k.stale)),
        &companies.iter().map(|c| c.guid.as_str()).collect(),
    );

    // Ledgers: owner must be committed or planned in this cycle.
    let ledgers = dedupe_last_wins(&snapshot.ledgers, |l| l.guid.as_str());
    let mut ledger_available: HashSet<&str> =
        previous.ledgers.keys().map(String::as_str).collect();
    for ledger in &ledgers {
        if !company_available.contains(ledger.company_guid.as_str()) {
            warn!(
                guid = %ledger.guid,
                company = %ledger.company_guid,
                "ledger references an unknown company, skipping"
            );
            continue;
        }
        match previous.ledgers.get(&ledger.guid) {
            None => {
                ledger_available.insert(ledger.guid.as_str());
                ops.push(SyncOp::Insert(TallyRecord::Ledger((*ledger).clone())));
            }
            Some(known) if known.stale || known.record != **ledger => {
                ops.push(SyncOp::Update(TallyRecord::Ledger((*ledger).clone())));
            }
            Some(_) => {}
        }
    }
    push_stale_markers(
        &mut ops,
        EntityKind::Ledger,
        previous.ledgers.iter().map(|(g, k)| (g.as_str(), k.stale)),
        &ledgers.iter().map(|l| l.guid.as_str()).collect(),
    );

    // Vouchers: owner ledger must be committed or planned.
    let vouchers = dedupe_last_wins(&snapshot.vouchers, |v| v.guid.as_str());
    for voucher in &vouchers {
        if !ledger_available.contains(voucher.ledger_guid.as_str()) {
            warn!(
                guid = %voucher.guid,
                ledger = %voucher.ledger_guid,
                "voucher references an unknown ledger, skipping"
            );
            continue;
        }
        match previous.vouchers.get(&voucher.guid) {
            None => ops.push(SyncOp::Insert(TallyRecord::Voucher((*voucher).clone()))),
            Some(known) if known.stale || known.record != **voucher => {
                ops.push(SyncOp::Update(TallyRecord::Voucher((*voucher).clone())));
            }
            Some(_) => {}
        }
    }
    push_stale_markers(
        &mut ops,
        EntityKind::Voucher,
        previous.vouchers.iter().map(|(g, k)| (g.as_str(), k.stale)),
        &vouchers.iter().map(|v| v.guid.as_str()).collect(),
    );

    SyncPlan {
        fetched_at: snapshot.fetched_at,
        ops,
    }
}

/// Keeps the last occurrence of each GUID, preserving fetch order.
fn dedupe_last_wins<'a, T>(items: &'a [T], guid: impl Fn(&T) -> &str) -> Vec<&'a T> {
    let mut last_index: HashMap<&str, usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        last_index.insert(guid(item), index);
    }
    items
        .iter()
        .enumerate()
        .filter(|(index, item)| last_index.get(guid(item)) == Some(index))
        .map(|(_, item)| item)
        .collect()
}

/// Marks previously known GUIDs absent from the current fetch.
///
/// Already-stale records are not re-marked, so a plan computed against
/// a freshly committed state is empty.
fn push_stale_markers<'a>(
    ops: &mut Vec<SyncOp>,
    kind: EntityKind,
    previous: impl Iterator<Item = (&'a str, bool)>,
    current: &HashSet<&str>,
) {
    for (guid, already_stale) in previous {
        if !already_stale && !current.contains(guid) {
            ops.push(SyncOp::Stale {
                kind,
                guid: guid.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;
    use tally_protocol::{CompanyRecord, LedgerRecord, VoucherRecord, VoucherType};

    fn company(guid: &str) -> CompanyRecord {
        CompanyRecord::new(guid, format!("Company {guid}"))
    }

    fn ledger(guid: &str, company_guid: &str, closing: i64) -> LedgerRecord {
        LedgerRecord {
            guid: guid.into(),
            company_guid: company_guid.into(),
            name: format!("Ledger {guid}"),
            opening_balance: Decimal::ZERO,
            closing_balance: Decimal::new(closing, 2),
            extra: BTreeMap::new(),
        }
    }

    fn voucher(guid: &str, ledger_guid: &str, amount: i64) -> VoucherRecord {
        VoucherRecord {
            guid: guid.into(),
            ledger_guid: ledger_guid.into(),
            date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            amount: Decimal::new(amount, 2),
            voucher_type: VoucherType::Sales,
            extra: BTreeMap::new(),
        }
    }

    fn snapshot(
        companies: Vec<CompanyRecord>,
        ledgers: Vec<LedgerRecord>,
        vouchers: Vec<VoucherRecord>,
    ) -> FetchSnapshot {
        FetchSnapshot {
            fetched_at: Utc::now(),
            companies,
            ledgers,
            vouchers,
            skipped: 0,
        }
    }

    #[test]
    fn fresh_fetch_plans_inserts_in_dependency_order() {
        let snap = snapshot(
            vec![company("c-1")],
            vec![ledger("l-1", "c-1", 100)],
            vec![voucher("v-1", "l-1", 100)],
        );
        let plan = reconcile(&snap, &SyncStateRecord::default());

        assert_eq!(plan.counts().inserted, 3);
        let kinds: Vec<_> = plan.ops.iter().map(SyncOp::kind).collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Company, EntityKind::Ledger, EntityKind::Voucher]
        );
    }

    #[test]
    fn reconcile_is_idempotent_after_apply() {
        let snap = snapshot(
            vec![company("c-1"), company("c-2")],
            vec![ledger("l-1", "c-1", 500)],
            vec![voucher("v-1", "l-1", 500)],
        );
        let previous = SyncStateRecord::default();

        let plan = reconcile(&snap, &previous);
        assert!(!plan.is_empty());

        let committed = plan.apply(&previous);
        let replanned = reconcile(&snap, &committed);
        assert!(replanned.is_empty(), "second plan: {:?}", replanned.ops);
    }

    #[test]
    fn changed_balance_plans_update() {
        let snap = snapshot(vec![company("c-1")], vec![ledger("l-1", "c-1", 100)], vec![]);
        let committed = reconcile(&snap, &SyncStateRecord::default())
            .apply(&SyncStateRecord::default());

        let changed = snapshot(vec![company("c-1")], vec![ledger("l-1", "c-1", 999)], vec![]);
        let plan = reconcile(&changed, &committed);

        assert_eq!(plan.counts(), PlanCounts {
            inserted: 0,
            updated: 1,
            stale: 0,
        });
        match &plan.ops[0] {
            SyncOp::Update(TallyRecord::Ledger(l)) => {
                assert_eq!(l.closing_balance, Decimal::new(999, 2));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn omitted_ledger_is_marked_stale_never_deleted() {
        let snap = snapshot(vec![company("c-1")], vec![ledger("l-1", "c-1", 100)], vec![]);
        let committed = reconcile(&snap, &SyncStateRecord::default())
            .apply(&SyncStateRecord::default());

        // Next fetch omits l-1 entirely.
        let empty_ledgers = snapshot(vec![company("c-1")], vec![], vec![]);
        let plan = reconcile(&empty_ledgers, &committed);

        assert_eq!(plan.counts().stale, 1);
        assert!(plan.ops.iter().any(|op| matches!(
            op,
            SyncOp::Stale { kind: EntityKind::Ledger, guid } if guid == "l-1"
        )));

        // And the marker is not re-emitted once committed.
        let after_stale = plan.apply(&committed);
        assert!(reconcile(&empty_ledgers, &after_stale).is_empty());
    }

    #[test]
    fn reappearing_stale_record_is_updated() {
        let snap = snapshot(vec![company("c-1")], vec![], vec![]);
        let mut state = reconcile(&snap, &SyncStateRecord::default())
            .apply(&SyncStateRecord::default());
        state.companies.get_mut("c-1").unwrap().stale = true;

        let plan = reconcile(&snap, &state);
        assert_eq!(plan.counts().updated, 1);

        let cleared = plan.apply(&state);
        assert!(!cleared.companies["c-1"].stale);
    }

    #[test]
    fn orphan_records_are_skipped_not_planned() {
        let snap = snapshot(
            vec![],
            vec![ledger("l-1", "c-missing", 100)],
            vec![voucher("v-1", "l-1", 100)],
        );
        let plan = reconcile(&snap, &SyncStateRecord::default());
        // The ledger's owner is unknown, so the ledger is skipped; the
        // voucher's owner was not planned, so it is skipped too.
        assert!(plan.is_empty());
    }

    #[test]
    fn duplicate_guid_last_fetched_wins() {
        let snap = snapshot(
            vec![company("c-1")],
            vec![ledger("l-1", "c-1", 100), ledger("l-1", "c-1", 777)],
            vec![],
        );
        let plan = reconcile(&snap, &SyncStateRecord::default());

        let planned: Vec<_> = plan
            .ops
            .iter()
            .filter_map(|op| match op {
                SyncOp::Insert(TallyRecord::Ledger(l)) => Some(l),
                _ => None,
            })
            .collect();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].closing_balance, Decimal::new(777, 2));
    }

    #[test]
    fn apply_bumps_version_and_stamps_all_kinds() {
        let snap = snapshot(vec![company("c-1")], vec![], vec![]);
        let plan = reconcile(&snap, &SyncStateRecord::default());
        let next = plan.apply(&SyncStateRecord::default());

        assert_eq!(next.version, 1);
        for kind in EntityKind::ALL {
            assert_eq!(next.last_synced.get(&kind), Some(&snap.fetched_at));
        }
    }

    prop_compose! {
        fn arb_world()(
            company_count in 1usize..4,
            ledgers_per_company in 0usize..4,
            vouchers_per_ledger in 0usize..3,
            balance in -100_000i64..100_000,
        ) -> FetchSnapshot {
            let mut companies = Vec::new();
            let mut ledgers = Vec::new();
            let mut vouchers = Vec::new();
            for c in 0..company_count {
                let cg = format!("c-{c}");
                companies.push(company(&cg));
                for l in 0..ledgers_per_company {
                    let lg = format!("l-{c}-{l}");
                    ledgers.push(ledger(&lg, &cg, balance));
                    for v in 0..vouchers_per_ledger {
                        vouchers.push(voucher(&format!("v-{c}-{l}-{v}"), &lg, balance));
                    }
                }
            }
            snapshot(companies, ledgers, vouchers)
        }
    }

    proptest! {
        #[test]
        fn prop_plan_respects_dependency_order(snap in arb_world()) {
            let plan = reconcile(&snap, &SyncStateRecord::default());
            let kinds: Vec<_> = plan.ops.iter().map(SyncOp::kind).collect();
            let mut sorted = kinds.clone();
            sorted.sort();
            prop_assert_eq!(kinds, sorted);
        }

        #[test]
        fn prop_owner_precedes_dependent(snap in arb_world()) {
            let plan = reconcile(&snap, &SyncStateRecord::default());
            let mut seen: HashSet<String> = HashSet::new();
            for op in &plan.ops {
                if let SyncOp::Insert(record) = op {
                    match record {
                        TallyRecord::Ledger(l) => {
                            prop_assert!(seen.contains(&l.company_guid));
                        }
                        TallyRecord::Voucher(v) => {
                            prop_assert!(seen.contains(&v.ledger_guid));
                        }
                        TallyRecord::Company(_) => {}
                    }
                    seen.insert(record.guid().to_string());
                }
            }
        }

        #[test]
        fn prop_idempotent_after_apply(snap in arb_world()) {
            let previous = SyncStateRecord::default();
            let committed = reconcile(&snap, &previous).apply(&previous);
            prop_assert!(reconcile(&snap, &committed).is_empty());
        }
    }
}
