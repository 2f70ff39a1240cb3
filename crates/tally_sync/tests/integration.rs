//! Integration tests: a full connector against a simulated Tally
//! instance.

use parking_lot::RwLock;
use std::sync::Arc;
use tally_protocol::parse_envelope;
use tally_sync::{
    ConnectorState, MemoryStore, MockTransport, RawResponse, RetryConfig, SyncConfig,
    SyncConnector, SyncError, SyncResult, SyncWorker, TallyTransport,
};

/// One company's books, rendered to Tally report XML on demand.
#[derive(Clone, Default)]
struct TallyBooks {
    companies: Vec<(String, String)>,
    // (guid, company_guid, name, closing_balance)
    ledgers: Vec<(String, String, String, String)>,
    // (guid, ledger_guid, date, amount, voucher_type)
    vouchers: Vec<(String, String, String, String, String)>,
}

impl TallyBooks {
    fn render(&self, report: tally_protocol::ReportKind) -> String {
        use tally_protocol::ReportKind;
        let mut body = String::from("<ENVELOPE>");
        match report {
            ReportKind::ListOfCompanies => {
                for (guid, name) in &self.companies {
                    body.push_str(&format!(
                        "<COMPANY><GUID>{guid}</GUID><NAME>{name}</NAME></COMPANY>"
                    ));
                }
            }
            ReportKind::ListOfLedgers => {
                for (guid, company, name, closing) in &self.ledgers {
                    body.push_str(&format!(
                        "<LEDGER><GUID>{guid}</GUID><NAME>{name}</NAME>\
                         <COMPANYGUID>{company}</COMPANYGUID>\
                         <OPENINGBALANCE>0</OPENINGBALANCE>\
                         <CLOSINGBALANCE>{closing}</CLOSINGBALANCE></LEDGER>"
                    ));
                }
            }
            ReportKind::ListOfVouchers => {
                for (guid, ledger, date, amount, vtype) in &self.vouchers {
                    body.push_str(&format!(
                        "<VOUCHER><GUID>{guid}</GUID><LEDGERGUID>{ledger}</LEDGERGUID>\
                         <DATE>{date}</DATE><AMOUNT>{amount}</AMOUNT>\
                         <VOUCHERTYPENAME>{vtype}</VOUCHERTYPENAME></VOUCHER>"
                    ));
                }
            }
        }
        body.push_str("</ENVELOPE>");
        body
    }
}

/// A transport backed by an in-memory Tally whose books can change
/// between cycles. Serves whichever report the envelope asks for,
/// with a UTF-8 BOM and a stray control byte like real responses.
struct SimulatedTally {
    books: RwLock<TallyBooks>,
}

impl SimulatedTally {
    fn new(books: TallyBooks) -> Self {
        Self {
            books: RwLock::new(books),
        }
    }
}

impl TallyTransport for SimulatedTally {
    fn send(&self, envelope: &str) -> SyncResult<RawResponse> {
        let (report, variables) =
            parse_envelope(envelope).map_err(|e| SyncError::Protocol(e.to_string()))?;
        assert_eq!(
            variables.get("SVEXPORTFORMAT").map(String::as_str),
            Some("$$SysName:XML")
        );
        let body = format!("\u{feff}{}\u{0}", self.books.read().render(report));
        Ok(RawResponse { status: 200, body })
    }

    fn is_running(&self) -> bool {
        true
    }
}

fn books_with_one_voucher() -> TallyBooks {
    TallyBooks {
        companies: vec![("c-1".into(), "Acme Traders".into())],
        ledgers: vec![("l-1".into(), "c-1".into(), "Cash".into(), "1,500.00".into())],
        vouchers: vec![(
            "v-1".into(),
            "l-1".into(),
            "20240401".into(),
            "1500.00".into(),
            "Sales".into(),
        )],
    }
}

fn config() -> SyncConfig {
    SyncConfig::default().with_retry(RetryConfig::new().without_jitter())
}

#[test]
fn full_cycle_against_simulated_tally() {
    let transport = SimulatedTally::new(books_with_one_voucher());
    let connector = SyncConnector::new(config(), transport, MemoryStore::new());

    let outcome = connector.run_cycle().unwrap();
    assert_eq!(outcome.counts.inserted, 3);
    assert_eq!(outcome.counts.updated, 0);
    assert_eq!(connector.state(), ConnectorState::Idle);

    let state = connector.store().state();
    assert_eq!(state.version, 1);
    assert!(state.companies.contains_key("c-1"));
    assert!(state.ledgers.contains_key("l-1"));
    assert!(state.vouchers.contains_key("v-1"));
    // Comma-grouped Tally amounts come through as plain decimals.
    assert_eq!(
        state.ledgers["l-1"].record.closing_balance.to_string(),
        "1500.00"
    );
}

#[test]
fn balance_change_between_cycles_updates_one_ledger() {
    let transport = SimulatedTally::new(books_with_one_voucher());
    let connector = SyncConnector::new(config(), transport, MemoryStore::new());
    connector.run_cycle().unwrap();

    connector.transport().books.write().ledgers[0].3 = "2,000.00".into();
    let outcome = connector.run_cycle().unwrap();
    assert_eq!(outcome.counts.inserted, 0);
    assert_eq!(outcome.counts.updated, 1);
    assert_eq!(
        connector.store().state().ledgers["l-1"]
            .record
            .closing_balance
            .to_string(),
        "2000.00"
    );
}

#[test]
fn vanished_voucher_is_marked_stale_and_survives() {
    let transport = SimulatedTally::new(books_with_one_voucher());
    let connector = SyncConnector::new(config(), transport, MemoryStore::new());
    connector.run_cycle().unwrap();

    connector.transport().books.write().vouchers.clear();
    let outcome = connector.run_cycle().unwrap();
    assert_eq!(outcome.counts.stale, 1);

    let state = connector.store().state();
    assert!(state.vouchers["v-1"].stale);

    // A third cycle with unchanged books commits an empty plan.
    let outcome = connector.run_cycle().unwrap();
    assert_eq!(outcome.counts.stale, 0);
    assert!(outcome.counts.inserted == 0 && outcome.counts.updated == 0);

    // The voucher comes back: its stale marker is cleared, not its row.
    connector.transport().books.write().vouchers = books_with_one_voucher().vouchers;
    let outcome = connector.run_cycle().unwrap();
    assert_eq!(outcome.counts.updated, 1);
    assert!(!connector.store().state().vouchers["v-1"].stale);
}

#[test]
fn malformed_record_is_skipped_without_failing_the_cycle() {
    struct OneBadLedger;
    impl TallyTransport for OneBadLedger {
        fn send(&self, envelope: &str) -> SyncResult<RawResponse> {
            let (report, _) =
                parse_envelope(envelope).map_err(|e| SyncError::Protocol(e.to_string()))?;
            let body = match report {
                tally_protocol::ReportKind::ListOfCompanies => {
                    "<ENVELOPE><COMPANY><GUID>c-1</GUID><NAME>Acme</NAME></COMPANY></ENVELOPE>"
                }
                tally_protocol::ReportKind::ListOfLedgers => {
                    // Missing CLOSINGBALANCE, then a good one.
                    "<ENVELOPE>\
                     <LEDGER><GUID>l-bad</GUID><NAME>Broken</NAME>\
                     <COMPANYGUID>c-1</COMPANYGUID><OPENINGBALANCE>0</OPENINGBALANCE></LEDGER>\
                     <LEDGER><GUID>l-1</GUID><NAME>Cash</NAME>\
                     <COMPANYGUID>c-1</COMPANYGUID><OPENINGBALANCE>0</OPENINGBALANCE>\
                     <CLOSINGBALANCE>10.00</CLOSINGBALANCE></LEDGER>\
                     </ENVELOPE>"
                }
                tally_protocol::ReportKind::ListOfVouchers => "<ENVELOPE></ENVELOPE>",
            };
            Ok(RawResponse {
                status: 200,
                body: body.to_string(),
            })
        }
        fn is_running(&self) -> bool {
            true
        }
    }

    let connector = SyncConnector::new(config(), OneBadLedger, MemoryStore::new());
    let outcome = connector.run_cycle().unwrap();
    assert_eq!(outcome.records_skipped, 1);
    assert_eq!(outcome.counts.inserted, 2);
    let state = connector.store().state();
    assert!(state.ledgers.contains_key("l-1"));
    assert!(!state.ledgers.contains_key("l-bad"));
}

#[test]
fn worker_drives_the_connector_end_to_end() {
    let transport = SimulatedTally::new(books_with_one_voucher());
    let connector = Arc::new(SyncConnector::new(
        config().with_poll_interval(std::time::Duration::from_secs(3600)),
        transport,
        MemoryStore::new(),
    ));

    let worker = SyncWorker::spawn(Arc::clone(&connector));
    connector.trigger_sync();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while connector.stats().cycles_completed == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    worker.shutdown();

    assert_eq!(connector.stats().cycles_completed, 1);
    assert_eq!(connector.store().state().len(), 3);
}

#[test]
fn scripted_line_error_halts_the_connector() {
    let transport = MockTransport::new();
    transport.push_body(
        "<ENVELOPE><LINEERROR>Could not set 'SVCURRENTCOMPANY'</LINEERROR></ENVELOPE>",
    );
    let connector = SyncConnector::new(config(), transport, MemoryStore::new());

    let err = connector.run_cycle().unwrap_err();
    assert!(matches!(err, SyncError::TallyApplication(_)));
    assert!(connector.is_halted());
    assert_eq!(connector.store().commits(), 0);
}
