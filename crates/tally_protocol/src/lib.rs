//! # Tally Protocol
//!
//! Request envelopes, typed records, and response parsing for Tally's
//! XML-over-HTTP export protocol.
//!
//! This crate provides:
//! - Envelope construction with escaping ([`EnvelopeBuilder`])
//! - Typed records for companies, ledgers, and vouchers
//! - Response scrubbing and parsing ([`parse_report`])
//! - Detection of Tally's in-band error envelopes (`LINEERROR`)
//!
//! ## Key invariants
//!
//! - Building an envelope has no I/O side effects
//! - A ledger GUID is unique within its owning company
//! - A voucher GUID is globally unique
//! - A malformed record never fails its batch; it is skipped and logged

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod parse;
mod records;

pub use envelope::{parse_envelope, EnvelopeBuilder, ReportKind};
pub use error::{ProtocolError, ProtocolResult};
pub use parse::{clean_response, parse_report, RecordSkip, ReportBatch};
pub use records::{
    CompanyRecord, EntityKind, LedgerRecord, TallyRecord, VoucherRecord, VoucherType,
};
