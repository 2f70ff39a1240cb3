//! Response parsing and validation.
//!
//! Tally answers with HTTP 200 even when the request failed at the
//! application level; failures are signaled by `LINEERROR` nodes inside
//! the body. The export is also known to emit BOM markers, banner text
//! around the envelope, and XML-illegal control characters, so responses
//! are scrubbed before parsing.

use crate::envelope::ReportKind;
use crate::error::{ProtocolError, ProtocolResult};
use crate::records::{CompanyRecord, LedgerRecord, TallyRecord, VoucherRecord};
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// A record that could not be converted into its typed form.
///
/// Skips are per-record: a malformed record is logged and dropped, and
/// the rest of the batch keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSkip {
    /// Zero-based position of the record within the response.
    pub index: usize,
    /// Why the record was rejected.
    pub reason: String,
}

/// The parsed result of one report fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportBatch {
    /// Which report this batch came from.
    pub report: ReportKind,
    /// Successfully parsed records.
    pub records: Vec<TallyRecord>,
    /// Records skipped due to per-record parse failures.
    pub skipped: Vec<RecordSkip>,
}

impl ReportBatch {
    /// True when the batch holds no records and no skips.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.skipped.is_empty()
    }
}

/// Scrubs a raw Tally response down to a parseable envelope.
///
/// Removes the UTF-8 BOM, XML-illegal control characters, and anything
/// before the first `<ENVELOPE>` or after the first `</ENVELOPE>`.
pub fn clean_response(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|&c| {
            matches!(c, '\t' | '\n' | '\r')
                || (c >= ' ' && c != '\u{feff}' && !('\u{7f}'..='\u{9f}').contains(&c))
        })
        .collect();

    let sliced = match (cleaned.find("<ENVELOPE>"), cleaned.find("</ENVELOPE>")) {
        (Some(start), Some(end)) if end > start => &cleaned[start..end + "</ENVELOPE>".len()],
        _ => cleaned.trim(),
    };
    sliced.trim().to_string()
}

/// Parses a raw response into typed records for the requested report.
///
/// Fatal errors (`Xml`, `TallyApplication`) abort the whole batch;
/// per-record failures become [`RecordSkip`] entries.
pub fn parse_report(raw: &str, report: ReportKind) -> ProtocolResult<ReportBatch> {
    let cleaned = clean_response(raw);
    let mut reader = Reader::from_str(&cleaned);
    reader.trim_text(true);

    let mut batch = ReportBatch {
        report,
        records: Vec::new(),
        skipped: Vec::new(),
    };
    let record_tag = report.record_tag().as_bytes();
    let mut index = 0usize;

    loop {
        match reader
            .read_event()
            .map_err(|e| ProtocolError::Xml(e.to_string()))?
        {
            Event::Start(e) if e.local_name().as_ref() == b"LINEERROR" => {
                let text = reader
                    .read_text(e.name())
                    .map_err(|e| ProtocolError::Xml(e.to_string()))?;
                return Err(ProtocolError::TallyApplication(text.trim().to_string()));
            }
            Event::Start(e) if e.local_name().as_ref() == record_tag => {
                let name_attr = attribute_value(&e, b"NAME")?;
                let fields = collect_fields(&mut reader, record_tag, name_attr)?;
                match typed_record(report, &fields) {
                    Ok(record) => batch.records.push(record),
                    Err(ProtocolError::MalformedRecord(reason)) => {
                        warn!(report = report.report_name(), index, %reason, "skipping record");
                        batch.skipped.push(RecordSkip { index, reason });
                    }
                    Err(other) => return Err(other),
                }
                index += 1;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(batch)
}

/// Reads the `NAME` attribute of a record element, if present.
fn attribute_value(
    element: &quick_xml::events::BytesStart<'_>,
    key: &[u8],
) -> ProtocolResult<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ProtocolError::Xml(e.to_string()))?;
        if attr.key.local_name().as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| ProtocolError::Xml(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Collects leaf text fields of one record element into a flat map.
///
/// Nested elements are flattened by leaf tag name, last occurrence wins,
/// which matches how Tally nests `NAME` under `LANGUAGENAME.LIST`. The
/// `NAME` attribute of the record element fills in for a missing `NAME`
/// child.
fn collect_fields(
    reader: &mut Reader<&[u8]>,
    record_tag: &[u8],
    name_attr: Option<String>,
) -> ProtocolResult<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader
            .read_event()
            .map_err(|e| ProtocolError::Xml(e.to_string()))?
        {
            Event::Start(e) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Event::Text(t) => {
                if let Some(leaf) = stack.last() {
                    let text = t
                        .unescape()
                        .map_err(|e| ProtocolError::Xml(e.to_string()))?
                        .trim()
                        .to_string();
                    fields.insert(leaf.clone(), text);
                }
            }
            Event::End(e) => {
                if stack.is_empty() {
                    if e.local_name().as_ref() != record_tag {
                        return Err(ProtocolError::invalid_structure(format!(
                            "unbalanced element {:?}",
                            String::from_utf8_lossy(e.local_name().as_ref())
                        )));
                    }
                    break;
                }
                stack.pop();
            }
            Event::Eof => {
                return Err(ProtocolError::invalid_structure(
                    "record element never closed",
                ));
            }
            _ => {}
        }
    }

    if let Some(name) = name_attr {
        fields.entry("NAME".to_string()).or_insert(name);
    }
    Ok(fields)
}

fn typed_record(
    report: ReportKind,
    fields: &BTreeMap<String, String>,
) -> ProtocolResult<TallyRecord> {
    match report {
        ReportKind::ListOfCompanies => company_record(fields).map(TallyRecord::Company),
        ReportKind::ListOfLedgers => ledger_record(fields).map(TallyRecord::Ledger),
        ReportKind::ListOfVouchers => voucher_record(fields).map(TallyRecord::Voucher),
    }
}

fn required<'a>(fields: &'a BTreeMap<String, String>, key: &str) -> ProtocolResult<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProtocolError::malformed_record(format!("{key} missing")))
}

/// Parses a Tally amount. Tally groups digits Indian-style ("1,50,000.00"),
/// so separators are stripped before parsing.
fn required_decimal(fields: &BTreeMap<String, String>, key: &str) -> ProtocolResult<Decimal> {
    let raw = required(fields, key)?;
    raw.replace(',', "")
        .parse::<Decimal>()
        .map_err(|_| ProtocolError::malformed_record(format!("{key} is not numeric: {raw:?}")))
}

fn required_date(fields: &BTreeMap<String, String>, key: &str) -> ProtocolResult<NaiveDate> {
    let raw = required(fields, key)?;
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| ProtocolError::malformed_record(format!("{key} is not a date: {raw:?}")))
}

/// Everything not consumed by the standard fields goes into `extra`.
fn extra_fields(fields: &BTreeMap<String, String>, consumed: &[&str]) -> BTreeMap<String, String> {
    fields
        .iter()
        .filter(|(k, _)| !consumed.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn company_record(fields: &BTreeMap<String, String>) -> ProtocolResult<CompanyRecord> {
    Ok(CompanyRecord {
        guid: required(fields, "GUID")?.to_string(),
        name: required(fields, "NAME")?.to_string(),
    })
}

fn ledger_record(fields: &BTreeMap<String, String>) -> ProtocolResult<LedgerRecord> {
    // Some Tally versions label the name LEDGERNAME instead of NAME.
    let name = required(fields, "NAME").or_else(|_| required(fields, "LEDGERNAME"))?;
    Ok(LedgerRecord {
        guid: required(fields, "GUID")?.to_string(),
        company_guid: required(fields, "COMPANYGUID")?.to_string(),
        name: name.to_string(),
        opening_balance: required_decimal(fields, "OPENINGBALANCE")?,
        closing_balance: required_decimal(fields, "CLOSINGBALANCE")?,
        extra: extra_fields(
            fields,
            &[
                "GUID",
                "NAME",
                "LEDGERNAME",
                "COMPANYGUID",
                "OPENINGBALANCE",
                "CLOSINGBALANCE",
            ],
        ),
    })
}

fn voucher_record(fields: &BTreeMap<String, String>) -> ProtocolResult<VoucherRecord> {
    Ok(VoucherRecord {
        guid: required(fields, "GUID")?.to_string(),
        ledger_guid: required(fields, "LEDGERGUID")?.to_string(),
        date: required_date(fields, "DATE")?,
        amount: required_decimal(fields, "AMOUNT")?,
        voucher_type: required(fields, "VOUCHERTYPENAME")?.parse()?,
        extra: extra_fields(
            fields,
            &["GUID", "LEDGERGUID", "DATE", "AMOUNT", "VOUCHERTYPENAME"],
        ),
    })
}
