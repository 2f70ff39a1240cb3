//! Request envelope construction for Tally's Export Data protocol.
//!
//! Tally accepts an XML envelope POSTed over HTTP:
//!
//! ```text
//! <ENVELOPE>
//!   <HEADER>
//!     <VERSION>1</VERSION>
//!     <TALLYREQUEST>Export Data</TALLYREQUEST>
//!   </HEADER>
//!   <BODY>
//!     <EXPORTDATA>
//!       <REQUESTDESC>
//!         <REPORTNAME>...</REPORTNAME>
//!         <STATICVARIABLES>...</STATICVARIABLES>
//!       </REQUESTDESC>
//!     </EXPORTDATA>
//!   </BODY>
//! </ENVELOPE>
//! ```
//!
//! All user-supplied values (company names, date strings) are escaped, so
//! a hostile company name cannot break the envelope.

use crate::error::{ProtocolError, ProtocolResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version Tally expects in the header.
const ENVELOPE_VERSION: &str = "1";
/// Request verb for report exports.
const TALLY_REQUEST: &str = "Export Data";
/// Export format variable, always sent.
const EXPORT_FORMAT_VAR: &str = "SVEXPORTFORMAT";
/// Export format value for XML responses.
const EXPORT_FORMAT_XML: &str = "$$SysName:XML";

/// The reports this connector knows how to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    /// All companies on the Tally instance.
    ListOfCompanies,
    /// All ledgers of the currently selected company.
    ListOfLedgers,
    /// All vouchers of the currently selected company.
    ListOfVouchers,
}

impl ReportKind {
    /// All reports, fetched in this order during a sync cycle.
    pub const ALL: [ReportKind; 3] = [
        ReportKind::ListOfCompanies,
        ReportKind::ListOfLedgers,
        ReportKind::ListOfVouchers,
    ];

    /// The report name as it appears in `REPORTNAME`.
    pub fn report_name(&self) -> &'static str {
        match self {
            ReportKind::ListOfCompanies => "ListOfCompanies",
            ReportKind::ListOfLedgers => "ListOfLedgers",
            ReportKind::ListOfVouchers => "ListOfVouchers",
        }
    }

    /// The response element tag holding one record of this report.
    pub fn record_tag(&self) -> &'static str {
        match self {
            ReportKind::ListOfCompanies => "COMPANY",
            ReportKind::ListOfLedgers => "LEDGER",
            ReportKind::ListOfVouchers => "VOUCHER",
        }
    }

    /// Parses a `REPORTNAME` value back into a report kind.
    pub fn from_report_name(name: &str) -> Option<Self> {
        match name {
            "ListOfCompanies" => Some(ReportKind::ListOfCompanies),
            "ListOfLedgers" => Some(ReportKind::ListOfLedgers),
            "ListOfVouchers" => Some(ReportKind::ListOfVouchers),
            _ => None,
        }
    }
}

/// Builder for request envelopes.
///
/// `SVEXPORTFORMAT` is always present; callers add date ranges and the
/// current company via [`EnvelopeBuilder::variable`]. No network or I/O
/// side effects: [`EnvelopeBuilder::build`] just produces a string.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    report: ReportKind,
    variables: BTreeMap<String, String>,
}

impl EnvelopeBuilder {
    /// Creates a builder for the given report.
    pub fn new(report: ReportKind) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(EXPORT_FORMAT_VAR.to_string(), EXPORT_FORMAT_XML.to_string());
        Self { report, variables }
    }

    /// Sets a static variable. Later calls with the same key overwrite.
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// The report this builder targets.
    pub fn report(&self) -> ReportKind {
        self.report
    }

    /// Renders the envelope as an XML string.
    pub fn build(&self) -> ProtocolResult<String> {
        let mut writer = Writer::new(Vec::new());

        write_start(&mut writer, "ENVELOPE")?;
        write_start(&mut writer, "HEADER")?;
        write_text_element(&mut writer, "VERSION", ENVELOPE_VERSION)?;
        write_text_element(&mut writer, "TALLYREQUEST", TALLY_REQUEST)?;
        write_end(&mut writer, "HEADER")?;
        write_start(&mut writer, "BODY")?;
        write_start(&mut writer, "EXPORTDATA")?;
        write_start(&mut writer, "REQUESTDESC")?;
        write_text_element(&mut writer, "REPORTNAME", self.report.report_name())?;
        write_start(&mut writer, "STATICVARIABLES")?;
        for (key, value) in &self.variables {
            write_text_element(&mut writer, key, value)?;
        }
        write_end(&mut writer, "STATICVARIABLES")?;
        write_end(&mut writer, "REQUESTDESC")?;
        write_end(&mut writer, "EXPORTDATA")?;
        write_end(&mut writer, "BODY")?;
        write_end(&mut writer, "ENVELOPE")?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| ProtocolError::Xml(format!("envelope is not utf-8: {e}")))
    }
}

fn write_start<W: std::io::Write>(writer: &mut Writer<W>, name: &str) -> ProtocolResult<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(|e| ProtocolError::Xml(e.to_string()))
}

fn write_end<W: std::io::Write>(writer: &mut Writer<W>, name: &str) -> ProtocolResult<()> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(|e| ProtocolError::Xml(e.to_string()))
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> ProtocolResult<()> {
    write_start(writer, name)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|e| ProtocolError::Xml(e.to_string()))?;
    write_end(writer, name)
}

/// Parses a request envelope back into its report kind and variables.
///
/// Used by tests to check the round-trip property; the connector itself
/// only ever builds envelopes.
pub fn parse_envelope(envelope: &str) -> ProtocolResult<(ReportKind, BTreeMap<String, String>)> {
    let mut reader = Reader::from_str(envelope);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut report: Option<ReportKind> = None;
    let mut variables = BTreeMap::new();

    loop {
        match reader
            .read_event()
            .map_err(|e| ProtocolError::Xml(e.to_string()))?
        {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                path.push(name);
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| ProtocolError::Xml(e.to_string()))?
                    .into_owned();
                match path.as_slice() {
                    [.., parent, leaf] if parent == "STATICVARIABLES" => {
                        variables.insert(leaf.clone(), text);
                    }
                    [.., leaf] if leaf == "REPORTNAME" => {
                        report = Some(ReportKind::from_report_name(&text).ok_or_else(|| {
                            ProtocolError::invalid_structure(format!("unknown report {text:?}"))
                        })?);
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let report =
        report.ok_or_else(|| ProtocolError::invalid_structure("envelope has no REPORTNAME"))?;
    Ok((report, variables))
}
