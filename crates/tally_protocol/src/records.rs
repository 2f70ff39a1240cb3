//! Typed records extracted from Tally's export responses.

use crate::error::ProtocolError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The entity types the connector synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A Tally company.
    Company,
    /// A ledger within a company.
    Ledger,
    /// A voucher within a ledger.
    Voucher,
}

impl EntityKind {
    /// All entity kinds in dependency order (owners first).
    pub const ALL: [EntityKind; 3] = [EntityKind::Company, EntityKind::Ledger, EntityKind::Voucher];

    /// Stable lowercase name, used as the `sync_state` table key.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Ledger => "ledger",
            EntityKind::Voucher => "voucher",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The voucher types Tally exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoucherType {
    /// Payment voucher.
    Payment,
    /// Receipt voucher.
    Receipt,
    /// Sales voucher.
    Sales,
    /// Purchase voucher.
    Purchase,
    /// Journal voucher.
    Journal,
    /// Contra voucher.
    Contra,
}

impl VoucherType {
    /// Canonical name as Tally spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherType::Payment => "Payment",
            VoucherType::Receipt => "Receipt",
            VoucherType::Sales => "Sales",
            VoucherType::Purchase => "Purchase",
            VoucherType::Journal => "Journal",
            VoucherType::Contra => "Contra",
        }
    }
}

impl fmt::Display for VoucherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoucherType {
    type Err = ProtocolError;

    /// Case-insensitive: Tally emits mixed case depending on version.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "payment" => Ok(VoucherType::Payment),
            "receipt" => Ok(VoucherType::Receipt),
            "sales" => Ok(VoucherType::Sales),
            "purchase" => Ok(VoucherType::Purchase),
            "journal" => Ok(VoucherType::Journal),
            "contra" => Ok(VoucherType::Contra),
            // Report the spelling Tally actually sent, not the lowercased form.
            _ => Err(ProtocolError::malformed_record(format!(
                "unknown voucher type {trimmed:?}"
            ))),
        }
    }
}

/// A company as exported by Tally.
///
/// Companies are immutable once observed; the GUID is Tally-assigned and
/// the name is unique within one Tally instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    /// Tally-assigned GUID.
    pub guid: String,
    /// Company name.
    pub name: String,
}

impl CompanyRecord {
    /// Creates a new company record.
    pub fn new(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
        }
    }
}

/// A ledger as exported by Tally.
///
/// The GUID is unique within the owning company. Balances are mutable:
/// a changed balance is what makes a sync cycle emit an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Tally-assigned GUID, unique within the owning company.
    pub guid: String,
    /// GUID of the owning company.
    pub company_guid: String,
    /// Ledger name.
    pub name: String,
    /// Signed opening balance.
    pub opening_balance: Decimal,
    /// Signed closing balance.
    pub closing_balance: Decimal,
    /// Fields the parser did not recognize, preserved as-is.
    ///
    /// Tally's export schema varies slightly by version; unknown child
    /// elements land here instead of being dropped.
    pub extra: BTreeMap<String, String>,
}

/// A single accounting transaction entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherRecord {
    /// Tally-assigned GUID, globally unique. Natural key for dedup.
    pub guid: String,
    /// GUID of the owning ledger.
    pub ledger_guid: String,
    /// Voucher date.
    pub date: NaiveDate,
    /// Signed amount.
    pub amount: Decimal,
    /// Voucher type.
    pub voucher_type: VoucherType,
    /// Unrecognized fields, preserved as-is.
    pub extra: BTreeMap<String, String>,
}

/// A record of any entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TallyRecord {
    /// A company record.
    Company(CompanyRecord),
    /// A ledger record.
    Ledger(LedgerRecord),
    /// A voucher record.
    Voucher(VoucherRecord),
}

impl TallyRecord {
    /// The record's natural key.
    pub fn guid(&self) -> &str {
        match self {
            TallyRecord::Company(c) => &c.guid,
            TallyRecord::Ledger(l) => &l.guid,
            TallyRecord::Voucher(v) => &v.guid,
        }
    }

    /// The record's entity kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            TallyRecord::Company(_) => EntityKind::Company,
            TallyRecord::Ledger(_) => EntityKind::Ledger,
            TallyRecord::Voucher(_) => EntityKind::Voucher,
        }
    }
}
