//! Domain model shared by the cache, ledger, sync pipeline and queries.
//!
//! Records live in the local store as camelCase JSON documents and cross
//! the wire as snake_case rows, mirroring the REST backend's column
//! naming. Conversion helpers at the bottom translate between the two.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identity of a cached record. Records created offline carry a
/// client-assigned temporary id until the remote acknowledges the insert
/// and hands back a permanent numeric key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Permanent(i64),
    Temporary(String),
}

impl RecordId {
    pub fn fresh_temporary() -> Self {
        RecordId::Temporary(format!("temp_{}", Uuid::now_v7()))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, RecordId::Temporary(_))
    }

    pub fn as_permanent(&self) -> Option<i64> {
        match self {
            RecordId::Permanent(n) => Some(*n),
            RecordId::Temporary(_) => None,
        }
    }

    /// Storage key used for the sqlite `id` column.
    pub fn to_key(&self) -> String {
        match self {
            RecordId::Permanent(n) => n.to_string(),
            RecordId::Temporary(s) => s.clone(),
        }
    }

    pub fn from_key(key: &str) -> Self {
        match key.parse::<i64>() {
            Ok(n) => RecordId::Permanent(n),
            Err(_) => RecordId::Temporary(key.to_string()),
        }
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Permanent),
            Value::String(s) => Some(RecordId::Temporary(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RecordId::Permanent(n) => Value::from(*n),
            RecordId::Temporary(s) => Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Entity tables mirrored between the local store and the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Accounts,
    IncomeSources,
    Categories,
    Transactions,
    Loans,
    Settings,
    CustomCurrencies,
    ReportCache,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Accounts,
        Table::IncomeSources,
        Table::Categories,
        Table::Transactions,
        Table::Loans,
        Table::Settings,
        Table::CustomCurrencies,
        Table::ReportCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Accounts => "accounts",
            Table::IncomeSources => "income_sources",
            Table::Categories => "categories",
            Table::Transactions => "transactions",
            Table::Loans => "loans",
            Table::Settings => "settings",
            Table::CustomCurrencies => "custom_currencies",
            Table::ReportCache => "report_cache",
        }
    }

    /// Fields on sibling tables that reference this table's ids. Used to
    /// rewrite references when a temporary id becomes permanent.
    pub fn referencing_fields(&self) -> &'static [(Table, &'static str)] {
        match self {
            Table::Accounts => &[
                (Table::Transactions, "accountId"),
                (Table::Transactions, "toAccountId"),
                (Table::Loans, "accountId"),
            ],
            Table::IncomeSources => &[(Table::Transactions, "incomeSourceId")],
            Table::Categories => &[(Table::Transactions, "categoryId")],
            Table::Loans => &[(Table::Transactions, "loanId")],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
    InvestmentBuy,
    InvestmentSell,
    LoanGiven,
    LoanReceived,
    LoanPayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanKind {
    Given,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    PartiallyPaid,
    FullyPaid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: RecordId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub currency: String,
    pub balance: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub kind: LoanKind,
    pub person_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub paid_amount: Decimal,
    pub status: LoanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_account_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub income_source_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_id: Option<RecordId>,
    /// Amount converted into the user's main currency, when the
    /// transaction currency differs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_currency_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Shape a cached record for a remote insert: snake_case columns, no
/// client id, and the owning user injected server-side style.
pub fn to_wire_row(record: &Value, user_id: &str) -> Value {
    let mut out = Map::new();
    if let Value::Object(fields) = record {
        for (key, value) in fields {
            if key == "id" || key == "userId" {
                continue;
            }
            out.insert(camel_to_snake(key), value.clone());
        }
    }
    out.insert("user_id".to_string(), Value::from(user_id));
    Value::Object(out)
}

/// Shape a partial update for the wire. Identity and creation time never
/// change, and row filtering already scopes the user.
pub fn to_wire_patch(patch: &Value) -> Value {
    let mut out = Map::new();
    if let Value::Object(fields) = patch {
        for (key, value) in fields {
            if key == "id" || key == "userId" || key == "createdAt" {
                continue;
            }
            out.insert(camel_to_snake(key), value.clone());
        }
    }
    Value::Object(out)
}

/// Translate a fetched remote row back into the cache's camelCase shape.
pub fn from_wire_row(row: &Value) -> Value {
    let mut out = Map::new();
    if let Value::Object(fields) = row {
        for (key, value) in fields {
            out.insert(snake_to_camel(key), value.clone());
        }
    }
    Value::Object(out)
}
