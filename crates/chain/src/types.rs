use serde::Deserialize;

use crate::error::ChainError;

/// Head block as observed by the state refresher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub transactions: Vec<Transaction>,
}

/// Transaction fields the load generator cares about.
///
/// `from` is `None` when the node only returned transaction hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: String,
    pub contract_address: Option<String>,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockView {
    number: Option<String>,
    hash: Option<String>,
    #[serde(default)]
    transactions: Vec<TransactionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransactionEntry {
    Full(TransactionView),
    Hash(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionView {
    hash: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReceiptView {
    transaction_hash: String,
    #[serde(default)]
    contract_address: Option<String>,
    #[serde(default)]
    logs: Vec<LogView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogView {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
}

// --- TryFrom impls ---

impl TryFrom<BlockView> for Block {
    type Error = ChainError;

    fn try_from(value: BlockView) -> Result<Self, Self::Error> {
        let number = value
            .number
            .ok_or_else(|| ChainError::parse_error("block is missing its number"))?;
        let hash = value
            .hash
            .ok_or_else(|| ChainError::parse_error("block is missing its hash"))?;
        Ok(Self {
            number: parse_quantity(&number)?,
            hash,
            transactions: value
                .transactions
                .into_iter()
                .map(Transaction::from)
                .collect(),
        })
    }
}

impl From<TransactionEntry> for Transaction {
    fn from(value: TransactionEntry) -> Self {
        match value {
            TransactionEntry::Full(tx) => Self {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
            },
            TransactionEntry::Hash(hash) => Self {
                hash,
                from: None,
                to: None,
            },
        }
    }
}

impl From<ReceiptView> for Receipt {
    fn from(value: ReceiptView) -> Self {
        Self {
            transaction_hash: value.transaction_hash,
            contract_address: value.contract_address,
            logs: value.logs.into_iter().map(Log::from).collect(),
        }
    }
}

impl From<LogView> for Log {
    fn from(value: LogView) -> Self {
        Self {
            address: value.address,
            topics: value.topics,
        }
    }
}

/// Parse a JSON-RPC hex quantity such as `0x1b4`.
pub fn parse_quantity(raw: &str) -> Result<u64, ChainError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| ChainError::parse_error(format!("quantity `{raw}` is missing 0x prefix")))?;
    if digits.is_empty() {
        return Err(ChainError::parse_error(format!("quantity `{raw}` has no digits")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|err| ChainError::parse_error(format!("invalid quantity `{raw}`: {err}")))
}

/// Format a block number as a JSON-RPC hex quantity.
pub fn format_quantity(value: u64) -> String {
    format!("{value:#x}")
}
