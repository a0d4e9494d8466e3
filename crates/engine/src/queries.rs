//! Built-in Ethereum JSON-RPC query generators.
//!
//! Every generator writes a single newline-terminated JSON-RPC 2.0 request
//! whose arguments are drawn from the current [`ChainState`].

use std::num::NonZeroU64;

use rpcflood_chain::format_quantity;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::registry::{GenerateError, QueryRegistry, RandomQuery, WeightOverflow};
use crate::state::ChainState;

/// Method mix used when no methods are configured.
pub const DEFAULT_METHODS: &[(&str, u64)] = &[
    ("eth_getCode", 100),
    ("eth_getLogs", 250),
    ("eth_getTransactionByHash", 250),
    ("eth_blockNumber", 350),
    ("eth_getTransactionCount", 400),
    ("eth_getBlockByNumber", 400),
    ("eth_getBalance", 550),
    ("eth_getTransactionReceipt", 600),
    ("eth_call", 2000),
];

/// How far back `eth_getBlockByNumber` reaches from the head.
const RECENT_BLOCKS: u64 = 128;
/// Widest `eth_getLogs` range, in blocks.
const MAX_LOG_RANGE: u64 = 3;
/// `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: &str = "0x70a08231";
const NO_PARAMS: [u8; 0] = [];

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error(transparent)]
    WeightOverflow(#[from] WeightOverflow),
}

type GeneratorFn = fn(&mut Vec<u8>, &ChainState) -> Result<(), GenerateError>;

fn generator_for(method: &str) -> Option<GeneratorFn> {
    let generator: GeneratorFn = match method {
        "eth_call" => eth_call,
        "eth_getTransactionReceipt" => eth_get_transaction_receipt,
        "eth_getBalance" => eth_get_balance,
        "eth_getBlockByNumber" => eth_get_block_by_number,
        "eth_getBlockByHash" => eth_get_block_by_hash,
        "eth_getTransactionCount" => eth_get_transaction_count,
        "eth_blockNumber" => eth_block_number,
        "eth_getTransactionByHash" => eth_get_transaction_by_hash,
        "eth_getLogs" => eth_get_logs,
        "eth_getCode" => eth_get_code,
        "eth_chainId" => eth_chain_id,
        "eth_gasPrice" => eth_gas_price,
        _ => return None,
    };
    Some(generator)
}

/// Register a generator for every `(method, weight)` pair.
///
/// Zero weights disable a method. Unknown methods and a total weight beyond
/// `u64::MAX` are rejected before anything is registered.
pub fn install<'a, I>(registry: &mut QueryRegistry, methods: I) -> Result<(), InstallError>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let mut resolved = Vec::new();
    let mut total = registry.total_weight();
    for (method, weight) in methods {
        let generator =
            generator_for(method).ok_or_else(|| InstallError::UnknownMethod(method.to_string()))?;
        let Some(weight) = NonZeroU64::new(weight) else {
            debug!(method, "skipping method with zero weight");
            continue;
        };
        total = total.checked_add(weight.get()).ok_or_else(|| WeightOverflow {
            method: method.to_string(),
            weight: weight.get(),
        })?;
        resolved.push(RandomQuery::new(method, weight, generator));
    }
    for query in resolved {
        registry.add(query)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

fn write_request<P: Serialize>(
    out: &mut Vec<u8>,
    state: &ChainState,
    method: &str,
    params: P,
) -> Result<(), GenerateError> {
    let request = Request {
        jsonrpc: "2.0",
        id: state.next_id(),
        method,
        params,
    };
    serde_json::to_writer(&mut *out, &request)?;
    out.push(b'\n');
    Ok(())
}

fn address(state: &ChainState) -> Result<&str, GenerateError> {
    state.random_address().ok_or(GenerateError::MissingInput("address"))
}

fn contract(state: &ChainState) -> Result<&str, GenerateError> {
    state.random_contract().ok_or(GenerateError::MissingInput("address"))
}

fn transaction(state: &ChainState) -> Result<&str, GenerateError> {
    state
        .random_transaction()
        .ok_or(GenerateError::MissingInput("transaction"))
}

/// ABI-encode `address` as a 32-byte word.
fn pad_address(address: &str) -> String {
    let digits = address.trim_start_matches("0x");
    format!("{digits:0>64}")
}

fn eth_call(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    let to = contract(state)?;
    let holder = address(state)?;
    let data = format!("{BALANCE_OF_SELECTOR}{}", pad_address(holder));
    write_request(
        out,
        state,
        "eth_call",
        (json!({ "to": to, "data": data }), "latest"),
    )
}

fn eth_get_transaction_receipt(
    out: &mut Vec<u8>,
    state: &ChainState,
) -> Result<(), GenerateError> {
    write_request(out, state, "eth_getTransactionReceipt", [transaction(state)?])
}

fn eth_get_transaction_by_hash(
    out: &mut Vec<u8>,
    state: &ChainState,
) -> Result<(), GenerateError> {
    write_request(out, state, "eth_getTransactionByHash", [transaction(state)?])
}

fn eth_get_balance(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    write_request(out, state, "eth_getBalance", [address(state)?, "latest"])
}

fn eth_get_transaction_count(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    write_request(out, state, "eth_getTransactionCount", [address(state)?, "pending"])
}

fn eth_get_code(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    write_request(out, state, "eth_getCode", [contract(state)?, "latest"])
}

fn eth_get_block_by_number(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    let head = state.block_number();
    let number = head.saturating_sub(state.rand_below(RECENT_BLOCKS));
    write_request(
        out,
        state,
        "eth_getBlockByNumber",
        (format_quantity(number), false),
    )
}

fn eth_get_block_by_hash(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    let hash = state
        .block_hash()
        .ok_or(GenerateError::MissingInput("block hash"))?;
    write_request(out, state, "eth_getBlockByHash", (hash, false))
}

fn eth_get_logs(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    let to_block = state.block_number();
    let from_block = to_block.saturating_sub(state.rand_below(MAX_LOG_RANGE));

    let mut filter = serde_json::Map::new();
    filter.insert("fromBlock".into(), Value::String(format_quantity(from_block)));
    filter.insert("toBlock".into(), Value::String(format_quantity(to_block)));
    if let Some(topic) = state.random_topic() {
        filter.insert("topics".into(), json!([[topic]]));
    } else if let Some(emitter) = state.random_contract() {
        filter.insert("address".into(), Value::String(emitter.to_string()));
    }
    write_request(out, state, "eth_getLogs", [Value::Object(filter)])
}

fn eth_block_number(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    write_request(out, state, "eth_blockNumber", NO_PARAMS)
}

fn eth_chain_id(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    write_request(out, state, "eth_chainId", NO_PARAMS)
}

fn eth_gas_price(out: &mut Vec<u8>, state: &ChainState) -> Result<(), GenerateError> {
    write_request(out, state, "eth_gasPrice", NO_PARAMS)
}
