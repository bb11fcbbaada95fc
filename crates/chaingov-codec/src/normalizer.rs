//! `Normalizer`: one per chain, shared by every source of that chain.

use alloy_core::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{Event, EventParam};
use chaingov_core::event::snake_case;
use chaingov_core::{
    AbiVariant, BlockEvent, ChainDeployment, FieldValue, GovernorFamily, LogEvent, Signature,
    SignatureError, TokenKind,
};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::NormalizeError;
use crate::params::attach_decoded_params;
use crate::repair;
use crate::row::TextRow;
use crate::rpc::{parse_quantity, RpcBlockHeader, RpcLog};
use crate::text;
use crate::value::{decode_hex, from_dyn};

/// Converts raw source records into canonical events for one chain.
///
/// Pure and deterministic: no I/O, no clock. The governor family and token
/// kind decide which ABI variant of a signature a record is decoded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    pub chain_id: u64,
    pub family: GovernorFamily,
    pub token: TokenKind,
}

impl Normalizer {
    pub fn new(chain_id: u64, family: GovernorFamily, token: TokenKind) -> Self {
        Self { chain_id, family, token }
    }

    pub fn for_chain(chain: &ChainDeployment) -> Self {
        Self::new(chain.chain_id, chain.family(), chain.token_kind())
    }

    // ─── Text rows (archive / database) ───────────────────────────────────────

    /// Normalize an event row. `address` is the emitting contract.
    pub fn log_from_row(
        &self,
        signature: Signature,
        address: &str,
        row: &TextRow,
    ) -> Result<LogEvent, NormalizeError> {
        let block_number = row.quantity("block_number")?;
        let transaction_index = row.quantity("transaction_index")?;
        let log_index = row.quantity("log_index")?;

        let event = self.variant_for_row(signature, row)?;
        let mut fields = IndexMap::with_capacity(event.inputs.len());
        for param in &event.inputs {
            let name = snake_case(&param.name);
            let Some(cell) = row.get(&name) else {
                warn!(%signature, block = block_number, field = %name, "column missing from row");
                continue;
            };
            let value = self.row_field(signature, &name, param, cell, block_number);
            fields.insert(name, value);
        }

        let mut log = LogEvent {
            chain_id: self.chain_id,
            address: address.to_ascii_lowercase(),
            signature,
            sighash: signature.sighash(),
            block_number,
            transaction_index,
            log_index,
            fields,
        };
        finish(&mut log);
        Ok(log)
    }

    /// Normalize a block row (`block_number`, `timestamp`).
    pub fn block_from_row(&self, row: &TextRow) -> Result<BlockEvent, NormalizeError> {
        Ok(BlockEvent {
            chain_id: self.chain_id,
            block_number: row.quantity("block_number")?,
            timestamp: row.timestamp("timestamp")?,
        })
    }

    /// Text rows carry no topics, so the variant is chosen from deployment
    /// metadata, then confirmed against the columns actually present.
    fn variant_for_row(
        &self,
        signature: Signature,
        row: &TextRow,
    ) -> Result<&'static Event, NormalizeError> {
        let (_, preferred) = signature.select(None, self.family, self.token)?;
        if covers(preferred, row) {
            return Ok(preferred);
        }
        for variant in signature.variants() {
            let event = variant.event()?;
            if covers(event, row) {
                return Ok(event);
            }
        }
        Ok(preferred)
    }

    fn row_field(
        &self,
        signature: Signature,
        name: &str,
        param: &EventParam,
        cell: &[u8],
        block: u64,
    ) -> FieldValue {
        let ty = match param.resolve() {
            Ok(ty) => ty,
            Err(e) => {
                warn!(%signature, block, field = %name, error = %e, "unresolvable ABI type");
                return FieldValue::Str(String::from_utf8_lossy(cell).into_owned());
            }
        };
        if let DynSolType::String = ty {
            return match std::str::from_utf8(cell) {
                Ok(s) => FieldValue::Str(s.to_string()),
                Err(_) if signature.is_proposal_created() && name == "description" => {
                    warn!(%signature, block, "invalid UTF-8 in description; applying #proposalData= repair");
                    FieldValue::Str(repair::recover_description(cell))
                }
                Err(e) => {
                    warn!(%signature, block, field = %name, error = %e, "invalid UTF-8; decoding lossily");
                    FieldValue::Str(String::from_utf8_lossy(cell).into_owned())
                }
            };
        }
        let raw = String::from_utf8_lossy(cell);
        if param.indexed && ty.is_dynamic() {
            // Indexed reference types only survive as their keccak hash.
            return text::coerce(&DynSolType::FixedBytes(32), &raw)
                .unwrap_or_else(|_| FieldValue::Str(raw.into_owned()));
        }
        match text::coerce(&ty, &raw) {
            Ok(v) => v,
            Err(reason) => {
                warn!(%signature, block, field = %name, %reason, "field left uncoerced");
                FieldValue::Str(raw.into_owned())
            }
        }
    }

    // ─── JSON-RPC / websocket ─────────────────────────────────────────────────

    /// Normalize a raw log; the signature is recovered from topic0.
    pub fn log_from_rpc(&self, log: &RpcLog) -> Result<LogEvent, NormalizeError> {
        let topic0 = log.topic0().ok_or_else(|| NormalizeError::MissingColumn {
            column: "topics[0]".into(),
        })?;
        let signature = Signature::from_sighash(topic0)
            .ok_or_else(|| SignatureError::Unknown(topic0.to_string()))?;
        self.log_from_rpc_as(signature, log)
    }

    /// Normalize a raw log already routed to `signature`.
    pub fn log_from_rpc_as(
        &self,
        signature: Signature,
        log: &RpcLog,
    ) -> Result<LogEvent, NormalizeError> {
        let expected = signature.sighash();
        match log.topic0() {
            Some(t) if t.eq_ignore_ascii_case(&expected) => {}
            other => {
                return Err(NormalizeError::TopicMismatch {
                    expected,
                    got: other.unwrap_or("<none>").to_string(),
                })
            }
        }

        let block_number = meta(log.block_number.as_deref(), "blockNumber")?;
        let transaction_index = meta(log.transaction_index.as_deref(), "transactionIndex")?;
        let log_index = meta(log.log_index.as_deref(), "logIndex")?;

        let indexed = log.topics.len() - 1;
        let (variant, event) = signature.select(Some(indexed), self.family, self.token)?;
        let fields = decode_rpc_fields(signature, variant, event, log)?;

        let mut out = LogEvent {
            chain_id: self.chain_id,
            address: log.address.to_ascii_lowercase(),
            signature,
            sighash: expected,
            block_number,
            transaction_index,
            log_index,
            fields,
        };
        finish(&mut out);
        Ok(out)
    }

    /// Normalize a `newHeads` push or `eth_getBlockByNumber` result.
    pub fn block_from_header(&self, header: &RpcBlockHeader) -> Result<BlockEvent, NormalizeError> {
        Ok(BlockEvent {
            chain_id: self.chain_id,
            block_number: meta(Some(header.number.as_str()), "number")?,
            timestamp: meta(Some(header.timestamp.as_str()), "timestamp")?,
        })
    }
}

fn covers(event: &Event, row: &TextRow) -> bool {
    event.inputs.iter().all(|p| row.contains(&p.name))
}

fn meta(raw: Option<&str>, column: &str) -> Result<u64, NormalizeError> {
    let raw = raw.ok_or_else(|| NormalizeError::MissingColumn {
        column: column.to_string(),
    })?;
    parse_quantity(raw).ok_or_else(|| NormalizeError::InvalidMeta {
        column: column.to_string(),
        value: raw.to_string(),
    })
}

/// Post-processing shared by every source.
fn finish(log: &mut LogEvent) {
    if log.signature.is_proposal_created() {
        if let Some(FieldValue::Str(desc)) = log.fields.get_mut("description") {
            if let Some(clean) = repair::strip_marker_tail(desc) {
                warn!(block = log.block_number, "stripped #proposalData= tail from description");
                *desc = clean;
            }
        }
    }
    attach_decoded_params(log);
}

fn decode_rpc_fields(
    signature: Signature,
    variant: &AbiVariant,
    event: &Event,
    log: &RpcLog,
) -> Result<IndexMap<String, FieldValue>, NormalizeError> {
    let mut types = Vec::with_capacity(event.inputs.len());
    for param in &event.inputs {
        let ty = param.resolve().map_err(|e| NormalizeError::AbiDecodeFailed {
            signature: signature.to_string(),
            reason: format!("{}: {e}", param.name),
        })?;
        types.push(ty);
    }

    // Indexed params, in order, from topics[1..].
    let mut indexed_values = Vec::new();
    for (param, ty) in event.inputs.iter().zip(&types).filter(|(p, _)| p.indexed) {
        let topic = log.topics.get(indexed_values.len() + 1).ok_or_else(|| {
            NormalizeError::MissingColumn {
                column: format!("topic for {}", param.name),
            }
        })?;
        indexed_values.push(decode_topic(signature, topic, ty)?);
    }

    let data = decode_hex(&log.data).map_err(|e| NormalizeError::InvalidHex {
        context: "data".into(),
        reason: e.to_string(),
    })?;
    let data_types: Vec<DynSolType> = event
        .inputs
        .iter()
        .zip(&types)
        .filter(|(p, _)| !p.indexed)
        .map(|(_, t)| t.clone())
        .collect();

    let data_values = match decode_data(&data_types, &data) {
        Ok(values) => values,
        Err(reason) if signature.is_proposal_created() => {
            debug!(declaration = variant.declaration, %reason, "strict decode failed");
            decode_with_repair(signature, event, &data_types, &data, log.block())?
        }
        Err(reason) => {
            return Err(NormalizeError::AbiDecodeFailed {
                signature: signature.to_string(),
                reason,
            })
        }
    };

    let mut indexed_iter = indexed_values.into_iter();
    let mut data_iter = data_values.into_iter();
    let mut fields = IndexMap::with_capacity(event.inputs.len());
    for param in &event.inputs {
        let value = if param.indexed { indexed_iter.next() } else { data_iter.next() };
        if let Some(v) = value {
            fields.insert(snake_case(&param.name), v);
        }
    }
    Ok(fields)
}

/// Indexed value types are ABI words; reference types are only their hash.
fn decode_topic(
    signature: Signature,
    topic: &str,
    ty: &DynSolType,
) -> Result<FieldValue, NormalizeError> {
    let bytes = decode_hex(topic).map_err(|e| NormalizeError::InvalidHex {
        context: "topic".into(),
        reason: e.to_string(),
    })?;
    if ty.is_dynamic() || matches!(ty, DynSolType::Tuple(_) | DynSolType::FixedArray(..)) {
        return Ok(FieldValue::Bytes(crate::value::hex_prefixed(&bytes)));
    }
    ty.abi_decode(&bytes)
        .map(from_dyn)
        .map_err(|e| NormalizeError::AbiDecodeFailed {
            signature: signature.to_string(),
            reason: format!("topic decode: {e}"),
        })
}

fn decode_data(types: &[DynSolType], data: &[u8]) -> Result<Vec<FieldValue>, String> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    let decoded = DynSolType::Tuple(types.to_vec())
        .abi_decode_params(data)
        .map_err(|e| e.to_string())?;
    match decoded {
        DynSolValue::Tuple(vals) => Ok(vals.into_iter().map(from_dyn).collect()),
        other => Ok(vec![from_dyn(other)]),
    }
}

/// Upstream data quirk: see [`crate::repair`]. The description is re-read as
/// `bytes` and cut at the `#proposalData=` marker.
fn decode_with_repair(
    signature: Signature,
    event: &Event,
    data_types: &[DynSolType],
    data: &[u8],
    block: Option<u64>,
) -> Result<Vec<FieldValue>, NormalizeError> {
    let position = event
        .inputs
        .iter()
        .filter(|p| !p.indexed)
        .position(|p| p.name == "description");
    let Some(position) = position else {
        return Err(NormalizeError::AbiDecodeFailed {
            signature: signature.to_string(),
            reason: "no description field to repair".into(),
        });
    };

    let mut relaxed = data_types.to_vec();
    relaxed[position] = DynSolType::Bytes;
    let decoded = DynSolType::Tuple(relaxed)
        .abi_decode_params(data)
        .map_err(|e| NormalizeError::AbiDecodeFailed {
            signature: signature.to_string(),
            reason: format!("repair decode: {e}"),
        })?;
    let DynSolValue::Tuple(mut values) = decoded else {
        return Err(NormalizeError::AbiDecodeFailed {
            signature: signature.to_string(),
            reason: "repair decode did not yield a tuple".into(),
        });
    };

    let raw = match std::mem::replace(&mut values[position], DynSolValue::Bool(false)) {
        DynSolValue::Bytes(b) => b,
        other => {
            return Err(NormalizeError::AbiDecodeFailed {
                signature: signature.to_string(),
                reason: format!("repair decode: description is {other:?}"),
            })
        }
    };
    warn!(?block, "applied #proposalData= repair to ProposalCreated description");
    values[position] = DynSolValue::String(repair::recover_description(&raw));
    Ok(values.into_iter().map(from_dyn).collect())
}
