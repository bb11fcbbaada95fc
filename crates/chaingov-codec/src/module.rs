//! Voting-module proposal payloads (`ProposalCreated.proposalData`).

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::U256;
use chaingov_core::VotingModuleKind;
use serde::{Deserialize, Serialize};

use crate::value::hex_prefixed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOption {
    pub budget_tokens_spent: U256,
    pub targets: Vec<String>,
    pub values: Vec<U256>,
    pub calldatas: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSettings {
    pub max_approvals: u8,
    pub criteria: u8,
    pub budget_token: String,
    pub criteria_value: U256,
    pub budget_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimisticSettings {
    pub against_threshold: U256,
    pub is_relative_to_votable_supply: bool,
}

/// Decoded module payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "module", rename_all = "lowercase")]
pub enum ModulePayload {
    Approval {
        options: Vec<ApprovalOption>,
        settings: ApprovalSettings,
    },
    Optimistic(OptimisticSettings),
}

fn approval_type() -> DynSolType {
    let option = DynSolType::Tuple(vec![
        DynSolType::Uint(256),
        DynSolType::Array(Box::new(DynSolType::Address)),
        DynSolType::Array(Box::new(DynSolType::Uint(256))),
        DynSolType::Array(Box::new(DynSolType::Bytes)),
        DynSolType::String,
    ]);
    let settings = DynSolType::Tuple(vec![
        DynSolType::Uint(8),
        DynSolType::Uint(8),
        DynSolType::Address,
        DynSolType::Uint(128),
        DynSolType::Uint(128),
    ]);
    DynSolType::Tuple(vec![DynSolType::Array(Box::new(option)), settings])
}

fn optimistic_type() -> DynSolType {
    DynSolType::Tuple(vec![DynSolType::Uint(248), DynSolType::Bool])
}

/// Guess the module from the payload layout when the deployment does not map
/// the module address.
///
/// An approval payload is `(ProposalOption[], ProposalSettings)`: one offset
/// word followed by five inline settings words, so its first word is `0xc0`.
/// An optimistic payload is a single static `(uint248, bool)`: 64 bytes.
pub fn infer_module(data: &[u8]) -> Option<VotingModuleKind> {
    if data.len() == 64 {
        return Some(VotingModuleKind::Optimistic);
    }
    if data.len() >= 32 && U256::from_be_slice(&data[..32]) == U256::from(0xc0u64) {
        return Some(VotingModuleKind::Approval);
    }
    None
}

/// Decode a payload for a known module kind. Standard modules carry none.
pub fn decode_payload(kind: VotingModuleKind, data: &[u8]) -> Result<Option<ModulePayload>, String> {
    match kind {
        VotingModuleKind::Standard => Ok(None),
        VotingModuleKind::Approval => decode_approval(data).map(Some),
        VotingModuleKind::Optimistic => decode_optimistic(data).map(Some),
    }
}

fn decode_approval(data: &[u8]) -> Result<ModulePayload, String> {
    let decoded = approval_type().abi_decode_params(data).map_err(|e| e.to_string())?;
    let [options, settings] = <[DynSolValue; 2]>::try_from(tuple(decoded)?)
        .map_err(|_| "approval payload is not a pair".to_string())?;

    let options = match options {
        DynSolValue::Array(items) => items
            .into_iter()
            .map(decode_option)
            .collect::<Result<Vec<_>, _>>()?,
        other => return Err(format!("options: expected array, got {other:?}")),
    };

    let s = tuple(settings)?;
    if s.len() != 5 {
        return Err(format!("settings: expected 5 fields, got {}", s.len()));
    }
    let settings = ApprovalSettings {
        max_approvals: small(&s[0])?,
        criteria: small(&s[1])?,
        budget_token: address(&s[2])?,
        criteria_value: uint(&s[3])?,
        budget_amount: uint(&s[4])?,
    };
    Ok(ModulePayload::Approval { options, settings })
}

fn decode_option(value: DynSolValue) -> Result<ApprovalOption, String> {
    let f = tuple(value)?;
    if f.len() != 5 {
        return Err(format!("option: expected 5 fields, got {}", f.len()));
    }
    Ok(ApprovalOption {
        budget_tokens_spent: uint(&f[0])?,
        targets: list(&f[1], address)?,
        values: list(&f[2], uint)?,
        calldatas: list(&f[3], bytes)?,
        description: match &f[4] {
            DynSolValue::String(s) => s.clone(),
            other => return Err(format!("option description: {other:?}")),
        },
    })
}

fn decode_optimistic(data: &[u8]) -> Result<ModulePayload, String> {
    let f = tuple(optimistic_type().abi_decode_params(data).map_err(|e| e.to_string())?)?;
    match f.as_slice() {
        [threshold, DynSolValue::Bool(relative)] => Ok(ModulePayload::Optimistic(OptimisticSettings {
            against_threshold: uint(threshold)?,
            is_relative_to_votable_supply: *relative,
        })),
        other => Err(format!("optimistic settings: {other:?}")),
    }
}

// ─── DynSolValue helpers ──────────────────────────────────────────────────────

fn tuple(value: DynSolValue) -> Result<Vec<DynSolValue>, String> {
    match value {
        DynSolValue::Tuple(v) => Ok(v),
        other => Err(format!("expected tuple, got {other:?}")),
    }
}

fn uint(value: &DynSolValue) -> Result<U256, String> {
    match value {
        DynSolValue::Uint(u, _) => Ok(*u),
        other => Err(format!("expected uint, got {other:?}")),
    }
}

fn small(value: &DynSolValue) -> Result<u8, String> {
    let u = uint(value)?;
    u8::try_from(u).map_err(|_| format!("{u} does not fit in u8"))
}

fn address(value: &DynSolValue) -> Result<String, String> {
    match value {
        DynSolValue::Address(a) => Ok(hex_prefixed(a.as_slice())),
        other => Err(format!("expected address, got {other:?}")),
    }
}

fn bytes(value: &DynSolValue) -> Result<String, String> {
    match value {
        DynSolValue::Bytes(b) => Ok(hex_prefixed(b)),
        other => Err(format!("expected bytes, got {other:?}")),
    }
}

fn list<T>(
    value: &DynSolValue,
    f: fn(&DynSolValue) -> Result<T, String>,
) -> Result<Vec<T>, String> {
    match value {
        DynSolValue::Array(items) => items.iter().map(f).collect(),
        other => Err(format!("expected array, got {other:?}")),
    }
}
