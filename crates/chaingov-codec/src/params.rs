//! `VoteCastWithParams.params` → `params_decoded`.

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::U256;
use chaingov_core::{FieldValue, LogEvent, Signature};
use tracing::warn;

use crate::value::decode_hex;

pub const PARAMS_DECODED: &str = "params_decoded";

/// Decode an ABI-encoded `uint256[]` vote-params payload.
pub fn decode_params(bytes: &[u8]) -> Result<Vec<U256>, String> {
    let ty = DynSolType::Tuple(vec![DynSolType::Array(Box::new(DynSolType::Uint(256)))]);
    let decoded = ty.abi_decode_params(bytes).map_err(|e| e.to_string())?;
    let first = match decoded {
        DynSolValue::Tuple(mut vals) if !vals.is_empty() => vals.swap_remove(0),
        other => other,
    };
    match first {
        DynSolValue::Array(items) => items
            .into_iter()
            .map(|v| match v {
                DynSolValue::Uint(u, _) => Ok(u),
                other => Err(format!("unexpected element {other:?}")),
            })
            .collect(),
        other => Err(format!("expected uint256[], got {other:?}")),
    }
}

/// Adds `params_decoded` to a `VoteCastWithParams` event.
///
/// Absent or empty `params` leaves the event untouched; an undecodable payload
/// is logged and likewise leaves it untouched.
pub fn attach_decoded_params(event: &mut LogEvent) {
    if event.signature != Signature::VoteCastWithParams {
        return;
    }
    let Some(raw) = event.field("params").and_then(FieldValue::as_hex) else {
        return;
    };
    let bytes = match decode_hex(raw) {
        Ok(b) if !b.is_empty() => b,
        Ok(_) => return,
        Err(e) => {
            warn!(block = event.block_number, error = %e, "vote params are not hex");
            return;
        }
    };
    match decode_params(&bytes) {
        Ok(values) => {
            let arr = values.into_iter().map(FieldValue::Uint).collect();
            event.fields.insert(PARAMS_DECODED.to_string(), FieldValue::Array(arr));
        }
        Err(reason) => {
            warn!(block = event.block_number, %reason, "could not decode vote params");
        }
    }
}
