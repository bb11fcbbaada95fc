//! Converts alloy-core `DynSolValue` → ChainGov `FieldValue`.

use alloy_core::dyn_abi::DynSolValue;
use chaingov_core::FieldValue;

/// Convert a decoded `DynSolValue` into a `FieldValue`.
pub fn from_dyn(val: DynSolValue) -> FieldValue {
    match val {
        DynSolValue::Bool(b) => FieldValue::Bool(b),
        DynSolValue::Int(i, _bits) => FieldValue::Int(i),
        DynSolValue::Uint(u, _bits) => FieldValue::Uint(u),
        DynSolValue::FixedBytes(word, size) => FieldValue::Bytes(hex_prefixed(&word[..size])),
        DynSolValue::Bytes(b) => FieldValue::Bytes(hex_prefixed(&b)),
        DynSolValue::String(s) => FieldValue::Str(s),
        DynSolValue::Address(a) => FieldValue::Address(hex_prefixed(a.as_slice())),
        DynSolValue::Function(f) => FieldValue::Bytes(hex_prefixed(f.as_slice())),
        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) => {
            FieldValue::Array(vals.into_iter().map(from_dyn).collect())
        }
        DynSolValue::Tuple(vals) => FieldValue::Tuple(vals.into_iter().map(from_dyn).collect()),
        #[allow(unreachable_patterns)]
        other => FieldValue::Str(format!("{other:?}")),
    }
}

/// Lowercase `0x…` hex.
pub fn hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode `0x…`, bare hex, or Postgres `\x…` bytea text.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let s = s.trim();
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .or_else(|| s.strip_prefix("\\x"))
        .unwrap_or(s);
    hex::decode(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, U256};

    #[test]
    fn address_lowercased() {
        let addr: Address = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap();
        assert_eq!(
            from_dyn(DynSolValue::Address(addr)),
            FieldValue::Address("0xd8da6bf26964af9d7eed9e03e53415d37aa96045".into())
        );
    }

    #[test]
    fn fixed_bytes_truncated_to_size() {
        let mut word = B256::ZERO;
        word.0[0] = 0xab;
        word.0[23] = 0xcd;
        let v = from_dyn(DynSolValue::FixedBytes(word, 24));
        let hex = v.as_hex().unwrap();
        assert_eq!(hex.len(), 2 + 48);
        assert!(hex.starts_with("0xab"));
        assert!(hex.ends_with("cd"));
    }

    #[test]
    fn nested_arrays() {
        let v = from_dyn(DynSolValue::Array(vec![
            DynSolValue::Uint(U256::from(1u64), 256),
            DynSolValue::Uint(U256::from(2u64), 256),
        ]));
        assert_eq!(v.as_array().unwrap().len(), 2);
    }

    #[test]
    fn hex_prefixes() {
        assert_eq!(decode_hex("0xABcd").unwrap(), vec![0xab, 0xcd]);
        assert_eq!(decode_hex("\\x01ff").unwrap(), vec![0x01, 0xff]);
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
        assert!(decode_hex("0xzz").is_err());
    }
}
