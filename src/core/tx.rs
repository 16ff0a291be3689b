use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Transaction, TxStatus};
use crate::error::{EngineError, Result};

/// Wei per native unit, as a decimal scale.
const WEI_SCALE: u32 = 18;
/// Wei per gwei, as a decimal scale.
const GWEI_SCALE: u32 = 9;
/// Upper bound for `value` (native units) and `gasPrice` (gwei). Keeps
/// windowed sums far inside `Decimal` range.
const MAX_QUANTITY: i128 = 100_000_000_000_000_000_000;

pub fn max_quantity() -> Decimal {
    Decimal::from_i128_with_scale(MAX_QUANTITY, 0)
}

/// Well-known 4-byte selectors decoded to method names.
const KNOWN_SELECTORS: &[(&str, &str)] = &[
    ("0xa9059cbb", "transfer"),
    ("0x23b872dd", "transferFrom"),
    ("0x095ea7b3", "approve"),
    ("0xd0e30db0", "deposit"),
    ("0x2e1a7d4d", "withdraw"),
    ("0x3ccfd60b", "withdraw"),
    ("0x4e71d92d", "claim"),
    ("0xdb006a75", "redeem"),
    ("0xa0712d68", "mint"),
    ("0x42966c68", "burn"),
    ("0x7ff36ab5", "swapExactETHForTokens"),
    ("0x38ed1739", "swapExactTokensForTokens"),
    ("0x18cbafe5", "swapExactTokensForETH"),
    ("0xfb3bdb41", "swapETHForExactTokens"),
    ("0x414bf389", "exactInputSingle"),
    ("0x3593564c", "execute"),
];

/// A transaction payload as supplied by a node connection.
///
/// Quantities may be JSON numbers, decimal strings or `0x` hex strings. Hex
/// quantities are wei: `value` is converted to native units and `gasPrice`
/// to gwei. Decimal quantities are taken as already being in those units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<Value>,
    pub gas_price: Option<Value>,
    #[serde(alias = "gas")]
    pub gas_limit: Option<Value>,
    pub method: Option<String>,
    pub input: Option<String>,
    /// RFC 3339 string or epoch milliseconds.
    pub observed_at: Option<Value>,
    pub status: Option<String>,
}

/// Parse a JSON payload and normalize it.
pub fn normalize_bytes(raw: &[u8]) -> Result<Transaction> {
    let payload: RawTransaction = serde_json::from_slice(raw)
        .map_err(|e| EngineError::MalformedPayload(format!("invalid JSON: {e}")))?;
    normalize(&payload)
}

/// Convert a raw payload into the canonical [`Transaction`].
pub fn normalize(raw: &RawTransaction) -> Result<Transaction> {
    let hash = match raw.hash.as_deref().map(str::trim) {
        Some(h) if !h.is_empty() => normalize_hex(h)
            .ok_or_else(|| EngineError::MalformedPayload(format!("hash {h:?} is not hex")))?,
        _ => return Err(EngineError::MalformedPayload("missing hash".into())),
    };

    let from = match raw.from.as_deref().map(str::trim) {
        Some(f) if !f.is_empty() => normalize_address(f)
            .map_err(|_| EngineError::MalformedPayload(format!("from {f:?} is not an address")))?,
        _ => return Err(EngineError::MalformedPayload("missing from".into())),
    };

    let to = match raw.to.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => Some(
            normalize_address(t)
                .map_err(|_| EngineError::MalformedPayload(format!("to {t:?} is not an address")))?,
        ),
        _ => None,
    };

    let value = parse_quantity(raw.value.as_ref(), WEI_SCALE, "value")?;
    let gas_price = parse_quantity(raw.gas_price.as_ref(), GWEI_SCALE, "gasPrice")?;
    let gas_limit = parse_gas_limit(raw.gas_limit.as_ref())?;

    let observed_at = match raw.observed_at.as_ref() {
        None | Some(Value::Null) => Utc::now(),
        Some(v) => parse_timestamp(v)?,
    };

    if let Some(input) = raw.input.as_deref() {
        validate_calldata(input)?;
    }

    let status = match raw.status.as_deref() {
        None => TxStatus::Pending,
        Some(s) => TxStatus::from_str(s).map_err(EngineError::MalformedPayload)?,
    };

    Ok(Transaction {
        hash,
        from,
        to,
        value,
        gas_price,
        gas_limit,
        method: decode_method(raw.method.as_deref(), raw.input.as_deref()),
        observed_at,
        status,
    })
}

/// Lowercase a `0x`-prefixed address, rejecting anything that is not hex.
pub fn normalize_address(address: &str) -> Result<String> {
    normalize_hex(address.trim()).ok_or_else(|| EngineError::InvalidAddress(address.to_string()))
}

fn normalize_hex(s: &str) -> Option<String> {
    let lower = s.to_ascii_lowercase();
    let digits = lower.strip_prefix("0x")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(lower)
}

/// Look up a 4-byte selector (`0x` + 8 hex digits).
pub fn decode_selector(selector: &str) -> Option<&'static str> {
    let selector = selector.to_ascii_lowercase();
    KNOWN_SELECTORS
        .iter()
        .find(|(sel, _)| *sel == selector)
        .map(|(_, name)| *name)
}

/// Calldata is `0x`-prefixed (optional) hex; an empty body is a plain transfer.
fn validate_calldata(input: &str) -> Result<()> {
    let data = input.trim();
    let data = data.strip_prefix("0x").or_else(|| data.strip_prefix("0X")).unwrap_or(data);
    if data.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(EngineError::MalformedPayload(format!(
            "input is not hex ({} bytes)",
            input.len()
        )))
    }
}

fn is_selector(s: &str) -> bool {
    s.len() == 10 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve the method from an explicit name/selector or from calldata.
fn decode_method(method: Option<&str>, input: Option<&str>) -> Option<String> {
    if let Some(m) = method.map(str::trim).filter(|m| !m.is_empty()) {
        if is_selector(m) {
            return Some(
                decode_selector(m)
                    .map(str::to_string)
                    .unwrap_or_else(|| m.to_ascii_lowercase()),
            );
        }
        // "withdraw(uint256)" -> "withdraw"
        let name = m.split('(').next().unwrap_or(m).trim();
        return (!name.is_empty()).then(|| name.to_string());
    }

    let data = input?.trim();
    let data = data.strip_prefix("0x").or_else(|| data.strip_prefix("0X")).unwrap_or(data);
    let selector = data.get(..8).filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))?;
    let selector = format!("0x{}", selector.to_ascii_lowercase());
    Some(
        decode_selector(&selector)
            .map(str::to_string)
            .unwrap_or(selector),
    )
}

fn parse_quantity(value: Option<&Value>, hex_scale: u32, field: &str) -> Result<Decimal> {
    let malformed = |reason: String| EngineError::MalformedPayload(format!("{field}: {reason}"));

    let parsed = match value {
        None | Some(Value::Null) => Decimal::ZERO,
        Some(Value::Number(n)) => parse_decimal(&n.to_string()).ok_or_else(|| malformed(format!("{n} out of range")))?,
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                let wei = u128::from_str_radix(hex, 16).map_err(|e| malformed(format!("{s:?}: {e}")))?;
                let wei = i128::try_from(wei).map_err(|_| malformed(format!("{s:?} out of range")))?;
                Decimal::try_from_i128_with_scale(wei, hex_scale)
                    .map_err(|_| malformed(format!("{s:?} out of range")))?
                    .normalize()
            } else {
                parse_decimal(s).ok_or_else(|| malformed(format!("{s:?} is not a number")))?
            }
        }
        Some(other) => return Err(malformed(format!("unexpected {other}"))),
    };

    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(malformed(format!("negative {parsed}")));
    }
    if parsed > max_quantity() {
        return Err(malformed(format!("{parsed} out of range")));
    }
    Ok(parsed)
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

fn parse_gas_limit(value: Option<&Value>) -> Result<u64> {
    let malformed = |reason: String| EngineError::MalformedPayload(format!("gasLimit: {reason}"));
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| malformed(format!("{n} is not an unsigned integer"))),
        Some(Value::String(s)) => {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| malformed(format!("{s:?}: {e}"))),
                None => s.parse::<u64>().map_err(|e| malformed(format!("{s:?}: {e}"))),
            }
        }
        Some(other) => Err(malformed(format!("unexpected {other}"))),
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| EngineError::MalformedPayload(format!("observedAt: {n} is not epoch millis"))),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| EngineError::MalformedPayload(format!("observedAt: {s:?}: {e}"))),
        other => Err(EngineError::MalformedPayload(format!("observedAt: unexpected {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawTransaction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn normalizes_decimal_payload() {
        let tx = normalize(&raw(json!({
            "hash": "0xAB01",
            "from": "0xF00",
            "to": "0xABC",
            "value": "1000",
            "gasPrice": 500,
            "gasLimit": 21000,
            "method": "swapExactETHForTokens",
            "observedAt": 1_700_000_000_000i64,
        })))
        .unwrap();
        assert_eq!(tx.hash, "0xab01");
        assert_eq!(tx.from, "0xf00");
        assert_eq!(tx.to.as_deref(), Some("0xabc"));
        assert_eq!(tx.value, Decimal::from(1000));
        assert_eq!(tx.gas_price, Decimal::from(500));
        assert_eq!(tx.gas_limit, 21_000);
        assert_eq!(tx.method.as_deref(), Some("swapExactETHForTokens"));
        assert_eq!(tx.observed_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(tx.status, TxStatus::Pending);
    }

    #[test]
    fn hex_quantities_are_scaled() {
        let tx = normalize(&raw(json!({
            "hash": "0x01",
            "from": "0x02",
            "value": "0xde0b6b3a7640000", // 1e18 wei
            "gasPrice": "0x3b9aca00",     // 1e9 wei
            "gas": "0x5208",
        })))
        .unwrap();
        assert_eq!(tx.value, Decimal::ONE);
        assert_eq!(tx.gas_price, Decimal::ONE);
        assert_eq!(tx.gas_limit, 21_000);
        assert!(tx.to.is_none());
    }

    #[test]
    fn rejects_missing_hash() {
        let err = normalize(&raw(json!({"from": "0x01", "value": 1}))).unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_empty_from() {
        let err = normalize(&raw(json!({"hash": "0x01", "from": "  "}))).unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_negative_value_and_gas_price() {
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "value": -1}))).is_err());
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "gasPrice": "-0.5"}))).is_err());
    }

    #[test]
    fn rejects_non_hex_hash() {
        assert!(normalize(&raw(json!({"hash": "hello", "from": "0x02"}))).is_err());
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "status": "orphaned"}))).is_err());
    }

    #[test]
    fn decodes_selector_from_input() {
        let tx = normalize(&raw(json!({
            "hash": "0x01",
            "from": "0x02",
            "input": "0x2e1a7d4d0000000000000000000000000000000000000000000000000000000000000001",
        })))
        .unwrap();
        assert_eq!(tx.method.as_deref(), Some("withdraw"));
    }

    #[test]
    fn unknown_selector_kept_raw() {
        let tx = normalize(&raw(json!({"hash": "0x01", "from": "0x02", "input": "0xDEADBEEF00"}))).unwrap();
        assert_eq!(tx.method.as_deref(), Some("0xdeadbeef"));
    }

    #[test]
    fn plain_transfer_has_no_method() {
        let tx = normalize(&raw(json!({"hash": "0x01", "from": "0x02", "input": "0x"}))).unwrap();
        assert!(tx.method.is_none());
    }

    #[test]
    fn method_signature_trimmed() {
        let tx = normalize(&raw(json!({"hash": "0x01", "from": "0x02", "method": "withdraw(uint256)"}))).unwrap();
        assert_eq!(tx.method.as_deref(), Some("withdraw"));
    }

    #[test]
    fn rfc3339_timestamp() {
        let tx = normalize(&raw(json!({
            "hash": "0x01",
            "from": "0x02",
            "observedAt": "2024-05-01T12:00:00Z",
            "status": "confirmed",
        })))
        .unwrap();
        assert_eq!(tx.observed_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(tx.status, TxStatus::Confirmed);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = normalize_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload(_)));
    }

    #[test]
    fn non_ascii_input_is_malformed() {
        let err = normalize(&raw(json!({
            "hash": "0x01",
            "from": "0x02",
            "to": "0xabc",
            "input": "0xaaaaaaa€",
        })))
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedPayload(_)));
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "input": "€€€€€€€€€€"}))).is_err());
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "input": "0xzz"}))).is_err());
    }

    #[test]
    fn short_input_has_no_method() {
        let tx = normalize(&raw(json!({"hash": "0x01", "from": "0x02", "input": "0xabcd"}))).unwrap();
        assert!(tx.method.is_none());
    }

    #[test]
    fn oversized_quantities_are_rejected() {
        let huge = "79228162514264337593543950335";
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "value": huge}))).is_err());
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "gasPrice": huge}))).is_err());
        // u128::MAX wei is ~3.4e20 native units
        let max_wei = format!("0x{:x}", u128::MAX);
        assert!(normalize(&raw(json!({"hash": "0x01", "from": "0x02", "value": max_wei}))).is_err());

        let tx = normalize(&raw(json!({"hash": "0x01", "from": "0x02", "value": "100000000000000000000"}))).unwrap();
        assert_eq!(tx.value, max_quantity());
    }

    #[test]
    fn address_validation() {
        assert_eq!(normalize_address(" 0xAbC ").unwrap(), "0xabc");
        assert!(normalize_address("abc").is_err());
        assert!(normalize_address("0x").is_err());
        assert!(normalize_address("0xzz").is_err());
    }
}
