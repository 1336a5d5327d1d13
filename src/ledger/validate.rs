//! Per-event-type payload validation.
//!
//! The gate in front of every ledger mutation. Each event type has a fixed,
//! closed schema: required fields, sign constraints (lot sizes strictly
//! positive, prices non-negative), non-empty strings, enumerated sub-fields.
//! Unknown event types and unknown payload fields are rejected outright; a
//! field the schema does not know would still be hashed and attested, so
//! nothing undeclared may ride along.
//!
//! Validation is pure: no storage, no clocks, no side effects.

use serde_json::{Map, Value};

use crate::ledger::canonical::is_hex_hash;
use crate::ledger::events::EventType;

/// Closed set of reasons a payload is refused. Carried back to the caller
/// verbatim; the append engine guarantees nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ValidationError {
    UnknownEventType { given: String },
    NotAnObject,
    UnknownField { field: String },
    MissingField { field: &'static str },
    WrongType { field: &'static str, expected: &'static str },
    EmptyString { field: &'static str },
    NotPositive { field: &'static str },
    Negative { field: &'static str },
    Zero { field: &'static str },
    InvalidEnum { field: &'static str, allowed: &'static str },
    NotHexHash { field: &'static str },
    MissingOneOf { fields: &'static str },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEventType { given } => write!(f, "unknown event type '{}'", given),
            Self::NotAnObject => write!(f, "payload must be a JSON object"),
            Self::UnknownField { field } => write!(f, "unknown payload field '{}'", field),
            Self::MissingField { field } => write!(f, "missing required field '{}'", field),
            Self::WrongType { field, expected } => {
                write!(f, "field '{}' must be {}", field, expected)
            }
            Self::EmptyString { field } => write!(f, "field '{}' must be non-empty", field),
            Self::NotPositive { field } => {
                write!(f, "field '{}' must be strictly positive", field)
            }
            Self::Negative { field } => write!(f, "field '{}' must be non-negative", field),
            Self::Zero { field } => write!(f, "field '{}' must be non-zero", field),
            Self::InvalidEnum { field, allowed } => {
                write!(f, "field '{}' must be one of {}", field, allowed)
            }
            Self::NotHexHash { field } => {
                write!(f, "field '{}' must be a 64-char lowercase hex hash", field)
            }
            Self::MissingOneOf { fields } => {
                write!(f, "at least one of [{}] is required", fields)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a payload against the closed schema of `event_type`.
///
/// Returns the parsed [`EventType`] so callers work with the enum from here
/// on. Unknown event types are always an error.
pub fn validate(event_type: &str, payload: &Value) -> Result<EventType, ValidationError> {
    let etype = EventType::from_label(event_type).ok_or_else(|| {
        ValidationError::UnknownEventType {
            given: event_type.to_string(),
        }
    })?;

    let map = payload.as_object().ok_or(ValidationError::NotAnObject)?;

    match etype {
        EventType::SessionStart => {
            allow_only(map, &["broker", "accountId", "balance", "server"])?;
            req_str(map, "broker")?;
            req_str(map, "accountId")?;
            non_negative(req_num(map, "balance")?, "balance")?;
            opt_str(map, "server")?;
        }
        EventType::SessionEnd => {
            allow_only(map, &["balance", "reason"])?;
            req_num(map, "balance")?;
            opt_str(map, "reason")?;
        }
        EventType::TradeOpen => {
            allow_only(
                map,
                &["ticket", "symbol", "direction", "lots", "openPrice", "stopLoss", "takeProfit"],
            )?;
            req_ticket(map)?;
            req_str(map, "symbol")?;
            req_direction(map)?;
            positive(req_num(map, "lots")?, "lots")?;
            non_negative(req_num(map, "openPrice")?, "openPrice")?;
            opt_non_negative(map, "stopLoss")?;
            opt_non_negative(map, "takeProfit")?;
        }
        EventType::TradeClose => {
            allow_only(
                map,
                &["ticket", "symbol", "direction", "lots", "openPrice", "closePrice", "profit", "swap", "commission"],
            )?;
            req_ticket(map)?;
            req_str(map, "symbol")?;
            req_direction(map)?;
            positive(req_num(map, "lots")?, "lots")?;
            non_negative(req_num(map, "openPrice")?, "openPrice")?;
            non_negative(req_num(map, "closePrice")?, "closePrice")?;
            req_num(map, "profit")?;
            opt_num(map, "swap")?;
            opt_num(map, "commission")?;
        }
        EventType::TradeModify => {
            allow_only(map, &["ticket", "stopLoss", "takeProfit"])?;
            req_ticket(map)?;
            let sl = opt_non_negative(map, "stopLoss")?;
            let tp = opt_non_negative(map, "takeProfit")?;
            if sl.is_none() && tp.is_none() {
                return Err(ValidationError::MissingOneOf {
                    fields: "stopLoss, takeProfit",
                });
            }
        }
        EventType::PartialClose => {
            allow_only(
                map,
                &["ticket", "closedLots", "remainingLots", "closePrice", "profit"],
            )?;
            req_ticket(map)?;
            positive(req_num(map, "closedLots")?, "closedLots")?;
            non_negative(req_num(map, "remainingLots")?, "remainingLots")?;
            non_negative(req_num(map, "closePrice")?, "closePrice")?;
            req_num(map, "profit")?;
        }
        EventType::Snapshot => {
            allow_only(map, &["balance", "equity", "marginLevel"])?;
            req_num(map, "balance")?;
            req_num(map, "equity")?;
            opt_non_negative(map, "marginLevel")?;
        }
        EventType::Cashflow => {
            allow_only(map, &["amount", "kind", "note"])?;
            let amount = req_num(map, "amount")?;
            if amount == 0.0 {
                return Err(ValidationError::Zero { field: "amount" });
            }
            req_enum(map, "kind", &["DEPOSIT", "WITHDRAWAL"], "DEPOSIT|WITHDRAWAL")?;
            opt_str(map, "note")?;
        }
        EventType::ChainRecovery => {
            allow_only(map, &["reason", "expectedHash", "actualHash"])?;
            req_str(map, "reason")?;
            req_hex_hash(map, "expectedHash")?;
            req_hex_hash(map, "actualHash")?;
        }
        EventType::BrokerEvidence => {
            allow_only(
                map,
                &["ticket", "source", "openPrice", "closePrice", "profit", "closedAt"],
            )?;
            req_ticket(map)?;
            req_str(map, "source")?;
            opt_non_negative(map, "openPrice")?;
            opt_non_negative(map, "closePrice")?;
            opt_num(map, "profit")?;
            opt_int(map, "closedAt")?;
        }
        EventType::BrokerHistoryDigest => {
            allow_only(
                map,
                &["digest", "tradeCount", "source", "periodStart", "periodEnd"],
            )?;
            req_hex_hash(map, "digest")?;
            let count = req_int(map, "tradeCount")?;
            if count < 0 {
                return Err(ValidationError::Negative { field: "tradeCount" });
            }
            req_str(map, "source")?;
            opt_int(map, "periodStart")?;
            opt_int(map, "periodEnd")?;
        }
    }

    Ok(etype)
}

// =============================================================================
// FIELD HELPERS
// =============================================================================

fn allow_only(map: &Map<String, Value>, allowed: &[&str]) -> Result<(), ValidationError> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ValidationError::UnknownField { field: key.clone() });
        }
    }
    Ok(())
}

fn req_num(map: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    let value = map
        .get(field)
        .ok_or(ValidationError::MissingField { field })?;
    // serde_json numbers are always finite; NaN/inf cannot parse from JSON
    value
        .as_f64()
        .ok_or(ValidationError::WrongType { field, expected: "a number" })
}

fn opt_num(map: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, ValidationError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => req_num(map, field).map(Some),
    }
}

fn req_int(map: &Map<String, Value>, field: &'static str) -> Result<i64, ValidationError> {
    let value = map
        .get(field)
        .ok_or(ValidationError::MissingField { field })?;
    value
        .as_i64()
        .ok_or(ValidationError::WrongType { field, expected: "an integer" })
}

fn opt_int(map: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => req_int(map, field).map(Some),
    }
}

fn req_str<'a>(map: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ValidationError> {
    let value = map
        .get(field)
        .ok_or(ValidationError::MissingField { field })?;
    let s = value
        .as_str()
        .ok_or(ValidationError::WrongType { field, expected: "a string" })?;
    if s.trim().is_empty() {
        return Err(ValidationError::EmptyString { field });
    }
    Ok(s)
}

fn opt_str<'a>(
    map: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => req_str(map, field).map(Some),
    }
}

fn req_ticket(map: &Map<String, Value>) -> Result<i64, ValidationError> {
    let ticket = req_int(map, "ticket")?;
    if ticket <= 0 {
        return Err(ValidationError::NotPositive { field: "ticket" });
    }
    Ok(ticket)
}

fn req_direction(map: &Map<String, Value>) -> Result<(), ValidationError> {
    req_enum(map, "direction", &["BUY", "SELL"], "BUY|SELL")
}

fn req_enum(
    map: &Map<String, Value>,
    field: &'static str,
    allowed: &[&str],
    allowed_label: &'static str,
) -> Result<(), ValidationError> {
    let value = req_str(map, field)?;
    if !allowed.contains(&value) {
        return Err(ValidationError::InvalidEnum { field, allowed: allowed_label });
    }
    Ok(())
}

fn req_hex_hash(map: &Map<String, Value>, field: &'static str) -> Result<(), ValidationError> {
    let value = req_str(map, field)?;
    if !is_hex_hash(value) {
        return Err(ValidationError::NotHexHash { field });
    }
    Ok(())
}

fn positive(value: f64, field: &'static str) -> Result<(), ValidationError> {
    if value <= 0.0 {
        return Err(ValidationError::NotPositive { field });
    }
    Ok(())
}

fn non_negative(value: f64, field: &'static str) -> Result<(), ValidationError> {
    if value < 0.0 {
        return Err(ValidationError::Negative { field });
    }
    Ok(())
}

fn opt_non_negative(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, ValidationError> {
    match opt_num(map, field)? {
        None => Ok(None),
        Some(n) => {
            non_negative(n, field)?;
            Ok(Some(n))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
