//! Wire codec for result values, column types and statement parameters
//!
//! Every value crosses the wire as a string (or JSON null) tagged by a one-character
//! type code. Parsing is lenient: a value that does not fit its declared class is
//! passed through as text. Only an unknown type code is rejected.

use crate::error::{CursorwayError, Result};
use crate::types::{Column, Row, SqlType, Value};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use num_bigint::BigInt;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMATS: [&str; 2] = ["%H:%M:%S%.f", "%H:%M"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Fixed-width shapes checked before chrono sees the input. `9` is any ASCII digit.
const DATE_SHAPE: &str = "9999-99-99";
const TIME_SHAPES: [&str; 2] = ["99:99:99", "99:99"];
const MAX_FRACTION_DIGITS: usize = 9;

/// Semantic type class of a column or parameter on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeClass {
    Integer,
    Boolean,
    Numeric,
    String,
    Date,
    Time,
    DateTime,
    Binary,
}

impl TypeClass {
    pub const ALL: [TypeClass; 8] = [
        TypeClass::Integer,
        TypeClass::Boolean,
        TypeClass::Numeric,
        TypeClass::String,
        TypeClass::Date,
        TypeClass::Time,
        TypeClass::DateTime,
        TypeClass::Binary,
    ];

    /// Single-character wire code
    pub fn code(self) -> &'static str {
        match self {
            TypeClass::Integer => "I",
            TypeClass::Boolean => "1",
            TypeClass::Numeric => "N",
            TypeClass::String => "S",
            TypeClass::Date => "D",
            TypeClass::Time => "T",
            TypeClass::DateTime => "d",
            TypeClass::Binary => "b",
        }
    }

    /// Resolve a wire code. Unknown codes are a hard error.
    pub fn from_code(code: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|class| class.code() == code)
            .ok_or_else(|| CursorwayError::UnknownTypeCode(code.to_string()))
    }
}

/// Map a column's SQL type to its wire class. Rule order matters: integer and
/// boolean types must win over the generic numeric check.
pub fn classify(column: &Column) -> TypeClass {
    let ty = &column.sql_type;
    if ty.is_integer() {
        return TypeClass::Integer;
    }
    if is_boolean_column(column) {
        return TypeClass::Boolean;
    }
    if ty.is_numeric() {
        return TypeClass::Numeric;
    }
    if ty.is_string() {
        return TypeClass::String;
    }
    match ty {
        SqlType::Date => TypeClass::Date,
        SqlType::Time => TypeClass::Time,
        t if t.is_temporal() => TypeClass::DateTime,
        _ => TypeClass::Binary,
    }
}

fn is_boolean_column(column: &Column) -> bool {
    match column.sql_type {
        SqlType::Boolean => true,
        SqlType::Bit => column.precision == 1,
        _ => false,
    }
}

/// Render a non-null value for the given class
pub fn serialize(class: TypeClass, value: &Value) -> String {
    match (class, value) {
        (TypeClass::Boolean, Value::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
        (TypeClass::DateTime, Value::DateTime(dt)) => format_datetime(dt),
        _ => value.to_string(),
    }
}

/// Render a value for the wire. Null stays null; without a column the natural text form is used.
pub fn serialize_value(column: Option<&Column>, value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    Some(match column {
        Some(column) => serialize(classify(column), value),
        None => value.to_string(),
    })
}

/// Render a row against the current schema
pub fn serialize_row(columns: &[Column], row: &Row) -> Vec<Option<String>> {
    row.values
        .iter()
        .enumerate()
        .map(|(i, value)| serialize_value(columns.get(i), value))
        .collect()
}

/// `YYYY-MM-DD HH:MM:SS[.fraction]`, fraction trimmed of trailing zeros and omitted when zero
pub fn format_datetime(dt: &NaiveDateTime) -> String {
    let mut out = dt.format("%Y-%m-%d %H:%M:%S").to_string();
    let nanos = dt.nanosecond() % 1_000_000_000;
    if nanos > 0 {
        let fraction = format!("{:09}", nanos);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out
}

/// Parse a wire string for the given class. Never fails; unparseable input comes back as text.
pub fn parse(class: TypeClass, raw: &str) -> Value {
    let parsed = match class {
        TypeClass::Integer => parse_integer(raw),
        TypeClass::Numeric => parse_numeric(raw),
        TypeClass::Boolean => raw.parse::<i64>().ok().map(|v| Value::Bool(v == 1)),
        TypeClass::Date => is_date_shape(raw)
            .then(|| NaiveDate::parse_from_str(raw, DATE_FORMAT).ok())
            .flatten()
            .map(Value::Date),
        TypeClass::Time => is_time_shape(raw)
            .then(|| {
                TIME_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
            })
            .flatten()
            .map(Value::Time),
        TypeClass::DateTime => is_datetime_shape(raw)
            .then(|| {
                DATETIME_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            })
            .flatten()
            .map(Value::DateTime),
        TypeClass::String | TypeClass::Binary => None,
    };
    parsed.unwrap_or_else(|| Value::Text(raw.to_string()))
}

fn matches_shape(raw: &str, shape: &str) -> bool {
    raw.len() == shape.len()
        && raw.bytes().zip(shape.bytes()).all(|(b, s)| match s {
            b'9' => b.is_ascii_digit(),
            _ => b == s,
        })
}

fn is_date_shape(raw: &str) -> bool {
    matches_shape(raw, DATE_SHAPE)
}

/// `HH:MM`, `HH:MM:SS` or `HH:MM:SS.f` with 1 to 9 fraction digits
fn is_time_shape(raw: &str) -> bool {
    match raw.split_once('.') {
        Some((clock, fraction)) => {
            matches_shape(clock, TIME_SHAPES[0])
                && (1..=MAX_FRACTION_DIGITS).contains(&fraction.len())
                && fraction.bytes().all(|b| b.is_ascii_digit())
        }
        None => TIME_SHAPES.iter().any(|shape| matches_shape(raw, shape)),
    }
}

/// Date and time joined by exactly one space
fn is_datetime_shape(raw: &str) -> bool {
    match (raw.get(..DATE_SHAPE.len()), raw.get(DATE_SHAPE.len()..)) {
        (Some(date), Some(rest)) => {
            is_date_shape(date) && rest.strip_prefix(' ').map_or(false, is_time_shape)
        }
        _ => false,
    }
}

/// Optional sign followed by decimal digits only
fn is_integer_literal(raw: &str) -> bool {
    let digits = raw.strip_prefix(['+', '-']).unwrap_or(raw);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// `[+-]digits[.digits][e[+-]digits]`, at least one mantissa digit, or a signed `Infinity`
fn is_float_literal(raw: &str) -> bool {
    let unsigned = raw.strip_prefix(['+', '-']).unwrap_or(raw);
    if unsigned == "Infinity" {
        return true;
    }
    let (mantissa, exponent) = match unsigned.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => (mantissa, Some(exponent)),
        None => (unsigned, None),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(whole.is_empty() && fraction.is_empty()) && all_digits(whole) && all_digits(fraction);
    let exponent_ok = exponent.map_or(true, |e| {
        let digits = e.strip_prefix(['+', '-']).unwrap_or(e);
        !digits.is_empty() && all_digits(digits)
    });
    mantissa_ok && exponent_ok
}

fn parse_integer(raw: &str) -> Option<Value> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(Value::Int(v));
    }
    if !is_integer_literal(raw) {
        return None;
    }
    raw.parse::<BigInt>().ok().map(Value::BigInt)
}

fn parse_numeric(raw: &str) -> Option<Value> {
    if raw.contains(['.', ',', 'e', 'f']) {
        let digits = raw
            .strip_suffix(['f', 'F', 'd', 'D'])
            .filter(|rest| !rest.is_empty())
            .unwrap_or(raw);
        if !is_float_literal(digits) {
            return None;
        }
        digits.parse::<f64>().ok().map(Value::Float)
    } else {
        raw.parse::<i64>().ok().map(Value::Int)
    }
}

/// Decode one statement parameter. The type code is resolved first so an unknown
/// code is rejected even when the value is null; a missing code means plain text.
pub fn decode_param(value: Option<&str>, type_code: Option<&str>) -> Result<Value> {
    let class = type_code.map(TypeClass::from_code).transpose()?;
    Ok(match (value, class) {
        (None, _) => Value::Null,
        (Some(raw), None) => Value::Text(raw.to_string()),
        (Some(raw), Some(class)) => parse(class, raw),
    })
}
