//! Arrow to row conversion
//!
//! DuckDB hands results over as Arrow record batches. Columns are described from
//! the batch schema and cells are converted to [`Value`]s with typed downcasts;
//! anything without a dedicated conversion falls back to Arrow's display formatter.

use chrono::{DateTime, NaiveDate, NaiveTime};
use cursorway_common::{Column, Row, SqlType, Value};
use duckdb::arrow::array::*;
use duckdb::arrow::datatypes::{DataType, Schema, TimeUnit};
use duckdb::arrow::util::display::ArrayFormatter;
use num_bigint::BigInt;

/// Days between 0001-01-01 (CE day 1) and the Unix epoch
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Describe result columns from an Arrow schema
pub fn columns_from_schema(schema: &Schema) -> Vec<Column> {
    schema
        .fields()
        .iter()
        .map(|field| column_from_type(field.name(), field.data_type()))
        .collect()
}

fn column_from_type(name: &str, data_type: &DataType) -> Column {
    let column = Column::new(name, sql_type_of(data_type));
    match data_type {
        DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
            column.with_precision(u32::from(*precision), (*scale).max(0) as u32)
        }
        DataType::Boolean => column.with_precision(1, 0),
        _ => column,
    }
}

/// Map an Arrow type to the SQL type DuckDB exported it from
pub fn sql_type_of(data_type: &DataType) -> SqlType {
    match data_type {
        DataType::Boolean => SqlType::Boolean,
        DataType::Int8 => SqlType::TinyInt,
        DataType::Int16 | DataType::UInt8 => SqlType::SmallInt,
        DataType::Int32 | DataType::UInt16 => SqlType::Integer,
        DataType::Int64 | DataType::UInt32 => SqlType::BigInt,
        DataType::UInt64 => SqlType::HugeInt,
        DataType::Float16 | DataType::Float32 => SqlType::Real,
        DataType::Float64 => SqlType::Double,
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => SqlType::Decimal,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => SqlType::Varchar,
        DataType::Date32 | DataType::Date64 => SqlType::Date,
        DataType::Time32(_) | DataType::Time64(_) => SqlType::Time,
        DataType::Timestamp(_, None) => SqlType::Timestamp,
        DataType::Timestamp(_, Some(_)) => SqlType::TimestampTz,
        DataType::Interval(_) | DataType::Duration(_) => SqlType::Interval,
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => SqlType::Binary,
        other => SqlType::Other(other.to_string()),
    }
}

/// Convert a record batch into rows, values in column order
pub fn rows_from_batch(batch: &RecordBatch) -> Vec<Row> {
    let mut rows: Vec<Row> = (0..batch.num_rows())
        .map(|_| Row::new(Vec::with_capacity(batch.num_columns())))
        .collect();

    for array in batch.columns() {
        for (idx, row) in rows.iter_mut().enumerate() {
            row.values.push(value_at(array.as_ref(), idx));
        }
    }
    rows
}

/// Extract a single cell
pub fn value_at(array: &dyn Array, idx: usize) -> Value {
    if array.is_null(idx) {
        return Value::Null;
    }

    let value = match array.data_type() {
        DataType::Boolean => downcast::<BooleanArray>(array).map(|a| Value::Bool(a.value(idx))),
        DataType::Int8 => downcast::<Int8Array>(array).map(|a| Value::Int(a.value(idx).into())),
        DataType::Int16 => downcast::<Int16Array>(array).map(|a| Value::Int(a.value(idx).into())),
        DataType::Int32 => downcast::<Int32Array>(array).map(|a| Value::Int(a.value(idx).into())),
        DataType::Int64 => downcast::<Int64Array>(array).map(|a| Value::Int(a.value(idx))),
        DataType::UInt8 => downcast::<UInt8Array>(array).map(|a| Value::Int(a.value(idx).into())),
        DataType::UInt16 => downcast::<UInt16Array>(array).map(|a| Value::Int(a.value(idx).into())),
        DataType::UInt32 => downcast::<UInt32Array>(array).map(|a| Value::Int(a.value(idx).into())),
        DataType::UInt64 => downcast::<UInt64Array>(array).map(|a| {
            let v = a.value(idx);
            i64::try_from(v)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::BigInt(BigInt::from(v)))
        }),
        DataType::Float32 => {
            downcast::<Float32Array>(array).map(|a| Value::Float(f64::from(a.value(idx))))
        }
        DataType::Float64 => downcast::<Float64Array>(array).map(|a| Value::Float(a.value(idx))),
        DataType::Decimal128(_, scale) => downcast::<Decimal128Array>(array)
            .map(|a| Value::Decimal(format_decimal(a.value(idx), *scale))),
        DataType::Utf8 => downcast::<StringArray>(array).map(|a| Value::Text(a.value(idx).into())),
        DataType::LargeUtf8 => {
            downcast::<LargeStringArray>(array).map(|a| Value::Text(a.value(idx).into()))
        }
        DataType::Binary => {
            downcast::<BinaryArray>(array).map(|a| Value::Bytes(a.value(idx).to_vec()))
        }
        DataType::LargeBinary => {
            downcast::<LargeBinaryArray>(array).map(|a| Value::Bytes(a.value(idx).to_vec()))
        }
        DataType::FixedSizeBinary(_) => {
            downcast::<FixedSizeBinaryArray>(array).map(|a| Value::Bytes(a.value(idx).to_vec()))
        }
        DataType::Date32 => downcast::<Date32Array>(array)
            .and_then(|a| date_from_days(a.value(idx)))
            .map(Value::Date),
        DataType::Date64 => downcast::<Date64Array>(array)
            .and_then(|a| DateTime::from_timestamp_millis(a.value(idx)))
            .map(|dt| Value::Date(dt.date_naive())),
        DataType::Time32(unit) => time32_value(array, idx, unit),
        DataType::Time64(unit) => time64_value(array, idx, unit),
        DataType::Timestamp(unit, _) => timestamp_value(array, idx, unit),
        _ => None,
    };

    value.unwrap_or_else(|| Value::Text(format_array_value(array, idx)))
}

fn downcast<T: 'static>(array: &dyn Array) -> Option<&T> {
    array.as_any().downcast_ref::<T>()
}

fn date_from_days(days_since_epoch: i32) -> Option<NaiveDate> {
    days_since_epoch
        .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

fn time_from_nanos(nanos: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(nanos.div_euclid(1_000_000_000)).ok()?;
    let frac = nanos.rem_euclid(1_000_000_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, frac)
}

fn time32_value(array: &dyn Array, idx: usize, unit: &TimeUnit) -> Option<Value> {
    let nanos = match unit {
        TimeUnit::Second => i64::from(downcast::<Time32SecondArray>(array)?.value(idx)) * 1_000_000_000,
        TimeUnit::Millisecond => {
            i64::from(downcast::<Time32MillisecondArray>(array)?.value(idx)) * 1_000_000
        }
        _ => return None,
    };
    time_from_nanos(nanos).map(Value::Time)
}

fn time64_value(array: &dyn Array, idx: usize, unit: &TimeUnit) -> Option<Value> {
    let nanos = match unit {
        TimeUnit::Microsecond => {
            downcast::<Time64MicrosecondArray>(array)?.value(idx).checked_mul(1_000)?
        }
        TimeUnit::Nanosecond => downcast::<Time64NanosecondArray>(array)?.value(idx),
        _ => return None,
    };
    time_from_nanos(nanos).map(Value::Time)
}

/// Timestamps with a zone are exported as UTC instants and surface as UTC wall time
fn timestamp_value(array: &dyn Array, idx: usize, unit: &TimeUnit) -> Option<Value> {
    let dt = match unit {
        TimeUnit::Second => {
            DateTime::from_timestamp(downcast::<TimestampSecondArray>(array)?.value(idx), 0)
        }
        TimeUnit::Millisecond => DateTime::from_timestamp_millis(
            downcast::<TimestampMillisecondArray>(array)?.value(idx),
        ),
        TimeUnit::Microsecond => DateTime::from_timestamp_micros(
            downcast::<TimestampMicrosecondArray>(array)?.value(idx),
        ),
        TimeUnit::Nanosecond => {
            let nanos = downcast::<TimestampNanosecondArray>(array)?.value(idx);
            DateTime::from_timestamp(
                nanos.div_euclid(1_000_000_000),
                nanos.rem_euclid(1_000_000_000) as u32,
            )
        }
    }?;
    Some(Value::DateTime(dt.naive_utc()))
}

/// Render an unscaled decimal with its scale applied
pub fn format_decimal(value: i128, scale: i8) -> String {
    let digits = value.unsigned_abs().to_string();
    let sign = if value < 0 { "-" } else { "" };

    if scale <= 0 {
        let zeros = "0".repeat(scale.unsigned_abs() as usize);
        return if value == 0 {
            "0".to_string()
        } else {
            format!("{}{}{}", sign, digits, zeros)
        };
    }

    let scale = scale as usize;
    if digits.len() <= scale {
        format!("{}0.{}{}", sign, "0".repeat(scale - digits.len()), digits)
    } else {
        let (integer, fraction) = digits.split_at(digits.len() - scale);
        format!("{}{}.{}", sign, integer, fraction)
    }
}

/// Display fallback for types without a dedicated conversion (lists, structs, intervals, ...)
fn format_array_value(array: &dyn Array, idx: usize) -> String {
    match ArrayFormatter::try_new(array, &Default::default()) {
        Ok(formatter) => formatter.value(idx).to_string(),
        Err(_) => format!("<{:?}>", array.data_type()),
    }
}
