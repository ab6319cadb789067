//! Value coercion and host-type mapping.
//!
//! `coerce_to_kind` is the single conversion matrix between wire kinds.
//! `FromValue`/`ToValue` sit on top of it for Rust host types, and
//! `CompositeMappings` maps composite values onto registered host structs.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;

use super::error::{PgError, PgResult};
use super::types::{
    date_to_naive, decode_scalar_text, naive_to_date, naive_to_time, naive_to_timestamp,
    parse_bool_word, time_to_naive, timestamp_date_part, timestamp_time_part, timestamp_to_naive,
    Interval, Kind, Oid, PgArray, PgValue, Record,
};

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Convert `value` to the value shape of `kind`.
///
/// NULL passes through. Containers are only accepted as themselves; the
/// codec recurses into them.
pub fn coerce_to_kind(value: &PgValue, kind: Kind) -> PgResult<PgValue> {
    let fail = || PgError::coercion(value.kind_name(), kind);

    if value.is_null() {
        return Ok(PgValue::Null);
    }

    // Text sources go through the server's own text syntax
    if let PgValue::Text(text) = value {
        return match kind {
            Kind::Text | Kind::Char | Kind::Enum | Kind::Unknown => Ok(value.clone()),
            Kind::Json | Kind::Jsonb => serde_json::from_str::<serde_json::Value>(text)
                .map(|_| PgValue::Json(text.clone()))
                .map_err(|_| fail()),
            Kind::Array | Kind::Composite | Kind::Domain | Kind::Void => Err(fail()),
            Kind::Int2 | Kind::Int4 | Kind::Int8 | Kind::Oid => {
                integer_from_text(text.trim()).and_then(|n| integer(n, kind)).ok_or_else(fail)
            }
            _ => decode_scalar_text(kind, Oid::UNSPECIFIED, text).map_err(|_| fail()),
        };
    }

    let coerced = match kind {
        Kind::Bool => match value {
            PgValue::Bool(v) => Some(PgValue::Bool(*v)),
            PgValue::Int2(_) | PgValue::Int4(_) | PgValue::Int8(_) => {
                as_i64(value).map(|n| PgValue::Bool(n != 0))
            }
            PgValue::Numeric(text) => parse_bool_word(text).map(PgValue::Bool),
            _ => None,
        },
        Kind::Int2 | Kind::Int4 | Kind::Int8 | Kind::Oid => match value {
            PgValue::Bool(v) => integer(i64::from(*v), kind),
            PgValue::Float4(f) => whole(*f as f64).and_then(|n| integer(n, kind)),
            PgValue::Float8(f) => whole(*f).and_then(|n| integer(n, kind)),
            PgValue::Numeric(text) => integer_from_text(text).and_then(|n| integer(n, kind)),
            other => as_i64(other).and_then(|n| integer(n, kind)),
        },
        Kind::Float4 | Kind::Float8 => {
            let f = match value {
                PgValue::Float4(f) => Some(*f as f64),
                PgValue::Float8(f) => Some(*f),
                PgValue::Numeric(text) => match text.as_str() {
                    "NaN" => Some(f64::NAN),
                    "Infinity" => Some(f64::INFINITY),
                    "-Infinity" => Some(f64::NEG_INFINITY),
                    other => other.parse().ok(),
                },
                other => as_i64(other).map(|n| n as f64),
            };
            f.map(|f| {
                if kind == Kind::Float4 {
                    PgValue::Float4(f as f32)
                } else {
                    PgValue::Float8(f)
                }
            })
        }
        Kind::Numeric => match value {
            PgValue::Numeric(text) => Some(PgValue::Numeric(text.clone())),
            PgValue::Float4(_) | PgValue::Float8(_) => value.to_text().map(PgValue::Numeric),
            other => as_i64(other).map(|n| PgValue::Numeric(n.to_string())),
        },
        Kind::Text | Kind::Char | Kind::Enum | Kind::Unknown => match value {
            PgValue::Raw { data, .. } => Some(PgValue::Text(String::from_utf8_lossy(data).into_owned())),
            other => other.to_text().map(PgValue::Text),
        },
        Kind::Bytea => match value {
            PgValue::Bytea(v) => Some(PgValue::Bytea(v.clone())),
            PgValue::Raw { data, .. } => Some(PgValue::Bytea(data.clone())),
            _ => None,
        },
        Kind::Uuid => match value {
            PgValue::Uuid(v) => Some(PgValue::Uuid(*v)),
            PgValue::Bytea(v) => <[u8; 16]>::try_from(v.as_slice()).ok().map(PgValue::Uuid),
            _ => None,
        },
        Kind::Date => match value {
            PgValue::Date(d) => Some(PgValue::Date(*d)),
            PgValue::Timestamp(ts) | PgValue::TimestampTz(ts) => {
                Some(PgValue::Date(timestamp_date_part(*ts)))
            }
            _ => None,
        },
        Kind::Time => match value {
            PgValue::Time(t) => Some(PgValue::Time(*t)),
            PgValue::TimeTz { micros, .. } => Some(PgValue::Time(*micros)),
            PgValue::Timestamp(ts) => Some(PgValue::Time(timestamp_time_part(*ts))),
            _ => None,
        },
        Kind::TimeTz => match value {
            PgValue::TimeTz { micros, offset } => Some(PgValue::TimeTz {
                micros: *micros,
                offset: *offset,
            }),
            PgValue::Time(t) => Some(PgValue::TimeTz {
                micros: *t,
                offset: 0,
            }),
            _ => None,
        },
        Kind::Timestamp | Kind::TimestampTz => {
            let micros = match value {
                PgValue::Timestamp(ts) | PgValue::TimestampTz(ts) => Some(*ts),
                PgValue::Date(d) => (*d as i64).checked_mul(MICROS_PER_DAY),
                _ => None,
            };
            micros.map(|ts| {
                if kind == Kind::Timestamp {
                    PgValue::Timestamp(ts)
                } else {
                    PgValue::TimestampTz(ts)
                }
            })
        }
        Kind::Interval => match value {
            PgValue::Interval(i) => Some(PgValue::Interval(*i)),
            _ => None,
        },
        Kind::Json | Kind::Jsonb => match value {
            PgValue::Json(v) => Some(PgValue::Json(v.clone())),
            PgValue::Bytea(_) | PgValue::Raw { .. } => None,
            other => Some(PgValue::Json(other.to_json().to_string())),
        },
        Kind::Void => None,
        Kind::Array => match value {
            PgValue::Array(_) => Some(value.clone()),
            _ => None,
        },
        Kind::Composite => match value {
            PgValue::Record(_) => Some(value.clone()),
            _ => None,
        },
        Kind::Domain => Some(value.clone()),
    };
    coerced.ok_or_else(fail)
}

fn as_i64(value: &PgValue) -> Option<i64> {
    match value {
        PgValue::Int2(v) => Some(*v as i64),
        PgValue::Int4(v) => Some(*v as i64),
        PgValue::Int8(v) => Some(*v),
        PgValue::Oid(v) => Some(*v as i64),
        _ => None,
    }
}

/// 2^63; `i64::MAX as f64` rounds up to it.
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn whole(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f))
        .then_some(f as i64)
}

/// `"12"`, `"12.000"` and `"-3"` are integers; `"1.5"` is not.
fn integer_from_text(text: &str) -> Option<i64> {
    match text.split_once('.') {
        Some((int, frac)) if frac.chars().all(|c| c == '0') => int.parse().ok(),
        Some(_) => None,
        None => text.parse().ok(),
    }
}

fn integer(n: i64, kind: Kind) -> Option<PgValue> {
    match kind {
        Kind::Int2 => i16::try_from(n).ok().map(PgValue::Int2),
        Kind::Int4 => i32::try_from(n).ok().map(PgValue::Int4),
        Kind::Int8 => Some(PgValue::Int8(n)),
        Kind::Oid => u32::try_from(n).ok().map(PgValue::Oid),
        _ => None,
    }
}

// ============================================================================
// Host types
// ============================================================================

/// Conversion from a decoded value to a host type.
pub trait FromValue: Sized {
    fn from_value(value: &PgValue) -> PgResult<Self>;
}

/// Conversion from a host type to a value ready for binding.
pub trait ToValue {
    fn to_value(&self) -> PgValue;
}

fn null_into(target: &str) -> PgError {
    PgError::coercion("null", target)
}

impl FromValue for PgValue {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Bool)? {
            PgValue::Bool(v) => Ok(v),
            _ => Err(null_into("bool")),
        }
    }
}

impl FromValue for i16 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Int2)? {
            PgValue::Int2(v) => Ok(v),
            _ => Err(null_into("int2")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Int4)? {
            PgValue::Int4(v) => Ok(v),
            _ => Err(null_into("int4")),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Int8)? {
            PgValue::Int8(v) => Ok(v),
            _ => Err(null_into("int8")),
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Oid)? {
            PgValue::Oid(v) => Ok(v),
            _ => Err(null_into("oid")),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Float4)? {
            PgValue::Float4(v) => Ok(v),
            _ => Err(null_into("float4")),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Float8)? {
            PgValue::Float8(v) => Ok(v),
            _ => Err(null_into("float8")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Text)? {
            PgValue::Text(v) => Ok(v),
            _ => Err(null_into("text")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Bytea)? {
            PgValue::Bytea(v) => Ok(v),
            _ => Err(null_into("bytea")),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Uuid)? {
            PgValue::Uuid(v) => Ok(uuid::Uuid::from_bytes(v)),
            _ => Err(null_into("uuid")),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Date)? {
            PgValue::Date(d) => date_to_naive(d).ok_or_else(|| PgError::coercion("date", "NaiveDate")),
            _ => Err(null_into("date")),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Time)? {
            PgValue::Time(t) => time_to_naive(t).ok_or_else(|| PgError::coercion("time", "NaiveTime")),
            _ => Err(null_into("time")),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Timestamp)? {
            PgValue::Timestamp(ts) => timestamp_to_naive(ts)
                .ok_or_else(|| PgError::coercion("timestamp", "NaiveDateTime")),
            _ => Err(null_into("timestamp")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::TimestampTz)? {
            PgValue::TimestampTz(ts) => timestamp_to_naive(ts)
                .map(|dt| dt.and_utc())
                .ok_or_else(|| PgError::coercion("timestamptz", "DateTime")),
            _ => Err(null_into("timestamptz")),
        }
    }
}

impl FromValue for Interval {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match coerce_to_kind(value, Kind::Interval)? {
            PgValue::Interval(i) => Ok(i),
            _ => Err(null_into("interval")),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        Ok(value.to_json())
    }
}

impl FromValue for Record {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Record(record) => Ok(record.clone()),
            other => Err(PgError::coercion(other.kind_name(), "record")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Array(array) => array.elements.iter().map(T::from_value).collect(),
            other => Err(PgError::coercion(other.kind_name(), "array")),
        }
    }
}

impl ToValue for PgValue {
    fn to_value(&self) -> PgValue {
        self.clone()
    }
}

impl ToValue for bool {
    fn to_value(&self) -> PgValue {
        PgValue::Bool(*self)
    }
}

impl ToValue for i16 {
    fn to_value(&self) -> PgValue {
        PgValue::Int2(*self)
    }
}

impl ToValue for i32 {
    fn to_value(&self) -> PgValue {
        PgValue::Int4(*self)
    }
}

impl ToValue for i64 {
    fn to_value(&self) -> PgValue {
        PgValue::Int8(*self)
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> PgValue {
        PgValue::Float4(*self)
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> PgValue {
        PgValue::Float8(*self)
    }
}

impl ToValue for str {
    fn to_value(&self) -> PgValue {
        PgValue::Text(self.to_string())
    }
}

impl ToValue for String {
    fn to_value(&self) -> PgValue {
        PgValue::Text(self.clone())
    }
}

impl ToValue for [u8] {
    fn to_value(&self) -> PgValue {
        PgValue::Bytea(self.to_vec())
    }
}

impl ToValue for uuid::Uuid {
    fn to_value(&self) -> PgValue {
        PgValue::Uuid(*self.as_bytes())
    }
}

impl ToValue for NaiveDate {
    fn to_value(&self) -> PgValue {
        PgValue::Date(naive_to_date(*self))
    }
}

impl ToValue for NaiveTime {
    fn to_value(&self) -> PgValue {
        PgValue::Time(naive_to_time(*self))
    }
}

impl ToValue for NaiveDateTime {
    fn to_value(&self) -> PgValue {
        PgValue::Timestamp(naive_to_timestamp(*self))
    }
}

impl ToValue for DateTime<Utc> {
    fn to_value(&self) -> PgValue {
        PgValue::TimestampTz(naive_to_timestamp(self.naive_utc()))
    }
}

impl ToValue for Interval {
    fn to_value(&self) -> PgValue {
        PgValue::Interval(*self)
    }
}

impl ToValue for serde_json::Value {
    fn to_value(&self) -> PgValue {
        PgValue::Json(self.to_string())
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> PgValue {
        match self {
            Some(v) => v.to_value(),
            None => PgValue::Null,
        }
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> PgValue {
        let elements: Vec<PgValue> = self.iter().map(ToValue::to_value).collect();
        let element_oid = elements
            .iter()
            .find(|v| !v.is_null())
            .map(PgValue::type_oid)
            .unwrap_or(Oid::TEXT);
        PgValue::Array(PgArray::from_elements(element_oid, elements))
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> PgValue {
        (**self).to_value()
    }
}

// ============================================================================
// Composite host mappings
// ============================================================================

impl Record {
    /// Map fields onto `T` by exact field name.
    pub fn into_host<T: DeserializeOwned>(&self) -> PgResult<T> {
        let object = PgValue::Record(self.clone()).to_json();
        serde_json::from_value(object).map_err(|e| {
            PgError::coercion(
                self.type_name.as_deref().unwrap_or("record"),
                format!("{} ({})", std::any::type_name::<T>(), e),
            )
        })
    }
}

type Mapper = Arc<dyn Fn(&Record) -> PgResult<Box<dyn Any + Send>> + Send + Sync>;

/// Host types registered per composite type name.
#[derive(Default, Clone)]
pub struct CompositeMappings {
    mappers: HashMap<String, Mapper>,
}

impl std::fmt::Debug for CompositeMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.mappers.keys().collect();
        names.sort();
        f.debug_struct("CompositeMappings")
            .field("types", &names)
            .finish()
    }
}

impl CompositeMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map values of composite `type_name` onto `T`.
    pub fn register<T: DeserializeOwned + Send + 'static>(&mut self, type_name: &str) {
        let mapper: Mapper = Arc::new(|record: &Record| {
            record
                .into_host::<T>()
                .map(|host| Box::new(host) as Box<dyn Any + Send>)
        });
        self.mappers.insert(type_name.to_string(), mapper);
    }

    pub fn unregister(&mut self, type_name: &str) -> bool {
        self.mappers.remove(type_name).is_some()
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.mappers.contains_key(type_name)
    }

    /// Run the registered mapper for the record's type, if there is one.
    pub fn map(&self, record: &Record) -> Option<PgResult<Box<dyn Any + Send>>> {
        let name = record.type_name.as_deref()?;
        self.mappers.get(name).map(|mapper| mapper(record))
    }

    /// Map to `T`; `Ok(None)` when no mapping is registered for the type.
    pub fn map_as<T: 'static>(&self, record: &Record) -> PgResult<Option<T>> {
        match self.map(record) {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(host)) => host.downcast::<T>().map(|b| Some(*b)).map_err(|_| {
                PgError::coercion(
                    record.type_name.as_deref().unwrap_or("record"),
                    std::any::type_name::<T>(),
                )
            }),
        }
    }
}
