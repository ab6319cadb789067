//! PostgreSQL type encoding and decoding.
//!
//! This module provides the value model and the scalar codecs (binary and
//! text format). Container types (arrays, records, domains) are handled by
//! `codec`, which recurses through the type graph and lands here for leaves.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer the parameter type
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    pub const UNKNOWN: Oid = Oid(705);

    // Money
    pub const MONEY: Oid = Oid(790);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);
    pub const REFCURSOR: Oid = Oid(1790);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // Network types
    pub const INET: Oid = Oid(869);
    pub const CIDR: Oid = Oid(650);
    pub const MACADDR: Oid = Oid(829);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Pseudo types
    pub const RECORD: Oid = Oid(2249);
    pub const VOID: Oid = Oid(2278);

    // Array types (some common ones)
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const RECORD_ARRAY: Oid = Oid(2287);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn is_unspecified(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

// ============================================================================
// Kinds
// ============================================================================

/// Wire-level kind of a type. Scalars are encoded here; the container kinds
/// (`Array`, `Composite`, `Domain`) are resolved through the type graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Text,
    Char,
    Bytea,
    Uuid,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Interval,
    Json,
    Jsonb,
    Enum,
    Void,
    Array,
    Composite,
    Domain,
    /// Transferred as text and surfaced as a string
    Unknown,
}

impl Kind {
    /// Kind of a built-in scalar OID, `Unknown` for anything else.
    pub fn of_builtin(oid: Oid) -> Kind {
        match oid {
            Oid::BOOL => Kind::Bool,
            Oid::INT2 => Kind::Int2,
            Oid::INT4 => Kind::Int4,
            Oid::INT8 => Kind::Int8,
            Oid::OID_TYPE => Kind::Oid,
            Oid::FLOAT4 => Kind::Float4,
            Oid::FLOAT8 => Kind::Float8,
            Oid::NUMERIC => Kind::Numeric,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME | Oid::REFCURSOR => Kind::Text,
            Oid::CHAR => Kind::Char,
            Oid::BYTEA => Kind::Bytea,
            Oid::UUID => Kind::Uuid,
            Oid::DATE => Kind::Date,
            Oid::TIME => Kind::Time,
            Oid::TIMETZ => Kind::TimeTz,
            Oid::TIMESTAMP => Kind::Timestamp,
            Oid::TIMESTAMPTZ => Kind::TimestampTz,
            Oid::INTERVAL => Kind::Interval,
            Oid::JSON => Kind::Json,
            Oid::JSONB => Kind::Jsonb,
            Oid::VOID => Kind::Void,
            _ => Kind::Unknown,
        }
    }

    /// Name used in coercion errors.
    pub fn name(self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::Int2 => "int2",
            Kind::Int4 => "int4",
            Kind::Int8 => "int8",
            Kind::Oid => "oid",
            Kind::Float4 => "float4",
            Kind::Float8 => "float8",
            Kind::Numeric => "numeric",
            Kind::Text => "text",
            Kind::Char => "char",
            Kind::Bytea => "bytea",
            Kind::Uuid => "uuid",
            Kind::Date => "date",
            Kind::Time => "time",
            Kind::TimeTz => "timetz",
            Kind::Timestamp => "timestamp",
            Kind::TimestampTz => "timestamptz",
            Kind::Interval => "interval",
            Kind::Json => "json",
            Kind::Jsonb => "jsonb",
            Kind::Enum => "enum",
            Kind::Void => "void",
            Kind::Array => "array",
            Kind::Composite => "record",
            Kind::Domain => "domain",
            Kind::Unknown => "unknown",
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, Kind::Array | Kind::Composite | Kind::Domain)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Composite values
// ============================================================================

/// Interval with PostgreSQL's three independent fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl Interval {
    pub fn new(months: i32, days: i32, micros: i64) -> Self {
        Self {
            months,
            days,
            micros,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        let years = self.months / 12;
        let mons = self.months % 12;
        if years != 0 {
            parts.push(format!("{} year{}", years, plural(years as i64)));
        }
        if mons != 0 {
            parts.push(format!("{} mon{}", mons, plural(mons as i64)));
        }
        if self.days != 0 {
            parts.push(format!("{} day{}", self.days, plural(self.days as i64)));
        }
        if self.micros != 0 || parts.is_empty() {
            let sign = if self.micros < 0 { "-" } else { "" };
            let total = self.micros.unsigned_abs();
            let secs = total / 1_000_000;
            let frac = total % 1_000_000;
            let mut time = format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            );
            if frac != 0 {
                let digits = format!("{:06}", frac);
                time.push('.');
                time.push_str(digits.trim_end_matches('0'));
            }
            parts.push(time);
        }
        f.write_str(&parts.join(" "))
    }
}

fn plural(n: i64) -> &'static str {
    if n.abs() == 1 {
        ""
    } else {
        "s"
    }
}

impl FromStr for Interval {
    type Err = PgError;

    /// Parses the `postgres` interval output style (`1 year 2 mons 3 days 04:05:06`).
    fn from_str(s: &str) -> PgResult<Self> {
        let bad = || PgError::coercion(format!("'{}'", s), "interval");
        let mut out = Interval::default();
        let tokens: Vec<&str> = s
            .split_whitespace()
            .filter(|t| *t != "@")
            .collect();
        if tokens.is_empty() {
            return Err(bad());
        }

        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            if token.contains(':') {
                out.micros += parse_clock(token).ok_or_else(bad)?;
                i += 1;
                continue;
            }
            let amount: f64 = token.parse().map_err(|_| bad())?;
            let unit = tokens.get(i + 1).ok_or_else(bad)?.to_ascii_lowercase();
            let unit = unit.trim_end_matches(',');
            match unit {
                u if u.starts_with("year") => out.months += (amount * 12.0) as i32,
                u if u.starts_with("mon") => out.months += amount as i32,
                u if u.starts_with("week") => out.days += (amount * 7.0) as i32,
                u if u.starts_with("day") => out.days += amount as i32,
                u if u.starts_with("hour") => out.micros += (amount * 3_600_000_000.0) as i64,
                u if u.starts_with("min") => out.micros += (amount * 60_000_000.0) as i64,
                u if u.starts_with("sec") => out.micros += (amount * 1_000_000.0) as i64,
                u if u.starts_with("millisecond") => out.micros += (amount * 1000.0) as i64,
                u if u.starts_with("microsecond") => out.micros += amount as i64,
                _ => return Err(bad()),
            }
            i += 2;
        }
        if tokens.last() == Some(&"ago") {
            out = Interval::new(-out.months, -out.days, -out.micros);
        }
        Ok(out)
    }
}

/// `[-+]HH:MM[:SS[.ffffff]]` as signed microseconds.
fn parse_clock(token: &str) -> Option<i64> {
    let (negative, body) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    let mut fields = body.split(':');
    let hours: i64 = fields.next()?.parse().ok()?;
    let minutes: i64 = fields.next()?.parse().ok()?;
    let seconds: f64 = match fields.next() {
        Some(s) => s.parse().ok()?,
        None => 0.0,
    };
    let micros = hours * 3_600_000_000 + minutes * 60_000_000 + (seconds * 1_000_000.0).round() as i64;
    Some(if negative { -micros } else { micros })
}

/// One dimension of an array value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    pub len: i32,
    pub lower_bound: i32,
}

/// Array value: flattened elements in row-major order plus dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct PgArray {
    pub element_oid: Oid,
    pub dims: Vec<ArrayDim>,
    pub elements: Vec<PgValue>,
}

impl PgArray {
    /// One-dimensional array with lower bound 1.
    pub fn from_elements(element_oid: Oid, elements: Vec<PgValue>) -> Self {
        let dims = if elements.is_empty() {
            Vec::new()
        } else {
            vec![ArrayDim {
                len: elements.len() as i32,
                lower_bound: 1,
            }]
        };
        Self {
            element_oid,
            dims,
            elements,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Decoded composite value: ordered (attribute name, value) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Composite type name, `None` for anonymous records
    pub type_name: Option<String>,
    pub type_oid: Oid,
    pub fields: Vec<(String, PgValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&PgValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    /// Decimal text, exact (`NaN`, `Infinity` and `-Infinity` allowed)
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    Timestamp(i64),
    TimestampTz(i64),
    /// Days since 2000-01-01
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    /// Microseconds since midnight plus UTC offset in seconds (east positive)
    TimeTz { micros: i64, offset: i32 },
    Interval(Interval),
    Json(String),
    Array(PgArray),
    Record(Record),
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

/// Days between 0001-01-01 (day 1) and 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;
/// Microseconds between the Unix epoch and 2000-01-01.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
const MICROS_PER_DAY: i64 = 86_400_000_000;

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Natural wire kind of this value.
    pub fn kind(&self) -> Kind {
        match self {
            PgValue::Null => Kind::Unknown,
            PgValue::Bool(_) => Kind::Bool,
            PgValue::Int2(_) => Kind::Int2,
            PgValue::Int4(_) => Kind::Int4,
            PgValue::Int8(_) => Kind::Int8,
            PgValue::Oid(_) => Kind::Oid,
            PgValue::Float4(_) => Kind::Float4,
            PgValue::Float8(_) => Kind::Float8,
            PgValue::Numeric(_) => Kind::Numeric,
            PgValue::Text(_) => Kind::Text,
            PgValue::Bytea(_) => Kind::Bytea,
            PgValue::Uuid(_) => Kind::Uuid,
            PgValue::Timestamp(_) => Kind::Timestamp,
            PgValue::TimestampTz(_) => Kind::TimestampTz,
            PgValue::Date(_) => Kind::Date,
            PgValue::Time(_) => Kind::Time,
            PgValue::TimeTz { .. } => Kind::TimeTz,
            PgValue::Interval(_) => Kind::Interval,
            PgValue::Json(_) => Kind::Jsonb,
            PgValue::Array(_) => Kind::Array,
            PgValue::Record(_) => Kind::Composite,
            PgValue::Raw { .. } => Kind::Unknown,
        }
    }

    /// Name of this value's kind, used in coercion errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PgValue::Null => "null",
            other => other.kind().name(),
        }
    }

    /// Encode this value to binary format using its own kind.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match encode_scalar(self, self.kind(), &mut buf) {
            Ok(()) => buf.to_vec(),
            Err(_) => match self {
                PgValue::Raw { data, .. } => data.clone(),
                other => other.to_text().unwrap_or_default().into_bytes(),
            },
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED, // let the server infer it
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Oid(_) => Oid::OID_TYPE,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::TimeTz { .. } => Oid::TIMETZ,
            PgValue::Interval(_) => Oid::INTERVAL,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Array(array) => builtin_array_oid(array.element_oid),
            PgValue::Record(record) => record.type_oid,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a built-in scalar value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        decode_scalar_binary(Kind::of_builtin(oid), oid, data)
    }

    /// Decode a built-in scalar from text format (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| PgError::Protocol(format!("Invalid UTF-8 in text value: {}", e)))?;
        decode_scalar_text(Kind::of_builtin(oid), oid, text)
    }

    /// Text representation as PostgreSQL would print it. `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null => return None,
            PgValue::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Oid(v) => v.to_string(),
            PgValue::Float4(v) => format_float(*v as f64),
            PgValue::Float8(v) => format_float(*v),
            PgValue::Numeric(v) | PgValue::Text(v) | PgValue::Json(v) => v.clone(),
            PgValue::Bytea(v) => {
                let mut out = String::with_capacity(2 + v.len() * 2);
                out.push_str("\\x");
                for b in v {
                    out.push_str(&format!("{:02x}", b));
                }
                out
            }
            PgValue::Uuid(v) => uuid::Uuid::from_bytes(*v).hyphenated().to_string(),
            PgValue::Date(d) => format_date(*d),
            PgValue::Time(t) => format_time(*t),
            PgValue::TimeTz { micros, offset } => {
                format!("{}{}", format_time(*micros), format_offset(*offset))
            }
            PgValue::Timestamp(ts) => format_timestamp(*ts),
            PgValue::TimestampTz(ts) => match *ts {
                i64::MAX | i64::MIN => format_timestamp(*ts),
                _ => format!("{}+00", format_timestamp(*ts)),
            },
            PgValue::Interval(i) => i.to_string(),
            PgValue::Array(array) => array_literal(array),
            PgValue::Record(record) => record_literal(record),
            PgValue::Raw { data, .. } => String::from_utf8_lossy(data).into_owned(),
        };
        Some(text)
    }

    /// JSON view used for host-type mapping of composites.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            PgValue::Null => Value::Null,
            PgValue::Bool(v) => Value::Bool(*v),
            PgValue::Int2(v) => Value::from(*v),
            PgValue::Int4(v) => Value::from(*v),
            PgValue::Int8(v) => Value::from(*v),
            PgValue::Oid(v) => Value::from(*v),
            PgValue::Float4(v) => Value::from(*v as f64),
            PgValue::Float8(v) => Value::from(*v),
            PgValue::Numeric(v) => serde_json::Number::from_str(v)
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(v.clone())),
            PgValue::Json(v) => {
                serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
            }
            PgValue::Bytea(v) => Value::Array(v.iter().map(|b| Value::from(*b)).collect()),
            PgValue::Timestamp(ts) => Value::String(
                timestamp_to_naive(*ts)
                    .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                    .unwrap_or_else(|| format_timestamp(*ts)),
            ),
            PgValue::TimestampTz(ts) => Value::String(
                timestamp_to_naive(*ts)
                    .map(|dt| dt.and_utc().to_rfc3339())
                    .unwrap_or_else(|| format_timestamp(*ts)),
            ),
            PgValue::Array(array) => {
                Value::Array(array.elements.iter().map(PgValue::to_json).collect())
            }
            PgValue::Record(record) => {
                let mut map = serde_json::Map::new();
                for (name, value) in &record.fields {
                    map.insert(name.clone(), value.to_json());
                }
                Value::Object(map)
            }
            other => other
                .to_text()
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }
}

/// Array type OID for built-in element types, `UNSPECIFIED` otherwise.
pub fn builtin_array_oid(element: Oid) -> Oid {
    match element {
        Oid::BOOL => Oid::BOOL_ARRAY,
        Oid::BYTEA => Oid(1001),
        Oid::CHAR => Oid(1002),
        Oid::NAME => Oid(1003),
        Oid::INT2 => Oid::INT2_ARRAY,
        Oid::INT4 => Oid::INT4_ARRAY,
        Oid::TEXT => Oid::TEXT_ARRAY,
        Oid::BPCHAR => Oid(1014),
        Oid::VARCHAR => Oid(1015),
        Oid::INT8 => Oid::INT8_ARRAY,
        Oid::FLOAT4 => Oid(1021),
        Oid::FLOAT8 => Oid::FLOAT8_ARRAY,
        Oid::OID_TYPE => Oid(1028),
        Oid::TIMESTAMP => Oid(1115),
        Oid::DATE => Oid(1182),
        Oid::TIME => Oid(1183),
        Oid::TIMESTAMPTZ => Oid(1185),
        Oid::INTERVAL => Oid(1187),
        Oid::NUMERIC => Oid(1231),
        Oid::TIMETZ => Oid(1270),
        Oid::UUID => Oid(2951),
        Oid::JSON => Oid(199),
        Oid::JSONB => Oid(3807),
        Oid::RECORD => Oid::RECORD_ARRAY,
        _ => Oid::UNSPECIFIED,
    }
}

// ============================================================================
// Scalar binary codec
// ============================================================================

/// Encode a scalar already coerced to `kind`.
pub fn encode_scalar(value: &PgValue, kind: Kind, buf: &mut BytesMut) -> PgResult<()> {
    match (kind, value) {
        (Kind::Bool, PgValue::Bool(v)) => buf.put_u8(u8::from(*v)),
        (Kind::Int2, PgValue::Int2(v)) => buf.put_i16(*v),
        (Kind::Int4, PgValue::Int4(v)) => buf.put_i32(*v),
        (Kind::Int8, PgValue::Int8(v)) => buf.put_i64(*v),
        (Kind::Oid, PgValue::Oid(v)) => buf.put_u32(*v),
        (Kind::Float4, PgValue::Float4(v)) => buf.put_f32(*v),
        (Kind::Float8, PgValue::Float8(v)) => buf.put_f64(*v),
        (Kind::Numeric, PgValue::Numeric(v)) => encode_numeric(v, buf)?,
        (Kind::Text | Kind::Enum | Kind::Unknown, PgValue::Text(v)) => buf.put_slice(v.as_bytes()),
        (Kind::Char, PgValue::Text(v)) => buf.put_u8(v.bytes().next().unwrap_or(0)),
        (Kind::Bytea, PgValue::Bytea(v)) => buf.put_slice(v),
        (Kind::Uuid, PgValue::Uuid(v)) => buf.put_slice(v),
        (Kind::Date, PgValue::Date(v)) => buf.put_i32(*v),
        (Kind::Time, PgValue::Time(v)) => buf.put_i64(*v),
        (Kind::TimeTz, PgValue::TimeTz { micros, offset }) => {
            buf.put_i64(*micros);
            // wire stores seconds west of UTC
            buf.put_i32(-*offset);
        }
        (Kind::Timestamp, PgValue::Timestamp(v)) => buf.put_i64(*v),
        (Kind::TimestampTz, PgValue::TimestampTz(v)) => buf.put_i64(*v),
        (Kind::Interval, PgValue::Interval(v)) => {
            buf.put_i64(v.micros);
            buf.put_i32(v.days);
            buf.put_i32(v.months);
        }
        (Kind::Json, PgValue::Json(v)) => buf.put_slice(v.as_bytes()),
        (Kind::Jsonb, PgValue::Json(v)) => {
            buf.put_u8(1);
            buf.put_slice(v.as_bytes());
        }
        (Kind::Void, PgValue::Null) => {}
        (_, PgValue::Raw { data, .. }) => buf.put_slice(data),
        (kind, value) => return Err(PgError::coercion(value.kind_name(), kind)),
    }
    Ok(())
}

fn fixed<const N: usize>(data: &[u8], kind: Kind) -> PgResult<[u8; N]> {
    data.try_into().map_err(|_| {
        PgError::Protocol(format!("Invalid {} length: {}", kind.name().to_uppercase(), data.len()))
    })
}

/// Decode a scalar from binary format.
pub fn decode_scalar_binary(kind: Kind, oid: Oid, data: &[u8]) -> PgResult<PgValue> {
    let value = match kind {
        Kind::Bool => PgValue::Bool(fixed::<1>(data, kind)?[0] != 0),
        Kind::Int2 => PgValue::Int2(i16::from_be_bytes(fixed(data, kind)?)),
        Kind::Int4 => PgValue::Int4(i32::from_be_bytes(fixed(data, kind)?)),
        Kind::Int8 => PgValue::Int8(i64::from_be_bytes(fixed(data, kind)?)),
        Kind::Oid => PgValue::Oid(u32::from_be_bytes(fixed(data, kind)?)),
        Kind::Float4 => PgValue::Float4(f32::from_be_bytes(fixed(data, kind)?)),
        Kind::Float8 => PgValue::Float8(f64::from_be_bytes(fixed(data, kind)?)),
        Kind::Numeric => PgValue::Numeric(decode_numeric(data)?),
        Kind::Text | Kind::Enum | Kind::Unknown => PgValue::Text(utf8(data)?),
        Kind::Char => PgValue::Text(
            data.first()
                .map(|b| (*b as char).to_string())
                .unwrap_or_default(),
        ),
        Kind::Bytea => PgValue::Bytea(data.to_vec()),
        Kind::Uuid => PgValue::Uuid(fixed(data, kind)?),
        Kind::Date => PgValue::Date(i32::from_be_bytes(fixed(data, kind)?)),
        Kind::Time => PgValue::Time(i64::from_be_bytes(fixed(data, kind)?)),
        Kind::TimeTz => {
            let raw: [u8; 12] = fixed(data, kind)?;
            let mut buf = &raw[..];
            let micros = buf.get_i64();
            let west = buf.get_i32();
            PgValue::TimeTz {
                micros,
                offset: -west,
            }
        }
        Kind::Timestamp => PgValue::Timestamp(i64::from_be_bytes(fixed(data, kind)?)),
        Kind::TimestampTz => PgValue::TimestampTz(i64::from_be_bytes(fixed(data, kind)?)),
        Kind::Interval => {
            let raw: [u8; 16] = fixed(data, kind)?;
            let mut buf = &raw[..];
            let micros = buf.get_i64();
            let days = buf.get_i32();
            let months = buf.get_i32();
            PgValue::Interval(Interval::new(months, days, micros))
        }
        Kind::Json => PgValue::Json(utf8(data)?),
        // JSONB has a version byte prefix
        Kind::Jsonb => PgValue::Json(utf8(data.get(1..).unwrap_or_default())?),
        Kind::Void => PgValue::Null,
        Kind::Array | Kind::Composite | Kind::Domain => PgValue::Raw {
            oid,
            data: data.to_vec(),
        },
    };
    Ok(value)
}

fn utf8(data: &[u8]) -> PgResult<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| PgError::Protocol(format!("Invalid UTF-8 in value: {}", e)))
}

// ============================================================================
// Scalar text codec
// ============================================================================

/// Decode a scalar from its text representation.
pub fn decode_scalar_text(kind: Kind, oid: Oid, text: &str) -> PgResult<PgValue> {
    let bad = || PgError::coercion(format!("'{}'", text), kind);
    let value = match kind {
        Kind::Bool => PgValue::Bool(parse_bool_word(text).ok_or_else(bad)?),
        Kind::Int2 => PgValue::Int2(text.trim().parse().map_err(|_| bad())?),
        Kind::Int4 => PgValue::Int4(text.trim().parse().map_err(|_| bad())?),
        Kind::Int8 => PgValue::Int8(text.trim().parse().map_err(|_| bad())?),
        Kind::Oid => PgValue::Oid(text.trim().parse().map_err(|_| bad())?),
        Kind::Float4 => PgValue::Float4(parse_float(text).ok_or_else(bad)? as f32),
        Kind::Float8 => PgValue::Float8(parse_float(text).ok_or_else(bad)?),
        Kind::Numeric => {
            if !is_numeric_text(text.trim()) {
                return Err(bad());
            }
            PgValue::Numeric(text.trim().to_string())
        }
        Kind::Text | Kind::Char | Kind::Enum | Kind::Unknown => PgValue::Text(text.to_string()),
        Kind::Bytea => PgValue::Bytea(parse_bytea(text).ok_or_else(bad)?),
        Kind::Uuid => PgValue::Uuid(
            *uuid::Uuid::parse_str(text.trim())
                .map_err(|_| bad())?
                .as_bytes(),
        ),
        Kind::Date => PgValue::Date(parse_date(text).ok_or_else(bad)?),
        Kind::Time => PgValue::Time(parse_time(text).ok_or_else(bad)?),
        Kind::TimeTz => {
            let (micros, offset) = parse_timetz(text).ok_or_else(bad)?;
            PgValue::TimeTz { micros, offset }
        }
        Kind::Timestamp => PgValue::Timestamp(parse_timestamp(text).ok_or_else(bad)?),
        Kind::TimestampTz => PgValue::TimestampTz(parse_timestamptz(text).ok_or_else(bad)?),
        Kind::Interval => PgValue::Interval(text.parse()?),
        Kind::Json | Kind::Jsonb => PgValue::Json(text.to_string()),
        Kind::Void => PgValue::Null,
        Kind::Array | Kind::Composite | Kind::Domain => PgValue::Raw {
            oid,
            data: text.as_bytes().to_vec(),
        },
    };
    Ok(value)
}

/// Boolean word forms accepted by the server.
pub fn parse_bool_word(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "on" | "1" | "yes" | "y" => Some(true),
        "f" | "false" | "off" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

fn parse_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

pub(crate) fn is_numeric_text(text: &str) -> bool {
    if matches!(text, "NaN" | "Infinity" | "-Infinity") {
        return true;
    }
    let body = text.strip_prefix(['-', '+']).unwrap_or(text);
    let mut digits = 0;
    let mut dots = 0;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}

// ============================================================================
// Numeric (base 10000)
// ============================================================================

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;
const NUMERIC_NBASE: i16 = 10000;
const NUMERIC_MAX_DSCALE: usize = 0x3FFF;

/// Decode the binary numeric format into exact decimal text.
pub fn decode_numeric(data: &[u8]) -> PgResult<String> {
    if data.len() < 8 {
        return Err(PgError::Protocol(format!(
            "Invalid NUMERIC length: {}",
            data.len()
        )));
    }
    let mut buf = data;
    let ndigits = buf.get_i16();
    let weight = buf.get_i16() as i32;
    let sign = buf.get_u16();
    let dscale = buf.get_u16() as usize;
    let ndigits = usize::try_from(ndigits)
        .map_err(|_| PgError::Protocol(format!("Negative NUMERIC digit count: {}", ndigits)))?;
    match ndigits.checked_mul(2) {
        Some(needed) if needed <= buf.remaining() => {}
        _ => return Err(PgError::Protocol("Truncated NUMERIC digits".to_string())),
    }
    let digits: Vec<i16> = (0..ndigits).map(|_| buf.get_i16()).collect();
    if let Some(bad) = digits.iter().find(|d| !(0..NUMERIC_NBASE).contains(*d)) {
        return Err(PgError::Protocol(format!("Invalid NUMERIC digit: {}", bad)));
    }
    if dscale > NUMERIC_MAX_DSCALE {
        return Err(PgError::Protocol(format!("Invalid NUMERIC scale: {}", dscale)));
    }

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digit_at = |index: i32| -> i16 {
        if index >= 0 && (index as usize) < digits.len() {
            digits[index as usize]
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for w in (0..=weight).rev() {
            let digit = digit_at(weight - w);
            if w == weight {
                out.push_str(&digit.to_string());
            } else {
                out.push_str(&format!("{:04}", digit));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut k = 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(weight + k)));
            k += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

/// Encode exact decimal text into the binary numeric format.
pub fn encode_numeric(text: &str, buf: &mut BytesMut) -> PgResult<()> {
    let text = text.trim();
    let special = match text {
        "NaN" => Some(NUMERIC_NAN),
        "Infinity" => Some(NUMERIC_PINF),
        "-Infinity" => Some(NUMERIC_NINF),
        _ => None,
    };
    if let Some(sign) = special {
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_u16(sign);
        buf.put_u16(0);
        return Ok(());
    }
    if !is_numeric_text(text) {
        return Err(PgError::coercion(format!("'{}'", text), Kind::Numeric));
    }

    let (negative, body) = match text.as_bytes()[0] {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let int_part = int_part.trim_start_matches('0');
    let dscale = frac_part.len();

    let mut int_padded = "0".repeat((4 - int_part.len() % 4) % 4);
    int_padded.push_str(int_part);
    let mut frac_padded = frac_part.to_string();
    frac_padded.push_str(&"0".repeat((4 - frac_part.len() % 4) % 4));

    let groups = |s: &str| -> Vec<i16> {
        s.as_bytes()
            .chunks(4)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
            })
            .collect()
    };
    let int_groups = groups(&int_padded);
    let mut all: Vec<i16> = int_groups.clone();
    all.extend(groups(&frac_padded));
    let mut weight = int_groups.len() as i32 - 1;

    let leading = all.iter().take_while(|d| **d == 0).count();
    all.drain(..leading);
    weight -= leading as i32;
    while all.last() == Some(&0) {
        all.pop();
    }
    if all.is_empty() {
        weight = 0;
    }

    let out_of_range = || PgError::Structural(format!("NUMERIC value out of range: {}", text));
    let ndigits = i16::try_from(all.len()).map_err(|_| out_of_range())?;
    let weight = i16::try_from(weight).map_err(|_| out_of_range())?;
    if dscale > NUMERIC_MAX_DSCALE {
        return Err(out_of_range());
    }

    buf.put_i16(ndigits);
    buf.put_i16(weight);
    buf.put_u16(if negative && !all.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    });
    buf.put_u16(dscale as u16);
    for digit in all {
        buf.put_i16(digit);
    }
    Ok(())
}

// ============================================================================
// Date / time helpers
// ============================================================================

pub fn date_to_naive(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(PG_EPOCH_DAYS_FROM_CE)?)
}

pub fn naive_to_date(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE
}

pub fn time_to_naive(micros: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

pub fn naive_to_time(time: NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * 1_000_000 + (time.nanosecond() / 1000) as i64
}

pub fn timestamp_to_naive(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros.checked_add(PG_EPOCH_UNIX_MICROS)?)
        .map(|dt| dt.naive_utc())
}

pub fn naive_to_timestamp(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

pub(crate) fn timestamp_date_part(micros: i64) -> i32 {
    micros.div_euclid(MICROS_PER_DAY) as i32
}

pub(crate) fn timestamp_time_part(micros: i64) -> i64 {
    micros.rem_euclid(MICROS_PER_DAY)
}

fn format_date(days: i32) -> String {
    match days {
        i32::MAX => "infinity".to_string(),
        i32::MIN => "-infinity".to_string(),
        _ => date_to_naive(days)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| days.to_string()),
    }
}

fn format_time(micros: i64) -> String {
    time_to_naive(micros)
        .map(|t| t.format("%H:%M:%S%.f").to_string())
        .unwrap_or_else(|| "24:00:00".to_string())
}

fn format_timestamp(micros: i64) -> String {
    match micros {
        i64::MAX => "infinity".to_string(),
        i64::MIN => "-infinity".to_string(),
        _ => timestamp_to_naive(micros)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
            .unwrap_or_else(|| micros.to_string()),
    }
}

fn format_offset(offset: i32) -> String {
    let sign = if offset < 0 { '-' } else { '+' };
    let abs = offset.unsigned_abs();
    let (hours, minutes) = (abs / 3600, (abs / 60) % 60);
    if minutes == 0 {
        format!("{}{:02}", sign, hours)
    } else {
        format!("{}{:02}:{:02}", sign, hours, minutes)
    }
}

fn parse_date(text: &str) -> Option<i32> {
    match text.trim() {
        "infinity" => Some(i32::MAX),
        "-infinity" => Some(i32::MIN),
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
            .ok()
            .map(naive_to_date),
    }
}

fn parse_time(text: &str) -> Option<i64> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text.trim(), "%H:%M"))
        .ok()
        .map(naive_to_time)
}

fn parse_timetz(text: &str) -> Option<(i64, i32)> {
    let text = text.trim();
    let split = text.rfind(['+', '-'])?;
    let micros = parse_time(&text[..split])?;
    let sign = if text.as_bytes()[split] == b'-' { -1 } else { 1 };
    let mut fields = text[split + 1..].split(':');
    let hours: i32 = fields.next()?.parse().ok()?;
    let minutes: i32 = fields.next().map(|m| m.parse().ok()).unwrap_or(Some(0))?;
    Some((micros, sign * (hours * 3600 + minutes * 60)))
}

fn parse_timestamp(text: &str) -> Option<i64> {
    match text.trim() {
        "infinity" => Some(i64::MAX),
        "-infinity" => Some(i64::MIN),
        other => NaiveDateTime::parse_from_str(other, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(other, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
            .map(naive_to_timestamp),
    }
}

fn parse_timestamptz(text: &str) -> Option<i64> {
    match text.trim() {
        "infinity" => Some(i64::MAX),
        "-infinity" => Some(i64::MIN),
        other => DateTime::parse_from_str(other, "%Y-%m-%d %H:%M:%S%.f%#z")
            .or_else(|_| DateTime::parse_from_rfc3339(other))
            .ok()
            .map(|dt| naive_to_timestamp(dt.naive_utc())),
    }
}

// ============================================================================
// Container literals
// ============================================================================

fn quote_element(text: &str, always: bool) -> String {
    let needs = always
        || text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\' | '(' | ')') || c.is_whitespace());
    if !needs {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `{a,b,"c d"}` form, nested per dimension.
fn array_literal(array: &PgArray) -> String {
    fn level(array: &PgArray, dim: usize, offset: &mut usize, out: &mut String) {
        out.push('{');
        let len = array.dims[dim].len.max(0) as usize;
        for i in 0..len {
            if i > 0 {
                out.push(',');
            }
            if dim + 1 < array.dims.len() {
                level(array, dim + 1, offset, out);
            } else {
                match array.elements.get(*offset).and_then(PgValue::to_text) {
                    None => out.push_str("NULL"),
                    Some(text) => out.push_str(&quote_element(&text, false)),
                }
                *offset += 1;
            }
        }
        out.push('}');
    }

    if array.dims.is_empty() {
        return "{}".to_string();
    }
    let mut out = String::new();
    let mut offset = 0;
    level(array, 0, &mut offset, &mut out);
    out
}

/// `(a,"b c",)` form; NULL fields are empty.
fn record_literal(record: &Record) -> String {
    let mut out = String::from("(");
    for (i, (_, value)) in record.fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if let Some(text) = value.to_text() {
            out.push_str(&quote_element(&text, text.is_empty()));
        }
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(Oid::FLOAT8.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_int4_roundtrip() {
        let original = PgValue::Int4(12345);
        let encoded = original.encode_binary();
        let decoded = PgValue::decode_binary(Oid::INT4, &encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_numeric_binary_layout() {
        let mut buf = BytesMut::new();
        encode_numeric("-1234.5", &mut buf).unwrap();
        // ndigits=2, weight=0, sign=neg, dscale=1, digits [1234, 5000]
        assert_eq!(
            &buf[..],
            &[0, 2, 0, 0, 0x40, 0, 0, 1, 0x04, 0xD2, 0x13, 0x88]
        );
        assert_eq!(decode_numeric(&buf).unwrap(), "-1234.5");
    }

    #[test]
    fn test_numeric_preserves_scale_and_magnitude() {
        for text in ["0", "0.00", "10000", "0.0001", "123456789.000120", "NaN"] {
            let mut buf = BytesMut::new();
            encode_numeric(text, &mut buf).unwrap();
            assert_eq!(decode_numeric(&buf).unwrap(), text);
        }
    }

    #[test]
    fn test_numeric_rejects_garbage() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_numeric("12a", &mut buf),
            Err(PgError::Coercion { .. })
        ));
    }

    #[test]
    fn test_numeric_malformed_headers() {
        // negative digit count
        assert!(matches!(
            decode_numeric(&[0xff, 0xff, 0, 0, 0, 0, 0, 0]),
            Err(PgError::Protocol(_))
        ));
        // claims 3 digits, carries 1
        assert!(decode_numeric(&[0, 3, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
        // digit outside base 10000
        assert!(decode_numeric(&[0, 1, 0, 0, 0, 0, 0, 0, 0x27, 0x10]).is_err());
        // scale beyond the numeric maximum
        assert!(decode_numeric(&[0, 0, 0, 0, 0, 0, 0x40, 0]).is_err());
        assert!(decode_numeric(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_numeric_encode_out_of_range() {
        let mut buf = BytesMut::new();
        let too_many_digits = "9".repeat(140_000);
        assert!(matches!(
            encode_numeric(&too_many_digits, &mut buf),
            Err(PgError::Structural(_))
        ));
        let too_much_scale = format!("0.{}1", "0".repeat(20_000));
        assert!(matches!(
            encode_numeric(&too_much_scale, &mut buf),
            Err(PgError::Structural(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_scalar_binary_rejects_short_or_invalid_input() {
        for (kind, data) in [
            (Kind::Int4, &[0u8, 0, 1][..]),
            (Kind::Int8, &[0u8; 4][..]),
            (Kind::Float8, &[0u8; 7][..]),
            (Kind::Uuid, &[0u8; 15][..]),
            (Kind::Interval, &[0u8; 12][..]),
            (Kind::TimeTz, &[0u8; 8][..]),
            (Kind::Bool, &[][..]),
            (Kind::Text, &[0xff, 0xfe][..]),
        ] {
            assert!(
                decode_scalar_binary(kind, Oid::UNSPECIFIED, data).is_err(),
                "{:?} accepted {:?}",
                kind,
                data
            );
        }
    }

    #[test]
    fn test_interval_text_forms() {
        let i: Interval = "1 year 2 mons 3 days 04:05:06.5".parse().unwrap();
        assert_eq!(i, Interval::new(14, 3, 14_706_500_000));
        assert_eq!(i.to_string(), "1 year 2 mons 3 days 04:05:06.5");

        let neg: Interval = "-1 days -00:00:01".parse().unwrap();
        assert_eq!(neg, Interval::new(0, -1, -1_000_000));
        assert_eq!(Interval::default().to_string(), "00:00:00");
    }

    #[test]
    fn test_bool_word_forms() {
        for word in ["on", "true", "1", "t", "YES"] {
            assert_eq!(parse_bool_word(word), Some(true), "{}", word);
        }
        for word in ["off", "false", "0", "f", "no"] {
            assert_eq!(parse_bool_word(word), Some(false), "{}", word);
        }
        assert_eq!(parse_bool_word("maybe"), None);
    }

    #[test]
    fn test_date_and_timestamp_text() {
        let date = decode_scalar_text(Kind::Date, Oid::DATE, "2000-01-02").unwrap();
        assert_eq!(date, PgValue::Date(1));
        assert_eq!(date.to_text().unwrap(), "2000-01-02");

        let ts = decode_scalar_text(Kind::Timestamp, Oid::TIMESTAMP, "2000-01-01 00:00:01.5").unwrap();
        assert_eq!(ts, PgValue::Timestamp(1_500_000));

        let tz = decode_scalar_text(Kind::TimestampTz, Oid::TIMESTAMPTZ, "2000-01-01 02:00:00+02").unwrap();
        assert_eq!(tz, PgValue::TimestampTz(0));
        assert_eq!(tz.to_text().unwrap(), "2000-01-01 00:00:00+00");
    }

    #[test]
    fn test_timetz_offset_direction() {
        let value = PgValue::TimeTz {
            micros: 3_600_000_000,
            offset: 5 * 3600,
        };
        let bytes = value.encode_binary();
        assert_eq!(&bytes[8..], &(-5 * 3600i32).to_be_bytes());
        assert_eq!(
            decode_scalar_binary(Kind::TimeTz, Oid::TIMETZ, &bytes).unwrap(),
            value
        );
        assert_eq!(value.to_text().unwrap(), "01:00:00+05");
    }

    #[test]
    fn test_jsonb_version_byte() {
        let bytes = PgValue::Json("{\"a\":1}".to_string()).encode_binary();
        assert_eq!(bytes[0], 1);
        assert_eq!(
            PgValue::decode_binary(Oid::JSONB, &bytes).unwrap(),
            PgValue::Json("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_array_and_record_literals() {
        let array = PgArray::from_elements(
            Oid::TEXT,
            vec![
                PgValue::Text("a".into()),
                PgValue::Null,
                PgValue::Text("b c".into()),
            ],
        );
        assert_eq!(PgValue::Array(array).to_text().unwrap(), "{a,NULL,\"b c\"}");

        let record = Record {
            type_name: None,
            type_oid: Oid::RECORD,
            fields: vec![
                ("f1".into(), PgValue::Int4(1)),
                ("f2".into(), PgValue::Null),
                ("f3".into(), PgValue::Text("x\"y".into())),
            ],
        };
        assert_eq!(PgValue::Record(record).to_text().unwrap(), "(1,,\"x\\\"y\")");
    }

    #[test]
    fn test_bytea_hex_text() {
        let value = decode_scalar_text(Kind::Bytea, Oid::BYTEA, "\\xdeadbeef").unwrap();
        assert_eq!(value, PgValue::Bytea(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(value.to_text().unwrap(), "\\xdeadbeef");
    }
}
