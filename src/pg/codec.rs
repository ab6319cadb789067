//! Recursive wire codec.
//!
//! Walks the type graph: domains unwrap to their base, arrays recurse into
//! the element type, composites into their attributes. Scalars are handed
//! to the codecs in `types`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::coerce::coerce_to_kind;
use super::error::{PgError, PgResult};
use super::protocol::Format;
use super::registry::{Type, TypeLookup};
use super::types::{
    decode_scalar_binary, decode_scalar_text, encode_scalar, ArrayDim, Kind, Oid, PgArray, PgValue,
    Record,
};

const MAX_ARRAY_DIMS: i32 = 6;

// ============================================================================
// Decoding
// ============================================================================

/// Decode one column value in the given wire format.
pub fn decode_value(
    ty: &Type,
    format: Format,
    data: &[u8],
    lookup: &dyn TypeLookup,
) -> PgResult<PgValue> {
    match format {
        Format::Binary => decode_binary(ty, data, lookup),
        Format::Text => {
            let text = std::str::from_utf8(data)
                .map_err(|e| PgError::Protocol(format!("Invalid UTF-8 in text value: {}", e)))?;
            decode_text(ty, text, lookup)
        }
    }
}

/// Decode a binary-format value of type `ty`.
pub fn decode_binary(ty: &Type, data: &[u8], lookup: &dyn TypeLookup) -> PgResult<PgValue> {
    let ty = ty.resolved();
    match ty.kind {
        Kind::Array => decode_binary_array(ty, data, lookup),
        Kind::Composite => decode_binary_record(ty, data, lookup),
        kind => decode_scalar_binary(kind, ty.oid, data),
    }
}

fn decode_binary_array(ty: &Type, mut data: &[u8], lookup: &dyn TypeLookup) -> PgResult<PgValue> {
    let truncated = || PgError::Protocol(format!("Truncated array value for {}", ty.name));
    if data.remaining() < 12 {
        return Err(truncated());
    }
    let ndims = data.get_i32();
    let _has_nulls = data.get_i32();
    let element_oid = Oid(data.get_i32());
    if !(0..=MAX_ARRAY_DIMS).contains(&ndims) {
        return Err(PgError::Protocol(format!("Invalid array dimensions: {}", ndims)));
    }

    let element = element_type(ty, element_oid, lookup);
    let mut dims = Vec::with_capacity(ndims as usize);
    for _ in 0..ndims {
        if data.remaining() < 8 {
            return Err(truncated());
        }
        dims.push(ArrayDim {
            len: data.get_i32(),
            lower_bound: data.get_i32(),
        });
    }

    // every element carries at least its 4-byte length
    let count = element_count(&dims)
        .filter(|count| *count <= data.remaining() / 4)
        .ok_or_else(|| PgError::Protocol(format!("Array dimensions exceed value size for {}", ty.name)))?;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        if data.remaining() < 4 {
            return Err(truncated());
        }
        let len = data.get_i32();
        if len < 0 {
            elements.push(PgValue::Null);
            continue;
        }
        let len = len as usize;
        if data.remaining() < len {
            return Err(truncated());
        }
        let value = match &element {
            Some(element) => decode_binary(element, &data[..len], lookup)?,
            None => PgValue::Raw {
                oid: element_oid,
                data: data[..len].to_vec(),
            },
        };
        data.advance(len);
        elements.push(value);
    }

    Ok(PgValue::Array(PgArray {
        element_oid,
        dims,
        elements,
    }))
}

/// Product of the dimension lengths, `None` on a negative length or overflow.
fn element_count(dims: &[ArrayDim]) -> Option<usize> {
    if dims.is_empty() {
        return Some(0);
    }
    dims.iter().try_fold(1usize, |count, dim| {
        usize::try_from(dim.len).ok().and_then(|len| count.checked_mul(len))
    })
}

fn element_type(
    ty: &Type,
    element_oid: Oid,
    lookup: &dyn TypeLookup,
) -> Option<std::sync::Arc<Type>> {
    match &ty.element {
        Some(element) if element.oid == element_oid || element_oid.is_unspecified() => {
            Some(std::sync::Arc::clone(element))
        }
        _ => lookup.lookup(element_oid),
    }
}

fn decode_binary_record(ty: &Type, mut data: &[u8], lookup: &dyn TypeLookup) -> PgResult<PgValue> {
    let truncated = || PgError::Protocol(format!("Truncated record value for {}", ty.name));
    if data.remaining() < 4 {
        return Err(truncated());
    }
    let count = data.get_i32();
    if count < 0 || count as usize > data.remaining() / 8 {
        return Err(PgError::Protocol(format!(
            "Invalid field count {} for {}",
            count, ty.name
        )));
    }
    let count = count as usize;
    let mut fields = Vec::with_capacity(count);

    for i in 0..count {
        if data.remaining() < 8 {
            return Err(truncated());
        }
        let field_oid = Oid(data.get_i32());
        let len = data.get_i32();
        let attribute = ty.attributes.get(i);
        let name = attribute
            .map(|a| a.name.clone())
            .unwrap_or_else(|| format!("f{}", i + 1));
        if len < 0 {
            fields.push((name, PgValue::Null));
            continue;
        }
        let len = len as usize;
        if data.remaining() < len {
            return Err(truncated());
        }
        let field_type = attribute
            .map(|a| std::sync::Arc::clone(&a.type_))
            .or_else(|| lookup.lookup(field_oid));
        let value = match field_type {
            Some(field_type) => decode_binary(&field_type, &data[..len], lookup)?,
            None => PgValue::Raw {
                oid: field_oid,
                data: data[..len].to_vec(),
            },
        };
        data.advance(len);
        fields.push((name, value));
    }

    Ok(PgValue::Record(record_of(ty, fields)))
}

fn record_of(ty: &Type, fields: Vec<(String, PgValue)>) -> Record {
    Record {
        type_name: (ty.oid != Oid::RECORD).then(|| ty.name.clone()),
        type_oid: ty.oid,
        fields,
    }
}

/// Decode a text-format value of type `ty`.
pub fn decode_text(ty: &Type, text: &str, lookup: &dyn TypeLookup) -> PgResult<PgValue> {
    let ty = ty.resolved();
    match ty.kind {
        Kind::Array => {
            let element = ty.element.as_deref();
            let element_oid = element.map(|e| e.oid).unwrap_or(Oid::TEXT);
            let parsed = parse_array_literal(text, ty.delimiter)?;
            let mut elements = Vec::with_capacity(parsed.items.len());
            for item in parsed.items {
                elements.push(match (item, element) {
                    (None, _) => PgValue::Null,
                    (Some(s), Some(element)) => decode_text(element, &s, lookup)?,
                    (Some(s), None) => PgValue::Text(s),
                });
            }
            Ok(PgValue::Array(PgArray {
                element_oid,
                dims: parsed.dims,
                elements,
            }))
        }
        Kind::Composite => {
            let items = parse_record_literal(text)?;
            let mut fields = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let attribute = ty.attributes.get(i);
                let name = attribute
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| format!("f{}", i + 1));
                let value = match (item, attribute) {
                    (None, _) => PgValue::Null,
                    (Some(s), Some(attribute)) => decode_text(&attribute.type_, &s, lookup)?,
                    (Some(s), None) => PgValue::Text(s),
                };
                fields.push((name, value));
            }
            Ok(PgValue::Record(record_of(ty, fields)))
        }
        kind => decode_scalar_text(kind, ty.oid, text),
    }
}

struct ArrayLiteral {
    dims: Vec<ArrayDim>,
    items: Vec<Option<String>>,
}

/// Parse `{a,"b c",NULL}` (optionally `[1:2]={...}` decorated, nested).
fn parse_array_literal(text: &str, delimiter: char) -> PgResult<ArrayLiteral> {
    let bad = |offset: usize| PgError::syntax(format!("Malformed array literal: {}", text), offset);
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0;

    // Explicit bounds decoration
    let mut lower_bounds = Vec::new();
    if chars.first() == Some(&'[') {
        while chars.get(pos) == Some(&'[') {
            let close = chars[pos..]
                .iter()
                .position(|c| *c == ']')
                .map(|p| p + pos)
                .ok_or_else(|| bad(pos))?;
            let spec: String = chars[pos + 1..close].iter().collect();
            let lower = spec
                .split_once(':')
                .and_then(|(l, _)| l.trim().parse::<i32>().ok())
                .unwrap_or(1);
            lower_bounds.push(lower);
            pos = close + 1;
        }
        if chars.get(pos) != Some(&'=') {
            return Err(bad(pos));
        }
        pos += 1;
    }

    let mut items = Vec::new();
    let mut lengths: Vec<i32> = Vec::new();
    let mut counts: Vec<i32> = Vec::new();
    let mut depth = 0usize;
    let mut saw_any = false;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '{' => {
                depth += 1;
                if lengths.len() < depth {
                    lengths.push(0);
                }
                counts.push(0);
                pos += 1;
            }
            '}' => {
                let count = counts.pop().ok_or_else(|| bad(pos))?;
                if depth == 0 {
                    return Err(bad(pos));
                }
                lengths[depth - 1] = lengths[depth - 1].max(count);
                depth -= 1;
                if let Some(parent) = counts.last_mut() {
                    *parent += 1;
                }
                pos += 1;
            }
            c if c == delimiter || c.is_whitespace() => pos += 1,
            '"' => {
                let mut value = String::new();
                pos += 1;
                loop {
                    match chars.get(pos) {
                        None => return Err(bad(pos)),
                        Some('\\') => {
                            value.push(*chars.get(pos + 1).ok_or_else(|| bad(pos))?);
                            pos += 2;
                        }
                        Some('"') => {
                            pos += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            pos += 1;
                        }
                    }
                }
                items.push(Some(value));
                saw_any = true;
                *counts.last_mut().ok_or_else(|| bad(pos))? += 1;
            }
            _ => {
                let start = pos;
                let mut value = String::new();
                while let Some(ch) = chars.get(pos) {
                    if *ch == delimiter || *ch == '}' || *ch == '{' {
                        break;
                    }
                    if *ch == '\\' {
                        value.push(*chars.get(pos + 1).ok_or_else(|| bad(pos))?);
                        pos += 2;
                        continue;
                    }
                    value.push(*ch);
                    pos += 1;
                }
                let value = value.trim_end().to_string();
                if value.is_empty() {
                    return Err(bad(start));
                }
                items.push(if value.eq_ignore_ascii_case("NULL") {
                    None
                } else {
                    Some(value)
                });
                saw_any = true;
                *counts.last_mut().ok_or_else(|| bad(start))? += 1;
            }
        }
    }
    if depth != 0 {
        return Err(bad(chars.len()));
    }

    let dims = if saw_any {
        lengths
            .iter()
            .enumerate()
            .map(|(i, len)| ArrayDim {
                len: *len,
                lower_bound: lower_bounds.get(i).copied().unwrap_or(1),
            })
            .collect()
    } else {
        Vec::new()
    };
    Ok(ArrayLiteral { dims, items })
}

/// Parse `(a,"b c",)`; empty unquoted fields are NULL.
fn parse_record_literal(text: &str) -> PgResult<Vec<Option<String>>> {
    let bad = |offset: usize| PgError::syntax(format!("Malformed record literal: {}", text), offset);
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.first() != Some(&'(') || chars.last() != Some(&')') {
        return Err(bad(0));
    }
    let body = &chars[1..chars.len() - 1];
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut touched = false;
    let mut pos = 0;
    while pos < body.len() {
        let c = body[pos];
        match c {
            '"' if quoted && body.get(pos + 1) == Some(&'"') => {
                current.push('"');
                pos += 1;
            }
            '"' => {
                quoted = !quoted;
                touched = true;
            }
            '\\' => {
                current.push(*body.get(pos + 1).ok_or_else(|| bad(pos + 1))?);
                pos += 1;
            }
            ',' if !quoted => {
                fields.push(if touched || !current.is_empty() {
                    Some(std::mem::take(&mut current))
                } else {
                    None
                });
                touched = false;
            }
            _ => current.push(c),
        }
        pos += 1;
    }
    if quoted {
        return Err(bad(text.len()));
    }
    fields.push(if touched || !current.is_empty() {
        Some(current)
    } else {
        None
    });
    Ok(fields)
}

// ============================================================================
// Encoding
// ============================================================================

/// Wire format a parameter of type `ty` is sent in.
pub fn param_format(ty: &Type) -> Format {
    if ty.supports_binary() {
        Format::Binary
    } else {
        Format::Text
    }
}

/// Encode a parameter for Bind; `None` for NULL.
pub fn encode_param(value: &PgValue, ty: &Type, format: Format) -> PgResult<Option<Bytes>> {
    if value.is_null() {
        return Ok(None);
    }
    match format {
        Format::Binary => {
            let mut buf = BytesMut::new();
            encode_binary(value, ty, &mut buf)?;
            Ok(Some(buf.freeze()))
        }
        Format::Text => Ok(Some(Bytes::from(encode_text(value, ty)?))),
    }
}

/// Encode `value` in binary format as type `ty`, coercing scalars as needed.
pub fn encode_binary(value: &PgValue, ty: &Type, buf: &mut BytesMut) -> PgResult<()> {
    let ty = ty.resolved();
    match ty.kind {
        Kind::Array => encode_binary_array(value, ty, buf),
        Kind::Composite => encode_binary_record(value, ty, buf),
        kind => {
            let coerced = coerce_to_kind(value, kind)?;
            encode_scalar(&coerced, kind, buf)
        }
    }
}

fn encode_binary_array(value: &PgValue, ty: &Type, buf: &mut BytesMut) -> PgResult<()> {
    let element = ty
        .element
        .as_deref()
        .ok_or_else(|| PgError::UnknownType(format!("element type of {}", ty.name)))?;
    let parsed;
    let array = match value {
        PgValue::Array(array) => array,
        PgValue::Text(text) => {
            parsed = decode_text(ty, text, &NoLookup)?;
            match &parsed {
                PgValue::Array(array) => array,
                _ => return Err(PgError::coercion("text", &ty.name)),
            }
        }
        other => return Err(PgError::coercion(other.kind_name(), &ty.name)),
    };

    let has_nulls = array.elements.iter().any(PgValue::is_null);
    buf.put_i32(array.dims.len() as i32);
    buf.put_i32(i32::from(has_nulls));
    buf.put_i32(element.oid.as_i32());
    for dim in &array.dims {
        buf.put_i32(dim.len);
        buf.put_i32(dim.lower_bound);
    }
    for item in &array.elements {
        if item.is_null() {
            buf.put_i32(-1);
            continue;
        }
        let mut encoded = BytesMut::new();
        encode_binary(item, element, &mut encoded)?;
        buf.put_i32(encoded.len() as i32);
        buf.put_slice(&encoded);
    }
    Ok(())
}

fn encode_binary_record(value: &PgValue, ty: &Type, buf: &mut BytesMut) -> PgResult<()> {
    let parsed;
    let record = match value {
        PgValue::Record(record) => record,
        PgValue::Text(text) => {
            parsed = decode_text(ty, text, &NoLookup)?;
            match &parsed {
                PgValue::Record(record) => record,
                _ => return Err(PgError::coercion("text", &ty.name)),
            }
        }
        other => return Err(PgError::coercion(other.kind_name(), &ty.name)),
    };
    if ty.attributes.is_empty() {
        return Err(PgError::Unsupported(
            "binary encoding of anonymous records".to_string(),
        ));
    }
    if record.fields.len() != ty.attributes.len() {
        return Err(PgError::Structural(format!(
            "{} has {} attributes but the record has {} fields",
            ty.name,
            ty.attributes.len(),
            record.fields.len()
        )));
    }

    buf.put_i32(ty.attributes.len() as i32);
    for (i, attribute) in ty.attributes.iter().enumerate() {
        let field = record
            .get(&attribute.name)
            .unwrap_or(&record.fields[i].1);
        buf.put_i32(attribute.type_.oid.as_i32());
        if field.is_null() {
            buf.put_i32(-1);
            continue;
        }
        let mut encoded = BytesMut::new();
        encode_binary(field, &attribute.type_, &mut encoded)?;
        buf.put_i32(encoded.len() as i32);
        buf.put_slice(&encoded);
    }
    Ok(())
}

/// Text form of `value` as type `ty`.
pub fn encode_text(value: &PgValue, ty: &Type) -> PgResult<String> {
    let ty = ty.resolved();
    let coerced = match ty.kind {
        Kind::Array | Kind::Composite | Kind::Unknown => value.clone(),
        kind => coerce_to_kind(value, kind)?,
    };
    coerced
        .to_text()
        .ok_or_else(|| PgError::coercion("null", &ty.name))
}

struct NoLookup;

impl TypeLookup for NoLookup {
    fn lookup(&self, _oid: Oid) -> Option<std::sync::Arc<Type>> {
        None
    }

    fn lookup_name(&self, _name: &str) -> Option<std::sync::Arc<Type>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pg::registry::{Attribute, Category, SharedRegistry};

    fn registry() -> SharedRegistry {
        SharedRegistry::with_builtins()
    }

    fn composite(registry: &SharedRegistry) -> Type {
        let mut ty = Type::scalar(Oid(93000), "point3", Kind::Composite, Category::Composite, -1);
        ty.namespace = "public".to_string();
        ty.relation_oid = Oid(93001);
        ty.attributes = vec![
            Attribute {
                name: "x".to_string(),
                type_: registry.get(Oid::INT4).unwrap(),
            },
            Attribute {
                name: "label".to_string(),
                type_: registry.get(Oid::TEXT).unwrap(),
            },
        ];
        ty
    }

    fn array_header(ndims: i32, dims: &[(i32, i32)]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(ndims);
        buf.put_i32(0);
        buf.put_i32(Oid::INT4.0);
        for (len, lower) in dims {
            buf.put_i32(*len);
            buf.put_i32(*lower);
        }
        buf
    }

    #[test]
    fn test_binary_array_oversized_dimensions() {
        let registry = registry();
        let ty = registry.get(Oid::INT4_ARRAY).unwrap();

        let huge = array_header(2, &[(i32::MAX, 1), (i32::MAX, 1)]);
        assert!(matches!(
            decode_binary(&ty, &huge, &registry),
            Err(PgError::Protocol(_))
        ));

        // a count that fits but has no element bytes behind it
        let mut short = array_header(1, &[(1_000_000, 1)]);
        short.put_i32(4);
        short.put_i32(7);
        assert!(matches!(
            decode_binary(&ty, &short, &registry),
            Err(PgError::Protocol(_))
        ));

        let negative = array_header(1, &[(-1, 1)]);
        assert!(decode_binary(&ty, &negative, &registry).is_err());
    }

    #[test]
    fn test_binary_array_malformed_headers() {
        let registry = registry();
        let ty = registry.get(Oid::INT4_ARRAY).unwrap();

        assert!(decode_binary(&ty, &[0, 0, 0, 1, 0, 0], &registry).is_err());
        assert!(decode_binary(&ty, &array_header(7, &[]), &registry).is_err());
        assert!(decode_binary(&ty, &array_header(-1, &[]), &registry).is_err());
        // dimension missing its lower bound
        let mut missing = array_header(1, &[]);
        missing.put_i32(1);
        assert!(decode_binary(&ty, &missing, &registry).is_err());
        // element length beyond the buffer
        let mut element = array_header(1, &[(1, 1)]);
        element.put_i32(8);
        element.put_i32(1);
        assert!(decode_binary(&ty, &element, &registry).is_err());
        // wrong width for the element type
        let mut width = array_header(1, &[(1, 1)]);
        width.put_i32(2);
        width.put_i16(1);
        assert!(decode_binary(&ty, &width, &registry).is_err());

        let empty = array_header(0, &[]);
        match decode_binary(&ty, &empty, &registry).unwrap() {
            PgValue::Array(array) => assert!(array.elements.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_binary_record_malformed_field_counts() {
        let registry = registry();
        let ty = composite(&registry);

        let mut huge = BytesMut::new();
        huge.put_i32(i32::MAX);
        assert!(matches!(
            decode_binary(&ty, &huge, &registry),
            Err(PgError::Protocol(_))
        ));

        let mut negative = BytesMut::new();
        negative.put_i32(-5);
        assert!(decode_binary(&ty, &negative, &registry).is_err());

        // field length beyond the buffer
        let mut field = BytesMut::new();
        field.put_i32(1);
        field.put_i32(Oid::INT4.0);
        field.put_i32(100);
        field.put_i32(1);
        assert!(decode_binary(&ty, &field, &registry).is_err());

        assert!(decode_binary(&ty, &[0, 0], &registry).is_err());
    }

    #[test]
    fn test_binary_array_with_null() {
        let registry = registry();
        let ty = registry.get(Oid::INT4_ARRAY).unwrap();
        let value = PgValue::Array(PgArray::from_elements(
            Oid::INT4,
            vec![PgValue::Int4(1), PgValue::Null, PgValue::Int4(3)],
        ));
        let mut buf = BytesMut::new();
        encode_binary(&value, &ty, &mut buf).unwrap();
        // ndim, has_null, element oid
        assert_eq!(&buf[..12], &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 23]);
        assert_eq!(decode_binary(&ty, &buf, &registry).unwrap(), value);
    }

    #[test]
    fn test_array_elements_are_coerced() {
        let registry = registry();
        let ty = registry.get(Oid::INT8_ARRAY).unwrap();
        let value = PgValue::Array(PgArray::from_elements(
            Oid::TEXT,
            vec![PgValue::Text("7".into()), PgValue::Int2(8)],
        ));
        let mut buf = BytesMut::new();
        encode_binary(&value, &ty, &mut buf).unwrap();
        match decode_binary(&ty, &buf, &registry).unwrap() {
            PgValue::Array(array) => {
                assert_eq!(array.elements, vec![PgValue::Int8(7), PgValue::Int8(8)])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_array_multi_dimensional() {
        let registry = registry();
        let ty = registry.get(Oid::INT4_ARRAY).unwrap();
        match decode_text(&ty, "{{1,2},{3,NULL}}", &registry).unwrap() {
            PgValue::Array(array) => {
                assert_eq!(array.dims.len(), 2);
                assert_eq!(array.dims[0].len, 2);
                assert_eq!(array.dims[1].len, 2);
                assert_eq!(array.elements[3], PgValue::Null);
                assert_eq!(array.elements[2], PgValue::Int4(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_array_quoting_and_bounds() {
        let registry = registry();
        let ty = registry.get(Oid::TEXT_ARRAY).unwrap();
        match decode_text(&ty, "[0:1]={\"a,b\",\"q\\\"x\"}", &registry).unwrap() {
            PgValue::Array(array) => {
                assert_eq!(array.dims[0].lower_bound, 0);
                assert_eq!(
                    array.elements,
                    vec![PgValue::Text("a,b".into()), PgValue::Text("q\"x".into())]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode_text(&ty, "{a,b", &registry).is_err());
    }

    #[test]
    fn test_composite_binary_and_text() {
        let registry = registry();
        let ty = composite(&registry);
        let value = PgValue::Record(Record {
            type_name: Some("point3".into()),
            type_oid: Oid(93000),
            fields: vec![
                ("x".into(), PgValue::Int4(4)),
                ("label".into(), PgValue::Text("north pole".into())),
            ],
        });
        let mut buf = BytesMut::new();
        encode_binary(&value, &ty, &mut buf).unwrap();
        assert_eq!(decode_binary(&ty, &buf, &registry).unwrap(), value);

        let text = decode_text(&ty, "(4,\"north pole\")", &registry).unwrap();
        assert_eq!(text, value);

        match decode_text(&ty, "(,)", &registry).unwrap() {
            PgValue::Record(record) => {
                assert_eq!(record.get("x"), Some(&PgValue::Null));
                assert_eq!(record.get("label"), Some(&PgValue::Null));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_anonymous_record_uses_inline_oids() {
        let registry = registry();
        let record_type = registry.get(Oid::RECORD).unwrap();
        let mut buf = BytesMut::new();
        buf.put_i32(2);
        buf.put_i32(Oid::INT4.as_i32());
        buf.put_i32(4);
        buf.put_i32(9);
        buf.put_i32(Oid::TEXT.as_i32());
        buf.put_i32(-1);
        match decode_binary(&record_type, &buf, &registry).unwrap() {
            PgValue::Record(record) => {
                assert!(record.type_name.is_none());
                assert_eq!(record.fields[0], ("f1".to_string(), PgValue::Int4(9)));
                assert_eq!(record.fields[1], ("f2".to_string(), PgValue::Null));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_domain_unwraps_to_base() {
        let registry = registry();
        let mut domain = Type::scalar(Oid(94000), "percent", Kind::Domain, Category::Numeric, 4);
        domain.base = Some(registry.get(Oid::INT4).unwrap());
        let mut buf = BytesMut::new();
        encode_binary(&PgValue::Text("42".into()), &domain, &mut buf).unwrap();
        assert_eq!(
            decode_binary(&domain, &buf, &registry).unwrap(),
            PgValue::Int4(42)
        );
    }

    #[test]
    fn test_unknown_types_travel_as_text() {
        let registry = registry();
        let inet = registry.get(Oid::INET).unwrap();
        assert_eq!(param_format(&inet), Format::Text);
        let encoded = encode_param(&PgValue::Text("10.0.0.1".into()), &inet, Format::Text)
            .unwrap()
            .unwrap();
        assert_eq!(&encoded[..], b"10.0.0.1");
        assert_eq!(
            decode_value(&inet, Format::Text, b"10.0.0.1", &registry).unwrap(),
            PgValue::Text("10.0.0.1".into())
        );
        assert!(encode_param(&PgValue::Null, &inet, Format::Text)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_incompatible_scalar_reports_both_kinds() {
        let registry = registry();
        let ty: Arc<Type> = registry.get(Oid::INT4).unwrap();
        let mut buf = BytesMut::new();
        let err = encode_binary(&PgValue::Bytea(vec![1]), &ty, &mut buf).unwrap_err();
        assert_eq!(err.to_string(), "Cannot coerce bytea to int4");
    }
}
