//! IOP-over-JSON codec (spec.md §4.7: "Content-type `application/json`
//! selects JSON unpack (`t_parse_json`)"). Packs and unpacks the same
//! descriptor-shaped [`Value`] tree the ASN.1 and IOP XML codecs use,
//! with `serde_json::Value` as the wire representation instead of BER
//! bytes or an XML tree.
//!
//! Unlike the IOP XML codec this has no multipart/CID stitching: the
//! JSON wire format carries no attachment convention, so `String`/
//! `Opaque` fields are always inline (base64 for `Opaque`/`BitString`,
//! plain text for `String`).

use base64::Engine as _;
use serde_json::{Map, Number, Value as Json};

use crate::asn1::descriptor::{Descriptor, DescriptorKind, Field, FieldMode, SemanticType};
use crate::asn1::unpack::validate_constraints;
use crate::asn1::value::Value;
use crate::error::IcError;
use crate::registry::Registry;

/// Packs `value` (shaped by `descriptor`) into a [`Json`] tree.
pub fn pack(registry: &Registry, descriptor: &Descriptor, value: &Value) -> Json {
    match descriptor.kind {
        DescriptorKind::Sequence | DescriptorKind::Set => pack_sequence(registry, descriptor, value),
        DescriptorKind::Choice => pack_choice(registry, descriptor, value),
    }
}

fn pack_sequence(registry: &Registry, descriptor: &Descriptor, value: &Value) -> Json {
    let slots = value.as_sequence().unwrap_or(&[]);
    let mut map = Map::new();
    for (field, slot) in descriptor.fields.iter().zip(slots.iter()) {
        if let Some(v) = slot {
            map.insert(field.name.to_string(), pack_field(registry, field, v));
        }
    }
    Json::Object(map)
}

fn pack_choice(registry: &Registry, descriptor: &Descriptor, value: &Value) -> Json {
    let (selector, inner) = match value {
        Value::Choice(sel, inner) => (*sel, inner.as_ref()),
        Value::UntaggedChoice(inner) => {
            // No explicit selector to address by; fall back to the
            // first field whose shape matches, same convention as the
            // IOP XML codec's untagged-choice packer.
            let idx = descriptor
                .fields
                .iter()
                .position(|f| value_matches_semantic_type(f.semantic_type, inner))
                .unwrap_or(0);
            (idx as i32 + 1, inner.as_ref())
        }
        _ => return Json::Null,
    };
    let Some(field) = descriptor.fields.get((selector - 1).max(0) as usize) else {
        return Json::Null;
    };
    let mut map = Map::new();
    map.insert(field.name.to_string(), pack_field(registry, field, inner));
    Json::Object(map)
}

/// Matches an untagged choice's payload shape against a candidate
/// field's semantic type, same fallback the IOP XML packer uses since
/// neither wire format gives an untagged choice an explicit selector.
fn value_matches_semantic_type(st: SemanticType, v: &Value) -> bool {
    use SemanticType::*;
    matches!(
        (st, v),
        (Bool, Value::Bool(_))
            | (I8, Value::I8(_))
            | (U8, Value::U8(_))
            | (I16, Value::I16(_))
            | (U16, Value::U16(_))
            | (I32, Value::I32(_))
            | (U32, Value::U32(_))
            | (I64, Value::I64(_))
            | (U64, Value::U64(_))
            | (Enum, Value::Enum(_))
            | (Null, Value::Null)
            | (OptNull, Value::OptNull(_))
            | (String, Value::String(_))
            | (BitString, Value::BitString(..))
            | (OpenType, Value::OpenType(_))
            | (Opaque, Value::Opaque(_))
            | (Sequence, Value::Sequence(_))
            | (Choice, Value::Choice(..))
    )
}

fn pack_field(registry: &Registry, field: &Field, value: &Value) -> Json {
    if field.mode == FieldMode::SeqOf {
        let items = value.as_seq_of().unwrap_or(&[]);
        return Json::Array(items.iter().map(|v| pack_field_value(registry, field, v)).collect());
    }
    pack_field_value(registry, field, value)
}

fn pack_field_value(registry: &Registry, field: &Field, value: &Value) -> Json {
    match field.semantic_type {
        SemanticType::Sequence | SemanticType::Choice | SemanticType::UntaggedChoice => {
            let nested = registry.get(field.nested.expect("nested field has no descriptor"));
            pack(registry, &nested, value)
        }
        _ => pack_scalar(field, value),
    }
}

fn pack_scalar(field: &Field, value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::I8(v) => Json::Number((*v as i64).into()),
        Value::U8(v) => Json::Number((*v as i64).into()),
        Value::I16(v) => Json::Number((*v as i64).into()),
        Value::U16(v) => Json::Number((*v as i64).into()),
        Value::I32(v) => Json::Number((*v as i64).into()),
        Value::U32(v) => Json::Number((*v as i64).into()),
        Value::I64(v) => Json::Number((*v).into()),
        Value::U64(v) => Number::from_f64(*v as f64).map(Json::Number).unwrap_or(Json::Null),
        Value::Enum(v) => Json::Number((*v as i64).into()),
        Value::Null => Json::Null,
        Value::OptNull(present) => Json::Bool(*present),
        Value::String(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::BitString(bits, _unused) => Json::String(base64::engine::general_purpose::STANDARD.encode(bits)),
        Value::OpenType(bytes) => Json::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
        Value::Opaque(bytes) => {
            let packed = field.opaque.map(|ops| (ops.pack)(bytes)).unwrap_or_else(|| bytes.clone());
            Json::String(base64::engine::general_purpose::STANDARD.encode(packed))
        }
        Value::Sequence(_) | Value::Choice(..) | Value::UntaggedChoice(_) | Value::SeqOf(_) => Json::Null,
    }
}

/// Unpacks `json` into a [`Value`] shaped by `descriptor`.
pub fn unpack(registry: &Registry, descriptor: &Descriptor, json: &Json) -> Result<Value, IcError> {
    match descriptor.kind {
        DescriptorKind::Sequence | DescriptorKind::Set => unpack_sequence(registry, descriptor, json),
        DescriptorKind::Choice => unpack_choice(registry, descriptor, json),
    }
}

fn unpack_sequence(registry: &Registry, descriptor: &Descriptor, json: &Json) -> Result<Value, IcError> {
    let map = json
        .as_object()
        .ok_or_else(|| IcError::invalid(format!("{}: expected a JSON object", descriptor.name)))?;
    let mut slots = Vec::with_capacity(descriptor.fields.len());
    for field in &descriptor.fields {
        let raw = map.get(field.name);
        let slot = match (field.mode, raw) {
            (FieldMode::Mandatory, None) | (FieldMode::Mandatory, Some(Json::Null)) => {
                return Err(IcError::invalid(format!("missing mandatory field {}", field.name)))
            }
            (FieldMode::Optional, None) | (FieldMode::Optional, Some(Json::Null)) => None,
            (FieldMode::SeqOf, None) => Some(Value::SeqOf(Vec::new())),
            (FieldMode::SeqOf, Some(v)) => {
                let items = v
                    .as_array()
                    .ok_or_else(|| IcError::invalid(format!("field {} expected a JSON array", field.name)))?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(unpack_field_value(registry, field, item)?);
                }
                let value = Value::SeqOf(out);
                validate_constraints(field, &value)?;
                Some(value)
            }
            (_, Some(v)) => {
                let value = unpack_field_value(registry, field, v)?;
                validate_constraints(field, &value)?;
                Some(value)
            }
        };
        slots.push(slot);
    }
    Ok(Value::Sequence(slots))
}

fn unpack_choice(registry: &Registry, descriptor: &Descriptor, json: &Json) -> Result<Value, IcError> {
    let map = json
        .as_object()
        .ok_or_else(|| IcError::invalid(format!("{}: expected a JSON object", descriptor.name)))?;
    let (key, raw) = map
        .iter()
        .next()
        .ok_or_else(|| IcError::invalid(format!("{}: choice object has no selector key", descriptor.name)))?;
    let (idx, field) = descriptor
        .fields
        .iter()
        .enumerate()
        .find(|(_, f)| f.name == key)
        .ok_or_else(|| IcError::invalid(format!("unknown choice variant '{key}' for {}", descriptor.name)))?;
    let inner = unpack_field_value(registry, field, raw)?;
    Ok(Value::Choice(idx as i32 + 1, Box::new(inner)))
}

fn unpack_field_value(registry: &Registry, field: &Field, json: &Json) -> Result<Value, IcError> {
    match field.semantic_type {
        SemanticType::Sequence | SemanticType::Choice | SemanticType::UntaggedChoice => {
            let nested = registry.get(field.nested.expect("nested field has no descriptor"));
            unpack(registry, &nested, json)
        }
        _ => unpack_scalar(field, json),
    }
}

fn unpack_scalar(field: &Field, json: &Json) -> Result<Value, IcError> {
    let invalid = || IcError::invalid(format!("field {} has the wrong JSON shape", field.name));
    Ok(match field.semantic_type {
        SemanticType::Bool => Value::Bool(json.as_bool().ok_or_else(invalid)?),
        SemanticType::I8 => Value::I8(json.as_i64().ok_or_else(invalid)? as i8),
        SemanticType::U8 => Value::U8(json.as_u64().ok_or_else(invalid)? as u8),
        SemanticType::I16 => Value::I16(json.as_i64().ok_or_else(invalid)? as i16),
        SemanticType::U16 => Value::U16(json.as_u64().ok_or_else(invalid)? as u16),
        SemanticType::I32 => Value::I32(json.as_i64().ok_or_else(invalid)? as i32),
        SemanticType::U32 => Value::U32(json.as_u64().ok_or_else(invalid)? as u32),
        SemanticType::I64 => Value::I64(json.as_i64().ok_or_else(invalid)?),
        SemanticType::U64 => Value::U64(json.as_u64().ok_or_else(invalid)?),
        SemanticType::Enum => Value::Enum(json.as_i64().ok_or_else(invalid)? as i32),
        SemanticType::Null => Value::Null,
        SemanticType::OptNull => Value::OptNull(json.as_bool().unwrap_or(false)),
        SemanticType::String => Value::String(json.as_str().ok_or_else(invalid)?.as_bytes().to_vec()),
        SemanticType::BitString => {
            let text = json.as_str().ok_or_else(invalid)?;
            let bits = base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| IcError::invalid(format!("field {}: bad base64: {e}", field.name)))?;
            Value::BitString(bits, 0)
        }
        SemanticType::OpenType => {
            let text = json.as_str().ok_or_else(invalid)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| IcError::invalid(format!("field {}: bad base64: {e}", field.name)))?;
            Value::OpenType(bytes)
        }
        SemanticType::Opaque => {
            let text = json.as_str().ok_or_else(invalid)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| IcError::invalid(format!("field {}: bad base64: {e}", field.name)))?;
            match field.opaque {
                Some(ops) => Value::Opaque((ops.unpack)(&bytes)?),
                None => Value::Opaque(bytes),
            }
        }
        SemanticType::Sequence | SemanticType::Choice | SemanticType::UntaggedChoice => {
            return Err(IcError::invalid(format!(
                "field {} is composite but was dispatched as scalar",
                field.name
            )))
        }
        SemanticType::Ext | SemanticType::Skip => Value::Null,
    })
}
