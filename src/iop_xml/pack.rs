//! IOP XML packing (spec.md §4.3 "Packing is straightforward forward
//! traversal; class pack emits `xsi:type` attribute using the
//! concrete class's fully-qualified name.").

use base64::Engine;

use crate::asn1::descriptor::{Descriptor, DescriptorKind, Field, FieldMode, SemanticType};
use crate::asn1::value::Value;
use crate::error::IcError;
use crate::iop_xml::writer::XmlWriter;
use crate::registry::Registry;

/// Options governing packing's private-field behavior (spec.md §4.3
/// "Private-field filter").
#[derive(Debug, Clone, Copy, Default)]
pub struct PackOptions {
    pub skip_private: bool,
}

/// Packs `value` under `descriptor` as a complete XML document rooted
/// at an element named after the descriptor.
pub fn pack(
    registry: &Registry,
    descriptor: &Descriptor,
    value: &Value,
    options: PackOptions,
) -> Result<Vec<u8>, IcError> {
    let mut w = XmlWriter::new();
    emit_element(registry, descriptor, descriptor.name, value, options, &mut w)?;
    Ok(w.into_bytes())
}

fn emit_element(
    registry: &Registry,
    descriptor: &Descriptor,
    tag: &str,
    value: &Value,
    options: PackOptions,
    w: &mut XmlWriter,
) -> Result<(), IcError> {
    let mut attrs: Vec<(&str, &str)> = Vec::new();
    if let Some(info) = &descriptor.class_info {
        if info.is_private && options.skip_private {
            return Ok(());
        }
        attrs.push(("xsi:type", info.fq_name));
    }
    w.start(tag, &attrs)?;
    match descriptor.kind {
        DescriptorKind::Sequence | DescriptorKind::Set => {
            let slots = value
                .as_sequence()
                .ok_or_else(|| IcError::invalid("expected a Sequence value"))?;
            for (field, slot) in descriptor.fields.iter().zip(slots.iter()) {
                emit_field(registry, field, slot, options, w)?;
            }
        }
        DescriptorKind::Choice => {
            let (selector, inner) = match value {
                Value::Choice(sel, inner) => (*sel, inner.as_ref()),
                _ => return Err(IcError::invalid("expected a Choice value")),
            };
            if selector < 1 || selector as usize > descriptor.fields.len() {
                return Err(IcError::invalid("choice selector out of range"));
            }
            let field = &descriptor.fields[selector as usize - 1];
            emit_field(registry, field, &Some(inner.clone()), options, w)?;
        }
    }
    w.end(tag)?;
    Ok(())
}

fn emit_field(
    registry: &Registry,
    field: &Field,
    slot: &Option<Value>,
    options: PackOptions,
    w: &mut XmlWriter,
) -> Result<(), IcError> {
    match field.mode {
        FieldMode::Mandatory => {
            let v = slot
                .as_ref()
                .ok_or_else(|| IcError::invalid(format!("mandatory field {} is absent", field.name)))?;
            emit_field_value(registry, field, v, options, w)
        }
        FieldMode::Optional => match slot {
            None => Ok(()),
            Some(v) => emit_field_value(registry, field, v, options, w),
        },
        FieldMode::SeqOf => {
            let v = slot
                .as_ref()
                .ok_or_else(|| IcError::invalid(format!("mandatory field {} is absent", field.name)))?;
            let items = v
                .as_seq_of()
                .ok_or_else(|| IcError::invalid(format!("field {} is not seq-of", field.name)))?;
            for item in items {
                emit_field_value(registry, field, item, options, w)?;
            }
            Ok(())
        }
    }
}

fn emit_field_value(
    registry: &Registry,
    field: &Field,
    value: &Value,
    options: PackOptions,
    w: &mut XmlWriter,
) -> Result<(), IcError> {
    match field.semantic_type {
        SemanticType::Sequence | SemanticType::Choice => {
            let nested_ref = field
                .nested
                .ok_or_else(|| IcError::invalid(format!("field {} has no nested descriptor", field.name)))?;
            let nested = registry.get(nested_ref);
            emit_element(registry, &nested, field.name, value, options, w)
        }
        SemanticType::UntaggedChoice => {
            let nested_ref = field
                .nested
                .ok_or_else(|| IcError::invalid(format!("field {} has no nested descriptor", field.name)))?;
            let nested = registry.get(nested_ref);
            let wrapped = match value {
                Value::UntaggedChoice(inner) => Value::Choice(choice_selector(&nested, inner)?, inner.clone()),
                other => other.clone(),
            };
            emit_element(registry, &nested, field.name, &wrapped, options, w)
        }
        _ => {
            w.start(field.name, &[])?;
            emit_scalar_text(field, value, w)?;
            w.end(field.name)?;
            Ok(())
        }
    }
}

/// Untagged choice values don't carry their own selector (they flatten
/// directly to the chosen payload); re-derive it from the nested
/// descriptor's own tag so the XML element name can still be chosen.
/// BER tags have no XML analogue, so this falls back to picking the
/// first field whose semantic type matches the payload's shape.
fn choice_selector(nested: &Descriptor, payload: &Value) -> Result<i32, IcError> {
    for (idx, f) in nested.fields.iter().enumerate() {
        if value_matches_semantic_type(f.semantic_type, payload) {
            return Ok(idx as i32 + 1);
        }
    }
    Err(IcError::invalid(format!(
        "no field of untagged choice {} matches the payload shape",
        nested.name
    )))
}

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

fn emit_scalar_text(field: &Field, value: &Value, w: &mut XmlWriter) -> Result<(), IcError> {
    use SemanticType::*;
    match field.semantic_type {
        Bool => w.text(if matches!(value, Value::Bool(true)) { "true" } else { "false" }),
        I8 | U8 | I16 | U16 | I32 | U32 | I64 | U64 | Enum => {
            let v = value.as_i64().ok_or_else(|| IcError::invalid("expected an integer value"))?;
            w.text(&v.to_string())
        }
        Null | OptNull => Ok(()),
        String => {
            let s = value.as_string().ok_or_else(|| IcError::invalid("expected a string value"))?;
            w.text(&std::string::String::from_utf8_lossy(s))
        }
        BitString => {
            let (bits, _) = match value {
                Value::BitString(b, u) => (b, u),
                _ => return Err(IcError::invalid("expected a BitString value")),
            };
            w.text(&base64::engine::general_purpose::STANDARD.encode(bits))
        }
        OpenType => match value {
            Value::OpenType(raw) => w.raw_inner(&std::string::String::from_utf8_lossy(raw)),
            _ => Err(IcError::invalid("expected an OpenType value")),
        },
        Opaque => {
            let raw = match value {
                Value::Opaque(raw) => raw,
                _ => return Err(IcError::invalid("expected an Opaque value")),
            };
            let encoded = match field.opaque {
                Some(ops) => (ops.pack)(raw),
                None => raw.clone(),
            };
            w.text(&base64::engine::general_purpose::STANDARD.encode(encoded))
        }
        Sequence | Choice | UntaggedChoice | Ext | Skip => Err(IcError::invalid(format!(
            "field {} is composite but was routed through scalar text emission",
            field.name
        ))),
    }
}
