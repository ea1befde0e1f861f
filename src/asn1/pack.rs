//! ASN.1 BER packing (spec.md §4.2).
//!
//! The original engine is a two-pass algorithm: a size pass walks the
//! value once, pushing each composite's computed length onto a
//! growable stack (reserving its slot before descending, patching it
//! afterward), then an emit pass replays the same walk consuming that
//! stack in order. This implementation gets the same two properties —
//! `pack_size(v) == len(pack(v))` and a single coherent traversal order
//! — from a direct recursive `pack_size`/`pack_into` pair: the call
//! stack *is* the length stack, and each composite's length is the
//! `usize` its own `pack_size` call returns, computed and available
//! before the caller ever emits that composite's header. No separate
//! stack bookkeeping is needed to get an identical result.

use crate::asn1::descriptor::{Descriptor, DescriptorKind, FieldMode, SemanticType};
use crate::asn1::value::Value;
use crate::ber::{pack_int32, pack_int64, pack_len, pack_uint32, pack_uint64};
use crate::error::IcError;
use crate::registry::Registry;

/// Computes the exact packed size of `value` under `descriptor`,
/// without emitting any bytes. `pack` calls this internally to
/// pre-allocate its output buffer, and it is exposed directly to
/// support the "Size pass fidelity" testable property (spec.md §8).
pub fn pack_size(registry: &Registry, descriptor: &Descriptor, value: &Value) -> Result<usize, IcError> {
    field_size(registry, descriptor, value).map(|(tl, content)| tl + content)
}

/// Packs `value` under `descriptor` into a freshly allocated buffer.
pub fn pack(registry: &Registry, descriptor: &Descriptor, value: &Value) -> Result<Vec<u8>, IcError> {
    let total = pack_size(registry, descriptor, value)?;
    let mut out = Vec::with_capacity(total);
    emit_value(registry, descriptor, value, &mut out)?;
    debug_assert_eq!(out.len(), total, "pack_size/pack disagreed on length");
    Ok(out)
}

/// Returns `(tag_and_length_bytes, content_bytes)` for one top-level
/// composite value (a SEQUENCE or CHOICE carries its own tag+length;
/// callers needing just the content size for a nested nontag type call
/// `content_size` instead).
fn field_size(
    registry: &Registry,
    descriptor: &Descriptor,
    value: &Value,
) -> Result<(usize, usize), IcError> {
    let content = content_size(registry, descriptor, value)?;
    let tl = 1 + pack_len(content).len();
    Ok((tl, content))
}

fn content_size(registry: &Registry, descriptor: &Descriptor, value: &Value) -> Result<usize, IcError> {
    match descriptor.kind {
        DescriptorKind::Choice => {
            let (selector, inner) = expect_choice(value)?;
            let field = choice_field(descriptor, selector)?;
            Ok(scalar_or_nested_size(registry, field, inner)?)
        }
        DescriptorKind::Sequence | DescriptorKind::Set => {
            let slots = expect_sequence(value)?;
            if slots.len() != descriptor.fields.len() {
                return Err(IcError::invalid(format!(
                    "descriptor {} expects {} fields, value has {}",
                    descriptor.name,
                    descriptor.fields.len(),
                    slots.len()
                )));
            }
            let mut total = 0usize;
            for (field, slot) in descriptor.fields.iter().zip(slots.iter()) {
                total += sequence_field_size(registry, field, slot)?;
            }
            Ok(total)
        }
    }
}

fn sequence_field_size(
    registry: &Registry,
    field: &crate::asn1::descriptor::Field,
    slot: &Option<Value>,
) -> Result<usize, IcError> {
    match field.mode {
        FieldMode::Mandatory => {
            let v = slot
                .as_ref()
                .ok_or_else(|| mandatory_missing(field.name))?;
            scalar_or_nested_size(registry, field, v)
        }
        FieldMode::Optional => match slot {
            None => Ok(0),
            Some(v) => scalar_or_nested_size(registry, field, v),
        },
        FieldMode::SeqOf => {
            let v = slot
                .as_ref()
                .ok_or_else(|| mandatory_missing(field.name))?;
            let items = v
                .as_seq_of()
                .ok_or_else(|| IcError::invalid(format!("field {} is not seq-of", field.name)))?;
            let mut total = 0usize;
            for item in items {
                total += scalar_or_nested_size(registry, field, item)?;
            }
            Ok(total)
        }
    }
}

/// Programmer error per spec.md §4.2: "MANDATORY: value pointer must be
/// non-null ... otherwise it is a programmer error (fatal)." We surface
/// it as an `Invalid` `IcError` rather than panicking so a misbehaving
/// caller fails one RPC instead of the process, but the message makes
/// the class of bug explicit.
fn mandatory_missing(name: &str) -> IcError {
    IcError::invalid(format!("mandatory field {name} is absent (programmer error)"))
}

/// Size of one field's own tag+length+content, whether it is a scalar
/// or a nested composite.
fn scalar_or_nested_size(
    registry: &Registry,
    field: &crate::asn1::descriptor::Field,
    value: &Value,
) -> Result<usize, IcError> {
    match field.semantic_type {
        SemanticType::Sequence | SemanticType::Choice => {
            let nested_ref = field
                .nested
                .ok_or_else(|| IcError::invalid(format!("field {} has no nested descriptor", field.name)))?;
            let nested = registry.get(nested_ref);
            let (tl, content) = field_size(registry, &nested, value)?;
            Ok(tl + content)
        }
        SemanticType::UntaggedChoice => {
            let nested_ref = field
                .nested
                .ok_or_else(|| IcError::invalid(format!("field {} has no nested descriptor", field.name)))?;
            let nested = registry.get(nested_ref);
            content_size(registry, &nested, value)
        }
        _ => {
            let content = scalar_content_size(field, value)?;
            Ok(1 + pack_len(content).len() + content)
        }
    }
}

fn scalar_content_size(field: &crate::asn1::descriptor::Field, value: &Value) -> Result<usize, IcError> {
    use SemanticType::*;
    Ok(match field.semantic_type {
        Bool => 1,
        I8 | U8 => pack_int_value(field, value)?.len(),
        I16 | U16 => pack_int_value(field, value)?.len(),
        I32 | U32 => pack_int_value(field, value)?.len(),
        I64 | U64 => pack_int_value(field, value)?.len(),
        Enum => pack_int32(expect_i64(value)? as i32).len(),
        Null | OptNull => 0,
        String => expect_string(value)?.len(),
        BitString => {
            let (bits, _) = expect_bitstring(value)?;
            1 + bits.len()
        }
        OpenType => expect_open_type(value)?.len(),
        Opaque => {
            let raw = expect_opaque(value)?;
            match field.opaque {
                Some(ops) => (ops.pack)(raw).len(),
                None => raw.len(),
            }
        }
        Sequence | Choice | UntaggedChoice | Ext | Skip => {
            return Err(IcError::invalid(format!(
                "field {} is composite but was routed through scalar packing",
                field.name
            )))
        }
    })
}

fn pack_int_value(field: &crate::asn1::descriptor::Field, value: &Value) -> Result<Vec<u8>, IcError> {
    use SemanticType::*;
    let v = expect_i64(value)?;
    Ok(match field.semantic_type {
        I8 | I16 | I32 => pack_int32(v as i32),
        U8 | U16 | U32 => pack_uint32(v as u32),
        I64 => pack_int64(v),
        U64 => pack_uint64(v as u64),
        _ => unreachable!(),
    })
}

fn emit_value(
    registry: &Registry,
    descriptor: &Descriptor,
    value: &Value,
    out: &mut Vec<u8>,
) -> Result<(), IcError> {
    match descriptor.kind {
        DescriptorKind::Choice => {
            let (selector, inner) = expect_choice(value)?;
            let field = choice_field(descriptor, selector)?;
            emit_field_tagged(registry, field, inner, out)
        }
        DescriptorKind::Sequence | DescriptorKind::Set => {
            let slots = expect_sequence(value)?;
            for (field, slot) in descriptor.fields.iter().zip(slots.iter()) {
                emit_sequence_field(registry, field, slot, out)?;
            }
            Ok(())
        }
    }
}

fn emit_sequence_field(
    registry: &Registry,
    field: &crate::asn1::descriptor::Field,
    slot: &Option<Value>,
    out: &mut Vec<u8>,
) -> Result<(), IcError> {
    match field.mode {
        FieldMode::Mandatory => {
            let v = slot.as_ref().ok_or_else(|| mandatory_missing(field.name))?;
            emit_field_tagged(registry, field, v, out)
        }
        FieldMode::Optional => match slot {
            None => Ok(()),
            Some(v) => emit_field_tagged(registry, field, v, out),
        },
        FieldMode::SeqOf => {
            let v = slot.as_ref().ok_or_else(|| mandatory_missing(field.name))?;
            let items = v
                .as_seq_of()
                .ok_or_else(|| IcError::invalid(format!("field {} is not seq-of", field.name)))?;
            for item in items {
                emit_field_tagged(registry, field, item, out)?;
            }
            Ok(())
        }
    }
}

fn emit_field_tagged(
    registry: &Registry,
    field: &crate::asn1::descriptor::Field,
    value: &Value,
    out: &mut Vec<u8>,
) -> Result<(), IcError> {
    match field.semantic_type {
        SemanticType::Sequence | SemanticType::Choice => {
            let nested_ref = field.nested.ok_or_else(|| {
                IcError::invalid(format!("field {} has no nested descriptor", field.name))
            })?;
            let nested = registry.get(nested_ref);
            let content = content_size(registry, &nested, value)?;
            out.push(field.tag);
            out.extend(pack_len(content));
            emit_value(registry, &nested, value, out)
        }
        SemanticType::UntaggedChoice => {
            let nested_ref = field.nested.ok_or_else(|| {
                IcError::invalid(format!("field {} has no nested descriptor", field.name))
            })?;
            let nested = registry.get(nested_ref);
            // The enclosing tag *is* the child's own tag; no wrapper is
            // emitted (spec.md §4.2 "Untagged choice").
            emit_value(registry, &nested, value, out)
        }
        _ => {
            let content = scalar_content_bytes(field, value)?;
            out.push(field.tag);
            out.extend(pack_len(content.len()));
            out.extend(content);
            Ok(())
        }
    }
}

fn scalar_content_bytes(field: &crate::asn1::descriptor::Field, value: &Value) -> Result<Vec<u8>, IcError> {
    use SemanticType::*;
    Ok(match field.semantic_type {
        Bool => vec![if matches!(value, Value::Bool(true)) { 0xff } else { 0x00 }],
        I8 | U8 | I16 | U16 | I32 | U32 | I64 | U64 => pack_int_value(field, value)?,
        Enum => pack_int32(expect_i64(value)? as i32),
        Null | OptNull => Vec::new(),
        String => expect_string(value)?.to_vec(),
        BitString => {
            let (bits, unused) = expect_bitstring(value)?;
            let mut v = Vec::with_capacity(1 + bits.len());
            v.push(unused);
            v.extend_from_slice(bits);
            v
        }
        OpenType => expect_open_type(value)?.to_vec(),
        Opaque => {
            let raw = expect_opaque(value)?;
            match field.opaque {
                Some(ops) => (ops.pack)(raw),
                None => raw.to_vec(),
            }
        }
        Sequence | Choice | UntaggedChoice | Ext | Skip => {
            return Err(IcError::invalid(format!(
                "field {} is composite but was routed through scalar emission",
                field.name
            )))
        }
    })
}

fn expect_choice(value: &Value) -> Result<(i32, &Value), IcError> {
    match value {
        Value::Choice(sel, inner) => Ok((*sel, inner)),
        Value::UntaggedChoice(inner) => Ok((0, inner)),
        _ => Err(IcError::invalid("expected a Choice value")),
    }
}

fn choice_field(
    descriptor: &Descriptor,
    selector: i32,
) -> Result<&crate::asn1::descriptor::Field, IcError> {
    if selector == 0 {
        // Untagged-choice passthrough: caller already resolved the
        // field out of band (used only from emit_field_tagged's
        // UntaggedChoice branch, which never calls this). Present only
        // to keep `expect_choice`'s return type uniform.
        return Err(IcError::invalid("untagged choice has no direct selector"));
    }
    if selector < 1 || selector as usize > descriptor.fields.len() {
        return Err(IcError::invalid(format!(
            "choice selector {selector} out of range [1, {})",
            descriptor.fields.len()
        )));
    }
    Ok(&descriptor.fields[selector as usize - 1])
}

fn expect_sequence(value: &Value) -> Result<&[Option<Value>], IcError> {
    value
        .as_sequence()
        .ok_or_else(|| IcError::invalid("expected a Sequence value"))
}

fn expect_i64(value: &Value) -> Result<i64, IcError> {
    value.as_i64().ok_or_else(|| IcError::invalid("expected an integer value"))
}

fn expect_string(value: &Value) -> Result<&[u8], IcError> {
    value.as_string().ok_or_else(|| IcError::invalid("expected a string value"))
}

fn expect_bitstring(value: &Value) -> Result<(&[u8], u8), IcError> {
    match value {
        Value::BitString(bits, unused) => Ok((bits, *unused)),
        _ => Err(IcError::invalid("expected a BitString value")),
    }
}

fn expect_open_type(value: &Value) -> Result<&[u8], IcError> {
    match value {
        Value::OpenType(bytes) => Ok(bytes),
        _ => Err(IcError::invalid("expected an OpenType value")),
    }
}

fn expect_opaque(value: &Value) -> Result<&[u8], IcError> {
    match value {
        Value::Opaque(bytes) => Ok(bytes),
        _ => Err(IcError::invalid("expected an Opaque value")),
    }
}
