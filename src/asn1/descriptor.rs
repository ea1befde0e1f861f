//! The schema descriptor shared by the ASN.1 engine and the IOP XML
//! codec (spec.md §3 "Schema descriptor").
//!
//! A [`Descriptor`] is a recursive structure describing a composite
//! type: a kind, an ordered list of [`Field`]s, an optional extension
//! marker, a diagnostic byte-size, and (for choices) a precomputed
//! tag→index table. Descriptors reference each other by
//! [`DescriptorRef`] into the process-wide [`crate::registry::Registry`]
//! rather than by raw pointer, which is what lets mutually recursive
//! sequences exist at all (spec.md §9).

use crate::error::IcError;
use crate::registry::DescriptorRef;

/// What a [`Descriptor`] describes at the outermost level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Sequence,
    Choice,
    Set,
}

/// The semantic type of a field's payload, independent of how it is
/// physically carried (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Enum,
    Null,
    OptNull,
    String,
    BitString,
    OpenType,
    Opaque,
    Sequence,
    Choice,
    UntaggedChoice,
    Ext,
    Skip,
}

/// Presence discipline for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    Mandatory,
    Optional,
    SeqOf,
}

/// Per-category constraint metadata (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Constraints {
    None,
    IntRange {
        min: i64,
        max: i64,
        extended: bool,
    },
    StringLen {
        min: usize,
        max: usize,
        extended: bool,
    },
    SeqOfLen {
        min: usize,
        max: usize,
        extended: bool,
    },
    Enum(EnumInfo),
}

/// An enum's registered value domain (spec.md §4.2.2).
#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub values: Vec<i32>,
    pub ext_values: Vec<i32>,
    pub ext_defval: Option<i32>,
    pub extended: bool,
}

impl EnumInfo {
    /// Registers an enum's value domain, enforcing uniqueness of the
    /// default across both the base and extended value vectors
    /// (spec.md §4.2.2).
    pub fn new(
        values: Vec<i32>,
        ext_values: Vec<i32>,
        ext_defval: Option<i32>,
    ) -> Result<Self, IcError> {
        if let Some(def) = ext_defval {
            let count = values.iter().chain(ext_values.iter()).filter(|v| **v == def).count();
            if count > 1 {
                return Err(IcError::invalid(format!(
                    "enum default value {def} is not unique across values/ext_values"
                )));
            }
        }
        let extended = !ext_values.is_empty();
        Ok(Self {
            values,
            ext_values,
            ext_defval,
            extended,
        })
    }

    pub fn is_valid(&self, v: i32) -> bool {
        self.values.contains(&v) || self.ext_values.contains(&v)
    }

    /// Finalization sets the integer constraint to `[0, len-1]`
    /// (spec.md §4.2.2): registration freezes this bound once the enum
    /// is closed.
    pub fn int_range(&self) -> (i64, i64) {
        let len = self.values.len() + self.ext_values.len();
        (0, len.saturating_sub(1) as i64)
    }
}

/// User-supplied `(pack, unpack)` hooks for an `opaque` field
/// (spec.md §3 "for opaque: user-supplied triple `(size, pack,
/// unpack)`" — `size` is implicit here since Rust's `Vec<u8>` already
/// knows its own length).
#[derive(Clone, Copy)]
pub struct OpaqueOps {
    pub pack: fn(&[u8]) -> Vec<u8>,
    pub unpack: fn(&[u8]) -> Result<Vec<u8>, IcError>,
}

impl std::fmt::Debug for OpaqueOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OpaqueOps(..)")
    }
}

/// Class-polymorphism metadata consumed by the IOP XML codec
/// (spec.md §4.3); irrelevant to plain ASN.1 BER descriptors, hence
/// `Option`.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub is_class: bool,
    pub is_abstract: bool,
    pub is_private: bool,
    pub parent: Option<DescriptorRef>,
    /// Fully-qualified name used for `xsi:type` on pack and matched
    /// against the `type` attribute on unpack.
    pub fq_name: &'static str,
}

/// One field of a [`Descriptor`] (spec.md §3).
#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    /// Name of the in-memory carrier type; diagnostics only.
    pub carrier_type_name: &'static str,
    /// Byte offset into the parent value. Diagnostic metadata carried
    /// over from the original memory-offset design; this
    /// implementation addresses fields through the [`crate::asn1::value::Value`]
    /// tree rather than raw offsets (spec.md §9 redesign notes).
    pub byte_offset: usize,
    pub semantic_type: SemanticType,
    pub mode: FieldMode,
    /// Whether the carrier stores the value inline or by reference.
    pub pointed: bool,
    pub tag: u8,
    pub constraints: Constraints,
    pub opaque: Option<OpaqueOps>,
    pub is_extension: bool,
    pub is_open_type: bool,
    pub open_type_len: usize,
    /// For `sequence`/`choice`/`untagged-choice` fields, the nested
    /// descriptor.
    pub nested: Option<DescriptorRef>,
}

impl Field {
    /// A minimal mandatory scalar field, the common case; other
    /// builders (`Field::optional`, `Field::seq_of`, ...) start from
    /// this and override.
    pub fn scalar(name: &'static str, semantic_type: SemanticType, tag: u8) -> Self {
        Self {
            name,
            carrier_type_name: "",
            byte_offset: 0,
            semantic_type,
            mode: FieldMode::Mandatory,
            pointed: false,
            tag,
            constraints: Constraints::None,
            opaque: None,
            is_extension: false,
            is_open_type: false,
            open_type_len: 0,
            nested: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mode = FieldMode::Optional;
        self
    }

    pub fn seq_of(mut self) -> Self {
        self.mode = FieldMode::SeqOf;
        self
    }

    pub fn pointed(mut self) -> Self {
        self.pointed = true;
        self
    }

    pub fn extension(mut self) -> Self {
        self.is_extension = true;
        self
    }

    pub fn nested_in(mut self, r: DescriptorRef) -> Self {
        self.nested = Some(r);
        self
    }

    pub fn with_constraints(mut self, c: Constraints) -> Self {
        self.constraints = c;
        self
    }

    pub fn with_opaque(mut self, ops: OpaqueOps) -> Self {
        self.opaque = Some(ops);
        self
    }
}

/// Tag byte -> 1-based field index, used for O(1) choice dispatch
/// (spec.md §4.2.1). `None` entries have no registered variant.
pub type ChoiceTagTable = [Option<usize>; 256];

/// A recursive composite-type descriptor (spec.md §3).
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub name: &'static str,
    pub kind: DescriptorKind,
    pub fields: Vec<Field>,
    /// Index into `fields` of the first extension field, if any.
    pub extension_marker: Option<usize>,
    pub byte_size: usize,
    pub tag_table: Option<Box<ChoiceTagTable>>,
    pub class_info: Option<ClassInfo>,
}

impl Descriptor {
    /// Builds a `SEQUENCE`/`SET` descriptor and validates its
    /// invariants (spec.md §3): a seq-of field may only appear as the
    /// sole field of a seq-of descriptor; extension fields must be
    /// optional.
    pub fn sequence(
        name: &'static str,
        kind: DescriptorKind,
        fields: Vec<Field>,
    ) -> Result<Self, IcError> {
        assert!(kind != DescriptorKind::Choice);
        let seq_of_fields = fields.iter().filter(|f| f.mode == FieldMode::SeqOf).count();
        if seq_of_fields > 0 && fields.len() != 1 {
            return Err(IcError::invalid(format!(
                "descriptor {name}: a seq-of field must be the sole field of its descriptor"
            )));
        }
        let extension_marker = fields.iter().position(|f| f.is_extension);
        for f in &fields {
            if f.is_extension && f.mode != FieldMode::Optional {
                return Err(IcError::invalid(format!(
                    "descriptor {name}: extension field {} must be optional",
                    f.name
                )));
            }
        }
        Ok(Self {
            name,
            kind,
            fields,
            extension_marker,
            byte_size: 0,
            tag_table: None,
            class_info: None,
        })
    }

    /// Builds a `CHOICE` descriptor with no untagged-choice children,
    /// computing its tag→index table and rejecting duplicate tags
    /// (spec.md §4.2.1). Use [`Descriptor::choice_in_registry`] when any
    /// field is an `untagged-choice`.
    pub fn choice(name: &'static str, fields: Vec<Field>) -> Result<Self, IcError> {
        let mut table: Box<ChoiceTagTable> = Box::new([None; 256]);
        for (idx, f) in fields.iter().enumerate() {
            assert_ne!(
                f.semantic_type,
                SemanticType::UntaggedChoice,
                "untagged-choice field {} requires Descriptor::choice_in_registry",
                f.name
            );
            insert_tag(&mut table, f.tag, idx + 1)?;
        }
        Ok(Self {
            name,
            kind: DescriptorKind::Choice,
            fields,
            extension_marker: None,
            byte_size: 0,
            tag_table: Some(table),
            class_info: None,
        })
    }

    /// Builds a `CHOICE` descriptor that may contain `untagged-choice`
    /// fields. Untagged children flatten into the parent's tag table:
    /// every tag the nested choice dispatches on is copied into the
    /// parent table under the parent field's own (1-based) index
    /// (spec.md §4.2.1). The nested descriptor must already be defined
    /// in `registry`.
    pub fn choice_in_registry(
        name: &'static str,
        fields: Vec<Field>,
        registry: &crate::registry::Registry,
    ) -> Result<Self, IcError> {
        let mut table: Box<ChoiceTagTable> = Box::new([None; 256]);
        for (idx, f) in fields.iter().enumerate() {
            let parent_index = idx + 1;
            if f.semantic_type == SemanticType::UntaggedChoice {
                let nested_ref = f.nested.ok_or_else(|| {
                    IcError::invalid(format!(
                        "untagged-choice field {} has no nested descriptor",
                        f.name
                    ))
                })?;
                let nested = registry.get(nested_ref);
                let nested_table = nested.tag_table.ok_or_else(|| {
                    IcError::invalid(format!(
                        "untagged-choice field {} nests a non-choice descriptor",
                        f.name
                    ))
                })?;
                for (tag, entry) in nested_table.iter().enumerate() {
                    if entry.is_some() {
                        insert_tag(&mut table, tag as u8, parent_index)?;
                    }
                }
            } else {
                insert_tag(&mut table, f.tag, parent_index)?;
            }
        }
        Ok(Self {
            name,
            kind: DescriptorKind::Choice,
            fields,
            extension_marker: None,
            byte_size: 0,
            tag_table: Some(table),
            class_info: None,
        })
    }

    pub fn with_class_info(mut self, info: ClassInfo) -> Self {
        self.class_info = Some(info);
        self
    }
}

fn insert_tag(table: &mut ChoiceTagTable, tag: u8, index: usize) -> Result<(), IcError> {
    match table[tag as usize] {
        Some(existing) if existing != index => Err(IcError::invalid(format!(
            "choice tag collision: byte {tag:#04x} already maps to variant {existing}"
        ))),
        _ => {
            table[tag as usize] = Some(index);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_tag_collision_is_rejected() {
        let fields = vec![
            Field::scalar("a", SemanticType::I32, 0x80),
            Field::scalar("b", SemanticType::String, 0x80),
        ];
        assert!(Descriptor::choice("C", fields).is_err());
    }

    #[test]
    fn choice_tag_table_maps_first_byte_to_one_based_index() {
        let fields = vec![
            Field::scalar("a", SemanticType::I32, 0x80),
            Field::scalar("b", SemanticType::String, 0x81),
        ];
        let d = Descriptor::choice("C", fields).unwrap();
        let table = d.tag_table.unwrap();
        assert_eq!(table[0x80], Some(1));
        assert_eq!(table[0x81], Some(2));
    }

    #[test]
    fn seq_of_must_be_sole_field() {
        let fields = vec![
            Field::scalar("a", SemanticType::I32, 0x80),
            Field::scalar("b", SemanticType::I32, 0x81).seq_of(),
        ];
        assert!(Descriptor::sequence("S", DescriptorKind::Sequence, fields).is_err());
    }

    #[test]
    fn extension_field_must_be_optional() {
        let fields = vec![Field::scalar("a", SemanticType::I32, 0x80).extension()];
        assert!(Descriptor::sequence("S", DescriptorKind::Sequence, fields).is_err());
    }
}
