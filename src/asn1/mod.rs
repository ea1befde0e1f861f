//! The ASN.1 BER codec engine: schema descriptors, the in-memory value
//! tree, and the pack/unpack pair that walks both (spec.md §3-§4.2).

pub mod descriptor;
pub mod pack;
pub mod unpack;
pub mod value;

pub use descriptor::{
    ChoiceTagTable, ClassInfo, Constraints, Descriptor, DescriptorKind, EnumInfo, Field,
    FieldMode, OpaqueOps, SemanticType,
};
pub use pack::{pack, pack_size};
pub use unpack::unpack;
pub use value::{MultipartParts, Value};
