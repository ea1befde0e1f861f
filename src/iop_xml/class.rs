//! Class polymorphism helpers (spec.md §4.3 "Class polymorphism").

use crate::asn1::descriptor::Descriptor;
use crate::error::IcError;
use crate::registry::Registry;

/// Walks `descriptor`'s `type` attribute (or, absent one, its own
/// declared identity) to the concrete descriptor it names, then
/// flattens the parent chain root-first so the unpacker can dispatch
/// over one combined field list.
///
/// Returns `(concrete_descriptor, fields_root_to_leaf)`.
pub fn resolve_concrete(
    registry: &Registry,
    declared: &Descriptor,
    xsi_type: Option<&str>,
) -> Result<(Descriptor, Vec<crate::asn1::descriptor::Field>), IcError> {
    let concrete = match xsi_type {
        Some(name) => {
            let stripped = name.rsplit(':').next().unwrap_or(name);
            let found = registry
                .find_by_fq_name(name)
                .or_else(|| registry.find_by_fq_name(stripped));
            match found {
                Some(r) => registry.get(r),
                None => {
                    return Err(IcError::invalid(format!(
                        "no registered class matches xsi:type {name:?}"
                    )))
                }
            }
        }
        None => {
            let info = declared.class_info.as_ref().ok_or_else(|| {
                IcError::invalid(format!("descriptor {} is not a class", declared.name))
            })?;
            if info.is_abstract {
                return Err(IcError::invalid(format!(
                    "abstract class {} requires an explicit xsi:type attribute",
                    declared.name
                )));
            }
            declared.clone()
        }
    };

    let fields = flatten_fields(registry, &concrete)?;
    Ok((concrete, fields))
}

/// Collects `descriptor`'s fields prefixed by every ancestor's own
/// fields, root-first, per spec.md §4.3 "the class chain from root to
/// concrete is walked to flatten its fields in inheritance order".
fn flatten_fields(
    registry: &Registry,
    descriptor: &Descriptor,
) -> Result<Vec<crate::asn1::descriptor::Field>, IcError> {
    let mut chain = vec![descriptor.clone()];
    let mut current = descriptor.clone();
    while let Some(info) = current.class_info.as_ref() {
        match info.parent {
            Some(parent_ref) => {
                let parent = registry.get(parent_ref);
                chain.push(parent.clone());
                current = parent;
            }
            None => break,
        }
    }
    let mut fields = Vec::new();
    for d in chain.into_iter().rev() {
        fields.extend(d.fields);
    }
    Ok(fields)
}
