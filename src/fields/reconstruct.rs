//! Rebuilding extraction results from (possibly edited) fields.

use serde_json::Map;

use super::{FieldDescriptor, RootKind, StructureMap};
use crate::prelude::*;

/// Builds a nested extraction result from a [`StructureMap`] and a series of
/// field writes.
///
/// The skeleton (sections, arrays of the right length, empty objects) is
/// allocated up front. Each [`StructureBuilder::apply`] then writes exactly one
/// leaf, so applying fields from several pages only overwrites a field when
/// two pages carry the same path. The last write wins.
#[derive(Debug)]
pub struct StructureBuilder {
    structure_map: StructureMap,
    sections: Vec<Map<String, Value>>,
}

impl StructureBuilder {
    /// Allocate an empty skeleton.
    pub fn new(structure_map: StructureMap) -> Self {
        let section_count = structure_map
            .roots
            .values()
            .map(|shape| shape.section_idx + 1)
            .max()
            .unwrap_or(0)
            .max(structure_map.section_count);
        let mut sections = vec![Map::new(); section_count];
        for (root, shape) in &structure_map.roots {
            let skeleton = match shape.kind {
                RootKind::Array { length } => {
                    Value::Array(vec![Value::Object(Map::new()); length])
                }
                RootKind::Object => Value::Object(Map::new()),
                // Written directly by `apply`.
                RootKind::Simple => continue,
            };
            sections[shape.section_idx].insert(root.clone(), skeleton);
        }
        Self {
            structure_map,
            sections,
        }
    }

    /// Write one field into the skeleton.
    pub fn apply(&mut self, field: &FieldDescriptor) -> Result<()> {
        let components = &field.path_components;
        let shape = self
            .structure_map
            .roots
            .get(&components.root)
            .ok_or_else(|| {
                anyhow!(
                    "{} refers to unknown root {:?}",
                    field.field_path,
                    components.root
                )
            })?;
        let section = &mut self.sections[shape.section_idx];
        let leaf = leaf_value(field);

        match (&shape.kind, components.array_index, &components.field) {
            (RootKind::Array { .. }, Some(index), Some(name)) => {
                let record = section
                    .get_mut(&components.root)
                    .and_then(Value::as_array_mut)
                    .and_then(|records| records.get_mut(index))
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| {
                        anyhow!("{} is outside the array", field.field_path)
                    })?;
                record.insert(name.clone(), leaf);
            }
            (RootKind::Object, None, Some(name)) => {
                let record = section
                    .get_mut(&components.root)
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| anyhow!("{} has no parent object", field.field_path))?;
                record.insert(name.clone(), leaf);
            }
            (RootKind::Simple, None, None) => {
                section.insert(components.root.clone(), leaf);
            }
            (kind, _, _) => {
                return Err(anyhow!(
                    "{} does not match the {:?} shape of {:?}",
                    field.field_path,
                    kind,
                    components.root
                ));
            }
        }
        Ok(())
    }

    /// Return the finished result as a JSON array of sections.
    pub fn finish(self) -> Value {
        Value::Array(self.sections.into_iter().map(Value::Object).collect())
    }
}

/// Rebuild a complete extraction result. Fails on the first field that does
/// not fit `structure_map`.
pub fn reconstruct(structure_map: &StructureMap, fields: &[FieldDescriptor]) -> Result<Value> {
    let mut builder = StructureBuilder::new(structure_map.clone());
    for field in fields {
        builder.apply(field)?;
    }
    Ok(builder.finish())
}

/// The `{value, confidence, geometry?}` object stored at each leaf.
fn leaf_value(field: &FieldDescriptor) -> Value {
    let mut leaf = Map::new();
    leaf.insert("value".to_owned(), field.value.clone());
    leaf.insert("confidence".to_owned(), Value::from(field.confidence));
    if let Some(geometry) = &field.geometry {
        leaf.insert("geometry".to_owned(), Value::Array(geometry.clone()));
    }
    Value::Object(leaf)
}
