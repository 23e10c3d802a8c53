//! Flattening extraction results into reviewable fields.

use std::collections::BTreeMap;

use schemars::JsonSchema;

use super::{ExtractionResult, Field, Record, SectionValue};
use crate::prelude::*;

/// Where a field lives in the original structure.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct PathComponents {
    /// The top-level name in the section.
    pub root: String,

    /// The element index, for fields inside an array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<usize>,

    /// The member name, for fields inside an object or array element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl PathComponents {
    /// Format as `root`, `root.field` or `root[2].field`.
    pub fn field_path(&self) -> String {
        let mut path = self.root.clone();
        if let Some(index) = self.array_index {
            path.push_str(&format!("[{index}]"));
        }
        if let Some(field) = &self.field {
            path.push('.');
            path.push_str(field);
        }
        path
    }
}

/// One reviewable field.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct FieldDescriptor {
    /// Fully-qualified path, unique within one flattening.
    pub field_path: String,

    /// The leaf name, for display.
    pub display_name: String,

    /// The extracted (or edited) value.
    pub value: Value,

    /// Extraction confidence, between 0.0 and 1.0.
    pub confidence: f64,

    /// Zero-based page the field appears on.
    pub page: u32,

    /// Positional geometry, without page annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Vec<Value>>,

    /// How to find this field in the original structure.
    pub path_components: PathComponents,
}

/// The shape of one top-level name.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RootKind {
    /// An array with `length` elements.
    Array { length: usize },
    /// An object of fields.
    Object,
    /// A single field.
    Simple,
}

/// Where a top-level name lives, and what shape it has.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct RootShape {
    /// Index of the section containing this name.
    pub section_idx: usize,

    #[serde(flatten)]
    pub kind: RootKind,
}

/// The shape of an extraction result, without any values. Enough to build an
/// empty skeleton before pouring fields back in.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct StructureMap {
    /// How many sections the original result had.
    pub section_count: usize,

    /// Every top-level name we flattened.
    pub roots: BTreeMap<String, RootShape>,
}

impl StructureMap {
    /// Add any roots from `other` that we don't already know about. Used when
    /// combining several pages that were flattened from the same result.
    ///
    /// Arrays keep the longest length seen, so every page's records fit.
    pub fn merge(&mut self, other: &StructureMap) {
        self.section_count = self.section_count.max(other.section_count);
        for (name, shape) in &other.roots {
            let existing = self
                .roots
                .entry(name.clone())
                .or_insert_with(|| shape.clone());
            if let (
                RootKind::Array { length },
                RootKind::Array {
                    length: other_length,
                },
            ) = (&mut existing.kind, &shape.kind)
            {
                *length = (*length).max(*other_length);
            }
        }
    }
}

/// The output of [`flatten`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Flattened {
    /// Every confidence-bearing field, in document order.
    pub fields: Vec<FieldDescriptor>,

    /// The shape of the original result.
    pub structure_map: StructureMap,

    /// Was any field strictly below the threshold?
    pub has_low_confidence: bool,
}

/// Flatten an extraction result into reviewable fields.
///
/// A single field below `threshold` marks the whole result as low confidence.
/// A confidence exactly equal to `threshold` is fine.
pub fn flatten(result: &ExtractionResult, threshold: f64) -> Flattened {
    let mut state = FlattenState {
        threshold,
        fields: vec![],
        structure_map: StructureMap {
            section_count: result.sections.len(),
            roots: BTreeMap::new(),
        },
        has_low_confidence: false,
    };

    for (section_idx, section) in result.sections.iter().enumerate() {
        for (root, value) in &section.entries {
            if state.structure_map.roots.contains_key(root) {
                warn!(%root, section_idx, "Skipping duplicate top-level name");
                continue;
            }
            let kind = match value {
                SectionValue::Array(records) => {
                    for (index, record) in records.iter().enumerate() {
                        state.push_record(root, Some(index), record);
                    }
                    RootKind::Array {
                        length: records.len(),
                    }
                }
                SectionValue::Object(record) => {
                    state.push_record(root, None, record);
                    RootKind::Object
                }
                SectionValue::Simple(field) => {
                    let components = PathComponents {
                        root: root.clone(),
                        array_index: None,
                        field: None,
                    };
                    state.push_field(components, root, field, None);
                    RootKind::Simple
                }
            };
            state
                .structure_map
                .roots
                .insert(root.clone(), RootShape { section_idx, kind });
        }
    }

    Flattened {
        fields: state.fields,
        structure_map: state.structure_map,
        has_low_confidence: state.has_low_confidence,
    }
}

/// Flatten a raw JSON extraction result.
pub fn flatten_json(value: &Value, threshold: f64) -> Result<Flattened> {
    let result = ExtractionResult::from_json(value)?;
    Ok(flatten(&result, threshold))
}

/// Accumulated output of [`flatten`].
struct FlattenState {
    threshold: f64,
    fields: Vec<FieldDescriptor>,
    structure_map: StructureMap,
    has_low_confidence: bool,
}

impl FlattenState {
    fn push_record(&mut self, root: &str, array_index: Option<usize>, record: &Record) {
        for (name, field) in &record.fields {
            let components = PathComponents {
                root: root.to_owned(),
                array_index,
                field: Some(name.clone()),
            };
            self.push_field(components, name, field, record.record_page);
        }
    }

    fn push_field(
        &mut self,
        path_components: PathComponents,
        display_name: &str,
        field: &Field,
        default_page: Option<u64>,
    ) {
        let field_path = path_components.field_path();
        if field.confidence < self.threshold {
            debug!(
                %field_path,
                confidence = field.confidence,
                threshold = self.threshold,
                "Low confidence field"
            );
            self.has_low_confidence = true;
        }
        let one_based_page = field.geometry_page.or(default_page).unwrap_or(1);
        self.fields.push(FieldDescriptor {
            field_path,
            display_name: display_name.to_owned(),
            value: field.value.clone(),
            confidence: field.confidence,
            page: u32::try_from(one_based_page.saturating_sub(1)).unwrap_or(u32::MAX),
            geometry: field.geometry.clone(),
            path_components,
        });
    }
}
