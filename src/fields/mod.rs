//! Extraction results and their reviewable, flattened form.
//!
//! An extraction result is an ordered list of "sections". Each section maps a
//! top-level name to one of three shapes:
//!
//! 1. A simple field: `{"value": "Jane", "confidence": 0.93, "geometry": [...]}`.
//! 2. An object whose members are simple fields.
//! 3. An array of such objects.
//!
//! We discriminate these shapes once, in [`SectionValue::from_json`], and work
//! with typed values after that. [`flatten`] turns a parsed result into a list
//! of [`FieldDescriptor`]s that a reviewer can edit, and [`reconstruct`] pours
//! edited descriptors back into the original shape.

use serde_json::Map;

use crate::prelude::*;

pub mod flatten;
pub mod reconstruct;

pub use self::{
    flatten::{
        FieldDescriptor, Flattened, PathComponents, RootKind, RootShape, StructureMap,
        flatten,
    },
    reconstruct::{StructureBuilder, reconstruct},
};

/// A single confidence-bearing value.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// The extracted value. Missing values are treated as an empty string.
    pub value: Value,

    /// How sure the extractor was, between 0.0 and 1.0.
    pub confidence: f64,

    /// Positional geometry, with page annotations removed. `None` if the field
    /// had no geometry, or if the geometry was not a list.
    pub geometry: Option<Vec<Value>>,

    /// The one-based page carried by the geometry, if any entry had one.
    pub geometry_page: Option<u64>,
}

impl Field {
    /// Parse a field from an object known to contain a `confidence` key.
    fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let confidence = obj
            .get("confidence")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                anyhow!("confidence is not a number: {:?}", obj.get("confidence"))
            })?;
        let (geometry, geometry_page) = match obj.get("geometry") {
            Some(Value::Array(items)) => {
                (Some(strip_geometry_pages(items)), page_from_geometry(items))
            }
            _ => (None, None),
        };
        Ok(Self {
            value: obj
                .get("value")
                .cloned()
                .unwrap_or_else(|| Value::String(String::new())),
            confidence,
            geometry,
            geometry_page,
        })
    }
}

/// An object of simple fields, either standalone or as an array element.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// Confidence-bearing members, in document order. Members without a
    /// `confidence` key are metadata and are not kept.
    pub fields: Vec<(String, Field)>,

    /// The one-based page of the first member geometry that is not on page 1.
    /// Members without geometry of their own inherit this page.
    pub record_page: Option<u64>,
}

impl Record {
    fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let mut record = Record::default();
        for (name, member) in obj {
            let Value::Object(member) = member else {
                continue;
            };
            if record.record_page.is_none() {
                if let Some(Value::Array(geometry)) = member.get("geometry") {
                    record.record_page =
                        page_from_geometry(geometry).filter(|&page| page != 1);
                }
            }
            if member.contains_key("confidence") {
                let field = Field::from_json(member)
                    .with_context(|| format!("invalid field {name:?}"))?;
                record.fields.push((name.clone(), field));
            }
        }
        Ok(record)
    }
}

/// The value stored under one top-level name of a section.
#[derive(Clone, Debug, PartialEq)]
pub enum SectionValue {
    /// A list of records, like a table of line items.
    Array(Vec<Record>),
    /// A single record of named fields.
    Object(Record),
    /// One field.
    Simple(Field),
}

impl SectionValue {
    /// Classify a JSON value by shape. Returns `None` for values that are not
    /// reviewable at all, such as bare strings.
    pub fn from_json(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    match item {
                        Value::Object(obj) => records.push(
                            Record::from_json(obj)
                                .with_context(|| format!("invalid array element {idx}"))?,
                        ),
                        other => {
                            // Keep the slot so array indices stay stable.
                            warn!(idx, ?other, "Array element is not an object");
                            records.push(Record::default());
                        }
                    }
                }
                Ok(Some(Self::Array(records)))
            }
            Value::Object(obj) if obj.contains_key("confidence") => {
                Ok(Some(Self::Simple(Field::from_json(obj)?)))
            }
            Value::Object(obj) => Ok(Some(Self::Object(Record::from_json(obj)?))),
            _ => Ok(None),
        }
    }
}

/// One section of an extraction result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Section {
    /// Top-level names and their values, in document order.
    pub entries: Vec<(String, SectionValue)>,
}

/// A parsed extraction result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractionResult {
    pub sections: Vec<Section>,
}

impl ExtractionResult {
    /// Parse an extraction result from a JSON array of section objects.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Array(sections) = value else {
            return Err(anyhow!("extraction result must be an array of sections"));
        };
        let mut result = ExtractionResult::default();
        for (section_idx, section) in sections.iter().enumerate() {
            let Value::Object(section) = section else {
                return Err(anyhow!("section {section_idx} is not an object"));
            };
            let mut entries = vec![];
            for (name, value) in section {
                let parsed = SectionValue::from_json(value).with_context(|| {
                    format!("invalid value for {name:?} in section {section_idx}")
                })?;
                match parsed {
                    Some(parsed) => entries.push((name.clone(), parsed)),
                    None => debug!(%name, section_idx, "Skipping non-reviewable value"),
                }
            }
            result.sections.push(Section { entries });
        }
        Ok(result)
    }
}

/// Find the one-based page of the first geometry entry that has one.
fn page_from_geometry(geometry: &[Value]) -> Option<u64> {
    geometry
        .iter()
        .find_map(|item| item.get("page"))
        .and_then(Value::as_u64)
}

/// Copy geometry, removing the `page` key from each entry.
fn strip_geometry_pages(geometry: &[Value]) -> Vec<Value> {
    geometry
        .iter()
        .map(|item| {
            let mut item = item.clone();
            if let Value::Object(obj) = &mut item {
                obj.remove("page");
            }
            item
        })
        .collect()
}
