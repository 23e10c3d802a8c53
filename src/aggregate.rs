//! Combining every page's machine and human output into document-level
//! results.
//!
//! For a document `id` uploaded as `uploads/form.pdf` with pages 0 and 1, we
//! write:
//!
//! - `complete/{id}-form-pages-0-1-output.csv`: one header row and one value
//!   row, with columns like `page0_name-ai` and `page1_name-human`.
//! - `complete/{id}-form-pages-0-1-ai-responses.json`: every page's raw
//!   machine output, keyed by `page_{n}_ai`.
//! - `complete/{id}-form-pages-0-1-human-responses.json`: only when someone
//!   reviewed at least one page.

use std::sync::Arc;

use schemars::JsonSchema;
use serde_json::Map;

use crate::{
    fields::{StructureBuilder, StructureMap},
    pipeline::{
        PageKey, WorkStatus, ai_output_key, file_stem, human_output_key, output_extension,
        page_prefix, review::HumanPageOutput,
    },
    prelude::*,
    stores::{ObjectStore, ObjectUri, read_json, write_json},
};

/// A request to aggregate one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct AggregateRequest {
    pub bucket: String,

    /// The document ID.
    pub id: String,

    /// The key of the original upload.
    pub key: String,

    /// The document's pages.
    #[serde(default, alias = "multi_page_indices")]
    pub image_keys: Vec<PageKey>,
}

/// What [`ResultAggregator::aggregate`] produced.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct AggregateOutput {
    pub id: String,
    pub status: WorkStatus,
    pub errors: Vec<String>,
    pub bucket: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_responses_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_responses_key: Option<String>,

    /// Pages which had a human review.
    pub processed_pages: Vec<u32>,
}

/// The contents of `*-human-responses.json`.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct HumanResponses {
    /// The first page's machine output, with every reviewed answer merged in.
    pub human_responses: Value,

    /// The original extraction structure, rebuilt from reviewed fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconstructed: Option<Value>,

    /// Which pages had a human review, as `page_{n}_human`.
    pub processed_pages: Vec<String>,
}

/// Builds document-level outputs from per-page artifacts.
#[derive(Clone)]
pub struct ResultAggregator {
    objects: Arc<dyn ObjectStore>,
}

impl ResultAggregator {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Aggregate a document.
    ///
    /// This never fails outright. Unreadable pages are skipped and reported in
    /// [`AggregateOutput::errors`], and everything we could build is written.
    #[instrument(level = "debug", skip_all, fields(document_id = %request.id))]
    pub async fn aggregate(&self, request: &AggregateRequest) -> AggregateOutput {
        let mut output = AggregateOutput {
            id: request.id.clone(),
            status: WorkStatus::Ok,
            errors: vec![],
            bucket: request.bucket.clone(),
            csv_key: None,
            ai_responses_key: None,
            human_responses_key: None,
            processed_pages: vec![],
        };

        let mut pages = request.image_keys.clone();
        pages.sort();
        pages.dedup();
        let extension = output_extension(&request.key);

        // Gather whatever each page has.
        let mut ai_pages: Vec<(u32, Value)> = vec![];
        let mut human_pages: Vec<(u32, HumanPageOutput)> = vec![];
        for &page in &pages {
            let prefix = page_prefix(&request.id, page, &extension);
            let number = page.number();

            let ai_uri = ObjectUri::new(&request.bucket, ai_output_key(&prefix));
            match read_json::<Value>(self.objects.as_ref(), &ai_uri).await {
                Ok(Some(ai)) => ai_pages.push((number, ai)),
                Ok(None) => debug!(page = number, "No machine output"),
                Err(err) => {
                    warn!(page = number, "Skipping machine output: {err:#}");
                    output.errors.push(format!("page {page} machine output: {err:#}"));
                }
            }

            let human_uri = ObjectUri::new(&request.bucket, human_output_key(&prefix));
            match read_json::<HumanPageOutput>(self.objects.as_ref(), &human_uri).await {
                Ok(Some(human)) => human_pages.push((number, human)),
                Ok(None) => debug!(page = number, "No human output"),
                Err(err) => {
                    warn!(page = number, "Skipping human output: {err:#}");
                    output.errors.push(format!("page {page} human output: {err:#}"));
                }
            }
        }

        if ai_pages.is_empty() && human_pages.is_empty() {
            output.errors.push("no page outputs found".to_owned());
            output.status = WorkStatus::Failed;
            return output;
        }

        let base = output_base(&request.id, &request.key, &pages);
        let mut written = 0;
        let mut write_failures = 0;

        // CSV, machine output first.
        let mut cells = vec![];
        for (page, ai) in &ai_pages {
            csv_cells(ai, "ai", *page, &mut cells);
        }
        for (page, human) in &human_pages {
            csv_cells(&Value::Object(human.answers.clone()), "human", *page, &mut cells);
        }
        let csv_key = format!("{base}output.csv");
        match self.write_csv(&request.bucket, &csv_key, &cells).await {
            Ok(()) => {
                written += 1;
                output.csv_key = Some(csv_key);
            }
            Err(err) => {
                write_failures += 1;
                output.errors.push(format!("{err:#}"));
            }
        }

        // Raw machine responses.
        let ai_responses = ai_pages
            .iter()
            .map(|(page, ai)| (format!("page_{page}_ai"), ai.clone()))
            .collect::<Map<String, Value>>();
        let ai_key = format!("{base}ai-responses.json");
        let ai_uri = ObjectUri::new(&request.bucket, &ai_key);
        match write_json(self.objects.as_ref(), &ai_uri, &ai_responses).await {
            Ok(()) => {
                written += 1;
                output.ai_responses_key = Some(ai_key);
            }
            Err(err) => {
                write_failures += 1;
                output.errors.push(format!("{err:#}"));
            }
        }

        // Merged human responses.
        if !human_pages.is_empty() {
            let template = ai_pages
                .first()
                .map(|(_, ai)| ai.clone())
                .unwrap_or_else(|| Value::Object(Map::new()));
            let (responses, reconstruct_errors) = merge_human_pages(template, &human_pages);
            output.errors.extend(reconstruct_errors);
            output.processed_pages = human_pages.iter().map(|(page, _)| *page).collect();
            let human_key = format!("{base}human-responses.json");
            let human_uri = ObjectUri::new(&request.bucket, &human_key);
            match write_json(self.objects.as_ref(), &human_uri, &responses).await {
                Ok(()) => {
                    written += 1;
                    output.human_responses_key = Some(human_key);
                }
                Err(err) => {
                    write_failures += 1;
                    output.errors.push(format!("{err:#}"));
                }
            }
        }

        output.status = match WorkStatus::from_counts(written, write_failures) {
            WorkStatus::Ok if !output.errors.is_empty() => WorkStatus::Incomplete,
            status => status,
        };
        info!(
            status = ?output.status,
            ai_pages = ai_pages.len(),
            human_pages = human_pages.len(),
            "Aggregated document"
        );
        output
    }

    async fn write_csv(&self, bucket: &str, key: &str, cells: &[(String, String)]) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(cells.iter().map(|(key, _)| key.as_str()))
            .context("failed to write CSV header")?;
        wtr.write_record(cells.iter().map(|(_, value)| value.as_str()))
            .context("failed to write CSV values")?;
        let body = wtr
            .into_inner()
            .map_err(|err| anyhow!("failed to finish CSV: {}", err.error()))?;
        self.objects
            .put(&ObjectUri::new(bucket, key), body, "text/csv")
            .await
            .with_context(|| format!("failed to write s3://{bucket}/{key}"))
    }
}

/// The shared prefix of every output for a document.
fn output_base(document_id: &str, key: &str, pages: &[PageKey]) -> String {
    let pages = if pages.is_empty() {
        "unknown".to_owned()
    } else {
        pages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("-")
    };
    format!("complete/{document_id}-{}-pages-{pages}-", file_stem(key))
}

/// Flatten a JSON object into CSV `(header, value)` cells.
///
/// Nested objects are prefixed with their immediate parent key only, so
/// `{"a": {"b": {"c": 1}}}` yields `b_c`. Commas are removed from headers and
/// values.
fn csv_cells(value: &Value, source: &str, page: u32, cells: &mut Vec<(String, String)>) {
    fn walk(
        map: &Map<String, Value>,
        prefix: &str,
        source: &str,
        page: u32,
        cells: &mut Vec<(String, String)>,
    ) {
        for (key, value) in map {
            match value {
                Value::Object(inner) => walk(inner, &format!("{key}_"), source, page, cells),
                _ => {
                    let name = format!("{prefix}{key}").replace(',', "");
                    cells.push((
                        format!("page{page}_{name}-{source}"),
                        cell_text(value).replace(',', ""),
                    ));
                }
            }
        }
    }

    match value {
        Value::Object(map) => walk(map, "", source, page, cells),
        other => cells.push((
            format!("page{page}_value-{source}"),
            cell_text(other).replace(',', ""),
        )),
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge every human page into `template`, and rebuild the original structure
/// from the reviewed fields where we can. Fields that don't fit the structure
/// are left out and reported, one error per field.
fn merge_human_pages(
    mut template: Value,
    human_pages: &[(u32, HumanPageOutput)],
) -> (HumanResponses, Vec<String>) {
    let mut structure_map = StructureMap::default();
    for (_, human) in human_pages {
        merge_flattened(&mut template, &human.answers);
        structure_map.merge(&human.structure_map);
    }

    let mut errors = vec![];
    let reconstructed = if structure_map.roots.is_empty() {
        None
    } else {
        let mut builder = StructureBuilder::new(structure_map);
        for (page, human) in human_pages {
            for field in &human.fields {
                if let Err(err) = builder.apply(field) {
                    warn!(page, "Could not reconstruct reviewed field: {err:#}");
                    errors.push(format!("page {page}: reconstruction skipped: {err:#}"));
                }
            }
        }
        Some(builder.finish())
    };

    let responses = HumanResponses {
        human_responses: template,
        reconstructed,
        processed_pages: human_pages
            .iter()
            .map(|(page, _)| format!("page_{page}_human"))
            .collect(),
    };
    (responses, errors)
}

/// One step in a flattened key.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// Split a flattened key like `a/b`, `a.b` or `a[2].b` into steps.
fn key_steps(key: &str) -> Vec<Step> {
    let separator = if key.contains('/') { '/' } else { '.' };
    let mut steps = vec![];
    for part in key.split(separator) {
        match part.strip_suffix(']').and_then(|p| p.rsplit_once('[')) {
            Some((name, index)) if index.parse::<usize>().is_ok() => {
                if !name.is_empty() {
                    steps.push(Step::Key(name.to_owned()));
                }
                if let Ok(index) = index.parse() {
                    steps.push(Step::Index(index));
                }
            }
            _ => steps.push(Step::Key(part.to_owned())),
        }
    }
    steps
}

fn is_nested_key(key: &str) -> bool {
    key.contains(['/', '.', '['])
}

/// Write flattened `values` into `structure`, creating objects and arrays as
/// needed. Plain keys are written before nested ones, so a nested answer can
/// refine a plain one.
fn merge_flattened(structure: &mut Value, values: &Map<String, Value>) {
    let plain = values.iter().filter(|(key, _)| !is_nested_key(key));
    let nested = values.iter().filter(|(key, _)| is_nested_key(key));
    for (key, value) in plain.chain(nested) {
        set_path(structure, &key_steps(key), value.clone());
    }
}

fn set_path(root: &mut Value, steps: &[Step], value: Value) {
    let Some((last, parents)) = steps.split_last() else {
        return;
    };
    let mut current = root;
    for step in parents {
        current = child_mut(current, step);
    }
    *child_mut(current, last) = value;
}

fn child_mut<'a>(value: &'a mut Value, step: &Step) -> &'a mut Value {
    match step {
        Step::Key(key) => as_object_mut(value)
            .entry(key.clone())
            .or_insert(Value::Null),
        Step::Index(index) => {
            let items = as_array_mut(value);
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            &mut items[*index]
        }
    }
}

/// Borrow `value` as an object, replacing it with an empty one if needed.
fn as_object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value
        .as_object_mut()
        .expect("value was just replaced with an object")
}

/// Borrow `value` as an array, replacing it with an empty one if needed.
fn as_array_mut(value: &mut Value) -> &mut Vec<Value> {
    if !value.is_array() {
        *value = Value::Array(vec![]);
    }
    value
        .as_array_mut()
        .expect("value was just replaced with an array")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{fields::flatten::flatten_json, stores::memory::MemoryStore};

    fn human_page(page: u32, answers: Value) -> HumanPageOutput {
        HumanPageOutput {
            job_id: format!("doci{page}"),
            document_id: "doc".to_owned(),
            page,
            answers: answers.as_object().unwrap().clone(),
            fields: vec![],
            structure_map: StructureMap::default(),
        }
    }

    #[test]
    fn csv_cells_use_the_immediate_parent() {
        let mut cells = vec![];
        csv_cells(
            &json!({
                "name": "Smith, Jane",
                "address": { "city": "Springfield", "geo": { "lat": 1.5 } },
                "tags": ["a", "b"],
                "missing": null,
            }),
            "ai",
            3,
            &mut cells,
        );
        assert_eq!(
            cells,
            vec![
                ("page3_name-ai".to_owned(), "Smith Jane".to_owned()),
                ("page3_address_city-ai".to_owned(), "Springfield".to_owned()),
                ("page3_geo_lat-ai".to_owned(), "1.5".to_owned()),
                ("page3_tags-ai".to_owned(), "[\"a\"\"b\"]".to_owned()),
                ("page3_missing-ai".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn flattened_keys_become_steps() {
        assert_eq!(key_steps("a"), vec![Step::Key("a".to_owned())]);
        assert_eq!(
            key_steps("a/b.c"),
            vec![Step::Key("a".to_owned()), Step::Key("b.c".to_owned())]
        );
        assert_eq!(
            key_steps("items[2].price"),
            vec![
                Step::Key("items".to_owned()),
                Step::Index(2),
                Step::Key("price".to_owned()),
            ]
        );
        assert_eq!(key_steps("odd[x]"), vec![Step::Key("odd[x]".to_owned())]);
    }

    #[test]
    fn flattened_values_merge_into_the_template() {
        let mut template = json!({
            "name": "Jnae",
            "address": { "city": "Sprngfield", "zip": "12345" },
            "total": 5,
            "items": [{ "price": 1 }],
        });
        let answers = json!({
            "address/city": "Springfield",
            "name": "Jane",
            "total.amount": 10,
            "items[1].price": 2,
            "new": true,
        });
        merge_flattened(&mut template, answers.as_object().unwrap());
        assert_eq!(
            template,
            json!({
                "name": "Jane",
                "address": { "city": "Springfield", "zip": "12345" },
                "total": { "amount": 10 },
                "items": [{ "price": 1 }, { "price": 2 }],
                "new": true,
            })
        );
    }

    #[tokio::test]
    async fn documents_aggregate_machine_and_human_output() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        store.insert_json(
            &ObjectUri::new("bucket", "wip/doc/0.png/ai/output.json"),
            &json!({ "name": "Jnae", "total": 5 }),
        );
        store.insert_json(
            &ObjectUri::new("bucket", "wip/doc/1.png/ai/output.json"),
            &json!({ "name": "Jnae", "total": 5 }),
        );
        store.insert_json(
            &ObjectUri::new("bucket", "wip/doc/1.png/human/output.json"),
            &serde_json::to_value(human_page(1, json!({ "name": "Jane" })))?,
        );

        let aggregator = ResultAggregator::new(store.clone());
        let output = aggregator
            .aggregate(&AggregateRequest {
                bucket: "bucket".to_owned(),
                id: "doc".to_owned(),
                key: "uploads/form.v2.pdf".to_owned(),
                image_keys: vec![PageKey::Index(1), PageKey::Index(0)],
            })
            .await;
        assert_eq!(output.status, WorkStatus::Ok, "{:?}", output.errors);
        assert_eq!(output.processed_pages, vec![1]);
        assert_eq!(
            output.csv_key.as_deref(),
            Some("complete/doc-form-pages-0-1-output.csv")
        );

        let csv_body = store
            .lock()
            .objects
            .get(&ObjectUri::new("bucket", "complete/doc-form-pages-0-1-output.csv"))
            .cloned()
            .unwrap();
        assert_eq!(
            String::from_utf8(csv_body)?,
            "page0_name-ai,page0_total-ai,page1_name-ai,page1_total-ai,page1_name-human\n\
             Jnae,5,Jnae,5,Jane\n"
        );

        let ai = store
            .json(&ObjectUri::new("bucket", "complete/doc-form-pages-0-1-ai-responses.json"))
            .unwrap();
        assert_eq!(ai["page_1_ai"], json!({ "name": "Jnae", "total": 5 }));

        let human = store
            .json(&ObjectUri::new("bucket", "complete/doc-form-pages-0-1-human-responses.json"))
            .unwrap();
        assert_eq!(human["human_responses"], json!({ "name": "Jane", "total": 5 }));
        assert_eq!(human["processed_pages"], json!(["page_1_human"]));
        Ok(())
    }

    #[tokio::test]
    async fn segments_with_different_array_lengths_reconstruct() -> Result<()> {
        let items = |count: usize| {
            let records = (0..count)
                .map(|i| json!({ "price": { "value": i, "confidence": 0.4 } }))
                .collect::<Vec<_>>();
            flatten_json(&json!([{ "items": records }]), 0.7).unwrap()
        };
        let short = items(1);
        let long = items(3);

        let store = Arc::new(MemoryStore::default());
        for (page, flattened) in [(0, &short), (1, &long)] {
            store.insert_json(
                &ObjectUri::new("bucket", format!("wip/doc/{page}.png/ai/output.json")),
                &json!({ "items": [] }),
            );
            let mut human = human_page(page, json!({ "note": "ok" }));
            human.fields = flattened.fields.clone();
            human.structure_map = flattened.structure_map.clone();
            // Something that fits nowhere, to check it doesn't sink the rest.
            if page == 1 {
                let mut stray = flattened.fields[0].clone();
                stray.path_components.root = "unknown".to_owned();
                human.fields.push(stray);
            }
            store.insert_json(
                &ObjectUri::new("bucket", format!("wip/doc/{page}.png/human/output.json")),
                &serde_json::to_value(human)?,
            );
        }

        let output = ResultAggregator::new(store.clone())
            .aggregate(&AggregateRequest {
                bucket: "bucket".to_owned(),
                id: "doc".to_owned(),
                key: "form.pdf".to_owned(),
                image_keys: vec![PageKey::Index(0), PageKey::Index(1)],
            })
            .await;
        assert_eq!(output.status, WorkStatus::Incomplete);
        assert_eq!(output.errors.len(), 1, "{:?}", output.errors);
        assert!(output.errors[0].contains("unknown"));

        let human = store
            .json(&ObjectUri::new("bucket", "complete/doc-form-pages-0-1-human-responses.json"))
            .unwrap();
        let rebuilt = &human["reconstructed"][0]["items"];
        assert_eq!(rebuilt.as_array().map(Vec::len), Some(3));
        assert_eq!(rebuilt[2]["price"]["value"], json!(2));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_pages_are_skipped() {
        let store = Arc::new(MemoryStore::default());
        store.insert_json(
            &ObjectUri::new("bucket", "wip/doc/0.jpg/ai/output.json"),
            &json!({ "a": 1 }),
        );
        store.lock().objects.insert(
            ObjectUri::new("bucket", "wip/doc/1.jpg/ai/output.json"),
            b"{not json".to_vec(),
        );
        let output = ResultAggregator::new(store.clone())
            .aggregate(&AggregateRequest {
                bucket: "bucket".to_owned(),
                id: "doc".to_owned(),
                key: "scan.jpg".to_owned(),
                image_keys: vec![PageKey::Index(0), PageKey::Index(1)],
            })
            .await;
        assert_eq!(output.status, WorkStatus::Incomplete);
        assert_eq!(output.errors.len(), 1);
        assert!(output.csv_key.is_some());
        assert!(output.human_responses_key.is_none());
    }

    #[tokio::test]
    async fn empty_documents_fail() {
        let store = Arc::new(MemoryStore::default());
        let output = ResultAggregator::new(store.clone())
            .aggregate(&AggregateRequest {
                bucket: "bucket".to_owned(),
                id: "doc".to_owned(),
                key: "scan.jpg".to_owned(),
                image_keys: vec![],
            })
            .await;
        assert_eq!(output.status, WorkStatus::Failed);
        assert!(store.lock().objects.is_empty());
    }
}
