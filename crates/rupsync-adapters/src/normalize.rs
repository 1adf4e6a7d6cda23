//! Raw item → [`OrderedDataset`] using the field registry.

use std::sync::LazyLock;

use regex::Regex;
use rupsync_core::{
    field_mapping, FieldKind, FieldMapping, MappingStatus, OrderedDataset, RawItem, KEY_CODE_FIELD,
    KEY_NAME_FIELD,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

static CODE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{8,}").unwrap());

static RUPIAH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bRp\.?\s*(\d[\d.,]*)").unwrap());

static MONTH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2}\s+(?:januari|februari|maret|april|mei|juni|juli|agustus|september|oktober|november|desember)\s+\d{4})\b",
    )
    .unwrap()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unrecognized item shape: {0}")]
    UnrecognizedShape(String),
}

/// Normalizes one item for `table_id`, falling back to an unmapped
/// passthrough when the registry has no schema for the table.
pub fn normalize(table_id: &str, item: &RawItem) -> Result<OrderedDataset, NormalizeError> {
    match field_mapping(table_id) {
        Some(mapping) => normalize_item(mapping, item),
        None => passthrough(table_id, item),
    }
}

pub fn normalize_item(
    mapping: &FieldMapping,
    item: &RawItem,
) -> Result<OrderedDataset, NormalizeError> {
    let (values, status, original_array) = match item {
        RawItem::Keyed(record) => {
            let (values, status) = map_fields(mapping, |name| keyed_value(record, name));
            (values, status, None)
        }
        RawItem::Positional(columns) => {
            let (values, status) = map_fields(mapping, |name| {
                mapping
                    .position_of(name)
                    .and_then(|i| columns.get(i))
                    .and_then(stringify)
            });
            (values, status, Some(columns.clone()))
        }
        RawItem::FreeText(text) => {
            let extracted = free_text_fields(mapping, text);
            let (values, status) = map_fields(mapping, |name| keyed_value(&extracted, name));
            (values, status, None)
        }
        RawItem::Unrecognized(value) => {
            return Err(NormalizeError::UnrecognizedShape(json_kind(value).to_string()))
        }
    };

    if status.is_poor() {
        warn!(
            table = mapping.table_id,
            shape = item.shape(),
            mapped = status.mapped,
            total = status.total,
            invalid = status.invalid,
            quality = status.quality(),
            "poor mapping quality; upstream format may have changed"
        );
    }

    Ok(OrderedDataset {
        table_id: mapping.table_id.to_string(),
        values,
        original_array,
        status,
    })
}

/// Unmapped rendition of an item for a table with no known schema.
pub fn passthrough(table_id: &str, item: &RawItem) -> Result<OrderedDataset, NormalizeError> {
    let values = match item {
        RawItem::Keyed(record) => record
            .iter()
            .filter_map(|(key, value)| stringify(value).map(|v| (key.clone(), v)))
            .collect(),
        RawItem::Positional(columns) => columns
            .iter()
            .enumerate()
            .filter_map(|(i, value)| stringify(value).map(|v| (format!("col_{i}"), v)))
            .collect(),
        RawItem::FreeText(text) => vec![("text".to_string(), text.trim().to_string())],
        RawItem::Unrecognized(value) => {
            return Err(NormalizeError::UnrecognizedShape(json_kind(value).to_string()))
        }
    };
    Ok(OrderedDataset {
        table_id: table_id.to_string(),
        values,
        original_array: match item {
            RawItem::Positional(columns) => Some(columns.clone()),
            _ => None,
        },
        status: MappingStatus::default(),
    })
}

fn map_fields<F>(mapping: &FieldMapping, lookup: F) -> (Vec<(String, String)>, MappingStatus)
where
    F: Fn(&str) -> Option<String>,
{
    let total = mapping.fields.len();
    let mut mapped = 0usize;
    let mut invalid = 0usize;
    let mut values = Vec::with_capacity(total);

    for spec in mapping.fields {
        let value = match lookup(spec.name) {
            Some(candidate) if spec.admits(&candidate) => {
                mapped += 1;
                candidate
            }
            Some(_) => {
                invalid += 1;
                spec.default.to_string()
            }
            None => spec.default.to_string(),
        };
        values.push((spec.name.to_string(), value));
    }

    let status = MappingStatus {
        total,
        mapped,
        missing: total - mapped,
        invalid,
        sequence_preserved: mapped == total,
    };
    (values, status)
}

fn keyed_value(record: &JsonMap<String, JsonValue>, name: &str) -> Option<String> {
    record
        .get(name)
        .or_else(|| {
            record
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .and_then(stringify)
}

/// Text form of a JSON value. `null` and blank strings count as absent.
pub fn stringify(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Heuristic field recovery from an unstructured string.
fn free_text_fields(mapping: &FieldMapping, text: &str) -> JsonMap<String, JsonValue> {
    let mut out = JsonMap::new();

    // Amounts are consumed first so their digits are not mistaken for a code.
    let mut remainder = text.to_string();
    if let Some(caps) = RUPIAH.captures(text) {
        let amount = caps[1].trim_end_matches(['.', ',']);
        if let Some(field) = mapping.first_of_kind(FieldKind::Currency) {
            out.insert(field.name.to_string(), JsonValue::String(format!("Rp. {amount}")));
        }
        remainder = RUPIAH.replace_all(text, " ").into_owned();
    }

    if let Some(code) = CODE_RUN.find(&remainder) {
        out.insert(KEY_CODE_FIELD.to_string(), JsonValue::String(code.as_str().to_string()));
    }

    if let Some(caps) = MONTH_DATE.captures(text) {
        if let Some(field) = mapping.first_of_kind(FieldKind::Date) {
            out.insert(field.name.to_string(), JsonValue::String(caps[1].to_string()));
        }
    }

    if out.is_empty() {
        out.insert(KEY_NAME_FIELD.to_string(), JsonValue::String(text.trim().to_string()));
    }
    out
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
