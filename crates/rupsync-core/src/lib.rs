//! Core procurement data model: field registry, normalized datasets, natural
//! keys and enrichment records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub mod locale;
pub mod registry;
pub mod validate;

pub use registry::{
    field_mapping, FieldKind, FieldMapping, FieldSpec, ENRICHMENT_SOURCE, ENRICHMENT_TABLE,
    KEY_CODE_FIELD, KEY_NAME_FIELD, MAPPINGS,
};

pub const CRATE_NAME: &str = "rupsync-core";

/// Business identity of a procurement package across sync cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub kode_rup: String,
    pub nama_paket: String,
}

impl NaturalKey {
    pub fn new(kode_rup: impl Into<String>, nama_paket: impl Into<String>) -> Self {
        Self {
            kode_rup: kode_rup.into(),
            nama_paket: nama_paket.into(),
        }
    }
}

/// One item of an endpoint payload, classified once at the source boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    Keyed(JsonMap<String, JsonValue>),
    Positional(Vec<JsonValue>),
    FreeText(String),
    Unrecognized(JsonValue),
}

impl RawItem {
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => RawItem::Keyed(map),
            JsonValue::Array(values) => RawItem::Positional(values),
            JsonValue::String(text) => RawItem::FreeText(text),
            other => RawItem::Unrecognized(other),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            RawItem::Keyed(_) => "keyed",
            RawItem::Positional(_) => "positional",
            RawItem::FreeText(_) => "free_text",
            RawItem::Unrecognized(_) => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStatus {
    pub total: usize,
    pub mapped: usize,
    pub missing: usize,
    pub invalid: usize,
    pub sequence_preserved: bool,
}

impl MappingStatus {
    pub fn quality(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.mapped as f64 / self.total as f64
    }

    /// Fewer than half of the expected fields were populated.
    pub fn is_poor(&self) -> bool {
        self.mapped * 2 < self.total
    }
}

/// Resolved field values for one raw item, in mapping order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderedDataset {
    pub table_id: String,
    pub values: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_array: Option<Vec<JsonValue>>,
    pub status: MappingStatus,
}

impl OrderedDataset {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    /// The natural key, or `None` when the item carries no procurement code.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        let code = self.get(KEY_CODE_FIELD).unwrap_or_default().trim();
        if code.is_empty() {
            return None;
        }
        Some(NaturalKey::new(
            code,
            self.get(KEY_NAME_FIELD).unwrap_or_default().trim(),
        ))
    }
}

/// Start and end of a schedule window on a detail page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ScheduleWindow {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Fields pulled from a package detail page. Everything is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailFields {
    pub kode_rup: Option<String>,
    pub nama_paket: Option<String>,
    pub nama_klpd: Option<String>,
    pub satuan_kerja: Option<String>,
    pub tahun_anggaran: Option<String>,
    pub jenis_pengadaan: Option<String>,
    pub metode_pemilihan: Option<String>,
    pub total_pagu: Option<f64>,
    pub sumber_dana: Vec<String>,
    pub lokasi_pekerjaan: Vec<String>,
    pub pemanfaatan: ScheduleWindow,
    pub jadwal_kontrak: ScheduleWindow,
    pub jadwal_pemilihan: ScheduleWindow,
    pub tanggal_umumkan: Option<NaiveDate>,
    pub unlabeled_dates: Vec<NaiveDate>,
}

impl DetailFields {
    pub fn has_package_name(&self) -> bool {
        self.nama_paket
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        *self == DetailFields::default()
    }
}

/// A row of the enrichment table: primary fields copied from the sink plus
/// detail-page fields. `extraction_succeeded` is independent of row existence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentRecord {
    pub key: NaturalKey,
    pub primary: Vec<(String, String)>,
    pub detail: DetailFields,
    pub extraction_succeeded: bool,
}

impl EnrichmentRecord {
    /// Minimal row recorded when nothing usable came back from the detail page.
    pub fn failed(key: NaturalKey, primary: Vec<(String, String)>) -> Self {
        Self {
            key,
            primary,
            detail: DetailFields::default(),
            extraction_succeeded: false,
        }
    }
}
