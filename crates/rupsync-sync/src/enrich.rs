//! Detail-page enrichment of planning packages.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rupsync_adapters::{extract_detail, ExtractionPass};
use rupsync_core::{
    DetailFields, EnrichmentRecord, NaturalKey, ENRICHMENT_SOURCE, ENRICHMENT_TABLE,
    KEY_CODE_FIELD, KEY_NAME_FIELD,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::engine::SyncEngine;
use crate::store::{StoreError, UpsertStamp};

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("kode_rup {0} has no live planning row")]
    UnknownKey(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of enriching one procurement code.
#[derive(Debug, Clone, Serialize)]
pub struct CodeEnrichment {
    pub kode_rup: String,
    pub extraction_succeeded: bool,
    pub pass: Option<ExtractionPass>,
    /// Enrichment rows written, one per live package under the code.
    pub rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichAllReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retired: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Copies detail values into primary text fields that are still empty.
fn merge_primary(mut primary: Vec<(String, String)>, detail: &DetailFields) -> Vec<(String, String)> {
    for (name, value) in primary.iter_mut() {
        if !value.trim().is_empty() {
            continue;
        }
        let filler = match name.as_str() {
            "satuan_kerja" => detail.satuan_kerja.as_deref(),
            "jenis_pengadaan" => detail.jenis_pengadaan.as_deref(),
            "metode_pemilihan" => detail.metode_pemilihan.as_deref(),
            _ => None,
        };
        if let Some(filler) = filler.filter(|f| !f.trim().is_empty()) {
            *value = filler.trim().to_string();
        }
    }
    primary
}

fn key_of(primary: &[(String, String)]) -> Option<NaturalKey> {
    let get = |field: &str| {
        primary
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    };
    Some(NaturalKey::new(get(KEY_CODE_FIELD)?, get(KEY_NAME_FIELD)?))
}

impl SyncEngine {
    /// Fetches and stores the detail page of one planning code.
    pub async fn enrich_one(&self, kode_rup: &str) -> Result<CodeEnrichment, EnrichError> {
        let _guard = self.lock_table(ENRICHMENT_TABLE).await;
        self.enrich_code(kode_rup)
            .instrument(info_span!("enrich", kode_rup))
            .await
    }

    async fn enrich_code(&self, kode_rup: &str) -> Result<CodeEnrichment, EnrichError> {
        let kode_rup = kode_rup.trim();
        let rows = self.store.primary_rows(ENRICHMENT_SOURCE, kode_rup).await?;
        if rows.is_empty() {
            return Err(EnrichError::UnknownKey(kode_rup.to_string()));
        }

        let (detail, pass, error) = match self.source.fetch_detail_page(kode_rup).await {
            Ok(html) => match extract_detail(&html) {
                Ok(extraction) if extraction.succeeded() => {
                    (Some(extraction.fields), Some(extraction.pass), None)
                }
                Ok(extraction) => (None, Some(extraction.pass), None),
                Err(err) => (None, None, Some(err.to_string())),
            },
            Err(err) => (None, None, Some(err.to_string())),
        };
        if let Some(error) = &error {
            warn!(error = %error, "detail page unavailable; recording failed extraction");
        }

        let stamp = UpsertStamp::now(self.context.active_year.clone());
        let mut written = 0usize;
        for primary in rows {
            let Some(key) = key_of(&primary) else {
                continue;
            };
            let record = match &detail {
                Some(fields) => EnrichmentRecord {
                    key,
                    primary: merge_primary(primary, fields),
                    detail: fields.clone(),
                    extraction_succeeded: true,
                },
                None => EnrichmentRecord::failed(key, primary),
            };
            self.store.upsert_enrichment(&record, &stamp).await?;
            written += 1;
        }

        Ok(CodeEnrichment {
            kode_rup: kode_rup.to_string(),
            extraction_succeeded: detail.is_some(),
            pass,
            rows: written,
            error,
        })
    }

    /// Enriches every live planning package lacking a successful extraction,
    /// then retires enrichment rows whose package is gone.
    pub async fn enrich_all(&self) -> Result<EnrichAllReport, EnrichError> {
        let _guard = self.lock_table(ENRICHMENT_TABLE).await;
        let started_at = Utc::now();
        let codes: BTreeSet<String> = self
            .store
            .keys_lacking_enrichment()
            .await?
            .into_iter()
            .map(|key| key.kode_rup)
            .collect();
        info!(pending = codes.len(), "enrichment pass started");

        let mut report = EnrichAllReport {
            processed: 0,
            succeeded: 0,
            failed: 0,
            retired: 0,
            started_at,
            finished_at: started_at,
        };
        let total = codes.len();
        for code in codes {
            let outcome = self
                .enrich_code(&code)
                .instrument(info_span!("enrich", kode_rup = %code))
                .await;
            report.processed += 1;
            match outcome {
                Ok(result) if result.extraction_succeeded => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(kode_rup = %code, error = %err, "enrichment failed");
                }
            }
            if report.processed % PROGRESS_EVERY == 0 {
                info!(
                    processed = report.processed,
                    total,
                    succeeded = report.succeeded,
                    "enrichment progress"
                );
            }
        }

        match self.store.retire_orphaned_enrichment().await {
            Ok(retired) => report.retired = retired as usize,
            Err(err) => warn!(error = %err, "retiring orphaned enrichment rows failed"),
        }
        report.finished_at = Utc::now();
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            retired = report.retired,
            "enrichment pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::testing::{engine_with, MemoryStore, ScriptedSource};

    const DETAIL_PAGE: &str = r#"
        <html><body><table>
          <tr><td>Kode RUP</td><td>41000001</td></tr>
          <tr><td>Nama Paket</td><td>Belanja Modal Laptop</td></tr>
          <tr><td>Nama KLPD</td><td>Kab. Sumedang</td></tr>
          <tr><td>Satuan Kerja</td><td>Dinas Kominfo</td></tr>
          <tr><td>Tahun Anggaran</td><td>2025</td></tr>
          <tr><td>Jenis Pengadaan</td><td>Barang</td></tr>
          <tr><td>Total Pagu</td><td>Rp. 150.000.000,00</td></tr>
          <tr><td>Tanggal Umumkan Paket</td><td>10 Januari 2025</td></tr>
        </table></body></html>
    "#;

    fn plan(code: &str, name: &str) -> serde_json::Value {
        json!({
            "kode_rup": code,
            "nama_paket": name,
            "satuan_kerja": "",
            "metode_pemilihan": "E-Purchasing",
            "pagu_rup": "Rp. 150.000.000",
        })
    }

    async fn seeded(
        plans: Vec<serde_json::Value>,
    ) -> (Arc<MemoryStore>, Arc<ScriptedSource>, SyncEngine) {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(ScriptedSource::with_token("tok"));
        let engine = engine_with(source.clone(), store.clone(), &["perencanaan"]);
        source.push_items(plans);
        engine.run_cycle("perencanaan").await.expect("seed planning rows");
        (store, source, engine)
    }

    #[tokio::test]
    async fn successful_extraction_is_stored_with_merged_primary_fields() {
        let (store, source, engine) = seeded(vec![plan("41000001", "Belanja Modal Laptop")]).await;
        source.set_detail("41000001", DETAIL_PAGE);

        let result = engine.enrich_one("41000001").await.expect("enrich");
        assert!(result.extraction_succeeded);
        assert_eq!(result.pass, Some(ExtractionPass::Labeled));
        assert_eq!(result.rows, 1);

        let row = store
            .enrichment(&NaturalKey::new("41000001", "Belanja Modal Laptop"))
            .expect("enrichment row");
        assert!(row.record.extraction_succeeded);
        assert_eq!(row.record.detail.total_pagu, Some(150_000_000.0));
        assert_eq!(row.record.detail.nama_klpd.as_deref(), Some("Kab. Sumedang"));
        let satker = row
            .record
            .primary
            .iter()
            .find(|(name, _)| name == "satuan_kerja")
            .map(|(_, v)| v.as_str());
        assert_eq!(satker, Some("Dinas Kominfo"));
    }

    #[tokio::test]
    async fn empty_pages_and_fetch_errors_persist_a_failed_row() {
        let (store, source, engine) = seeded(vec![
            plan("41000001", "Belanja Modal Laptop"),
            plan("41000002", "Belanja Kertas"),
        ])
        .await;
        source.set_detail("41000001", "<html><body><p>Paket tidak ditemukan</p></body></html>");

        let empty = engine.enrich_one("41000001").await.expect("empty page");
        assert!(!empty.extraction_succeeded);
        let unreachable = engine.enrich_one("41000002").await.expect("fetch error");
        assert!(!unreachable.extraction_succeeded);
        assert!(unreachable.error.is_some());

        for key in [
            NaturalKey::new("41000001", "Belanja Modal Laptop"),
            NaturalKey::new("41000002", "Belanja Kertas"),
        ] {
            let row = store.enrichment(&key).expect("failed row exists");
            assert!(!row.record.extraction_succeeded);
        }
    }

    #[tokio::test]
    async fn a_failed_refresh_keeps_earlier_detail() {
        let (store, source, engine) = seeded(vec![plan("41000001", "Belanja Modal Laptop")]).await;
        source.set_detail("41000001", DETAIL_PAGE);
        engine.enrich_one("41000001").await.expect("first");

        source.set_detail("41000001", "<html></html>");
        let refresh = engine.enrich_one("41000001").await.expect("refresh");
        assert!(!refresh.extraction_succeeded);

        let row = store
            .enrichment(&NaturalKey::new("41000001", "Belanja Modal Laptop"))
            .expect("row");
        assert!(row.record.extraction_succeeded);
        assert_eq!(row.record.detail.total_pagu, Some(150_000_000.0));
    }

    #[tokio::test]
    async fn unknown_codes_are_rejected_without_fetching() {
        let (_store, source, engine) = seeded(vec![plan("41000001", "Belanja Modal Laptop")]).await;
        let err = engine.enrich_one("49999999").await.expect_err("unknown");
        assert!(matches!(err, EnrichError::UnknownKey(code) if code == "49999999"));
        assert_eq!(source.detail_requests(), 0);
    }

    #[tokio::test]
    async fn enrich_all_skips_done_keys_and_retires_orphans() {
        let (store, source, engine) = seeded(vec![
            plan("41000001", "Belanja Modal Laptop"),
            plan("41000002", "Belanja Kertas"),
        ])
        .await;
        source.set_detail("41000001", DETAIL_PAGE);
        source.set_detail("41000002", DETAIL_PAGE);
        engine.enrich_one("41000001").await.expect("already enriched");
        let before = source.detail_requests();

        let report = engine.enrich_all().await.expect("enrich all");
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.retired, 0);
        assert_eq!(source.detail_requests(), before + 1);

        source.push_items(vec![plan("41000002", "Belanja Kertas")]);
        engine.run_cycle("perencanaan").await.expect("drop first plan");
        let report = engine.enrich_all().await.expect("enrich all again");
        assert_eq!(report.processed, 0);
        assert_eq!(report.retired, 1);
        let orphan = store
            .enrichment(&NaturalKey::new("41000001", "Belanja Modal Laptop"))
            .expect("orphan kept");
        assert!(orphan.deleted);
    }

    #[test]
    fn merge_fills_only_empty_primary_fields() {
        let detail = DetailFields {
            satuan_kerja: Some("Dinas Kominfo".into()),
            metode_pemilihan: Some("Tender".into()),
            ..DetailFields::default()
        };
        let merged = merge_primary(
            vec![
                ("satuan_kerja".into(), " ".into()),
                ("metode_pemilihan".into(), "E-Purchasing".into()),
            ],
            &detail,
        );
        assert_eq!(merged[0].1, "Dinas Kominfo");
        assert_eq!(merged[1].1, "E-Purchasing");
    }
}
