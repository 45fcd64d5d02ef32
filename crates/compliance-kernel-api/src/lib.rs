use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use compliance_kernel_core::{
    AnswerPhraser, CorpusBundle, MatchMode, MetricsSnapshot, PipelineMetrics, Query, QueryEmbedder,
    ReasoningEvent, ReasoningPipeline, RequestId, TerminalPayload,
};
use compliance_kernel_store_sqlite::{CorpusCounts, ImportSummary, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub mod clients;
pub mod config;
pub mod rollout;

pub use clients::{HttpEmbedder, HttpPhraser};
pub use config::{EndpointConfig, KernelConfig, RolloutConfig};
pub use rollout::{assign, rollout_bucket, select_variant, MatchVariant, RolloutAssignment};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskResponse {
    pub request_id: String,
    pub variant: MatchVariant,
    pub events: Vec<ReasoningEvent>,
    pub terminal: TerminalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub summary: ImportSummary,
    pub totals: CorpusCounts,
}

#[derive(Debug, Clone)]
pub struct ComplianceKernelApi {
    db_path: PathBuf,
    config: Arc<KernelConfig>,
    metrics: Arc<PipelineMetrics>,
}

impl ComplianceKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, KernelConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: KernelConfig) -> Self {
        Self { db_path, config: Arc::new(config), metrics: Arc::new(PipelineMetrics::new()) }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Import a validated corpus bundle.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn import_corpus(&self, bundle: &CorpusBundle) -> Result<ImportResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let summary = store.import_corpus(bundle)?;
        let totals = store.corpus_counts()?;
        Ok(ImportResult { summary, totals })
    }

    /// Answer one question and persist every emitted event.
    ///
    /// # Errors
    /// Returns an error only when the store cannot be opened or the audit trail cannot be
    /// written; reasoning failures are reported inside the terminal payload.
    pub fn ask(&self, query: Query) -> Result<AskResponse> {
        self.ask_streaming(query, |_| {})
    }

    /// Like [`Self::ask`], handing each event to `on_event` as soon as it is produced.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or the audit trail cannot be written.
    pub fn ask_streaming(&self, query: Query, mut on_event: impl FnMut(&ReasoningEvent)) -> Result<AskResponse> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let request_id = RequestId::new().to_string();
        let rollout_key = query.company_id.clone().unwrap_or_else(|| request_id.clone());
        let variant = select_variant(&rollout_key, self.config.rollout.hybrid_percent);

        let embedder = self.config.embedding.as_ref().map(HttpEmbedder::new);
        let phraser = self.config.phrasing.as_ref().map(HttpPhraser::new);
        let mut pipeline_config = self.config.pipeline.clone();
        if variant == MatchVariant::Hybrid && embedder.is_some() {
            pipeline_config.matching.mode = MatchMode::Hybrid;
        }
        tracing::debug!(%request_id, ?variant, mode = ?pipeline_config.matching.mode, "starting reasoning run");

        let (events, terminal) = {
            let mut pipeline = ReasoningPipeline::new(query, &store, pipeline_config)
                .with_request_id(request_id.clone())
                .with_metrics(&self.metrics);
            if let Some(embedder) = embedder.as_ref() {
                pipeline = pipeline.with_embedder(embedder as &dyn QueryEmbedder);
            }
            if let Some(phraser) = phraser.as_ref() {
                pipeline = pipeline.with_phraser(phraser as &dyn AnswerPhraser);
            }

            let mut events = Vec::new();
            while let Some(event) = pipeline.next_event() {
                on_event(&event);
                events.push(event);
            }
            let terminal = pipeline
                .terminal()
                .cloned()
                .ok_or_else(|| anyhow!("reasoning run {request_id} ended without a terminal payload"))?;
            (events, terminal)
        };

        store
            .append_events(&events)
            .with_context(|| format!("failed to persist reasoning events for {request_id}"))?;
        tracing::info!(%request_id, outcome = terminal.outcome(), events = events.len(), "reasoning run finished");

        Ok(AskResponse { request_id, variant, events, terminal })
    }

    /// Replay the persisted events of one request.
    ///
    /// # Errors
    /// Returns an error when lookup fails or no events exist for the request.
    pub fn events(&self, request_id: &str) -> Result<Vec<ReasoningEvent>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let events = store.list_events(request_id)?;
        if events.is_empty() {
            return Err(anyhow!("no reasoning events recorded for request: {request_id}"));
        }
        Ok(events)
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn rollout(&self, key: &str) -> RolloutAssignment {
        assign(key, self.config.rollout.hybrid_percent)
    }
}

/// Read a corpus bundle from a JSON file.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a valid bundle document.
pub fn load_corpus_bundle(path: &Path) -> Result<CorpusBundle> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus bundle {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid corpus bundle {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_kernel_core::{ClientContext, ReasoningStage, RefusalReason, StageStatus};
    use serde_json::json;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("compliance-kernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn bundle() -> Result<CorpusBundle> {
        serde_json::from_value(json!({
            "concepts": [
                { "id": "c-vat", "slug": "pdv-opca-stopa", "name": "Opća stopa PDV-a", "aliases": ["stopa pdv"] },
                {
                    "id": "c-contrib",
                    "slug": "doprinos-mirovinsko",
                    "name": "Stopa doprinosa za mirovinsko osiguranje",
                    "aliases": []
                }
            ],
            "evidence": [
                {
                    "id": "ev-vat",
                    "url": "https://narodne-novine.nn.hr/clanci/sluzbeni/2013_06_73_1451.html",
                    "fetched_at": "2025-02-20T08:00:00Z",
                    "source": "narodne-novine"
                },
                {
                    "id": "ev-contrib",
                    "url": "https://narodne-novine.nn.hr/clanci/sluzbeni/2019_01_1_1.html",
                    "fetched_at": "2025-02-20T08:00:00Z",
                    "source": "narodne-novine"
                }
            ],
            "rules": [
                {
                    "id": "vat-25",
                    "concept_slug": "pdv-opca-stopa",
                    "title": "Opća stopa PDV-a",
                    "law_reference": "Zakon o PDV-u, čl. 38",
                    "authority": "LAW",
                    "status": "published",
                    "effective_from": "2013-01-01",
                    "confidence": 0.95,
                    "value": "25",
                    "value_type": "percentage",
                    "sources": [{ "exact_quote": "Porez na dodanu vrijednost obračunava se po stopi od 25 %", "evidence_id": "ev-vat" }]
                },
                {
                    "id": "contrib-llc",
                    "concept_slug": "doprinos-mirovinsko",
                    "title": "Stopa doprinosa za mirovinsko osiguranje",
                    "authority": "LAW",
                    "status": "published",
                    "effective_from": "2019-01-01",
                    "confidence": 0.9,
                    "value": "20",
                    "value_type": "percentage",
                    "applies_if": { "op": "cmp", "field": "entity.type", "cmp": "eq", "value": "limited_company" },
                    "sources": [{ "exact_quote": "Stopa doprinosa iznosi 20 %", "evidence_id": "ev-contrib" }]
                }
            ]
        }))
        .context("fixture bundle should deserialize")
    }

    #[test]
    fn migrate_dry_run_then_apply() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ComplianceKernelApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn ask_persists_replayable_events() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ComplianceKernelApi::new(db_path.clone());
        let imported = api.import_corpus(&bundle()?)?;
        assert_eq!(imported.totals.rules, 2);

        let mut streamed = 0_usize;
        let response = api.ask_streaming(
            Query::new("Kolika je stopa doprinosa za mirovinsko osiguranje u Hrvatskoj?")
                .with_client(ClientContext { legal_form: Some("d.o.o.".to_string()), ..ClientContext::default() }),
            |_| streamed += 1,
        )?;
        assert_eq!(response.terminal.outcome(), "ANSWER");
        assert_eq!(streamed, response.events.len());
        assert_eq!(response.variant, MatchVariant::Control);

        let replayed = api.events(&response.request_id)?;
        assert_eq!(
            replayed.iter().map(|event| (event.id.as_str(), event.sequence)).collect::<Vec<_>>(),
            response.events.iter().map(|event| (event.id.as_str(), event.sequence)).collect::<Vec<_>>()
        );
        assert_eq!(replayed.first().map(|event| (event.stage, event.status)), Some((ReasoningStage::QuestionIntake, StageStatus::Started)));

        let metrics = api.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.answers, 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn missing_client_data_refuses_and_unknown_request_errors() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ComplianceKernelApi::new(db_path.clone());
        api.import_corpus(&bundle()?)?;

        let response = api.ask(Query::new("Kolika je stopa doprinosa za mirovinsko osiguranje u Hrvatskoj?"))?;
        assert_eq!(response.terminal.refusal_reason(), Some(RefusalReason::MissingClientData));
        assert!(api.events("01JUNKNOWNREQUEST").is_err());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn unreachable_phraser_falls_back_to_template() -> Result<()> {
        let db_path = unique_temp_db_path();
        let config = KernelConfig {
            phrasing: Some(EndpointConfig { url: "http://127.0.0.1:9".to_string(), timeout_ms: 200 }),
            embedding: Some(EndpointConfig { url: "http://127.0.0.1:9/embed".to_string(), timeout_ms: 200 }),
            rollout: RolloutConfig { hybrid_percent: 100 },
            ..KernelConfig::default()
        };
        let api = ComplianceKernelApi::with_config(db_path.clone(), config);
        api.import_corpus(&bundle()?)?;

        let response = api.ask(Query::new("Koja je stopa PDV-a u Hrvatskoj?"))?;
        assert_eq!(response.variant, MatchVariant::Hybrid);
        assert_ne!(response.terminal.outcome(), "ERROR");
        assert!(api.metrics().semantic_fallbacks >= 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn invalid_bundle_is_rejected() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ComplianceKernelApi::new(db_path.clone());
        let mut bundle = bundle()?;
        bundle.rules[0].sources.clear();
        assert!(api.import_corpus(&bundle).is_err());
        assert!(load_corpus_bundle(&db_path.with_extension("missing.json")).is_err());

        cleanup(&db_path);
        Ok(())
    }
}
