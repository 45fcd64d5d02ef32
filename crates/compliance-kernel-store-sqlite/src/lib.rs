use std::path::Path;

use anyhow::{anyhow, Context, Result};
use compliance_kernel_core::dates::{format_date, parse_date};
use compliance_kernel_core::{
    Authority, ConceptRecord, CorpusBundle, EvidenceRecord, ReasoningEvent, RepositoryError,
    RuleRecord, RuleRepository, RuleStatus, SourcePointerRecord, ValueType,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS concepts (
  id TEXT PRIMARY KEY,
  slug TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  aliases_json TEXT NOT NULL,
  embedding_json TEXT
);

CREATE TABLE IF NOT EXISTS evidence (
  id TEXT PRIMARY KEY,
  url TEXT NOT NULL,
  fetched_at TEXT,
  source TEXT NOT NULL,
  title TEXT
);

CREATE TABLE IF NOT EXISTS rules (
  id TEXT PRIMARY KEY,
  concept_slug TEXT NOT NULL,
  title TEXT NOT NULL,
  law_reference TEXT,
  authority TEXT NOT NULL CHECK (authority IN ('LAW','REGULATION','GUIDANCE','PRACTICE','PROCEDURE')),
  status TEXT NOT NULL CHECK (status IN ('draft','published','deprecated')),
  effective_from TEXT,
  effective_until TEXT,
  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
  value TEXT NOT NULL,
  value_type TEXT NOT NULL CHECK (value_type IN ('percentage','currency','number','text','boolean','date')),
  applies_if_json TEXT,
  FOREIGN KEY (concept_slug) REFERENCES concepts(slug)
);

CREATE TABLE IF NOT EXISTS rule_sources (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  rule_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  exact_quote TEXT NOT NULL,
  evidence_id TEXT NOT NULL,
  UNIQUE(rule_id, position),
  FOREIGN KEY (rule_id) REFERENCES rules(id),
  FOREIGN KEY (evidence_id) REFERENCES evidence(id)
);

CREATE TABLE IF NOT EXISTS corpus_imports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  imported_at TEXT NOT NULL,
  bundle_sha256 TEXT NOT NULL,
  concepts INTEGER NOT NULL,
  rules INTEGER NOT NULL,
  evidence INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_concept_status ON rules(concept_slug, status);
CREATE INDEX IF NOT EXISTS idx_rule_sources_rule ON rule_sources(rule_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS reasoning_events (
  event_id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  stage TEXT NOT NULL,
  status TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  event_json TEXT NOT NULL,
  UNIQUE(request_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_reasoning_events_request ON reasoning_events(request_id, sequence);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub bundle_sha256: String,
    pub imported_concepts: usize,
    pub skipped_existing_concepts: usize,
    pub imported_evidence: usize,
    pub skipped_existing_evidence: usize,
    pub imported_rules: usize,
    pub skipped_existing_rules: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusCounts {
    pub concepts: usize,
    pub rules: usize,
    pub evidence: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed corpus store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (mut version, inferred) = detect_effective_schema_version(&self.conn)?;
        if inferred {
            // Tables exist but the migration ledger was never written.
            for applied in 1..=version {
                record_schema_version(&self.conn, applied)?;
            }
        }

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "schema migration applied");
        Ok(())
    }

    /// Import a corpus bundle. Rows whose id already exists are skipped, never overwritten.
    ///
    /// # Errors
    /// Returns an error when the bundle fails validation or any write fails; nothing is
    /// written in that case.
    pub fn import_corpus(&mut self, bundle: &CorpusBundle) -> Result<ImportSummary> {
        bundle.validate().map_err(|err| anyhow!("corpus validation failed: {err}"))?;

        let encoded = serde_json::to_vec(bundle).context("failed to serialize corpus bundle")?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        let mut summary =
            ImportSummary { bundle_sha256: format!("{:x}", hasher.finalize()), ..ImportSummary::default() };

        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for concept in &bundle.concepts {
            if row_exists(&tx, "concepts", &concept.id)? {
                summary.skipped_existing_concepts += 1;
                continue;
            }
            insert_concept(&tx, concept)?;
            summary.imported_concepts += 1;
        }

        for record in &bundle.evidence {
            if row_exists(&tx, "evidence", &record.id)? {
                summary.skipped_existing_evidence += 1;
                continue;
            }
            insert_evidence(&tx, record)?;
            summary.imported_evidence += 1;
        }

        for rule in &bundle.rules {
            if row_exists(&tx, "rules", &rule.id)? {
                summary.skipped_existing_rules += 1;
                continue;
            }
            insert_rule(&tx, rule)?;
            summary.imported_rules += 1;
        }

        tx.execute(
            "INSERT INTO corpus_imports(imported_at, bundle_sha256, concepts, rules, evidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                now_rfc3339()?,
                summary.bundle_sha256,
                count_as_i64(summary.imported_concepts)?,
                count_as_i64(summary.imported_rules)?,
                count_as_i64(summary.imported_evidence)?,
            ],
        )
        .context("failed to record corpus import")?;
        tx.commit().context("failed to commit corpus import")?;

        tracing::info!(
            sha256 = %summary.bundle_sha256,
            concepts = summary.imported_concepts,
            rules = summary.imported_rules,
            evidence = summary.imported_evidence,
            "corpus imported"
        );
        Ok(summary)
    }

    /// Count persisted corpus rows.
    ///
    /// # Errors
    /// Returns an error when the tables cannot be read.
    pub fn corpus_counts(&self) -> Result<CorpusCounts> {
        let count = |table: &str| -> Result<usize> {
            let total = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
                .with_context(|| format!("failed to count {table}"))?;
            usize::try_from(total).context("row count out of range")
        };
        Ok(CorpusCounts { concepts: count("concepts")?, rules: count("rules")?, evidence: count("evidence")? })
    }

    /// Append reasoning events to the audit trail in one transaction.
    ///
    /// # Errors
    /// Returns an error when an event cannot be serialized or a row already exists.
    pub fn append_events(&mut self, events: &[ReasoningEvent]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start audit transaction")?;
        for event in events {
            tx.execute(
                "INSERT INTO reasoning_events(
                    event_id, request_id, sequence, stage, status, recorded_at, event_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id,
                    event.request_id,
                    event.sequence,
                    event.stage.as_str(),
                    event.status.as_str(),
                    rfc3339(event.timestamp)?,
                    serde_json::to_string(event).context("failed to serialize reasoning event")?,
                ],
            )
            .with_context(|| format!("failed to append reasoning event {}", event.id))?;
        }
        tx.commit().context("failed to commit audit transaction")?;
        Ok(events.len())
    }

    /// Replay a request's events in sequence order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_events(&self, request_id: &str) -> Result<Vec<ReasoningEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_json FROM reasoning_events WHERE request_id = ?1 ORDER BY sequence ASC",
        )?;
        let mut rows = stmt.query(params![request_id])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            events.push(serde_json::from_str(&raw).context("failed to deserialize reasoning event")?);
        }
        Ok(events)
    }

    fn load_concepts(&self) -> Result<Vec<ConceptRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, slug, name, aliases_json, embedding_json FROM concepts ORDER BY slug ASC")?;
        let mut rows = stmt.query([])?;
        let mut concepts = Vec::new();
        while let Some(row) = rows.next()? {
            let aliases_json: String = row.get(3)?;
            let embedding_json: Option<String> = row.get(4)?;
            concepts.push(ConceptRecord {
                id: row.get(0)?,
                slug: row.get(1)?,
                name: row.get(2)?,
                aliases: serde_json::from_str(&aliases_json).context("failed to deserialize aliases")?,
                embedding: embedding_json
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .context("failed to deserialize embedding")?,
            });
        }
        Ok(concepts)
    }

    fn load_rules(&self, concept_slugs: &[String], status: RuleStatus) -> Result<Vec<RuleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                id, concept_slug, title, law_reference, authority, status,
                effective_from, effective_until, confidence, value, value_type, applies_if_json
             FROM rules
             WHERE concept_slug = ?1 AND status = ?2
             ORDER BY id ASC",
        )?;

        let mut rules = Vec::new();
        for slug in concept_slugs {
            let mut rows = stmt.query(params![slug, status.as_str()])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let authority_raw: String = row.get(4)?;
                let status_raw: String = row.get(5)?;
                let value_type_raw: String = row.get(10)?;
                let applies_if_json: Option<String> = row.get(11)?;
                let sources = self.load_sources(&id)?;
                #[allow(clippy::cast_possible_truncation)]
                let confidence = row.get::<_, f64>(8)? as f32;

                rules.push(RuleRecord {
                    concept_slug: row.get(1)?,
                    title: row.get(2)?,
                    law_reference: row.get(3)?,
                    authority: Authority::parse(&authority_raw)
                        .ok_or_else(|| anyhow!("unknown authority: {authority_raw}"))?,
                    status: RuleStatus::parse(&status_raw)
                        .ok_or_else(|| anyhow!("unknown rule status: {status_raw}"))?,
                    effective_from: parse_optional_date(row.get(6)?)?,
                    effective_until: parse_optional_date(row.get(7)?)?,
                    confidence,
                    value: row.get(9)?,
                    value_type: ValueType::parse(&value_type_raw)
                        .ok_or_else(|| anyhow!("unknown value_type: {value_type_raw}"))?,
                    applies_if: applies_if_json
                        .map(|raw| serde_json::from_str(&raw))
                        .transpose()
                        .context("failed to deserialize applies_if")?,
                    sources,
                    id,
                });
            }
        }
        Ok(rules)
    }

    fn load_sources(&self, rule_id: &str) -> Result<Vec<SourcePointerRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT exact_quote, evidence_id FROM rule_sources WHERE rule_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![rule_id], |row| {
            Ok(SourcePointerRecord { exact_quote: row.get(0)?, evidence_id: row.get(1)? })
        })?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row?);
        }
        Ok(sources)
    }

    fn load_evidence(&self, evidence_ids: &[String]) -> Result<Vec<EvidenceRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, url, fetched_at, source, title FROM evidence WHERE id = ?1")?;
        let mut records = Vec::new();
        for id in evidence_ids {
            let row = stmt
                .query_row(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .optional()?;
            let Some((id, url, fetched_at, source, title)) = row else {
                continue;
            };
            records.push(EvidenceRecord {
                id,
                url,
                fetched_at: fetched_at.as_deref().map(parse_rfc3339).transpose()?,
                source,
                title,
            });
        }
        Ok(records)
    }
}

impl RuleRepository for SqliteStore {
    fn find_concepts(&self) -> Result<Vec<ConceptRecord>, RepositoryError> {
        self.load_concepts().map_err(repository_error)
    }

    fn find_rules(&self, concept_slugs: &[String], status: RuleStatus) -> Result<Vec<RuleRecord>, RepositoryError> {
        self.load_rules(concept_slugs, status).map_err(repository_error)
    }

    fn find_evidence(&self, evidence_ids: &[String]) -> Result<Vec<EvidenceRecord>, RepositoryError> {
        self.load_evidence(evidence_ids).map_err(repository_error)
    }
}

/// Lock contention is retriable capacity pressure; anything SQLite itself reports is an
/// unavailable store; everything else is a row that failed to decode.
fn repository_error(err: anyhow::Error) -> RepositoryError {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _))
            if matches!(failure.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) =>
        {
            RepositoryError::Busy(err.to_string())
        }
        Some(_) => RepositoryError::Unavailable(err.to_string()),
        None => RepositoryError::Corrupt(format!("{err:#}")),
    }
}

fn insert_concept(tx: &Transaction<'_>, concept: &ConceptRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO concepts(id, slug, name, aliases_json, embedding_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            concept.id,
            concept.slug,
            concept.name,
            serde_json::to_string(&concept.aliases).context("failed to serialize aliases")?,
            concept
                .embedding
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize embedding")?,
        ],
    )
    .with_context(|| format!("failed to insert concept {}", concept.id))?;
    Ok(())
}

fn insert_evidence(tx: &Transaction<'_>, record: &EvidenceRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO evidence(id, url, fetched_at, source, title) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.url,
            record.fetched_at.map(rfc3339).transpose()?,
            record.source,
            record.title,
        ],
    )
    .with_context(|| format!("failed to insert evidence {}", record.id))?;
    Ok(())
}

fn insert_rule(tx: &Transaction<'_>, rule: &RuleRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO rules(
            id, concept_slug, title, law_reference, authority, status,
            effective_from, effective_until, confidence, value, value_type, applies_if_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            rule.id,
            rule.concept_slug,
            rule.title,
            rule.law_reference,
            rule.authority.as_str(),
            rule.status.as_str(),
            rule.effective_from.map(format_date),
            rule.effective_until.map(format_date),
            f64::from(rule.confidence),
            rule.value,
            rule.value_type.as_str(),
            rule.applies_if
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize applies_if")?,
        ],
    )
    .with_context(|| format!("failed to insert rule {}", rule.id))?;

    for (position, source) in rule.sources.iter().enumerate() {
        tx.execute(
            "INSERT INTO rule_sources(rule_id, position, exact_quote, evidence_id) VALUES (?1, ?2, ?3, ?4)",
            params![rule.id, count_as_i64(position)?, source.exact_quote, source.evidence_id],
        )
        .with_context(|| format!("failed to insert source pointer for rule {}", rule.id))?;
    }
    Ok(())
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let exists = conn
        .query_row(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"), params![id], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("failed to check {table} row {id}"))?;
    Ok(exists == 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    let has_corpus = table_exists(conn, "rules")? && table_exists(conn, "concepts")?;
    let has_audit = table_exists(conn, "reasoning_events")?;
    match (has_corpus, has_audit) {
        (false, false) => Ok((0, false)),
        (true, false) => Ok((1, true)),
        (true, true) => Ok((2, true)),
        (false, true) => Err(anyhow!(
            "database schema is invalid: reasoning_events exists without corpus tables"
        )),
    }
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn count_as_i64(count: usize) -> Result<i64> {
    i64::try_from(count).context("count out of range")
}

fn parse_optional_date(raw: Option<String>) -> Result<Option<time::Date>> {
    raw.map(|value| parse_date(&value).ok_or_else(|| anyhow!("invalid date: {value}")))
        .transpose()
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
