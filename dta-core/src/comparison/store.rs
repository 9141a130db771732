//! SQLite-backed persistence for the Comparison entity (spec §3, §4.7).
//!
//! A `UNIQUE` index on `(tenant, pair_key, judge_model)` is the write-time
//! half of the duplicate guard (spec §4.7, §9 "Duplicate guard under
//! races"); the advisory lock in [`crate::comparison::guard`] is the other.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::judge::types::{Comparison, ComparisonMetadata, StageVerdict, Winner};

pub struct ComparisonStore {
    conn: Arc<Mutex<Connection>>,
}

/// Unordered-pair key used both for the UNIQUE index and the advisory lock
/// (spec glossary: "Unordered-pair uniqueness").
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

impl ComparisonStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS comparisons (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                creator TEXT NOT NULL,
                analysis_a TEXT NOT NULL,
                analysis_b TEXT NOT NULL,
                pair_key TEXT NOT NULL,
                judge_model TEXT NOT NULL,
                judge_model_version TEXT NOT NULL,
                judge_temperature REAL NOT NULL,
                evaluation_criteria TEXT NOT NULL,
                stage1 TEXT NOT NULL,
                stage2 TEXT NOT NULL,
                stage3 TEXT NOT NULL,
                overall TEXT NOT NULL,
                judge_trace_id TEXT NOT NULL,
                comparison_metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_comparisons_dedup
                ON comparisons(tenant, pair_key, judge_model);
            CREATE INDEX IF NOT EXISTS idx_comparisons_analysis_a ON comparisons(analysis_a);
            CREATE INDEX IF NOT EXISTS idx_comparisons_analysis_b ON comparisons(analysis_b);",
        )?;
        Ok(())
    }

    /// Returns the existing comparison for this `(tenant, unordered pair,
    /// judge_model)` scope, if any (spec §4.7).
    pub fn find_existing(
        &self,
        tenant: &str,
        analysis_a: &str,
        analysis_b: &str,
        judge_model: &str,
    ) -> Result<Option<Comparison>> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        let key = pair_key(analysis_a, analysis_b);
        let row = conn
            .query_row(
                "SELECT id, tenant, creator, analysis_a, analysis_b, judge_model,
                        judge_model_version, judge_temperature, evaluation_criteria,
                        stage1, stage2, stage3, overall, judge_trace_id,
                        comparison_metadata, created_at
                 FROM comparisons WHERE tenant = ?1 AND pair_key = ?2 AND judge_model = ?3",
                params![tenant, key, judge_model],
                row_to_comparison,
            )
            .optional()?;
        Ok(row)
    }

    /// Inserts a new comparison. Relies on the `UNIQUE` index to reject a
    /// concurrent duplicate at write time; any such conflict is translated
    /// into `DuplicateConflict` carrying the pre-existing id.
    pub fn insert(&self, comparison: &Comparison) -> Result<()> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        let key = pair_key(&comparison.analysis_a, &comparison.analysis_b);
        let result = conn.execute(
            "INSERT INTO comparisons
                (id, tenant, creator, analysis_a, analysis_b, pair_key, judge_model,
                 judge_model_version, judge_temperature, evaluation_criteria,
                 stage1, stage2, stage3, overall, judge_trace_id, comparison_metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                comparison.id,
                comparison.tenant,
                comparison.creator,
                comparison.analysis_a,
                comparison.analysis_b,
                key,
                comparison.judge_model,
                comparison.judge_model_version,
                comparison.judge_temperature,
                serde_json::to_string(&comparison.evaluation_criteria)?,
                serde_json::to_string(&comparison.stage1)?,
                serde_json::to_string(&comparison.stage2)?,
                serde_json::to_string(&comparison.stage3)?,
                serde_json::to_string(&comparison.overall)?,
                comparison.judge_trace_id,
                serde_json::to_string(&comparison.comparison_metadata)?,
                comparison.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                drop(conn);
                let existing = self
                    .find_existing(&comparison.tenant, &comparison.analysis_a, &comparison.analysis_b, &comparison.judge_model)?
                    .ok_or_else(|| Error::Internal("constraint violation with no matching row".into()))?;
                Err(Error::duplicate_conflict(existing.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Comparison>> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, tenant, creator, analysis_a, analysis_b, judge_model,
                        judge_model_version, judge_temperature, evaluation_criteria,
                        stage1, stage2, stage3, overall, judge_trace_id,
                        comparison_metadata, created_at
                 FROM comparisons WHERE id = ?1",
                params![id],
                row_to_comparison,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list(&self, tenant: &str) -> Result<Vec<Comparison>> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, tenant, creator, analysis_a, analysis_b, judge_model,
                    judge_model_version, judge_temperature, evaluation_criteria,
                    stage1, stage2, stage3, overall, judge_trace_id,
                    comparison_metadata, created_at
             FROM comparisons WHERE tenant = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![tenant], row_to_comparison)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        let deleted = conn.execute("DELETE FROM comparisons WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Deletes every comparison referencing `analysis_id` on either side
    /// (spec §4.7: "Deletion of an Analysis cascades to Comparisons
    /// referencing it").
    pub fn delete_referencing(&self, analysis_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("comparison store lock poisoned");
        let deleted = conn.execute(
            "DELETE FROM comparisons WHERE analysis_a = ?1 OR analysis_b = ?1",
            params![analysis_id],
        )?;
        Ok(deleted)
    }

    pub fn new_id() -> String {
        format!("comparison_{}", Uuid::new_v4())
    }
}

fn row_to_comparison(row: &rusqlite::Row) -> rusqlite::Result<Comparison> {
    let evaluation_criteria: Vec<String> = serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default();
    let stage1: StageVerdict = serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_else(|_| empty_verdict());
    let stage2: StageVerdict = serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_else(|_| empty_verdict());
    let stage3: StageVerdict = serde_json::from_str(&row.get::<_, String>(11)?).unwrap_or_else(|_| empty_verdict());
    let overall: StageVerdict = serde_json::from_str(&row.get::<_, String>(12)?).unwrap_or_else(|_| empty_verdict());
    let comparison_metadata: ComparisonMetadata =
        serde_json::from_str(&row.get::<_, String>(14)?).unwrap_or_else(|_| ComparisonMetadata {
            cost_a: 0.0,
            cost_b: 0.0,
            tokens_a: 0,
            tokens_b: 0,
            total_cost: 0.0,
            duration_ms: 0,
            cost_difference_pct: None,
            quality_improvement_pct: None,
            implied_winner: Winner::Tie,
            clamped_fields: vec![],
        });

    Ok(Comparison {
        id: row.get(0)?,
        tenant: row.get(1)?,
        creator: row.get(2)?,
        analysis_a: row.get(3)?,
        analysis_b: row.get(4)?,
        judge_model: row.get(5)?,
        judge_model_version: row.get(6)?,
        judge_temperature: row.get(7)?,
        evaluation_criteria,
        stage1,
        stage2,
        stage3,
        overall,
        judge_trace_id: row.get(13)?,
        comparison_metadata,
        created_at: row.get::<_, String>(15)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn empty_verdict() -> StageVerdict {
    StageVerdict {
        winner: Winner::Tie,
        scores_a: Default::default(),
        scores_b: Default::default(),
        reasoning: String::new(),
    }
}
