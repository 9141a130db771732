//! SQLite-backed persistence for the Analysis entity (spec §3).
//!
//! Analyses are written once, atomically, on pipeline success (spec §4.5
//! step 3); partial runs never reach this store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::comparison::store::ComparisonStore;
use crate::error::Result;
use crate::pipeline::types::{Analysis, StageParams};

pub struct AnalysisStore {
    conn: Arc<Mutex<Connection>>,
}

impl AnalysisStore {
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
        let conn = self.conn.lock().expect("analysis store lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS analyses (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                creator TEXT NOT NULL,
                project TEXT,
                transcript_title TEXT,
                transcript_input TEXT NOT NULL,
                pii_redacted INTEGER NOT NULL,
                facts_output TEXT NOT NULL,
                insights_output TEXT NOT NULL,
                summary_output TEXT NOT NULL,
                stage_params TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                model TEXT NOT NULL,
                total_tokens INTEGER NOT NULL,
                total_cost REAL NOT NULL,
                total_duration_ms INTEGER NOT NULL,
                parent_trace_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_analyses_tenant ON analyses(tenant);",
        )?;
        Ok(())
    }

    pub fn insert(&self, analysis: &Analysis) -> Result<()> {
        let conn = self.conn.lock().expect("analysis store lock poisoned");
        conn.execute(
            "INSERT INTO analyses
                (id, tenant, creator, project, transcript_title, transcript_input,
                 pii_redacted, facts_output, insights_output, summary_output,
                 stage_params, system_prompt, model, total_tokens, total_cost,
                 total_duration_ms, parent_trace_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                analysis.id,
                analysis.tenant,
                analysis.creator,
                analysis.project,
                analysis.transcript_title,
                analysis.transcript_input,
                analysis.pii_redacted as i64,
                analysis.facts_output,
                analysis.insights_output,
                analysis.summary_output,
                serde_json::to_string(&analysis.stage_params)?,
                serde_json::to_string(&analysis.system_prompt)?,
                serde_json::to_string(&analysis.model)?,
                analysis.total_tokens,
                analysis.total_cost,
                analysis.total_duration_ms,
                analysis.parent_trace_id,
                analysis.created_at.to_rfc3339(),
                analysis.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Analysis>> {
        let conn = self.conn.lock().expect("analysis store lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, tenant, creator, project, transcript_title, transcript_input,
                        pii_redacted, facts_output, insights_output, summary_output,
                        stage_params, system_prompt, model, total_tokens, total_cost,
                        total_duration_ms, parent_trace_id, created_at, updated_at
                 FROM analyses WHERE id = ?1",
                params![id],
                row_to_analysis,
            )
            .optional()?;
        Ok(row)
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("analysis store lock poisoned");
        let updated = conn.execute(
            "UPDATE analyses SET transcript_title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    pub fn list(&self, tenant: &str) -> Result<Vec<Analysis>> {
        let conn = self.conn.lock().expect("analysis store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, tenant, creator, project, transcript_title, transcript_input,
                    pii_redacted, facts_output, insights_output, summary_output,
                    stage_params, system_prompt, model, total_tokens, total_cost,
                    total_duration_ms, parent_trace_id, created_at, updated_at
             FROM analyses WHERE tenant = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![tenant], row_to_analysis)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Removes the Analysis row only. Does not touch Comparisons referencing
    /// it — use [`delete_analysis_cascading`] unless the caller has already
    /// established no Comparison can reference this id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("analysis store lock poisoned");
        let deleted = conn.execute("DELETE FROM analyses WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn new_id() -> String {
        format!("analysis_{}", Uuid::new_v4())
    }
}

/// Deletes an Analysis and every Comparison referencing it on either side
/// (spec §4.7: "Deletion of an Analysis cascades to Comparisons referencing
/// it"). Comparisons are removed first so a reader can never observe a
/// Comparison whose Analysis is already gone.
pub fn delete_analysis_cascading(
    analyses: &AnalysisStore,
    comparisons: &ComparisonStore,
    id: &str,
) -> Result<bool> {
    comparisons.delete_referencing(id)?;
    analyses.delete(id)
}

fn row_to_analysis(row: &rusqlite::Row) -> rusqlite::Result<Analysis> {
    let stage_params: HashMap<String, StageParams> =
        serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default();
    let system_prompt: [String; 3] =
        serde_json::from_str(&row.get::<_, String>(11)?).unwrap_or_default();
    let model: [String; 3] = serde_json::from_str(&row.get::<_, String>(12)?).unwrap_or_default();

    Ok(Analysis {
        id: row.get(0)?,
        tenant: row.get(1)?,
        creator: row.get(2)?,
        project: row.get(3)?,
        transcript_title: row.get(4)?,
        transcript_input: row.get(5)?,
        pii_redacted: row.get::<_, i64>(6)? != 0,
        facts_output: row.get(7)?,
        insights_output: row.get(8)?,
        summary_output: row.get(9)?,
        stage_params,
        system_prompt,
        model,
        total_tokens: row.get::<_, i64>(13)? as u32,
        total_cost: row.get(14)?,
        total_duration_ms: row.get::<_, i64>(15)? as u64,
        parent_trace_id: row.get(16)?,
        created_at: row.get::<_, String>(17)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(18)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}
