//! Evaluation-result store, keyed by trace (spec §4.8).

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::Result;
use crate::evaluation::types::{EvaluationResult, EvaluationStatus};

pub struct EvaluationResultStore {
    conn: Arc<Mutex<Connection>>,
}

impl EvaluationResultStore {
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
        let conn = self.conn.lock().expect("evaluation store lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evaluation_results (
                id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                analysis_id TEXT,
                evaluator_id TEXT NOT NULL,
                status TEXT NOT NULL,
                score REAL,
                passed INTEGER,
                reason TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_evaluation_results_trace ON evaluation_results(trace_id);",
        )?;
        Ok(())
    }

    pub fn insert(&self, result: &EvaluationResult) -> Result<()> {
        let conn = self.conn.lock().expect("evaluation store lock poisoned");
        let status = match result.status {
            EvaluationStatus::Ok => "ok",
            EvaluationStatus::Error => "error",
        };
        conn.execute(
            "INSERT INTO evaluation_results
                (id, trace_id, analysis_id, evaluator_id, status, score, passed, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id,
                result.trace_id,
                result.analysis_id,
                result.evaluator_id,
                status,
                result.score,
                result.passed,
                result.reason,
                result.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn for_trace(&self, trace_id: &str) -> Result<Vec<EvaluationResult>> {
        let conn = self.conn.lock().expect("evaluation store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, trace_id, analysis_id, evaluator_id, status, score, passed, reason, created_at
             FROM evaluation_results WHERE trace_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![trace_id], row_to_result)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[allow(dead_code)]
    pub fn get(&self, id: &str) -> Result<Option<EvaluationResult>> {
        let conn = self.conn.lock().expect("evaluation store lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, trace_id, analysis_id, evaluator_id, status, score, passed, reason, created_at
                 FROM evaluation_results WHERE id = ?1",
                params![id],
                row_to_result,
            )
            .optional()?;
        Ok(row)
    }

    pub fn new_id() -> String {
        format!("eval_{}", Uuid::new_v4())
    }
}

fn row_to_result(row: &rusqlite::Row) -> rusqlite::Result<EvaluationResult> {
    let status_str: String = row.get(4)?;
    let status = match status_str.as_str() {
        "ok" => EvaluationStatus::Ok,
        _ => EvaluationStatus::Error,
    };
    Ok(EvaluationResult {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        analysis_id: row.get(2)?,
        evaluator_id: row.get(3)?,
        status,
        score: row.get(5)?,
        passed: row.get(6)?,
        reason: row.get(7)?,
        created_at: row.get::<_, String>(8)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(trace_id: &str, evaluator_id: &str) -> EvaluationResult {
        EvaluationResult {
            id: EvaluationResultStore::new_id(),
            trace_id: trace_id.to_string(),
            analysis_id: Some("analysis_1".to_string()),
            evaluator_id: evaluator_id.to_string(),
            status: EvaluationStatus::Ok,
            score: Some(0.8),
            passed: Some(true),
            reason: Some("looks good".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_and_query_by_trace() {
        let store = EvaluationResultStore::in_memory().unwrap();
        store.insert(&sample("trace_1", "eval-a")).unwrap();
        store.insert(&sample("trace_1", "eval-b")).unwrap();
        store.insert(&sample("trace_2", "eval-a")).unwrap();

        let results = store.for_trace("trace_1").unwrap();
        assert_eq!(results.len(), 2);
    }
}
