//! Trace Recorder (C4) — append-only writer of parent traces, child spans,
//! and trace metadata (spec §4.4).

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::provider::ExecResult;
use crate::trace::types::{Span, SpanType, Status, Trace, TraceSource};

/// Opaque handle to an open parent trace.
#[derive(Debug, Clone)]
pub struct ParentHandle {
    pub id: String,
    pub otel_trace_id: String,
}

/// Opaque handle to an open child span.
#[derive(Debug, Clone)]
pub struct SpanHandle {
    pub id: String,
    pub otel_span_id: String,
    pub trace_id: String,
}

pub struct TraceRecorder {
    conn: Arc<Mutex<Connection>>,
}

impl TraceRecorder {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let recorder = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        recorder.initialize_schema()?;
        Ok(recorder)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let recorder = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        recorder.initialize_schema()?;
        Ok(recorder)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("recorder lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS traces (
                id TEXT PRIMARY KEY,
                otel_trace_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                tenant TEXT NOT NULL,
                creator TEXT NOT NULL,
                project TEXT,
                input_data TEXT NOT NULL,
                output_data TEXT NOT NULL,
                trace_metadata TEXT NOT NULL,
                source TEXT NOT NULL,
                parent_trace_id TEXT,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                total_duration_ms INTEGER NOT NULL DEFAULT 0,
                model_name TEXT,
                provider TEXT,
                created_at TEXT NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_traces_source ON traces(source);
            CREATE INDEX IF NOT EXISTS idx_traces_parent_trace_id ON traces(parent_trace_id);

            CREATE TABLE IF NOT EXISTS spans (
                id TEXT PRIMARY KEY,
                otel_span_id TEXT NOT NULL UNIQUE,
                parent_span_id TEXT,
                trace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                span_type TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                model_name TEXT,
                model_params TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 1,
                closed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_spans_trace_id ON spans(trace_id);",
        )?;
        Ok(())
    }

    pub fn open_parent(
        &self,
        source: TraceSource,
        name: &str,
        tenant: &str,
        creator: &str,
        project: Option<&str>,
    ) -> Result<ParentHandle> {
        let id = format!("trace_{}", Uuid::new_v4());
        let otel_trace_id = Uuid::new_v4().to_string();
        let metadata = serde_json::json!({ "source": source.as_str() });

        let conn = self.conn.lock().expect("recorder lock poisoned");
        conn.execute(
            "INSERT INTO traces
                (id, otel_trace_id, name, status, tenant, creator, project, input_data,
                 output_data, trace_metadata, source, parent_trace_id, created_at, closed)
             VALUES (?1, ?2, ?3, 'ok', ?4, ?5, ?6, '{}', '{}', ?7, ?8, NULL, ?9, 0)",
            params![
                id,
                otel_trace_id,
                name,
                tenant,
                creator,
                project,
                metadata.to_string(),
                source.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(ParentHandle { id, otel_trace_id })
    }

    pub fn open_span(
        &self,
        parent: &ParentHandle,
        name: &str,
        span_type: SpanType,
        model_name: Option<&str>,
        model_params: Value,
    ) -> Result<SpanHandle> {
        let id = format!("span_{}", Uuid::new_v4());
        let otel_span_id = Uuid::new_v4().to_string();
        let span_type_str = match span_type {
            SpanType::Llm => "llm",
            SpanType::Tool => "tool",
            SpanType::Workflow => "workflow",
        };

        let conn = self.conn.lock().expect("recorder lock poisoned");
        conn.execute(
            "INSERT INTO spans
                (id, otel_span_id, parent_span_id, trace_id, name, span_type, status,
                 start_time, end_time, model_name, model_params, closed)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, 'ok', ?6, NULL, ?7, ?8, 0)",
            params![
                id,
                otel_span_id,
                parent.id,
                name,
                span_type_str,
                Utc::now().to_rfc3339(),
                model_name,
                model_params.to_string(),
            ],
        )?;

        Ok(SpanHandle {
            id,
            otel_span_id,
            trace_id: parent.id.clone(),
        })
    }

    /// Finalizes a span on a successful adapter call.
    pub fn close_span_ok(&self, span: &SpanHandle, result: &ExecResult, attempt_count: u32) -> Result<()> {
        self.close_span_inner(
            span,
            Status::Ok,
            result.usage.input_tokens,
            result.usage.output_tokens,
            result.total_cost,
            attempt_count,
        )
    }

    /// Finalizes a span that failed, timed out, or was cancelled.
    pub fn close_span_failed(&self, span: &SpanHandle, status: Status, attempt_count: u32) -> Result<()> {
        self.close_span_inner(span, status, 0, 0, 0.0, attempt_count)
    }

    /// `duration_ms` is always derived from the span's own `start_time` and
    /// the close-time timestamp, never trusted from the caller — a retried
    /// or slow-to-resolve call must still satisfy `duration_ms = (end_time -
    /// start_time)·1000` (spec §8).
    fn close_span_inner(
        &self,
        span: &SpanHandle,
        status: Status,
        prompt_tokens: u32,
        completion_tokens: u32,
        total_cost: f64,
        attempt_count: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("recorder lock poisoned");
        let (closed, start_time_str): (i64, String) = conn.query_row(
            "SELECT closed, start_time FROM spans WHERE id = ?1",
            params![span.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if closed != 0 {
            return Err(Error::Internal(format!("span {} already closed", span.id)));
        }
        let start_time: DateTime<Utc> = start_time_str
            .parse()
            .map_err(|_| Error::Internal(format!("invalid start_time for span {}", span.id)))?;
        let end_time = Utc::now();
        let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;
        conn.execute(
            "UPDATE spans SET status = ?1, end_time = ?2, prompt_tokens = ?3,
                completion_tokens = ?4, total_cost = ?5, duration_ms = ?6,
                attempt_count = ?7, closed = 1
             WHERE id = ?8",
            params![
                status.as_str(),
                end_time.to_rfc3339(),
                prompt_tokens,
                completion_tokens,
                total_cost,
                duration_ms,
                attempt_count,
                span.id,
            ],
        )?;
        Ok(())
    }

    /// Aggregates child rollups and writes the final parent status (spec
    /// §4.4 invariant: if any child is `error`, parent is `error`).
    pub fn close_parent(&self, parent: &ParentHandle, status: Status) -> Result<()> {
        let conn = self.conn.lock().expect("recorder lock poisoned");
        let closed: i64 = conn.query_row(
            "SELECT closed FROM traces WHERE id = ?1",
            params![parent.id],
            |row| row.get(0),
        )?;
        if closed != 0 {
            return Err(Error::Internal(format!("trace {} already closed", parent.id)));
        }

        let (total_tokens, total_cost, total_duration_ms, any_error): (i64, f64, i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(prompt_tokens + completion_tokens), 0),
                        COALESCE(SUM(total_cost), 0),
                        COALESCE(SUM(duration_ms), 0),
                        COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0)
                 FROM spans WHERE trace_id = ?1",
                params![parent.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let final_status = if any_error > 0 { Status::Error } else { status };

        conn.execute(
            "UPDATE traces SET status = ?1, total_tokens = ?2, total_cost = ?3,
                total_duration_ms = ?4, closed = 1
             WHERE id = ?5",
            params![
                final_status.as_str(),
                total_tokens,
                total_cost,
                total_duration_ms,
                parent.id,
            ],
        )?;
        Ok(())
    }

    /// Merges additional keys into `trace_metadata` (e.g. `parent_trace_id`,
    /// warnings, clamped-field lists).
    pub fn link_metadata(&self, parent: &ParentHandle, extra: Value) -> Result<()> {
        let conn = self.conn.lock().expect("recorder lock poisoned");
        let current: String = conn.query_row(
            "SELECT trace_metadata FROM traces WHERE id = ?1",
            params![parent.id],
            |row| row.get(0),
        )?;
        let mut metadata: Value = serde_json::from_str(&current)?;
        if let (Some(existing), Some(extra_obj)) = (metadata.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                existing.insert(k.clone(), v.clone());
            }
        }
        conn.execute(
            "UPDATE traces SET trace_metadata = ?1 WHERE id = ?2",
            params![metadata.to_string(), parent.id],
        )?;
        Ok(())
    }

    pub fn get_trace(&self, id: &str) -> Result<Option<Trace>> {
        let conn = self.conn.lock().expect("recorder lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, otel_trace_id, name, status, input_data, output_data,
                        trace_metadata, total_tokens, total_cost, total_duration_ms,
                        model_name, provider, created_at, closed
                 FROM traces WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Trace {
                        id: row.get(0)?,
                        otel_trace_id: row.get(1)?,
                        name: row.get(2)?,
                        status: Status::from_str(&row.get::<_, String>(3)?),
                        input_data: serde_json::from_str(&row.get::<_, String>(4)?)
                            .unwrap_or(Value::Null),
                        output_data: serde_json::from_str(&row.get::<_, String>(5)?)
                            .unwrap_or(Value::Null),
                        trace_metadata: serde_json::from_str(&row.get::<_, String>(6)?)
                            .unwrap_or(Value::Null),
                        total_tokens: row.get::<_, i64>(7)? as u32,
                        total_cost: row.get(8)?,
                        total_duration_ms: row.get::<_, i64>(9)? as u64,
                        model_name: row.get(10)?,
                        provider: row.get(11)?,
                        created_at: row
                            .get::<_, String>(12)?
                            .parse()
                            .unwrap_or_else(|_| Utc::now()),
                        closed: row.get::<_, i64>(13)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<Span>> {
        let conn = self.conn.lock().expect("recorder lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, otel_span_id, parent_span_id, trace_id, name, span_type, status,
                    start_time, end_time, model_name, model_params, prompt_tokens,
                    completion_tokens, total_cost, duration_ms, attempt_count, closed
             FROM spans WHERE trace_id = ?1 ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map(params![trace_id], |row| {
            let span_type = match row.get::<_, String>(5)?.as_str() {
                "tool" => SpanType::Tool,
                "workflow" => SpanType::Workflow,
                _ => SpanType::Llm,
            };
            Ok(Span {
                id: row.get(0)?,
                otel_span_id: row.get(1)?,
                parent_span_id: row.get(2)?,
                trace_id: row.get(3)?,
                name: row.get(4)?,
                span_type,
                status: Status::from_str(&row.get::<_, String>(6)?),
                start_time: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
                end_time: row
                    .get::<_, Option<String>>(8)?
                    .and_then(|s| s.parse().ok()),
                model_name: row.get(9)?,
                model_params: serde_json::from_str(&row.get::<_, String>(10)?)
                    .unwrap_or(Value::Null),
                prompt_tokens: row.get::<_, i64>(11)? as u32,
                completion_tokens: row.get::<_, i64>(12)? as u32,
                total_cost: row.get(13)?,
                duration_ms: row.get::<_, Option<i64>>(14)?.map(|v| v as u64),
                attempt_count: row.get::<_, i64>(15)? as u32,
                closed: row.get::<_, i64>(16)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_parent_and_span_rollup() {
        let recorder = TraceRecorder::in_memory().unwrap();
        let parent = recorder
            .open_parent(TraceSource::DtaPipeline, "dta-run", "acme", "user-1", None)
            .unwrap();
        let span = recorder
            .open_span(&parent, "stage-1", SpanType::Llm, Some("m-cheap"), serde_json::json!({}))
            .unwrap();
        let result = ExecResult {
            content: "F".to_string(),
            usage: crate::provider::TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            input_cost: 0.0001,
            output_cost: 0.0001,
            total_cost: 0.0002,
            duration_ms: 10,
            finish_reason: crate::provider::StopReason::Stop,
            model_version: "m-cheap-v1".to_string(),
            provider_request_id: None,
        };
        recorder.close_span_ok(&span, &result, 1).unwrap();
        recorder.close_parent(&parent, Status::Ok).unwrap();

        let trace = recorder.get_trace(&parent.id).unwrap().unwrap();
        assert_eq!(trace.total_tokens, 150);
        assert!((trace.total_cost - 0.0002).abs() < 1e-9);
        assert_eq!(trace.status, Status::Ok);
    }

    #[test]
    fn any_child_error_forces_parent_error() {
        let recorder = TraceRecorder::in_memory().unwrap();
        let parent = recorder
            .open_parent(TraceSource::DtaPipeline, "dta-run", "acme", "user-1", None)
            .unwrap();
        let span = recorder
            .open_span(&parent, "stage-1", SpanType::Llm, None, serde_json::json!({}))
            .unwrap();
        recorder
            .close_span_failed(&span, Status::Error, 3)
            .unwrap();
        recorder.close_parent(&parent, Status::Ok).unwrap();

        let trace = recorder.get_trace(&parent.id).unwrap().unwrap();
        assert_eq!(trace.status, Status::Error);
    }

    #[test]
    fn reopening_closed_span_is_rejected() {
        let recorder = TraceRecorder::in_memory().unwrap();
        let parent = recorder
            .open_parent(TraceSource::Judge, "judge-run", "acme", "user-1", None)
            .unwrap();
        let span = recorder
            .open_span(&parent, "call-1", SpanType::Llm, None, serde_json::json!({}))
            .unwrap();
        recorder
            .close_span_failed(&span, Status::Ok, 1)
            .unwrap();
        let err = recorder.close_span_failed(&span, Status::Ok, 1).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn otel_trace_ids_are_unique() {
        let recorder = TraceRecorder::in_memory().unwrap();
        let a = recorder
            .open_parent(TraceSource::Playground, "t1", "acme", "u", None)
            .unwrap();
        let b = recorder
            .open_parent(TraceSource::Playground, "t2", "acme", "u", None)
            .unwrap();
        assert_ne!(a.otel_trace_id, b.otel_trace_id);
    }

    #[test]
    fn link_metadata_merges_keys() {
        let recorder = TraceRecorder::in_memory().unwrap();
        let parent = recorder
            .open_parent(TraceSource::Judge, "judge-run", "acme", "u", None)
            .unwrap();
        recorder
            .link_metadata(&parent, serde_json::json!({ "parent_trace_id": "trace_x" }))
            .unwrap();
        let trace = recorder.get_trace(&parent.id).unwrap().unwrap();
        assert_eq!(trace.trace_metadata["source"], "judge");
        assert_eq!(trace.trace_metadata["parent_trace_id"], "trace_x");
    }

    #[test]
    fn span_duration_is_derived_from_timestamps_not_caller_input() {
        let recorder = TraceRecorder::in_memory().unwrap();
        let parent = recorder
            .open_parent(TraceSource::DtaPipeline, "dta-run", "acme", "u", None)
            .unwrap();
        let span = recorder
            .open_span(&parent, "stage-1", SpanType::Llm, None, serde_json::json!({}))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let result = ExecResult {
            content: "F".to_string(),
            usage: crate::provider::TokenUsage { input_tokens: 1, output_tokens: 1 },
            input_cost: 0.0,
            output_cost: 0.0,
            total_cost: 0.0,
            // Deliberately wrong — a retried or slow call's self-measured
            // duration must never end up in the stored span row.
            duration_ms: 999_999,
            finish_reason: crate::provider::StopReason::Stop,
            model_version: "m-cheap-v1".to_string(),
            provider_request_id: None,
        };
        recorder.close_span_ok(&span, &result, 1).unwrap();

        let spans = recorder.spans_for_trace(&parent.id).unwrap();
        let stored = &spans[0];
        let expected = (stored.end_time.unwrap() - stored.start_time).num_milliseconds() as u64;
        assert_eq!(stored.duration_ms, Some(expected));
        assert!(stored.duration_ms.unwrap() < 999_999);
    }
}
