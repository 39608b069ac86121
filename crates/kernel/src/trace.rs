//! In-memory trace recorder.
//!
//! Traces wrap whole turns; spans wrap the model and tool work inside
//! them. Records are queryable by id so hosts can render execution trees.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::ports::{SpanMeta, SpanRecord, TraceMeta, TraceRecord, TraceRecorder, TraceStatus};

#[derive(Default)]
pub struct TraceLog {
    traces: RwLock<HashMap<String, TraceRecord>>,
    spans: RwLock<HashMap<String, SpanRecord>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All traces, oldest first.
    pub fn traces(&self) -> Vec<TraceRecord> {
        let traces = self.traces.read();
        let mut out: Vec<TraceRecord> = traces.values().cloned().collect();
        out.sort_by_key(|t| t.started_at);
        out
    }

    /// Spans belonging to a trace, oldest first.
    pub fn spans_for_trace(&self, trace_id: &str) -> Vec<SpanRecord> {
        let spans = self.spans.read();
        let mut out: Vec<SpanRecord> = spans
            .values()
            .filter(|s| s.meta.trace_id == trace_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }
}

impl TraceRecorder for TraceLog {
    fn start_trace(&self, meta: TraceMeta) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.traces.write().insert(
            id.clone(),
            TraceRecord {
                id: id.clone(),
                meta,
                status: TraceStatus::Running,
                started_at: Utc::now(),
                ended_at: None,
            },
        );
        id
    }

    fn start_span(&self, meta: SpanMeta) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.spans.write().insert(
            id.clone(),
            SpanRecord {
                id: id.clone(),
                meta,
                status: TraceStatus::Running,
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
                error: None,
            },
        );
        id
    }

    fn end_span(&self, span_id: &str, status: TraceStatus, error: Option<&str>) {
        let mut spans = self.spans.write();
        if let Some(span) = spans.get_mut(span_id) {
            // First close wins; a finally-path re-close is a no-op.
            if span.ended_at.is_some() {
                return;
            }
            let now = Utc::now();
            span.status = status;
            span.ended_at = Some(now);
            span.duration_ms = Some((now - span.started_at).num_milliseconds().max(0) as u64);
            span.error = error.map(String::from);
        }
    }

    fn end_trace(&self, trace_id: &str, status: TraceStatus) {
        let mut traces = self.traces.write();
        if let Some(trace) = traces.get_mut(trace_id) {
            if trace.ended_at.is_some() {
                return;
            }
            trace.status = status;
            trace.ended_at = Some(Utc::now());
        }
    }

    fn span(&self, span_id: &str) -> Option<SpanRecord> {
        self.spans.read().get(span_id).cloned()
    }

    fn trace(&self, trace_id: &str) -> Option<TraceRecord> {
        self.traces.read().get(trace_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_lifecycle() {
        let log = TraceLog::new();
        let trace_id = log.start_trace(TraceMeta {
            name: "turn".into(),
            agent_id: Some("sup".into()),
            conversation_id: Some("c1".into()),
        });

        let trace = log.trace(&trace_id).unwrap();
        assert_eq!(trace.status, TraceStatus::Running);

        log.end_trace(&trace_id, TraceStatus::Ok);
        let trace = log.trace(&trace_id).unwrap();
        assert_eq!(trace.status, TraceStatus::Ok);
        assert!(trace.ended_at.is_some());
    }

    #[test]
    fn span_records_duration_and_error() {
        let log = TraceLog::new();
        let trace_id = log.start_trace(TraceMeta::default());
        let span_id = log.start_span(SpanMeta {
            trace_id: trace_id.clone(),
            name: "model".into(),
            ..Default::default()
        });

        log.end_span(&span_id, TraceStatus::Error, Some("upstream 500"));
        let span = log.span(&span_id).unwrap();
        assert_eq!(span.status, TraceStatus::Error);
        assert_eq!(span.error.as_deref(), Some("upstream 500"));
        assert!(span.duration_ms.is_some());
    }

    #[test]
    fn double_close_is_a_no_op() {
        let log = TraceLog::new();
        let trace_id = log.start_trace(TraceMeta::default());
        let span_id = log.start_span(SpanMeta {
            trace_id,
            name: "work".into(),
            ..Default::default()
        });

        log.end_span(&span_id, TraceStatus::Ok, None);
        log.end_span(&span_id, TraceStatus::Error, Some("late"));
        let span = log.span(&span_id).unwrap();
        assert_eq!(span.status, TraceStatus::Ok);
        assert!(span.error.is_none());
    }

    #[test]
    fn spans_for_trace_filters_and_orders() {
        let log = TraceLog::new();
        let t1 = log.start_trace(TraceMeta::default());
        let t2 = log.start_trace(TraceMeta::default());
        log.start_span(SpanMeta {
            trace_id: t1.clone(),
            name: "a".into(),
            ..Default::default()
        });
        log.start_span(SpanMeta {
            trace_id: t2,
            name: "other".into(),
            ..Default::default()
        });
        log.start_span(SpanMeta {
            trace_id: t1.clone(),
            name: "b".into(),
            ..Default::default()
        });

        let spans = log.spans_for_trace(&t1);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn unknown_ids_are_none() {
        let log = TraceLog::new();
        assert!(log.trace("ghost").is_none());
        assert!(log.span("ghost").is_none());
        // Ending unknown ids must not panic.
        log.end_trace("ghost", TraceStatus::Ok);
        log.end_span("ghost", TraceStatus::Ok, None);
    }
}
