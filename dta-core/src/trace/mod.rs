//! Trace Recorder (C4) — see spec §4.4.

pub mod recorder;
pub mod types;

pub use recorder::{ParentHandle, SpanHandle, TraceRecorder};
pub use types::{Span, SpanType, Status, Trace, TraceSource};
