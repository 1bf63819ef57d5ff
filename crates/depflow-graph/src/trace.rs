//! Nested trace of a propagation pass.
//!
//! Every trigger call opens an `event` span and every followed edge opens a
//! `dependency` span one level deeper. Opening a span at some level closes
//! all open spans at that level or deeper first, so the trace stays well
//! nested while the walk unwinds. The collected lines are only rendered when
//! the pass dirted at least `threshold` objects.

use depflow_core::TRACE_TARGET;
use std::fmt::Write as _;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Event,
    Dependency,
}

impl SpanKind {
    fn name(self) -> &'static str {
        match self {
            SpanKind::Event => "event",
            SpanKind::Dependency => "dependency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceLine {
    Open {
        level: usize,
        kind: SpanKind,
        label: String,
    },
    Close {
        level: usize,
        kind: SpanKind,
    },
}

#[derive(Debug, Clone)]
pub struct TraceLogger {
    threshold: usize,
    open: Vec<(usize, SpanKind)>,
    lines: Vec<TraceLine>,
}

impl TraceLogger {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            open: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Opens the `event` span of a trigger call at `depth`.
    pub fn event(&mut self, depth: usize, label: impl Into<String>) {
        self.open_span(depth * 2, SpanKind::Event, label.into());
    }

    /// Opens the `dependency` span of an edge followed at `depth`.
    pub fn dependency(&mut self, depth: usize, label: impl Into<String>) {
        self.open_span(depth * 2 + 1, SpanKind::Dependency, label.into());
    }

    fn open_span(&mut self, level: usize, kind: SpanKind, label: String) {
        self.close_to(level);
        self.open.push((level, kind));
        self.lines.push(TraceLine::Open { level, kind, label });
    }

    /// Closes every open span at `level` or deeper. `close_to(0)` flushes all.
    pub fn close_to(&mut self, level: usize) {
        while let Some(&(open_level, kind)) = self.open.last() {
            if open_level < level {
                break;
            }
            self.open.pop();
            self.lines.push(TraceLine::Close {
                level: open_level,
                kind,
            });
        }
    }

    pub fn open_spans(&self) -> usize {
        self.open.len()
    }

    pub fn lines(&self) -> &[TraceLine] {
        &self.lines
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let _ = match line {
                TraceLine::Open { level, kind, label } => {
                    writeln!(out, "{}<{} {}>", "  ".repeat(*level), kind.name(), label)
                }
                TraceLine::Close { level, kind } => {
                    writeln!(out, "{}</{}>", "  ".repeat(*level), kind.name())
                }
            };
        }
        out
    }

    /// Flushes open spans and renders the trace when `dirt_count` reaches
    /// the threshold.
    pub fn materialize(&mut self, dirt_count: usize) -> Option<String> {
        self.close_to(0);
        if dirt_count < self.threshold {
            debug!(
                target: TRACE_TARGET,
                dirt_count,
                threshold = self.threshold,
                "Trace below threshold, not materialized"
            );
            return None;
        }
        let text = self.render();
        debug!(target: TRACE_TARGET, dirt_count, "Dependency trace:\n{}", text);
        Some(text)
    }
}
