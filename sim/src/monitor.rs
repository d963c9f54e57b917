//! Tracing span tree (spec.md §2 component #10), grounded on
//! `zamlet/monitor.py`'s span-tree shape but reduced to the structural
//! minimum: an append-only arena of spans with parent links, usable for
//! post-hoc trace dumps. Optional: every call site takes `&mut Monitor`, but
//! a `Monitor::disabled()` instance makes recording a no-op so a perf build
//! can skip the bookkeeping without an `#[cfg]` split.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanType {
    KInstr,
    CacheFetch,
    J2jTransfer,
    Sync,
    VectorOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    FireAndForget,
    Tracked,
}

#[derive(Debug, Clone)]
pub struct Span {
    pub span_type: SpanType,
    pub component: &'static str,
    pub completion_type: CompletionType,
    pub parent: Option<usize>,
    pub instr_ident: Option<u32>,
    pub start_cycle: u64,
    pub end_cycle: Option<u64>,
}

pub struct Monitor {
    enabled: bool,
    spans: Vec<Span>,
}

impl Monitor {
    pub fn new() -> Self {
        Monitor {
            enabled: true,
            spans: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Monitor {
            enabled: false,
            spans: Vec::new(),
        }
    }

    pub fn create_span(
        &mut self,
        span_type: SpanType,
        component: &'static str,
        completion_type: CompletionType,
        parent: Option<usize>,
        instr_ident: Option<u32>,
        cycle: u64,
    ) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        self.spans.push(Span {
            span_type,
            component,
            completion_type,
            parent,
            instr_ident,
            start_cycle: cycle,
            end_cycle: None,
        });
        Some(self.spans.len() - 1)
    }

    pub fn close_span(&mut self, span_id: usize, cycle: u64) {
        if let Some(span) = self.spans.get_mut(span_id) {
            span.end_cycle = Some(cycle);
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_monitor_records_nothing() {
        let mut m = Monitor::disabled();
        let span = m.create_span(SpanType::KInstr, "lamlet", CompletionType::FireAndForget, None, Some(1), 0);
        assert!(span.is_none());
        assert!(m.spans().is_empty());
    }

    #[test]
    fn enabled_monitor_tracks_parent_child() {
        let mut m = Monitor::new();
        let parent = m.create_span(SpanType::VectorOp, "lamlet", CompletionType::Tracked, None, None, 0).unwrap();
        let child = m
            .create_span(SpanType::KInstr, "kamlet", CompletionType::FireAndForget, Some(parent), Some(7), 1)
            .unwrap();
        m.close_span(child, 2);
        assert_eq!(m.spans()[child].parent, Some(parent));
        assert_eq!(m.spans()[child].end_cycle, Some(2));
    }
}
