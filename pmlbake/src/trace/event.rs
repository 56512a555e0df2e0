//! Decoded trace events and the filter used to select them.

use super::detail::{operation_name, EventDetail};
use crate::domain::{EventClass, FileTime};

/// One event record, built once while streaming and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Position in the event-offset index.
    pub sequence: u32,
    pub process_index: u32,
    /// Zero for a gap: a slot that was never captured, or whose process is
    /// missing from the process table.
    pub process_id: u32,
    pub thread_id: u32,
    pub class: EventClass,
    pub operation: u16,
    pub capture_time: FileTime,
    pub result: u32,
    /// 100ns ticks.
    pub duration: u64,
    /// Return addresses, outermost first (as stored).
    pub frames: Vec<u64>,
    pub detail: Option<EventDetail>,
}

impl TraceEvent {
    pub(crate) fn gap(sequence: u32) -> Self {
        Self {
            sequence,
            process_index: u32::MAX,
            process_id: 0,
            thread_id: 0,
            class: EventClass::Unknown(0),
            operation: 0,
            capture_time: FileTime::default(),
            result: 0,
            duration: 0,
            frames: Vec::new(),
            detail: None,
        }
    }

    #[must_use]
    pub fn is_gap(&self) -> bool {
        self.process_id == 0
    }

    #[must_use]
    pub fn operation_name(&self) -> String {
        operation_name(self.class, self.operation)
    }
}

/// Which events, and which parts of them, to decode.
///
/// Parts that are not wanted are seeked over instead of read, which keeps
/// scans of multi-gigabyte captures cheap.
#[derive(Debug, Clone)]
pub struct EventFilter {
    /// `None` accepts every class.
    pub classes: Option<Vec<EventClass>>,
    pub stacks: bool,
    pub details: bool,
    /// Drop events without any stack frame. Only meaningful with `stacks`.
    pub require_stack: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self { classes: None, stacks: true, details: false, require_stack: false }
    }
}

impl EventFilter {
    /// Every class, with stacks and details.
    #[must_use]
    pub fn everything() -> Self {
        Self { details: true, ..Self::default() }
    }

    /// Only events that carry a stack; details are skipped.
    #[must_use]
    pub fn with_stacks() -> Self {
        Self { require_stack: true, ..Self::default() }
    }

    #[must_use]
    pub fn only(mut self, classes: &[EventClass]) -> Self {
        self.classes = Some(classes.to_vec());
        self
    }

    #[must_use]
    pub fn accepts_class(&self, class: EventClass) -> bool {
        self.classes.as_ref().map_or(true, |classes| classes.contains(&class))
    }
}
