//! Regex queries over a baked file.
//!
//! The index maps every distinct module and symbol string to the events whose
//! stacks mention it. Queries run the regex once per distinct key rather than
//! once per frame, which matters when the same few hundred symbols repeat
//! across millions of stacks.
//!
//! # Performance
//!
//! - `build()`: one pass over all frames
//! - `match_records_by_*()`: O(distinct keys) regex checks, then a sort of the
//!   matching event lists
//! - Memory: O(distinct strings) + O(frames) event indices in the worst case

// Percentages are for display only
#![allow(clippy::cast_precision_loss)]

use crate::baked::BakedFile;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

// =============================================================================
// OUTPUT TYPES
// =============================================================================

/// A symbol ranked by how many events it appears in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRank {
    pub symbol: String,
    /// Events whose stack contains the symbol at least once.
    pub events: usize,
    /// Share of the events that carry a stack (0.0 - 100.0).
    pub percentage: f64,
}

// =============================================================================
// QUERY INDEX
// =============================================================================

#[derive(Debug, Default)]
pub struct QueryIndex {
    /// Module name → ascending event indices, one entry per event.
    by_module: HashMap<String, Vec<u32>>,
    /// Symbol name → ascending event indices, one entry per event.
    by_symbol: HashMap<String, Vec<u32>>,
    events_with_stacks: usize,
}

impl QueryIndex {
    /// Index every module and symbol of `baked`. Unresolved frames (empty
    /// strings) are not indexed.
    #[must_use]
    pub fn build(baked: &BakedFile) -> Self {
        let mut index = Self::default();

        for event in 0..baked.event_count() {
            let Some(frames) = baked.frames(event) else {
                continue;
            };
            if frames.is_empty() {
                continue;
            }
            index.events_with_stacks += 1;

            let event = event as u32;
            for frame in frames {
                if let Some(module) = baked.string(frame.module).filter(|s| !s.is_empty()) {
                    push_once(&mut index.by_module, module, event);
                }
                if let Some(symbol) = baked.string(frame.symbol).filter(|s| !s.is_empty()) {
                    push_once(&mut index.by_symbol, symbol, event);
                }
            }
        }
        index
    }

    /// Events with a frame whose symbol matches `pattern`, ascending and
    /// without duplicates.
    #[must_use]
    pub fn match_records_by_symbol(&self, pattern: &Regex) -> Vec<u32> {
        match_keys(&self.by_symbol, pattern)
    }

    /// Events with a frame whose module matches `pattern`, ascending and
    /// without duplicates.
    #[must_use]
    pub fn match_records_by_module(&self, pattern: &Regex) -> Vec<u32> {
        match_keys(&self.by_module, pattern)
    }

    /// The `n` symbols present in the most events. Ties are broken by name.
    #[must_use]
    pub fn top_symbols(&self, n: usize) -> Vec<SymbolRank> {
        let mut ranked: Vec<(&String, usize)> =
            self.by_symbol.iter().map(|(symbol, events)| (symbol, events.len())).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let total = self.events_with_stacks.max(1) as f64;
        ranked
            .into_iter()
            .take(n)
            .map(|(symbol, events)| SymbolRank {
                symbol: symbol.clone(),
                events,
                percentage: events as f64 / total * 100.0,
            })
            .collect()
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.by_module.len()
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.by_symbol.len()
    }

    #[must_use]
    pub fn events_with_stacks(&self) -> usize {
        self.events_with_stacks
    }
}

/// Events arrive in ascending order, so comparing with the last entry is
/// enough to keep one entry per event.
fn push_once(map: &mut HashMap<String, Vec<u32>>, key: &str, event: u32) {
    if let Some(events) = map.get_mut(key) {
        if events.last() != Some(&event) {
            events.push(event);
        }
    } else {
        map.insert(key.to_string(), vec![event]);
    }
}

fn match_keys(map: &HashMap<String, Vec<u32>>, pattern: &Regex) -> Vec<u32> {
    let mut matched: Vec<u32> = map
        .iter()
        .filter(|(key, _)| pattern.is_match(key))
        .flat_map(|(_, events)| events.iter().copied())
        .collect();
    matched.sort_unstable();
    matched.dedup();
    matched
}
