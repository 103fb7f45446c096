//! Tuner allocation and conflict detection.
//!
//! # How It Works
//!
//! 1. Candidates sharing a program id are collapsed; the first one wins
//! 2. Start/end events are swept in time order (end before start on a tie)
//! 3. After every event the active set is re-sorted by priority and
//!    placed onto freshly reset tuners
//! 4. Anything that finds no tuner is flagged as conflicting for the pass
//!
//! The pass is always run over the full list; there is no incremental mode.

use std::collections::HashSet;

use pvr_types::Reservation;

use crate::tuner::{TunerDevice, TunerSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EdgeKind {
    // Declared first so that an end sorts before a start at the same instant.
    End,
    Start,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    at: i64,
    kind: EdgeKind,
    index: usize,
}

/// Resolve tuner conflicts for a candidate list.
///
/// `candidates` must already be in the caller's precedence order: when two
/// candidates share a program id, the earlier one is kept and the later one
/// is dropped from the output entirely. `is_conflict` is recomputed for
/// every surviving candidate. The result is ordered by start time.
pub fn resolve(candidates: Vec<Reservation>, tuners: &[TunerDevice]) -> Vec<Reservation> {
    let mut seen = HashSet::new();
    let mut reserves: Vec<Reservation> = candidates
        .into_iter()
        .filter(|r| seen.insert(r.program_id()))
        .collect();

    for reserve in reserves.iter_mut() {
        reserve.is_conflict = false;
    }

    let mut edges = Vec::with_capacity(reserves.len() * 2);
    for (index, reserve) in reserves.iter().enumerate() {
        // Zero-length programs never occupy a tuner.
        if reserve.program.end_at <= reserve.program.start_at {
            continue;
        }
        edges.push(Edge {
            at: reserve.program.start_at,
            kind: EdgeKind::Start,
            index,
        });
        edges.push(Edge {
            at: reserve.program.end_at,
            kind: EdgeKind::End,
            index,
        });
    }
    // Stable: full ties keep candidate order.
    edges.sort_by_key(|e| (e.at, e.kind));

    let mut slots: Vec<TunerSlot<'_>> = tuners.iter().map(TunerSlot::new).collect();
    let mut active: Vec<usize> = Vec::new();
    let mut conflict = vec![false; reserves.len()];

    for edge in &edges {
        match edge.kind {
            EdgeKind::Start => active.push(edge.index),
            EdgeKind::End => active.retain(|&i| i != edge.index),
        }

        active.sort_by_key(|&i| reserves[i].priority_key());

        for slot in slots.iter_mut() {
            slot.clear();
        }

        for &i in &active {
            let reserve = &reserves[i];
            if !reserve.wants_tuner() {
                continue;
            }
            let placed = slots.iter_mut().any(|slot| slot.try_add(&reserve.program));
            if !placed {
                conflict[i] = true;
            }
        }
    }

    for (reserve, is_conflict) in reserves.iter_mut().zip(conflict) {
        reserve.is_conflict = is_conflict;
    }

    reserves.sort_by_key(|r| r.program.start_at);
    reserves
}
