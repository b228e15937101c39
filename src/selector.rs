//! GPU selection.
//!
//! Pure functions over an offering snapshot: no I/O, no randomness. Given the
//! same offerings and constraint, [`rank`] and [`select`] always agree.

use serde::Serialize;
use std::cmp::Ordering;

use crate::capacity::{GpuOffering, Market};
use crate::error::SelectionError;

/// Caller-supplied limits for choosing a GPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionConstraint {
    /// Minimum VRAM in GB.
    pub min_vram_gb: u32,
    /// Maximum hourly cost in USD.
    pub max_cost_per_hour: f64,
    /// Market whose price is compared.
    pub market: Market,
}

/// An offering that passed every filter, with its price in the chosen market.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    /// The offering.
    pub offering: GpuOffering,
    /// Hourly cost in the selected market.
    pub cost_per_hour: f64,
}

/// Returns every qualifying offering, cheapest first.
///
/// Ties on cost prefer more VRAM, then the lexicographically smaller id.
#[must_use]
pub fn rank(offerings: &[GpuOffering], constraint: &SelectionConstraint) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = offerings
        .iter()
        .filter(|o| o.vram_gb >= constraint.min_vram_gb && o.available > 0)
        .filter_map(|o| {
            o.cost(constraint.market)
                .filter(|cost| *cost <= constraint.max_cost_per_hour)
                .map(|cost| Candidate {
                    offering: o.clone(),
                    cost_per_hour: cost,
                })
        })
        .collect();

    candidates.sort_by(compare);
    candidates
}

/// Returns the best qualifying offering.
///
/// # Errors
///
/// Returns [`SelectionError::NoCandidate`] when nothing qualifies.
pub fn select(
    offerings: &[GpuOffering],
    constraint: &SelectionConstraint,
) -> Result<Candidate, SelectionError> {
    rank(offerings, constraint)
        .into_iter()
        .next()
        .ok_or_else(|| SelectionError::NoCandidate {
            reason: explain_empty(offerings, constraint),
        })
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    a.cost_per_hour
        .total_cmp(&b.cost_per_hour)
        .then_with(|| b.offering.vram_gb.cmp(&a.offering.vram_gb))
        .then_with(|| a.offering.id.cmp(&b.offering.id))
}

/// Describes the first filter that emptied the candidate set.
#[must_use]
pub fn explain_empty(offerings: &[GpuOffering], constraint: &SelectionConstraint) -> String {
    let sold: Vec<&GpuOffering> = offerings
        .iter()
        .filter(|o| o.cost(constraint.market).is_some() && o.available > 0)
        .collect();

    if sold.is_empty() {
        return format!("no GPUs are currently available in the {} market", constraint.market);
    }

    if !sold.iter().any(|o| o.vram_gb >= constraint.min_vram_gb) {
        let max_vram = sold.iter().map(|o| o.vram_gb).max().unwrap_or_default();
        return format!(
            "no GPU with {}GB VRAM (largest available: {max_vram}GB)",
            constraint.min_vram_gb
        );
    }

    format!(
        "no GPU with {}GB VRAM under ${:.2}/hr; raise MAX_COST_PER_HOUR",
        constraint.min_vram_gb, constraint.max_cost_per_hour
    )
}
