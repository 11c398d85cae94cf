//! Candidate generation for unary inclusion dependencies.
//!
//! The candidate space is every ordered pair of distinct columns across all
//! tables, same-table pairs included. With `n` columns in total that is
//! `n * (n - 1)` candidates. This quadratic growth is the scaling limit of
//! exhaustive unary discovery: 1_000 columns already yield 999_000 tasks.

use crate::coord::types::{CandidatePair, ColumnRef};

/// Size of the candidate space for `columns` columns
pub fn candidate_count(columns: usize) -> usize {
    columns.saturating_mul(columns.saturating_sub(1))
}

/// Enumerate all directed candidates over `columns`.
///
/// Emission order is lexicographic by (dependent, referenced), where columns
/// compare by (table, column). Input order does not matter.
pub fn generate_unary_candidates(columns: &[ColumnRef]) -> Vec<CandidatePair> {
    let mut sorted = columns.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut candidates = Vec::with_capacity(candidate_count(sorted.len()));
    for &dependent in &sorted {
        for &referenced in &sorted {
            if let Some(pair) = CandidatePair::new(dependent, referenced) {
                candidates.push(pair);
            }
        }
    }
    candidates
}
