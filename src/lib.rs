//! Incremental likelihood of sequence alignments on phylogenetic trees.
//!
//! `likelihood::TreeLikelihood` recomputes only the part of the tree that a
//! change made stale, keeps a stored copy of every buffer for cheap
//! rejection of tentative changes and runs its numerics on a pluggable
//! `backends::LikelihoodCore`.

use anyhow::Error;

#[macro_use]
pub mod macros;

pub mod alignment;
pub mod alphabets;
pub mod backends;
pub mod evolutionary_models;
pub mod io;
pub mod likelihood;
pub mod substitution_models;
pub mod tree;

type Result<T> = std::result::Result<T, Error>;

/// Panics unless both slices are element-wise equal up to a relative
/// tolerance. Equal infinities compare equal.
pub fn assert_float_relative_slice_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    use approx::relative_eq;
    assert_eq!(actual.len(), expected.len(), "Slices differ in length.");
    for (i, (&act, &exp)) in actual.iter().zip(expected).enumerate() {
        assert!(
            relative_eq!(act, exp, epsilon = epsilon, max_relative = epsilon),
            "Entries at position {} differ, actual: {}, expected: {}",
            i,
            act,
            exp,
        );
    }
}
