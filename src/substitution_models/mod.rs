use std::fmt::Display;

use anyhow::bail;
use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::evolutionary_models::ModelError;
use crate::Result;

pub mod dna_models;

pub type SubstMatrix = DMatrix<f64>;
pub type FreqVector = DVector<f64>;

const REVERSIBILITY_TOLERANCE: f64 = 1e-10;
const IMAGINARY_TOLERANCE: f64 = 1e-10;

/// Eigen system of a rate matrix, `Q = V · diag(λ) · V⁻¹`.
///
/// Only real eigen systems are supported.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    vectors: SubstMatrix,
    inverse: SubstMatrix,
    values: DVector<f64>,
}

impl EigenDecomposition {
    /// Wraps an externally computed eigen system after checking dimensions
    /// and that `vectors · inverse` is the identity.
    pub fn new(vectors: SubstMatrix, inverse: SubstMatrix, values: DVector<f64>) -> Result<Self> {
        let n = values.len();
        if vectors.shape() != (n, n) || inverse.shape() != (n, n) {
            bail!(ModelError::Dimension {
                expected: n,
                actual: vectors.nrows().max(inverse.nrows()),
            });
        }
        if vectors.iter().chain(inverse.iter()).chain(values.iter()).any(|x| !x.is_finite()) {
            bail!(ModelError::MalformedEigenSystem(String::from(
                "non-finite entries"
            )));
        }
        let identity = &vectors * &inverse;
        if (identity - SubstMatrix::identity(n, n)).amax() > 1e-8 {
            bail!(ModelError::MalformedEigenSystem(String::from(
                "eigenvectors and inverse eigenvectors do not match"
            )));
        }
        Ok(Self {
            vectors,
            inverse,
            values,
        })
    }

    /// Decomposes a rate matrix. Time-reversible matrices go through the
    /// symmetrised form, others need real, distinct eigenvalues.
    pub fn from_rate_matrix(q: &SubstMatrix, freqs: &FreqVector) -> Result<Self> {
        let n = q.nrows();
        if q.ncols() != n || freqs.len() != n {
            bail!(ModelError::Dimension {
                expected: n,
                actual: freqs.len(),
            });
        }
        if is_reversible(q, freqs) {
            Self::from_reversible(q, freqs)
        } else {
            debug!("Rate matrix is not time-reversible, using a general eigen decomposition.");
            Self::from_general(q)
        }
    }

    fn from_reversible(q: &SubstMatrix, freqs: &FreqVector) -> Result<Self> {
        let sqrt_pi = freqs.map(f64::sqrt);
        let n = q.nrows();
        let symmetric =
            SubstMatrix::from_fn(n, n, |i, j| sqrt_pi[i] * q[(i, j)] / sqrt_pi[j]);
        let eigen = SymmetricEigen::new(symmetric);
        let vectors = SubstMatrix::from_fn(n, n, |i, j| eigen.eigenvectors[(i, j)] / sqrt_pi[i]);
        let inverse = SubstMatrix::from_fn(n, n, |i, j| eigen.eigenvectors[(j, i)] * sqrt_pi[j]);
        Self::new(vectors, inverse, eigen.eigenvalues)
    }

    fn from_general(q: &SubstMatrix) -> Result<Self> {
        let n = q.nrows();
        let complex = q.complex_eigenvalues();
        if complex.iter().any(|c| c.im.abs() > IMAGINARY_TOLERANCE) {
            bail!(ModelError::ComplexEigenvalues);
        }
        let values = DVector::from_iterator(n, complex.iter().map(|c| c.re));
        let mut vectors = SubstMatrix::zeros(n, n);
        for (k, &lambda) in values.iter().enumerate() {
            let shifted = q - SubstMatrix::identity(n, n) * lambda;
            let svd = shifted.svd(false, true);
            let Some(v_t) = svd.v_t else {
                bail!(ModelError::MalformedEigenSystem(String::from(
                    "singular value decomposition failed"
                )));
            };
            let null = svd
                .singular_values
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            vectors.set_column(k, &v_t.row(null).transpose());
        }
        let Some(inverse) = vectors.clone().try_inverse() else {
            bail!(ModelError::MalformedEigenSystem(String::from(
                "eigenvectors are not linearly independent"
            )));
        };
        Self::new(vectors, inverse, values)
    }

    pub fn n(&self) -> usize {
        self.values.len()
    }

    pub fn vectors(&self) -> &SubstMatrix {
        &self.vectors
    }

    pub fn inverse(&self) -> &SubstMatrix {
        &self.inverse
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Transition probabilities for the given time, `V · diag(exp(λt)) · V⁻¹`.
    pub fn p(&self, time: f64) -> SubstMatrix {
        let mut scaled = self.vectors.clone();
        for (j, mut column) in scaled.column_iter_mut().enumerate() {
            column *= (self.values[j] * time).exp();
        }
        scaled * &self.inverse
    }
}

fn is_reversible(q: &SubstMatrix, freqs: &FreqVector) -> bool {
    let n = q.nrows();
    (0..n).all(|i| {
        (0..i).all(|j| {
            let forward = freqs[i] * q[(i, j)];
            let backward = freqs[j] * q[(j, i)];
            (forward - backward).abs() <= REVERSIBILITY_TOLERANCE * forward.abs().max(1.0)
        })
    })
}

/// Checks that frequencies are positive and sum to one.
pub(crate) fn check_freqs(freqs: &[f64]) -> Result<FreqVector> {
    if freqs.iter().any(|&f| !(f > 0.0) || !f.is_finite()) {
        bail!(ModelError::InvalidFrequencies(format!(
            "all frequencies must be positive, got {:?}",
            freqs
        )));
    }
    let sum: f64 = freqs.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        bail!(ModelError::InvalidFrequencies(format!(
            "frequencies must sum to 1.0, got {}",
            sum
        )));
    }
    Ok(FreqVector::from_column_slice(freqs))
}

/// Continuous-time Markov substitution process with stationary frequencies
/// and a precomputed eigen decomposition. The rate matrix is normalised to
/// one expected substitution per unit time.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstModel {
    name: String,
    q: SubstMatrix,
    freqs: FreqVector,
    eigen: EigenDecomposition,
}

impl Display for SubstModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} with frequencies {:?}",
            self.name,
            self.freqs.as_slice()
        )
    }
}

impl SubstModel {
    /// Builds a model from a rate matrix. Rows must sum to zero, the matrix is
    /// normalised to mean rate one under `freqs`.
    pub fn new(name: &str, q: SubstMatrix, freqs: &[f64]) -> Result<Self> {
        let freqs = check_freqs(freqs)?;
        let n = freqs.len();
        if q.shape() != (n, n) {
            bail!(ModelError::Dimension {
                expected: n,
                actual: q.nrows(),
            });
        }
        for (i, row) in q.row_iter().enumerate() {
            if row.sum().abs() > 1e-8 {
                bail!(ModelError::InvalidRates(format!(
                    "row {} of the rate matrix does not sum to zero",
                    i
                )));
            }
            if row.iter().enumerate().any(|(j, &r)| i != j && r < 0.0) {
                bail!(ModelError::InvalidRates(format!(
                    "row {} of the rate matrix has negative off-diagonal rates",
                    i
                )));
            }
        }
        let mean_rate: f64 = -(0..n).map(|i| freqs[i] * q[(i, i)]).sum::<f64>();
        if !(mean_rate > 0.0) {
            bail!(ModelError::InvalidRates(String::from(
                "rate matrix has no substitutions"
            )));
        }
        let q = q / mean_rate;
        let eigen = EigenDecomposition::from_rate_matrix(&q, &freqs)?;
        Ok(Self {
            name: name.to_string(),
            q,
            freqs,
            eigen,
        })
    }

    /// General time-reversible model over any number of states.
    /// `exchangeabilities` holds the upper triangle row by row:
    /// `(0,1), (0,2), …, (0,n-1), (1,2), …`.
    pub fn reversible(name: &str, exchangeabilities: &[f64], freqs: &[f64]) -> Result<Self> {
        let n = freqs.len();
        if n < 2 {
            bail!(ModelError::InvalidFrequencies(format!(
                "a model needs at least two states, got {}",
                n
            )));
        }
        if exchangeabilities.len() != n * (n - 1) / 2 {
            bail!(ModelError::InvalidRates(format!(
                "expected {} exchangeabilities for {} states, got {}",
                n * (n - 1) / 2,
                n,
                exchangeabilities.len()
            )));
        }
        if exchangeabilities.iter().any(|&r| r < 0.0 || !r.is_finite()) {
            bail!(ModelError::InvalidRates(String::from(
                "exchangeabilities must be non-negative"
            )));
        }
        let mut q = SubstMatrix::zeros(n, n);
        let mut k = 0;
        for i in 0..n {
            for j in (i + 1)..n {
                q[(i, j)] = exchangeabilities[k] * freqs[j];
                q[(j, i)] = exchangeabilities[k] * freqs[i];
                k += 1;
            }
        }
        for i in 0..n {
            let row_sum: f64 = q.row(i).sum();
            q[(i, i)] = -row_sum;
        }
        Self::new(name, q, freqs)
    }

    /// Two-state model with equal rates and equal frequencies.
    pub fn binary_symmetric() -> Self {
        match Self::reversible("Binary", &[1.0], &[0.5, 0.5]) {
            Ok(model) => model,
            Err(_) => unreachable!(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n(&self) -> usize {
        self.freqs.len()
    }

    pub fn q(&self) -> &SubstMatrix {
        &self.q
    }

    pub fn freqs(&self) -> &FreqVector {
        &self.freqs
    }

    pub fn eigen(&self) -> &EigenDecomposition {
        &self.eigen
    }

    pub fn rate(&self, i: usize, j: usize) -> f64 {
        self.q[(i, j)]
    }

    pub fn p(&self, time: f64) -> SubstMatrix {
        self.eigen.p(time)
    }
}
