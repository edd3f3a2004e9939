use anyhow::bail;
use log::debug;

use crate::backends::{
    BackendDetails, BackendFlags, BackendKind, BackendRequest, CoreError, LikelihoodCore,
    Operation, Rescale,
};
use crate::substitution_models::EigenDecomposition;
use crate::Result;

pub const REFERENCE_NAME: &str = "reference-cpu";

/// Capabilities of the reference core.
pub fn reference_capabilities() -> BackendFlags {
    BackendFlags::PRECISION_DOUBLE
        | BackendFlags::PROCESSOR_CPU
        | BackendFlags::SCALING_MANUAL
        | BackendFlags::SCALING_AUTO
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Dims {
    pub(super) states: usize,
    pub(super) patterns: usize,
    pub(super) categories: usize,
}

impl Dims {
    pub(super) fn partial_len(&self) -> usize {
        self.categories * self.patterns * self.states
    }

    pub(super) fn matrix_len(&self) -> usize {
        self.categories * self.states * self.states
    }
}

/// Data of a child in a partials operation.
#[derive(Clone, Copy)]
pub(super) enum Child<'a> {
    States(&'a [usize]),
    Partials(&'a [f64]),
}

/// Straightforward single-threaded implementation of the likelihood core in
/// double precision. All other cores are checked against it.
pub struct ReferenceCore {
    pub(super) details: BackendDetails,
    pub(super) dims: Dims,
    pub(super) tip_count: usize,
    pub(super) tip_states: Vec<Option<Vec<usize>>>,
    pub(super) partials: Vec<Vec<f64>>,
    pub(super) matrices: Vec<Vec<f64>>,
    pub(super) eigens: Vec<Option<EigenDecomposition>>,
    pub(super) category_rates: [Vec<f64>; 2],
    pub(super) current_rates: usize,
    pub(super) stored_rates: usize,
    pub(super) pattern_weights: Vec<f64>,
    pub(super) scale_factors: Vec<Vec<f64>>,
    pub(super) auto_scaling: bool,
    pub(super) auto_factors: Vec<Vec<f64>>,
}

impl ReferenceCore {
    pub fn new(request: &BackendRequest) -> Result<Self> {
        Self::with_details(
            request,
            BackendDetails {
                kind: BackendKind::Reference,
                name: String::from(REFERENCE_NAME),
                flags: BackendFlags::empty(),
            },
        )
    }

    /// Reference kernels reporting the given kind and name, for loaders that
    /// emulate another device class. CPU, double precision and manual
    /// scaling flags are always added.
    pub fn with_details(request: &BackendRequest, details: BackendDetails) -> Result<Self> {
        check_request(request)?;
        let dims = Dims {
            states: request.state_count,
            patterns: request.pattern_count,
            categories: request.category_count,
        };
        let auto_scaling = request.wants_auto_scaling();
        let mut flags = details.flags
            | BackendFlags::PRECISION_DOUBLE
            | BackendFlags::PROCESSOR_CPU
            | BackendFlags::SCALING_MANUAL;
        if auto_scaling {
            flags |= BackendFlags::SCALING_AUTO;
        }
        debug!(
            "Allocating {} partial, {} matrix and {} scale buffers for {:?}.",
            request.partial_buffer_count,
            request.matrix_buffer_count,
            request.scale_buffer_count,
            dims
        );
        let partials = (0..request.partial_buffer_count)
            .map(|i| {
                if i < request.tip_count {
                    Vec::new()
                } else {
                    vec![0.0; dims.partial_len()]
                }
            })
            .collect();
        let auto_factors = if auto_scaling {
            vec![vec![0.0; dims.patterns]; request.partial_buffer_count]
        } else {
            Vec::new()
        };
        Ok(ReferenceCore {
            details: BackendDetails { flags, ..details },
            dims,
            tip_count: request.tip_count,
            tip_states: vec![None; request.tip_count],
            partials,
            matrices: vec![vec![0.0; dims.matrix_len()]; request.matrix_buffer_count],
            eigens: vec![None; request.eigen_buffer_count],
            category_rates: [
                vec![1.0; dims.categories],
                vec![1.0; dims.categories],
            ],
            current_rates: 0,
            stored_rates: 0,
            pattern_weights: vec![1.0; dims.patterns],
            scale_factors: vec![vec![0.0; dims.patterns]; request.scale_buffer_count],
            auto_scaling,
            auto_factors,
        })
    }

    pub(super) fn rates(&self) -> &[f64] {
        &self.category_rates[self.current_rates]
    }

    pub(super) fn child(&self, idx: usize) -> Result<Child<'_>> {
        check_index("partials buffer", idx, self.partials.len())?;
        if idx < self.tip_count {
            if let Some(states) = &self.tip_states[idx] {
                return Ok(Child::States(states));
            }
        }
        let partials = &self.partials[idx];
        if partials.len() != self.dims.partial_len() {
            bail!(CoreError::Uninitialised {
                what: "Partials buffer",
                index: idx
            });
        }
        Ok(Child::Partials(partials))
    }

    pub(super) fn matrix(&self, idx: usize) -> Result<&[f64]> {
        check_index("matrix buffer", idx, self.matrices.len())?;
        Ok(&self.matrices[idx])
    }

    pub(super) fn eigen(&self, idx: usize) -> Result<&EigenDecomposition> {
        check_index("eigen buffer", idx, self.eigens.len())?;
        match &self.eigens[idx] {
            Some(eigen) => Ok(eigen),
            None => bail!(CoreError::Uninitialised {
                what: "Eigen decomposition",
                index: idx
            }),
        }
    }

    pub(super) fn check_operation(&self, op: &Operation) -> Result<()> {
        check_index("partials buffer", op.destination, self.partials.len())?;
        if op.destination < self.tip_count {
            bail!(CoreError::InvalidRequest(format!(
                "tip buffer {} cannot be an operation destination",
                op.destination
            )));
        }
        if op.destination == op.child1 || op.destination == op.child2 {
            bail!(CoreError::InvalidRequest(format!(
                "buffer {} is both read and written by one operation",
                op.destination
            )));
        }
        match op.rescale {
            Some(Rescale::Write(idx)) | Some(Rescale::Reset(idx)) => {
                check_index("scale buffer", idx, self.scale_factors.len())?
            }
            Some(Rescale::Read { from, to }) => {
                check_index("scale buffer", from, self.scale_factors.len())?;
                check_index("scale buffer", to, self.scale_factors.len())?;
            }
            None => {}
        }
        Ok(())
    }

    /// Applies the operation's rescaling to freshly computed partials.
    pub(super) fn finish_partials(
        &mut self,
        destination: usize,
        rescale: Option<Rescale>,
        out: &mut [f64],
    ) {
        let dims = self.dims;
        match rescale {
            Some(Rescale::Write(idx)) => write_scale_factors(dims, out, &mut self.scale_factors[idx]),
            Some(Rescale::Read { from, to }) => {
                apply_scale_factors(dims, out, &self.scale_factors[from]);
                if from != to {
                    let factors = std::mem::take(&mut self.scale_factors[from]);
                    self.scale_factors[to].copy_from_slice(&factors);
                    self.scale_factors[from] = factors;
                }
            }
            Some(Rescale::Reset(idx)) => self.scale_factors[idx].fill(0.0),
            None => {}
        }
        if self.auto_scaling {
            write_scale_factors(dims, out, &mut self.auto_factors[destination]);
        }
    }

    fn execute(&mut self, op: &Operation) -> Result<()> {
        self.check_operation(op)?;
        let mut out = std::mem::take(&mut self.partials[op.destination]);
        let computed = (|| -> Result<()> {
            let child1 = self.child(op.child1)?;
            let child2 = self.child(op.child2)?;
            let m1 = self.matrix(op.child1_matrix)?;
            let m2 = self.matrix(op.child2_matrix)?;
            compute_partials(self.dims, child1, m1, child2, m2, &mut out);
            Ok(())
        })();
        if computed.is_ok() {
            self.finish_partials(op.destination, op.rescale, &mut out);
        }
        self.partials[op.destination] = out;
        computed
    }
}

fn check_request(request: &BackendRequest) -> Result<()> {
    if request.state_count < 2 {
        bail!(CoreError::InvalidRequest(format!(
            "at least two states are needed, got {}",
            request.state_count
        )));
    }
    if request.pattern_count == 0 || request.category_count == 0 {
        bail!(CoreError::InvalidRequest(String::from(
            "pattern and category counts must be positive"
        )));
    }
    if request.partial_buffer_count < request.tip_count {
        bail!(CoreError::InvalidRequest(format!(
            "{} partial buffers cannot hold {} tips",
            request.partial_buffer_count, request.tip_count
        )));
    }
    if request.eigen_buffer_count == 0 {
        bail!(CoreError::InvalidRequest(String::from(
            "at least one eigen buffer is needed"
        )));
    }
    Ok(())
}

pub(super) fn check_index(what: &'static str, index: usize, count: usize) -> Result<()> {
    if index >= count {
        bail!(CoreError::IndexOutOfRange { what, index, count });
    }
    Ok(())
}

pub(super) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        bail!(CoreError::Dimension {
            what,
            expected,
            actual
        });
    }
    Ok(())
}

pub(super) fn check_branch_time(time: f64) -> Result<()> {
    if time.is_nan() || time < 0.0 {
        bail!(CoreError::NegativeBranchTime(time));
    }
    Ok(())
}

/// `P(t·r_c)` for every category, negative round-off clamped to zero.
pub(super) fn transition_matrices(
    eigen: &EigenDecomposition,
    time: f64,
    rates: &[f64],
    out: &mut [f64],
) {
    let n = eigen.n();
    for (c, rate) in rates.iter().enumerate() {
        let p = eigen.p(time * rate);
        let block = &mut out[c * n * n..(c + 1) * n * n];
        for i in 0..n {
            for j in 0..n {
                block[i * n + j] = p[(i, j)].max(0.0);
            }
        }
    }
}

#[inline]
fn child_sum(child: Child, matrix: &[f64], dims: Dims, offset: usize, pattern: usize, s: usize) -> f64 {
    let n = dims.states;
    let row = &matrix[s * n..(s + 1) * n];
    match child {
        Child::States(states) => {
            let code = states[pattern];
            if code >= n {
                1.0
            } else {
                row[code]
            }
        }
        Child::Partials(partials) => row
            .iter()
            .zip(&partials[offset..offset + n])
            .map(|(p, c)| p * c)
            .sum(),
    }
}

/// `out[s] = (Σ_j P1[s,j]·c1[j]) · (Σ_j P2[s,j]·c2[j])` for every category
/// and pattern.
pub(super) fn compute_partials(
    dims: Dims,
    child1: Child,
    m1: &[f64],
    child2: Child,
    m2: &[f64],
    out: &mut Vec<f64>,
) {
    let n = dims.states;
    out.resize(dims.partial_len(), 0.0);
    for c in 0..dims.categories {
        let mat1 = &m1[c * n * n..(c + 1) * n * n];
        let mat2 = &m2[c * n * n..(c + 1) * n * n];
        for p in 0..dims.patterns {
            let offset = (c * dims.patterns + p) * n;
            for s in 0..n {
                out[offset + s] = child_sum(child1, mat1, dims, offset, p, s)
                    * child_sum(child2, mat2, dims, offset, p, s);
            }
        }
    }
}

fn pattern_max(dims: Dims, partials: &[f64], pattern: usize) -> f64 {
    let n = dims.states;
    (0..dims.categories)
        .flat_map(|c| {
            let offset = (c * dims.patterns + pattern) * n;
            partials[offset..offset + n].iter().copied()
        })
        .fold(0.0, f64::max)
}

fn divide_pattern(dims: Dims, partials: &mut [f64], pattern: usize, factor: f64) {
    let n = dims.states;
    for c in 0..dims.categories {
        let offset = (c * dims.patterns + pattern) * n;
        for x in partials[offset..offset + n].iter_mut() {
            *x /= factor;
        }
    }
}

/// Divides every pattern by its largest entry and records `ln(max)`.
/// All-zero patterns are left alone with a zero factor.
pub(super) fn write_scale_factors(dims: Dims, partials: &mut [f64], factors: &mut [f64]) {
    for (p, factor) in factors.iter_mut().enumerate() {
        let max = pattern_max(dims, partials, p);
        if max > 0.0 && max.is_finite() {
            divide_pattern(dims, partials, p, max);
            *factor = max.ln();
        } else {
            *factor = 0.0;
        }
    }
}

/// Divides every pattern by previously recorded factors.
pub(super) fn apply_scale_factors(dims: Dims, partials: &mut [f64], factors: &[f64]) {
    for (p, factor) in factors.iter().enumerate() {
        if *factor != 0.0 {
            divide_pattern(dims, partials, p, factor.exp());
        }
    }
}

pub(super) fn expand_states(dims: Dims, states: &[usize], out: &mut [f64]) {
    let n = dims.states;
    for c in 0..dims.categories {
        for (p, &code) in states.iter().enumerate() {
            let offset = (c * dims.patterns + p) * n;
            for s in 0..n {
                out[offset + s] = if code >= n || code == s { 1.0 } else { 0.0 };
            }
        }
    }
}

impl LikelihoodCore for ReferenceCore {
    fn details(&self) -> &BackendDetails {
        &self.details
    }

    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<()> {
        check_index("tip", tip, self.tip_count)?;
        check_len("state codes", self.dims.patterns, states.len())?;
        if let Some(&state) = states.iter().find(|&&s| s > self.dims.states) {
            bail!(CoreError::InvalidState { tip, state });
        }
        self.tip_states[tip] = Some(states.to_vec());
        self.partials[tip] = Vec::new();
        Ok(())
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()> {
        check_index("tip", tip, self.tip_count)?;
        let block = self.dims.patterns * self.dims.states;
        check_len("tip partials", block, partials.len())?;
        let mut buffer = Vec::with_capacity(self.dims.partial_len());
        for _ in 0..self.dims.categories {
            buffer.extend_from_slice(partials);
        }
        self.partials[tip] = buffer;
        self.tip_states[tip] = None;
        Ok(())
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        check_len("pattern weights", self.dims.patterns, weights.len())?;
        self.pattern_weights.copy_from_slice(weights);
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        eigen_index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<()> {
        check_index("eigen buffer", eigen_index, self.eigens.len())?;
        check_len("eigenvalues", self.dims.states, eigen.n())?;
        self.eigens[eigen_index] = Some(eigen.clone());
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        check_len("category rates", self.dims.categories, rates.len())?;
        if rates.iter().any(|r| *r < 0.0 || !r.is_finite()) {
            bail!(CoreError::InvalidRequest(format!(
                "category rates must be non-negative, got {:?}",
                rates
            )));
        }
        if self.current_rates == self.stored_rates {
            self.current_rates = 1 - self.current_rates;
        }
        self.category_rates[self.current_rates].copy_from_slice(rates);
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        destinations: &[usize],
        branch_times: &[f64],
    ) -> Result<()> {
        check_len("branch times", destinations.len(), branch_times.len())?;
        for (&dest, &time) in destinations.iter().zip(branch_times) {
            check_index("matrix buffer", dest, self.matrices.len())?;
            check_branch_time(time)?;
        }
        let eigen = self.eigen(eigen_index)?.clone();
        let rates = self.rates().to_vec();
        for (&dest, &time) in destinations.iter().zip(branch_times) {
            transition_matrices(&eigen, time, &rates, &mut self.matrices[dest]);
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation]) -> Result<()> {
        for op in operations {
            self.execute(op)?;
        }
        Ok(())
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        root: usize,
        category_weights: &[f64],
        frequencies: &[f64],
        scale_indices: &[usize],
        out: &mut [f64],
    ) -> Result<()> {
        let dims = self.dims;
        check_len("category weights", dims.categories, category_weights.len())?;
        check_len("frequencies", dims.states, frequencies.len())?;
        check_len("site log likelihoods", dims.patterns, out.len())?;
        let factors = if self.auto_scaling {
            &self.auto_factors
        } else {
            &self.scale_factors
        };
        for &idx in scale_indices {
            check_index("scale buffer", idx, factors.len())?;
        }
        let Child::Partials(partials) = self.child(root)? else {
            bail!(CoreError::InvalidRequest(format!(
                "root buffer {} holds tip states",
                root
            )));
        };
        let n = dims.states;
        for (p, site) in out.iter_mut().enumerate() {
            let mut likelihood = 0.0;
            for (c, weight) in category_weights.iter().enumerate() {
                let offset = (c * dims.patterns + p) * n;
                let sum: f64 = partials[offset..offset + n]
                    .iter()
                    .zip(frequencies)
                    .map(|(x, f)| x * f)
                    .sum();
                likelihood += weight * sum;
            }
            *site = if likelihood.is_nan() || likelihood <= 0.0 {
                f64::NEG_INFINITY
            } else {
                let scale: f64 = scale_indices.iter().map(|&k| factors[k][p]).sum();
                likelihood.ln() + scale
            };
        }
        Ok(())
    }

    fn sum_site_log_likelihoods(&self, site_log_likelihoods: &[f64]) -> f64 {
        let total: f64 = site_log_likelihoods
            .iter()
            .zip(self.pattern_weights.iter())
            .filter(|(_, w)| **w != 0.0)
            .map(|(l, w)| l * w)
            .sum();
        if total.is_nan() {
            f64::NEG_INFINITY
        } else {
            total
        }
    }

    fn store_state(&mut self) {
        self.stored_rates = self.current_rates;
    }

    fn restore_state(&mut self) {
        self.current_rates = self.stored_rates;
    }

    fn get_transition_matrix(&self, index: usize, out: &mut [f64]) -> Result<()> {
        let matrix = self.matrix(index)?;
        check_len("matrix entries", matrix.len(), out.len())?;
        out.copy_from_slice(matrix);
        Ok(())
    }

    fn get_partials(&self, index: usize, out: &mut [f64]) -> Result<()> {
        check_len("partials", self.dims.partial_len(), out.len())?;
        match self.child(index)? {
            Child::States(states) => expand_states(self.dims, states, out),
            Child::Partials(partials) => out.copy_from_slice(partials),
        }
        Ok(())
    }
}
