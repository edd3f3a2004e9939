use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::backends::reference::{
    check_branch_time, check_index, check_len, compute_partials, reference_capabilities,
    transition_matrices, ReferenceCore,
};
use crate::backends::{
    BackendDetails, BackendFlags, BackendKind, BackendRequest, CoreError, LikelihoodCore,
    Operation,
};
use crate::substitution_models::EigenDecomposition;
use crate::Result;

pub const THREADED_NAME: &str = "threaded-cpu";

pub fn threaded_capabilities() -> BackendFlags {
    reference_capabilities() | BackendFlags::THREADING
}

/// Multi-threaded CPU core. Shares buffers and kernels with the reference
/// core, transition matrices are computed in parallel and operations are
/// executed level by level on a rayon pool.
pub struct ThreadedCore {
    inner: ReferenceCore,
    pool: ThreadPool,
}

impl ThreadedCore {
    pub fn new(request: &BackendRequest) -> Result<Self> {
        let threads = request.threads.max(1);
        let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
        let inner = ReferenceCore::with_details(
            request,
            BackendDetails {
                kind: BackendKind::Native,
                name: String::from(THREADED_NAME),
                flags: BackendFlags::THREADING,
            },
        )?;
        debug!("Started likelihood thread pool with {} threads.", threads);
        Ok(ThreadedCore { inner, pool })
    }
}

/// Groups operations into dependency levels. An operation sits one level
/// above the latest earlier operation that writes one of its children.
pub(crate) fn dependency_levels(operations: &[Operation]) -> Vec<Vec<usize>> {
    let mut written_at = HashMap::<usize, usize>::with_capacity(operations.len());
    let mut levels: Vec<Vec<usize>> = Vec::new();
    for (i, op) in operations.iter().enumerate() {
        let level = [op.child1, op.child2]
            .iter()
            .filter_map(|child| written_at.get(child))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        let level = match written_at.get(&op.destination) {
            Some(previous) => level.max(previous + 1),
            None => level,
        };
        written_at.insert(op.destination, level);
        if levels.len() <= level {
            levels.resize(level + 1, Vec::new());
        }
        levels[level].push(i);
    }
    levels
}

fn check_distinct(what: &'static str, indices: impl Iterator<Item = usize>, count: usize) -> Result<()> {
    let mut seen = FixedBitSet::with_capacity(count);
    for idx in indices {
        check_index(what, idx, count)?;
        if seen.put(idx) {
            bail!(CoreError::InvalidRequest(format!(
                "{} {} written twice in one batch",
                what, idx
            )));
        }
    }
    Ok(())
}

impl ThreadedCore {
    fn run_level(&mut self, operations: &[Operation], level: &[usize]) -> Result<()> {
        for &i in level {
            self.inner.check_operation(&operations[i])?;
        }
        check_distinct(
            "partials buffer",
            level.iter().map(|&i| operations[i].destination),
            self.inner.partials.len(),
        )?;
        let mut outs: Vec<Vec<f64>> = level
            .iter()
            .map(|&i| std::mem::take(&mut self.inner.partials[operations[i].destination]))
            .collect();
        let inner = &self.inner;
        let computed: Result<()> = self.pool.install(|| {
            level
                .par_iter()
                .zip(outs.par_iter_mut())
                .map(|(&i, out)| {
                    let op = &operations[i];
                    let child1 = inner.child(op.child1)?;
                    let child2 = inner.child(op.child2)?;
                    let m1 = inner.matrix(op.child1_matrix)?;
                    let m2 = inner.matrix(op.child2_matrix)?;
                    compute_partials(inner.dims, child1, m1, child2, m2, out);
                    Ok(())
                })
                .collect()
        });
        for (&i, mut out) in level.iter().zip(outs) {
            let op = &operations[i];
            if computed.is_ok() {
                self.inner.finish_partials(op.destination, op.rescale, &mut out);
            }
            self.inner.partials[op.destination] = out;
        }
        computed
    }
}

impl LikelihoodCore for ThreadedCore {
    fn details(&self) -> &BackendDetails {
        self.inner.details()
    }

    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<()> {
        self.inner.set_tip_states(tip, states)
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()> {
        self.inner.set_tip_partials(tip, partials)
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.inner.set_pattern_weights(weights)
    }

    fn set_eigen_decomposition(
        &mut self,
        eigen_index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<()> {
        self.inner.set_eigen_decomposition(eigen_index, eigen)
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.inner.set_category_rates(rates)
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        destinations: &[usize],
        branch_times: &[f64],
    ) -> Result<()> {
        check_len("branch times", destinations.len(), branch_times.len())?;
        check_distinct(
            "matrix buffer",
            destinations.iter().copied(),
            self.inner.matrices.len(),
        )?;
        for &time in branch_times {
            check_branch_time(time)?;
        }
        let eigen = self.inner.eigen(eigen_index)?.clone();
        let rates = self.inner.rates().to_vec();
        let mut outs: Vec<(f64, Vec<f64>)> = destinations
            .iter()
            .zip(branch_times)
            .map(|(&dest, &time)| (time, std::mem::take(&mut self.inner.matrices[dest])))
            .collect();
        self.pool.install(|| {
            outs.par_iter_mut()
                .for_each(|(time, out)| transition_matrices(&eigen, *time, &rates, out))
        });
        for (&dest, (_, out)) in destinations.iter().zip(outs) {
            self.inner.matrices[dest] = out;
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation]) -> Result<()> {
        for level in dependency_levels(operations) {
            self.run_level(operations, &level)?;
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
        self.inner.calculate_root_log_likelihoods(
            root,
            category_weights,
            frequencies,
            scale_indices,
            out,
        )
    }

    fn sum_site_log_likelihoods(&self, site_log_likelihoods: &[f64]) -> f64 {
        self.inner.sum_site_log_likelihoods(site_log_likelihoods)
    }

    fn store_state(&mut self) {
        self.inner.store_state()
    }

    fn restore_state(&mut self) {
        self.inner.restore_state()
    }

    fn get_transition_matrix(&self, index: usize, out: &mut [f64]) -> Result<()> {
        self.inner.get_transition_matrix(index, out)
    }

    fn get_partials(&self, index: usize, out: &mut [f64]) -> Result<()> {
        self.inner.get_partials(index, out)
    }
}
