use anyhow::bail;
use fixedbitset::FixedBitSet;

use crate::backends::{Operation, Rescale};
use crate::evolutionary_models::BranchRates;
use crate::likelihood::buffers::EngineBuffers;
use crate::likelihood::dirty::DirtyTracker;
use crate::likelihood::EngineError;
use crate::tree::{NodeIdx, Tree};
use crate::Result;

/// How scale factors are handled for every partials operation of a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleAction {
    /// No engine managed scale factors.
    None,
    /// Partials stay unscaled, destination factors are zeroed.
    Reset,
    Recompute,
    /// Divide by the factors cached for the node.
    Reuse,
}

/// Work lists produced by one traversal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    pub matrix_destinations: Vec<usize>,
    pub branch_times: Vec<f64>,
    pub operations: Vec<Operation>,
}

impl Schedule {
    pub fn clear(&mut self) {
        self.matrix_destinations.clear();
        self.branch_times.clear();
        self.operations.clear();
    }

    pub fn matrix_count(&self) -> usize {
        self.matrix_destinations.len()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }
}

/// Work done by the last evaluation, summed over its passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub matrix_updates: usize,
    pub partial_updates: usize,
    pub passes: usize,
}

impl ScheduleStats {
    pub fn add(&mut self, schedule: &Schedule) {
        self.matrix_updates += schedule.matrix_count();
        self.partial_updates += schedule.operation_count();
        self.passes += 1;
    }
}

fn branch_time(tree: &Tree, rates: &BranchRates, idx: &NodeIdx, parent: &NodeIdx) -> Result<f64> {
    let length = tree.height(parent) - tree.height(idx);
    let time = rates.rate(idx) * length;
    if time.is_nan() || time < 0.0 {
        bail!(EngineError::NegativeBranchLength {
            node: usize::from(idx),
            length: time,
        });
    }
    Ok(time)
}

/// Walks the tree in postorder and schedules the work for dirty nodes.
///
/// A dirty node gets its transition matrix recomputed; an internal node with
/// an updated child gets its partials recomputed. A committing pass moves
/// every written slot off its stored buffer first, a retry pass writes into
/// the current buffers.
pub fn traverse(
    tree: &Tree,
    branch_rates: &BranchRates,
    tracker: &DirtyTracker,
    buffers: &mut EngineBuffers,
    commit: bool,
    scale: ScaleAction,
    schedule: &mut Schedule,
) -> Result<()> {
    schedule.clear();
    let mut updated = FixedBitSet::with_capacity(tree.len());
    for idx in tree.postorder() {
        let i = usize::from(idx);
        if let Some(parent) = tree.parent(idx) {
            if tracker.is_dirty(i) {
                let time = branch_time(tree, branch_rates, idx, parent)?;
                if commit {
                    buffers.matrices.flip_once(i);
                }
                schedule
                    .matrix_destinations
                    .push(buffers.matrices.offset_index(i));
                schedule.branch_times.push(time);
                updated.insert(i);
            }
        }
        let NodeIdx::Internal(_) = idx else {
            continue;
        };
        let children = tree.children(idx);
        let (c1, c2) = (usize::from(children[0]), usize::from(children[1]));
        if !updated.contains(c1) && !updated.contains(c2) {
            continue;
        }
        let slot = buffers.scale_slot(i);
        let rescale = match buffers.scales.as_mut() {
            Some(scales) => {
                let previous = scales.offset_index(slot);
                if commit {
                    scales.flip_once(slot);
                }
                let current = scales.offset_index(slot);
                match scale {
                    ScaleAction::None => None,
                    ScaleAction::Reset => Some(Rescale::Reset(current)),
                    ScaleAction::Recompute => Some(Rescale::Write(current)),
                    ScaleAction::Reuse => Some(Rescale::Read {
                        from: previous,
                        to: current,
                    }),
                }
            }
            None => None,
        };
        if commit {
            buffers.partials.flip_once(i);
        }
        schedule.operations.push(Operation {
            destination: buffers.partials.offset_index(i),
            rescale,
            child1: buffers.partials.offset_index(c1),
            child1_matrix: buffers.matrices.offset_index(c1),
            child2: buffers.partials.offset_index(c2),
            child2_matrix: buffers.matrices.offset_index(c2),
        });
        updated.insert(i);
    }
    Ok(())
}
