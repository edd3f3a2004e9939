use anyhow::bail;

use crate::likelihood::EngineError;
use crate::tree::Tree;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Clean,
    Dirty,
}

/// Change notification raised by the tree or one of the models. Nodes are
/// addressed by their global index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelEvent {
    /// Height of a node changed, which moves its own branch and the branches
    /// to its children.
    NodeChanged(usize),
    TreeChanged,
    SubstitutionModelChanged,
    SiteRatesChanged,
    /// Rate of one branch, or of all branches.
    BranchRateChanged(Option<usize>),
}

#[derive(Debug, Clone, PartialEq)]
struct Flags {
    nodes: Vec<NodeState>,
    update_eigen: bool,
    update_category_rates: bool,
    likelihood: Option<f64>,
}

/// Per-node dirty states plus the global update flags and the memoised
/// log likelihood.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyTracker {
    live: Flags,
    stored: Flags,
}

impl DirtyTracker {
    /// Everything starts out dirty.
    pub fn new(node_count: usize) -> Self {
        let flags = Flags {
            nodes: vec![NodeState::Dirty; node_count],
            update_eigen: true,
            update_category_rates: true,
            likelihood: None,
        };
        DirtyTracker {
            live: flags.clone(),
            stored: flags,
        }
    }

    pub fn node_count(&self) -> usize {
        self.live.nodes.len()
    }

    pub fn state(&self, node: usize) -> NodeState {
        self.live.nodes[node]
    }

    pub fn is_dirty(&self, node: usize) -> bool {
        self.live.nodes[node] == NodeState::Dirty
    }

    pub fn dirty_count(&self) -> usize {
        self.live
            .nodes
            .iter()
            .filter(|s| **s == NodeState::Dirty)
            .count()
    }

    pub fn mark(&mut self, node: usize) {
        self.live.nodes[node] = NodeState::Dirty;
        self.live.likelihood = None;
    }

    pub fn mark_all(&mut self) {
        self.live.nodes.fill(NodeState::Dirty);
        self.live.likelihood = None;
    }

    /// Marks every node clean after a successful evaluation.
    pub fn clear(&mut self) {
        self.live.nodes.fill(NodeState::Clean);
    }

    pub fn update_eigen(&self) -> bool {
        self.live.update_eigen
    }

    pub fn set_update_eigen(&mut self, update: bool) {
        self.live.update_eigen = update;
    }

    pub fn update_category_rates(&self) -> bool {
        self.live.update_category_rates
    }

    pub fn set_update_category_rates(&mut self, update: bool) {
        self.live.update_category_rates = update;
    }

    /// Memoised log likelihood, `None` when it has to be recomputed.
    pub fn likelihood(&self) -> Option<f64> {
        self.live.likelihood
    }

    pub fn set_likelihood(&mut self, log_likelihood: f64) {
        self.live.likelihood = Some(log_likelihood);
    }

    pub fn invalidate(&mut self) {
        self.live.likelihood = None;
    }

    /// Marks the nodes affected by an event. Every event invalidates the
    /// memoised likelihood.
    pub fn apply(&mut self, event: &ModelEvent, tree: &Tree) -> Result<()> {
        match *event {
            ModelEvent::NodeChanged(node) => {
                let Some(idx) = tree.by_index(node) else {
                    bail!(EngineError::UnknownNode(node));
                };
                self.mark(node);
                for child in tree.children(&idx) {
                    self.mark(usize::from(child));
                }
            }
            ModelEvent::TreeChanged => self.mark_all(),
            ModelEvent::SubstitutionModelChanged => {
                self.live.update_eigen = true;
                self.mark_all();
            }
            ModelEvent::SiteRatesChanged => {
                self.live.update_category_rates = true;
                self.mark_all();
            }
            ModelEvent::BranchRateChanged(Some(node)) => {
                if tree.by_index(node).is_none() {
                    bail!(EngineError::UnknownNode(node));
                }
                self.mark(node);
            }
            ModelEvent::BranchRateChanged(None) => self.mark_all(),
        }
        self.invalidate();
        Ok(())
    }

    pub fn store(&mut self) {
        self.stored.clone_from(&self.live);
    }

    pub fn restore(&mut self) {
        std::mem::swap(&mut self.live, &mut self.stored);
    }
}
