use std::error::Error;
use std::fmt;

use anyhow::bail;
use log::{debug, info, warn};

use crate::alignment::Patterns;
use crate::backends::{
    BackendDetails, BackendFlags, BackendRegistry, BackendRequest, LikelihoodCore,
};
use crate::evolutionary_models::{BranchRates, SiteRates};
use crate::substitution_models::SubstModel;
use crate::tree::{NodeIdx, Tree};
use crate::Result;

pub mod buffers;
pub mod config;
pub mod dirty;
pub mod rescaling;
pub mod scheduler;

pub use buffers::{BufferIndexTable, EngineBuffers};
pub use config::{LikelihoodConfig, TipMode};
pub use dirty::{DirtyTracker, ModelEvent, NodeState};
pub use rescaling::{RescalingController, RescalingScheme};
pub use scheduler::{ScaleAction, Schedule, ScheduleStats};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    UnknownNode(usize),
    NegativeBranchLength { node: usize, length: f64 },
    MissingTaxon(String),
    StateCountMismatch { expected: usize, actual: usize },
    CategoryCountMismatch { expected: usize, actual: usize },
    IncompatibleTree(String),
    InvalidConfig(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnknownNode(node) => write!(f, "Node {} is not part of the tree", node),
            EngineError::NegativeBranchLength { node, length } => {
                write!(f, "Branch above node {} has negative length {}", node, length)
            }
            EngineError::MissingTaxon(id) => {
                write!(f, "Tip {} has no sequence in the alignment", id)
            }
            EngineError::StateCountMismatch { expected, actual } => write!(
                f,
                "Alignment has {} states but the substitution model has {}",
                expected, actual
            ),
            EngineError::CategoryCountMismatch { expected, actual } => write!(
                f,
                "Engine was built for {} rate categories, got {}",
                expected, actual
            ),
            EngineError::IncompatibleTree(msg) => write!(f, "Incompatible tree: {}", msg),
            EngineError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl Error for EngineError {}

/// Collects the data and models of a `TreeLikelihood` and validates them
/// before any backend is asked for a core.
pub struct TreeLikelihoodBuilder {
    tree: Tree,
    patterns: Patterns,
    subst_model: SubstModel,
    site_rates: SiteRates,
    branch_rates: BranchRates,
    config: LikelihoodConfig,
}

impl TreeLikelihoodBuilder {
    /// Creates a builder with homogeneous site rates, a strict clock of rate 1
    /// and the default configuration.
    ///
    /// # Arguments
    /// * `tree` - Rooted binary tree, every leaf id must be a taxon of the alignment.
    /// * `patterns` - Compressed alignment.
    /// * `subst_model` - Substitution model with as many states as the alphabet.
    ///
    /// # Example
    /// ```
    /// use treelikelihood::alignment::Patterns;
    /// use treelikelihood::alphabets::dna_alphabet;
    /// use treelikelihood::likelihood::TreeLikelihoodBuilder;
    /// use treelikelihood::substitution_models::dna_models::jc69;
    /// use treelikelihood::tree::Tree;
    /// use bio::io::fasta::Record;
    ///
    /// let records = vec![
    ///     Record::with_attrs("A", None, b"ACGT"),
    ///     Record::with_attrs("B", None, b"ACGA"),
    /// ];
    /// let patterns = Patterns::new(&records, dna_alphabet()).unwrap();
    /// let tree = Tree::from_newick("(A:0.1,B:0.2);").unwrap();
    /// let mut likelihood = TreeLikelihoodBuilder::new(tree, patterns, jc69().unwrap())
    ///     .build()
    ///     .unwrap();
    /// assert!(likelihood.log_likelihood().unwrap() < 0.0);
    /// ```
    pub fn new(tree: Tree, patterns: Patterns, subst_model: SubstModel) -> Self {
        TreeLikelihoodBuilder {
            tree,
            patterns,
            subst_model,
            site_rates: SiteRates::default(),
            branch_rates: BranchRates::default(),
            config: LikelihoodConfig::default(),
        }
    }

    pub fn site_rates(mut self, site_rates: SiteRates) -> Self {
        self.site_rates = site_rates;
        self
    }

    pub fn branch_rates(mut self, branch_rates: BranchRates) -> Self {
        self.branch_rates = branch_rates;
        self
    }

    pub fn config(mut self, config: LikelihoodConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine on the first suitable core of the default registry.
    pub fn build(self) -> Result<TreeLikelihood> {
        self.build_with(&BackendRegistry::with_defaults())
    }

    fn check(&self) -> Result<Vec<usize>> {
        self.config.check()?;
        if self.patterns.state_count() != self.subst_model.n() {
            bail!(EngineError::StateCountMismatch {
                expected: self.patterns.state_count(),
                actual: self.subst_model.n(),
            });
        }
        self.branch_rates.check(self.tree.len())?;
        let mut taxa = Vec::with_capacity(self.tree.leaf_count());
        for leaf in self.tree.leaves() {
            match self.patterns.taxon_index(&leaf.id) {
                Ok(taxon) => taxa.push(taxon),
                Err(_) => bail!(EngineError::MissingTaxon(leaf.id.clone())),
            }
        }
        if self.patterns.taxon_count() > taxa.len() {
            warn!(
                "Alignment has {} taxa but only {} are tips of the tree, the rest is ignored.",
                self.patterns.taxon_count(),
                taxa.len()
            );
        }
        Ok(taxa)
    }

    fn request(&self) -> BackendRequest {
        let node_count = self.tree.len();
        let tip_count = self.tree.leaf_count();
        let internal_count = node_count - tip_count;
        // unset and auto schemes only get scale buffers once a core needs them
        let scale_buffer_count = match self.config.rescaling {
            Some(scheme) if scheme.uses_scale_buffers() => 2 * internal_count,
            _ => 0,
        };
        // an explicit engine side scheme must not be mixed with core scaling
        let mut preferred_flags = self.config.preferred_flags;
        match self.config.rescaling {
            Some(RescalingScheme::Auto) => preferred_flags |= BackendFlags::SCALING_AUTO,
            Some(_) => preferred_flags -= BackendFlags::SCALING_AUTO,
            None => {}
        }
        BackendRequest {
            tip_count,
            partial_buffer_count: node_count + internal_count,
            matrix_buffer_count: 2 * node_count,
            eigen_buffer_count: 2,
            scale_buffer_count,
            state_count: self.patterns.state_count(),
            pattern_count: self.patterns.pattern_count(),
            category_count: self.site_rates.category_count(),
            threads: self.config.threads,
            required_flags: self.config.required_flags,
            preferred_flags,
        }
    }

    /// Builds the engine on the first suitable core of `registry`.
    pub fn build_with(self, registry: &BackendRegistry) -> Result<TreeLikelihood> {
        let taxa = self.check()?;
        let mut request = self.request();
        let mut core = registry.create(&request, &self.config.resource_order)?;
        let mut scheme = rescaling::select_scheme(self.config.rescaling, core.details());
        if scheme.uses_scale_buffers() && request.scale_buffer_count == 0 {
            debug!(
                "Backend {} needs {} rescaling, requesting scale buffers.",
                core.details().name,
                scheme
            );
            drop(core);
            request.scale_buffer_count = 2 * (self.tree.len() - self.tree.leaf_count());
            core = registry.create(&request, &self.config.resource_order)?;
            scheme = rescaling::select_scheme(self.config.rescaling, core.details());
        }

        for (tip, &taxon) in taxa.iter().enumerate() {
            match self.config.tip_mode {
                TipMode::States => core.set_tip_states(tip, &self.patterns.tip_states(taxon)?)?,
                TipMode::Partials => {
                    core.set_tip_partials(tip, &self.patterns.tip_partials(taxon)?)?
                }
            }
        }
        core.set_pattern_weights(self.patterns.weights())?;

        let node_count = self.tree.len();
        let tip_count = self.tree.leaf_count();
        info!(
            "Built tree likelihood for {} tips, {} patterns, {} states and {} rate categories.",
            tip_count,
            self.patterns.pattern_count(),
            self.patterns.state_count(),
            self.site_rates.category_count()
        );
        let pattern_count = self.patterns.pattern_count();
        let mut likelihood = TreeLikelihood {
            stored_tree: self.tree.clone(),
            tree: self.tree,
            stored_subst_model: self.subst_model.clone(),
            subst_model: self.subst_model,
            stored_site_rates: self.site_rates.clone(),
            site_rates: self.site_rates,
            stored_branch_rates: self.branch_rates.clone(),
            branch_rates: self.branch_rates,
            patterns: self.patterns,
            core,
            buffers: EngineBuffers::new(node_count, tip_count, scheme.uses_scale_buffers()),
            tracker: DirtyTracker::new(node_count),
            rescaling: RescalingController::with_frequency(scheme, self.config.rescale_frequency),
            schedule: Schedule::default(),
            stats: ScheduleStats::default(),
            site_log_likelihoods: vec![0.0; pattern_count],
            stored_site_log_likelihoods: vec![0.0; pattern_count],
            scale_indices: Vec::with_capacity(node_count),
        };
        likelihood.store_state();
        Ok(likelihood)
    }
}

/// Incremental likelihood of an alignment on a tree.
///
/// Mutations go through the setters or `handle_event`, which mark the stale
/// part of the tree. `log_likelihood` recomputes only that part and memoises
/// the result until the next mutation. `store_state` and `restore_state`
/// bracket a tentative change: restoring brings back the stored likelihood
/// without recomputing anything.
pub struct TreeLikelihood {
    tree: Tree,
    stored_tree: Tree,
    subst_model: SubstModel,
    stored_subst_model: SubstModel,
    site_rates: SiteRates,
    stored_site_rates: SiteRates,
    branch_rates: BranchRates,
    stored_branch_rates: BranchRates,
    patterns: Patterns,
    core: Box<dyn LikelihoodCore>,
    buffers: EngineBuffers,
    tracker: DirtyTracker,
    rescaling: RescalingController,
    schedule: Schedule,
    stats: ScheduleStats,
    site_log_likelihoods: Vec<f64>,
    stored_site_log_likelihoods: Vec<f64>,
    scale_indices: Vec<usize>,
}

impl fmt::Debug for TreeLikelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLikelihood")
            .field("backend", self.core.details())
            .field("scheme", &self.rescaling.scheme())
            .field("tips", &self.tree.leaf_count())
            .field("patterns", &self.patterns.pattern_count())
            .field("log_likelihood", &self.tracker.likelihood())
            .finish()
    }
}

impl TreeLikelihood {
    /// Log likelihood of the current state. Only stale nodes are recomputed,
    /// repeated calls without a mutation return the memoised value.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        if let Some(log_likelihood) = self.tracker.likelihood() {
            return Ok(log_likelihood);
        }
        self.stats = ScheduleStats::default();
        let mut plan = self.rescaling.plan();
        if plan.make_all_dirty {
            debug!("Recomputing scale factors for the whole tree.");
            self.tracker.mark_all();
        }
        if self.tracker.update_eigen() {
            self.buffers.eigen.flip_once(0);
            self.core.set_eigen_decomposition(
                self.buffers.eigen.offset_index(0),
                self.subst_model.eigen(),
            )?;
        }
        if self.tracker.update_category_rates() {
            self.core.set_category_rates(self.site_rates.rates())?;
        }

        let mut commit = true;
        let log_likelihood = loop {
            let log_likelihood = self.evaluate(commit, plan.scale)?;
            match self.rescaling.after_pass(log_likelihood, commit) {
                Some(retry) => {
                    plan = retry;
                    commit = false;
                }
                None => break log_likelihood,
            }
        };
        if !log_likelihood.is_finite() {
            debug!("Log likelihood is {} after rescaling.", log_likelihood);
        }

        self.tracker.set_update_eigen(false);
        self.tracker.set_update_category_rates(false);
        self.tracker.clear();
        self.tracker.set_likelihood(log_likelihood);
        Ok(log_likelihood)
    }

    /// One pass over the dirty part of the tree. Only the first pass of an
    /// evaluation commits, a retry overwrites the buffers it wrote.
    fn evaluate(&mut self, commit: bool, scale: ScaleAction) -> Result<f64> {
        scheduler::traverse(
            &self.tree,
            &self.branch_rates,
            &self.tracker,
            &mut self.buffers,
            commit,
            scale,
            &mut self.schedule,
        )?;
        self.stats.add(&self.schedule);

        if !self.schedule.matrix_destinations.is_empty() {
            self.core.update_transition_matrices(
                self.buffers.eigen.offset_index(0),
                &self.schedule.matrix_destinations,
                &self.schedule.branch_times,
            )?;
        }
        if !self.schedule.operations.is_empty() {
            self.core.update_partials(&self.schedule.operations)?;
        }

        self.scale_indices.clear();
        let tip_count = self.tree.leaf_count();
        match (self.rescaling.scheme(), self.buffers.scales.as_ref()) {
            (RescalingScheme::Auto, _) => self
                .scale_indices
                .extend((tip_count..self.tree.len()).map(|n| self.buffers.partials.offset_index(n))),
            (_, Some(scales)) => self
                .scale_indices
                .extend((0..scales.slot_count()).map(|s| scales.offset_index(s))),
            (_, None) => {}
        }

        let root = self.buffers.partials.offset_index(usize::from(self.tree.root()));
        self.core.calculate_root_log_likelihoods(
            root,
            self.site_rates.proportions(),
            self.subst_model.freqs().as_slice(),
            &self.scale_indices,
            &mut self.site_log_likelihoods,
        )?;
        Ok(self.core.sum_site_log_likelihoods(&self.site_log_likelihoods))
    }

    /// Forces a full recomputation on the next evaluation.
    pub fn make_dirty(&mut self) {
        self.tracker.mark_all();
        self.tracker.set_update_eigen(true);
        self.tracker.set_update_category_rates(true);
    }

    /// Snapshots the current state. Must precede every `restore_state`.
    pub fn store_state(&mut self) {
        self.buffers.store();
        self.tracker.store();
        self.core.store_state();
        self.stored_tree.clone_from(&self.tree);
        self.stored_subst_model.clone_from(&self.subst_model);
        self.stored_site_rates.clone_from(&self.site_rates);
        self.stored_branch_rates.clone_from(&self.branch_rates);
        self.stored_site_log_likelihoods
            .clone_from(&self.site_log_likelihoods);
    }

    /// Returns to the last stored state without recomputing anything.
    pub fn restore_state(&mut self) {
        self.buffers.restore();
        self.tracker.restore();
        self.core.restore_state();
        std::mem::swap(&mut self.tree, &mut self.stored_tree);
        std::mem::swap(&mut self.subst_model, &mut self.stored_subst_model);
        std::mem::swap(&mut self.site_rates, &mut self.stored_site_rates);
        std::mem::swap(&mut self.branch_rates, &mut self.stored_branch_rates);
        std::mem::swap(
            &mut self.site_log_likelihoods,
            &mut self.stored_site_log_likelihoods,
        );
    }

    /// Marks the nodes affected by an external change.
    pub fn handle_event(&mut self, event: ModelEvent) -> Result<()> {
        self.tracker.apply(&event, &self.tree)
    }

    fn node_idx(&self, node: usize) -> Result<NodeIdx> {
        match self.tree.by_index(node) {
            Some(idx) => Ok(idx),
            None => bail!(EngineError::UnknownNode(node)),
        }
    }

    pub fn set_node_height(&mut self, node: usize, height: f64) -> Result<()> {
        let idx = self.node_idx(node)?;
        self.tree.set_height(&idx, height);
        self.handle_event(ModelEvent::NodeChanged(node))
    }

    pub fn set_branch_rates(&mut self, branch_rates: BranchRates) -> Result<()> {
        branch_rates.check(self.tree.len())?;
        self.branch_rates = branch_rates;
        self.handle_event(ModelEvent::BranchRateChanged(None))
    }

    pub fn set_branch_rate(&mut self, node: usize, rate: f64) -> Result<()> {
        let idx = self.node_idx(node)?;
        self.branch_rates.set_rate(&idx, rate, self.tree.len())?;
        self.handle_event(ModelEvent::BranchRateChanged(Some(node)))
    }

    pub fn set_subst_model(&mut self, subst_model: SubstModel) -> Result<()> {
        if subst_model.n() != self.patterns.state_count() {
            bail!(EngineError::StateCountMismatch {
                expected: self.patterns.state_count(),
                actual: subst_model.n(),
            });
        }
        self.subst_model = subst_model;
        self.handle_event(ModelEvent::SubstitutionModelChanged)
    }

    pub fn set_site_rates(&mut self, site_rates: SiteRates) -> Result<()> {
        if site_rates.category_count() != self.site_rates.category_count() {
            bail!(EngineError::CategoryCountMismatch {
                expected: self.site_rates.category_count(),
                actual: site_rates.category_count(),
            });
        }
        self.site_rates = site_rates;
        self.handle_event(ModelEvent::SiteRatesChanged)
    }

    /// Replaces the tree. The new tree must have the same tip labels; its
    /// leaves are renumbered to match the current tip order.
    pub fn set_tree(&mut self, tree: Tree) -> Result<()> {
        let tree = match tree.with_leaf_order(&self.tree.leaf_ids()) {
            Ok(tree) => tree,
            Err(e) => bail!(EngineError::IncompatibleTree(e.to_string())),
        };
        self.branch_rates.check(tree.len())?;
        self.tree = tree;
        self.handle_event(ModelEvent::TreeChanged)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    pub fn subst_model(&self) -> &SubstModel {
        &self.subst_model
    }

    pub fn site_rates(&self) -> &SiteRates {
        &self.site_rates
    }

    pub fn branch_rates(&self) -> &BranchRates {
        &self.branch_rates
    }

    pub fn scheme(&self) -> RescalingScheme {
        self.rescaling.scheme()
    }

    pub fn backend_details(&self) -> &BackendDetails {
        self.core.details()
    }

    /// Per-pattern log likelihoods of the last evaluation.
    pub fn site_log_likelihoods(&self) -> &[f64] {
        &self.site_log_likelihoods
    }

    /// Work done by the last evaluation that was not memoised.
    pub fn last_schedule_stats(&self) -> ScheduleStats {
        self.stats
    }

    /// Copy of a node's current transition matrices, one block per category.
    pub fn transition_matrix(&self, node: usize) -> Result<Vec<f64>> {
        self.node_idx(node)?;
        let n = self.patterns.state_count();
        let mut out = vec![0.0; self.site_rates.category_count() * n * n];
        self.core
            .get_transition_matrix(self.buffers.matrices.offset_index(node), &mut out)?;
        Ok(out)
    }
}
