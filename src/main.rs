use anyhow::{anyhow, bail, Error};
use clap::Parser;
use ftail::Ftail;
use itertools::Itertools;
use log::{debug, info, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use treelikelihood::alphabets::{binary_alphabet, dna_alphabet};
use treelikelihood::evolutionary_models::SiteRates;
use treelikelihood::io::{read_patterns, read_tree};
use treelikelihood::likelihood::{TreeLikelihood, TreeLikelihoodBuilder};
use treelikelihood::substitution_models::dna_models::{dna_model, DNAModelType};
use treelikelihood::substitution_models::SubstModel;

mod cli;
use crate::cli::{Cli, Config};

type Result<T> = std::result::Result<T, Error>;

fn setup_logging(log_file: Option<&std::path::Path>) -> Result<()> {
    let mut logger = Ftail::new().console(LevelFilter::Info);
    if let Some(path) = log_file {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("Log file path {} is not valid UTF-8", path.display()))?;
        logger = logger.single_file(path, true, LevelFilter::Debug);
    }
    logger
        .init()
        .map_err(|e| anyhow!("Unable to set up logging: {:?}", e))
}

fn subst_model(cfg: &Config) -> Result<SubstModel> {
    if cfg.model == "BINARY" {
        return Ok(SubstModel::binary_symmetric());
    }
    match DNAModelType::from(cfg.model.as_str()) {
        DNAModelType::UNDEF => bail!("Unknown model: {}", cfg.model),
        model_type => dna_model(model_type, &cfg.freqs, &cfg.model_params),
    }
}

fn site_rates(cfg: &Config) -> Result<SiteRates> {
    let rates = if cfg.rates.is_empty() {
        SiteRates::homogeneous()
    } else {
        SiteRates::equal(&cfg.rates)?
    };
    match cfg.p_inv {
        Some(p_inv) => rates.with_invariant(p_inv),
        None => Ok(rates),
    }
}

fn walk_seed(cfg: &Config) -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(feature = "deterministic")] {
            let _ = cfg;
            42
        } else {
            cfg.seed.unwrap_or_else(|| rand::thread_rng().gen())
        }
    }
}

/// Perturbs internal node heights, keeping or reverting each change at
/// random, and checks the incremental result against a full recomputation.
fn smoke_walk(likelihood: &mut TreeLikelihood, steps: usize, seed: u64) -> Result<()> {
    info!("Running {} perturbation steps with seed {}.", steps, seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let tree = likelihood.tree();
    let internals = (tree.leaf_count()..tree.len() - 1).collect_vec();
    if internals.is_empty() {
        info!("Tree has no internal node below the root, nothing to perturb.");
        return Ok(());
    }
    let mut kept = 0;
    for step in 0..steps {
        likelihood.store_state();
        let node = internals[rng.gen_range(0..internals.len())];
        let tree = likelihood.tree();
        let Some(idx) = tree.by_index(node) else {
            bail!("Node {} vanished from the tree", node);
        };
        let low = tree
            .children(&idx)
            .iter()
            .map(|c| tree.height(c))
            .fold(0.0, f64::max);
        let high = tree.parent(&idx).map_or(low, |p| tree.height(p));
        if high < low {
            bail!("Node {} is older than its parent", node);
        }
        likelihood.set_node_height(node, rng.gen_range(low..=high))?;
        let proposed = likelihood.log_likelihood()?;
        let stats = likelihood.last_schedule_stats();
        if rng.gen_bool(0.5) {
            kept += 1;
        } else {
            likelihood.restore_state();
        }
        debug!(
            "Step {}: node {}, log likelihood {}, {} matrices and {} partials updated.",
            step, node, proposed, stats.matrix_updates, stats.partial_updates
        );
    }
    let incremental = likelihood.log_likelihood()?;
    likelihood.make_dirty();
    let full = likelihood.log_likelihood()?;
    info!(
        "Kept {} of {} perturbations, incremental {} vs full {} log likelihood.",
        kept, steps, incremental, full
    );
    if (incremental - full).abs() > 1e-8 * full.abs().max(1.0) {
        bail!(
            "Incremental log likelihood {} diverged from full recomputation {}",
            incremental,
            full
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            bail!("Unable to parse command line arguments: \n {}", error)
        }
    };
    setup_logging(cli.log_file.as_deref())?;
    let cfg = cli.setup()?;
    info!("Tree likelihood run started.");
    info!("{}", cfg);

    let alphabet = if cfg.model == "BINARY" {
        binary_alphabet()
    } else {
        dna_alphabet()
    };
    let patterns = read_patterns(&cfg.seq_file, alphabet)?;
    let tree = read_tree(&cfg.tree_file)?;

    let mut likelihood = TreeLikelihoodBuilder::new(tree, patterns, subst_model(&cfg)?)
        .site_rates(site_rates(&cfg)?)
        .config(cfg.likelihood.clone())
        .build()?;
    info!("{:?}", likelihood);
    let log_likelihood = likelihood.log_likelihood()?;
    debug!(
        "Pattern log likelihoods: {}",
        likelihood.site_log_likelihoods().iter().join(", ")
    );

    if cfg.walk_steps > 0 {
        smoke_walk(&mut likelihood, cfg.walk_steps, walk_seed(&cfg))?;
    }
    println!("{}", log_likelihood);
    Ok(())
}
