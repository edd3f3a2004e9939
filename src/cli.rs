use std::fmt::Display;
use std::path::PathBuf;

use clap::Parser;

use treelikelihood::backends::{BackendFlags, BackendKind};
use treelikelihood::likelihood::{LikelihoodConfig, RescalingScheme, TipMode};

use crate::Result;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(super) struct Cli {
    /// Sequence file in fasta format
    #[arg(short, long, value_name = "SEQ_FILE")]
    pub(super) seq_file: PathBuf,

    /// Tree file in newick format, the first tree is used
    #[arg(short, long, value_name = "TREE_FILE")]
    pub(super) tree_file: PathBuf,

    /// Substitution model: JC69, K80, HKY, GTR or BINARY
    #[arg(short, long, value_name = "MODEL", default_value = "JC69")]
    pub(super) model: String,

    /// Substitution model parameters, e.g. kappa for K80 and HKY
    #[arg(short = 'p', long, value_name = "MODEL_PARAMS", num_args = 0..)]
    pub(super) model_params: Vec<f64>,

    /// Stationary frequencies, equal frequencies if omitted
    #[arg(short, long, value_name = "FREQS", num_args = 0..)]
    pub(super) freqs: Vec<f64>,

    /// Equally weighted site rate categories
    #[arg(short, long, value_name = "RATES", num_args = 0..)]
    pub(super) rates: Vec<f64>,

    /// Proportion of invariant sites
    #[arg(long, value_name = "P_INV")]
    pub(super) p_inv: Option<f64>,

    /// Rescaling scheme: none, always, dynamic or auto
    #[arg(long, value_name = "SCHEME")]
    pub(super) scaling: Option<RescalingScheme>,

    /// Tip data: states or partials
    #[arg(long, value_name = "TIP_MODE")]
    pub(super) tip_mode: Option<TipMode>,

    /// Backend priority, e.g. "native,reference"
    #[arg(long, value_name = "ORDER")]
    pub(super) backends: Option<String>,

    /// Backend flags that have to be supported, e.g. "cpu,double"
    #[arg(long, value_name = "FLAGS")]
    pub(super) require: Option<String>,

    /// Number of threads for the native backend
    #[arg(long, value_name = "THREADS")]
    pub(super) threads: Option<usize>,

    /// Number of store/perturb/restore steps to run after the first evaluation
    #[arg(short = 'w', long, value_name = "STEPS", default_value_t = 0)]
    pub(super) walk_steps: usize,

    /// Seed of the height perturbation walk
    #[arg(long, value_name = "SEED")]
    pub(super) seed: Option<u64>,

    /// Log file, logs go to the console only if omitted
    #[arg(short, long, value_name = "LOG_FILE")]
    pub(super) log_file: Option<PathBuf>,
}

pub(super) struct Config {
    pub(super) seq_file: PathBuf,
    pub(super) tree_file: PathBuf,
    pub(super) model: String,
    pub(super) model_params: Vec<f64>,
    pub(super) freqs: Vec<f64>,
    pub(super) rates: Vec<f64>,
    pub(super) p_inv: Option<f64>,
    pub(super) likelihood: LikelihoodConfig,
    pub(super) walk_steps: usize,
    pub(super) seed: Option<u64>,
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sequences: {}", self.seq_file.display())?;
        writeln!(f, "Tree: {}", self.tree_file.display())?;
        writeln!(
            f,
            "Model: {} with parameters {:?} and frequencies {:?}",
            self.model, self.model_params, self.freqs
        )?;
        writeln!(f, "Site rates: {:?}, invariant: {:?}", self.rates, self.p_inv)?;
        writeln!(f, "Likelihood: {:?}", self.likelihood)?;
        write!(f, "Walk steps: {}", self.walk_steps)
    }
}

impl Cli {
    /// Merges the command line with the `TREELIK_*` environment, command
    /// line values win.
    pub(super) fn setup(self) -> Result<Config> {
        let mut likelihood = LikelihoodConfig::from_env()?;
        if let Some(scheme) = self.scaling {
            likelihood = likelihood.with_rescaling(scheme);
        }
        if let Some(tip_mode) = self.tip_mode {
            likelihood = likelihood.with_tip_mode(tip_mode);
        }
        if let Some(order) = &self.backends {
            likelihood = likelihood.with_resource_order(
                BackendKind::parse_order(order).map_err(anyhow::Error::msg)?,
            );
        }
        if let Some(flags) = &self.require {
            likelihood = likelihood
                .with_required_flags(BackendFlags::parse_list(flags).map_err(anyhow::Error::msg)?);
        }
        if let Some(threads) = self.threads {
            likelihood = likelihood.with_threads(threads);
        }
        likelihood.check()?;
        Ok(Config {
            seq_file: self.seq_file,
            tree_file: self.tree_file,
            model: self.model.to_uppercase(),
            model_params: self.model_params,
            freqs: self.freqs,
            rates: self.rates,
            p_inv: self.p_inv,
            likelihood,
            walk_steps: self.walk_steps,
            seed: self.seed,
        })
    }
}
