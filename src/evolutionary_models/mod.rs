use std::error::Error;
use std::fmt;

use anyhow::bail;
use log::info;

use crate::tree::NodeIdx;
use crate::Result;

/// Failures while setting up substitution, site-rate or branch-rate models.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    Dimension { expected: usize, actual: usize },
    MalformedEigenSystem(String),
    ComplexEigenvalues,
    InvalidFrequencies(String),
    InvalidRates(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Dimension { expected, actual } => write!(
                f,
                "Dimension mismatch, expected {} states, got {}",
                expected, actual
            ),
            ModelError::MalformedEigenSystem(msg) => write!(f, "Malformed eigen system: {}", msg),
            ModelError::ComplexEigenvalues => {
                write!(f, "Rate matrix has complex eigenvalues, which are not supported")
            }
            ModelError::InvalidFrequencies(msg) => write!(f, "Invalid frequencies: {}", msg),
            ModelError::InvalidRates(msg) => write!(f, "Invalid rates: {}", msg),
        }
    }
}

impl Error for ModelError {}

/// Discrete among-site rate heterogeneity: every site evolves under one of
/// the categories, `rates[c]` scales branch times, `proportions[c]` is the
/// prior probability of the category.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteRates {
    rates: Vec<f64>,
    proportions: Vec<f64>,
}

impl Default for SiteRates {
    fn default() -> Self {
        Self::homogeneous()
    }
}

impl SiteRates {
    /// A single category with rate one.
    pub fn homogeneous() -> Self {
        SiteRates {
            rates: vec![1.0],
            proportions: vec![1.0],
        }
    }

    pub fn new(rates: &[f64], proportions: &[f64]) -> Result<Self> {
        if rates.is_empty() || rates.len() != proportions.len() {
            bail!(ModelError::Dimension {
                expected: rates.len().max(1),
                actual: proportions.len(),
            });
        }
        if rates.iter().any(|&r| r < 0.0 || !r.is_finite()) {
            bail!(ModelError::InvalidRates(format!(
                "category rates must be non-negative, got {:?}",
                rates
            )));
        }
        if proportions.iter().any(|&p| p < 0.0 || !p.is_finite()) {
            bail!(ModelError::InvalidRates(format!(
                "category proportions must be non-negative, got {:?}",
                proportions
            )));
        }
        let total: f64 = proportions.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            bail!(ModelError::InvalidRates(format!(
                "category proportions must sum to 1.0, got {}",
                total
            )));
        }
        Ok(SiteRates {
            rates: rates.to_vec(),
            proportions: proportions.to_vec(),
        })
    }

    /// Equally weighted categories.
    pub fn equal(rates: &[f64]) -> Result<Self> {
        let weight = 1.0 / rates.len().max(1) as f64;
        Self::new(rates, &vec![weight; rates.len()])
    }

    /// Adds an invariant category of weight `p_inv`. Remaining categories are
    /// rescaled so that the mean rate is preserved.
    pub fn with_invariant(self, p_inv: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p_inv) {
            bail!(ModelError::InvalidRates(format!(
                "proportion of invariant sites must be in [0, 1), got {}",
                p_inv
            )));
        }
        info!("Adding invariant sites category with proportion {}.", p_inv);
        let mut rates = vec![0.0];
        rates.extend(self.rates.iter().map(|r| r / (1.0 - p_inv)));
        let mut proportions = vec![p_inv];
        proportions.extend(self.proportions.iter().map(|p| p * (1.0 - p_inv)));
        Self::new(&rates, &proportions)
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn proportions(&self) -> &[f64] {
        &self.proportions
    }

    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    pub fn mean_rate(&self) -> f64 {
        self.rates
            .iter()
            .zip(self.proportions.iter())
            .map(|(r, p)| r * p)
            .sum()
    }
}

/// Rate multiplier applied to the time span of every branch.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchRates {
    Strict(f64),
    /// One rate per node, indexed by the global node index. The root entry
    /// is ignored.
    Relaxed(Vec<f64>),
}

impl Default for BranchRates {
    fn default() -> Self {
        BranchRates::Strict(1.0)
    }
}

impl BranchRates {
    pub fn strict(rate: f64) -> Result<Self> {
        if rate < 0.0 || !rate.is_finite() {
            bail!(ModelError::InvalidRates(format!(
                "clock rate must be non-negative, got {}",
                rate
            )));
        }
        Ok(BranchRates::Strict(rate))
    }

    pub fn relaxed(rates: Vec<f64>) -> Result<Self> {
        if let Some(r) = rates.iter().find(|r| **r < 0.0 || !r.is_finite()) {
            bail!(ModelError::InvalidRates(format!(
                "branch rates must be non-negative, got {}",
                r
            )));
        }
        Ok(BranchRates::Relaxed(rates))
    }

    /// Checks that every node of a tree with `node_count` nodes has a rate.
    pub fn check(&self, node_count: usize) -> Result<()> {
        match self {
            BranchRates::Strict(_) => Ok(()),
            BranchRates::Relaxed(rates) if rates.len() == node_count => Ok(()),
            BranchRates::Relaxed(rates) => bail!(ModelError::Dimension {
                expected: node_count,
                actual: rates.len(),
            }),
        }
    }

    pub fn rate(&self, node: &NodeIdx) -> f64 {
        match self {
            BranchRates::Strict(rate) => *rate,
            BranchRates::Relaxed(rates) => rates[usize::from(node)],
        }
    }

    /// Changes the rate of a single branch. A strict clock becomes relaxed.
    pub fn set_rate(&mut self, node: &NodeIdx, rate: f64, node_count: usize) -> Result<()> {
        if rate < 0.0 || !rate.is_finite() {
            bail!(ModelError::InvalidRates(format!(
                "branch rates must be non-negative, got {}",
                rate
            )));
        }
        if let BranchRates::Strict(clock) = self {
            *self = BranchRates::Relaxed(vec![*clock; node_count]);
        }
        if let BranchRates::Relaxed(rates) = self {
            rates[usize::from(node)] = rate;
        }
        Ok(())
    }
}
