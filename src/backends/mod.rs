use std::error::Error;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::substitution_models::EigenDecomposition;
use crate::Result;

pub mod factory;
pub mod reference;
#[cfg(feature = "parallel")]
pub mod threaded;

pub use factory::BackendRegistry;
pub use reference::ReferenceCore;
#[cfg(feature = "parallel")]
pub use threaded::ThreadedCore;

bitflags! {
    /// Capabilities a likelihood core advertises, or a request requires.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BackendFlags: u32 {
        const PRECISION_DOUBLE = 1 << 0;
        const SCALING_MANUAL   = 1 << 1;
        const SCALING_AUTO     = 1 << 2;
        const PROCESSOR_CPU    = 1 << 3;
        const PROCESSOR_GPU    = 1 << 4;
        const THREADING        = 1 << 5;
    }
}

impl BackendFlags {
    fn from_token(token: &str) -> std::result::Result<Self, String> {
        match token.trim().to_ascii_lowercase().as_str() {
            "double" | "precision_double" => Ok(BackendFlags::PRECISION_DOUBLE),
            "manual" | "scaling_manual" => Ok(BackendFlags::SCALING_MANUAL),
            "auto" | "scaling_auto" => Ok(BackendFlags::SCALING_AUTO),
            "cpu" | "processor_cpu" => Ok(BackendFlags::PROCESSOR_CPU),
            "gpu" | "processor_gpu" => Ok(BackendFlags::PROCESSOR_GPU),
            "threading" | "threads" => Ok(BackendFlags::THREADING),
            other => Err(format!(
                "unknown backend flag '{}': expected one of double, manual, auto, cpu, gpu, threading",
                other
            )),
        }
    }

    /// Parses a comma, pipe or whitespace separated list of flag names.
    /// An empty list gives no flags.
    pub fn parse_list(spec: &str) -> std::result::Result<Self, String> {
        let mut mask = BackendFlags::empty();
        for token in spec
            .split(|c| matches!(c, ',' | '|' | ';'))
            .flat_map(|segment| segment.split_whitespace())
        {
            mask |= BackendFlags::from_token(token)?;
        }
        Ok(mask)
    }
}

impl FromStr for BackendFlags {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BackendFlags::parse_list(s)
    }
}

/// Class of a likelihood core, in default priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Gpu,
    Native,
    Reference,
}

impl BackendKind {
    pub const DEFAULT_ORDER: [BackendKind; 3] =
        [BackendKind::Gpu, BackendKind::Native, BackendKind::Reference];

    /// Parses an ordered, comma separated list of backend kinds.
    pub fn parse_order(spec: &str) -> std::result::Result<Vec<Self>, String> {
        let mut order = Vec::new();
        for token in spec.split([',', ';', ' ']).filter(|t| !t.trim().is_empty()) {
            let kind = token.parse::<BackendKind>()?;
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        Ok(order)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Gpu => write!(f, "gpu"),
            BackendKind::Native => write!(f, "native"),
            BackendKind::Reference => write!(f, "reference"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(BackendKind::Gpu),
            "native" | "cpu" | "threaded" => Ok(BackendKind::Native),
            "reference" | "ref" => Ok(BackendKind::Reference),
            other => Err(format!(
                "unknown backend '{}': expected one of gpu, native, reference",
                other
            )),
        }
    }
}

/// What a constructed core reports about itself.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendDetails {
    pub kind: BackendKind,
    pub name: String,
    pub flags: BackendFlags,
}

impl fmt::Display for BackendDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, flags {:?})", self.name, self.kind, self.flags)
    }
}

/// Buffer counts and dimensions a core has to allocate for.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendRequest {
    pub tip_count: usize,
    pub partial_buffer_count: usize,
    pub matrix_buffer_count: usize,
    pub eigen_buffer_count: usize,
    pub scale_buffer_count: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub category_count: usize,
    pub threads: usize,
    pub required_flags: BackendFlags,
    pub preferred_flags: BackendFlags,
}

impl BackendRequest {
    /// Whether scaling has to happen inside the core.
    pub fn wants_auto_scaling(&self) -> bool {
        (self.required_flags | self.preferred_flags).contains(BackendFlags::SCALING_AUTO)
    }
}

/// Rescaling applied to the destination of a partials operation.
///
/// Scale indices address per-pattern log scale factor buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rescale {
    /// Recompute scale factors and store them in the buffer.
    Write(usize),
    /// Divide by the factors in `from` and carry them over into `to`.
    Read { from: usize, to: usize },
    /// Leave partials unscaled and zero the factors in the buffer.
    Reset(usize),
}

/// One partials update: `destination` is the product of both children
/// propagated through their transition matrices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub destination: usize,
    pub rescale: Option<Rescale>,
    pub child1: usize,
    pub child1_matrix: usize,
    pub child2: usize,
    pub child2_matrix: usize,
}

impl Operation {
    /// Scale buffer written by the operation.
    pub fn scale_write(&self) -> Option<usize> {
        match self.rescale {
            Some(Rescale::Write(idx)) | Some(Rescale::Reset(idx)) => Some(idx),
            Some(Rescale::Read { to, .. }) => Some(to),
            None => None,
        }
    }

    /// Scale buffer whose cached factors are reused.
    pub fn scale_read(&self) -> Option<usize> {
        match self.rescale {
            Some(Rescale::Read { from, .. }) => Some(from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    Dimension {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        count: usize,
    },
    InvalidState {
        tip: usize,
        state: usize,
    },
    NegativeBranchTime(f64),
    Uninitialised {
        what: &'static str,
        index: usize,
    },
    InvalidRequest(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Dimension {
                what,
                expected,
                actual,
            } => write!(f, "Expected {} {}, got {}", expected, what, actual),
            CoreError::IndexOutOfRange { what, index, count } => write!(
                f,
                "{} index {} out of range, only {} allocated",
                what, index, count
            ),
            CoreError::InvalidState { tip, state } => {
                write!(f, "Invalid state code {} for tip {}", state, tip)
            }
            CoreError::NegativeBranchTime(t) => write!(f, "Negative branch time {}", t),
            CoreError::Uninitialised { what, index } => {
                write!(f, "{} {} has not been set", what, index)
            }
            CoreError::InvalidRequest(msg) => write!(f, "Invalid backend request: {}", msg),
        }
    }
}

impl Error for CoreError {}

/// Numeric engine that owns all likelihood buffers. Buffers are addressed by
/// physical index, the caller decides which physical buffer is current.
///
/// Partials are laid out `[category][pattern][state]`, transition matrices
/// as one row-major `state × state` block per category.
pub trait LikelihoodCore: Send {
    fn details(&self) -> &BackendDetails;

    /// Sets tip data as state codes, one per pattern. `state_count` encodes
    /// missing data.
    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<()>;

    /// Sets tip data as `pattern × state` partials, shared by all categories.
    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()>;

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()>;

    fn set_eigen_decomposition(
        &mut self,
        eigen_index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<()>;

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()>;

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        destinations: &[usize],
        branch_times: &[f64],
    ) -> Result<()>;

    /// Executes operations in order.
    fn update_partials(&mut self, operations: &[Operation]) -> Result<()>;

    /// Per-pattern log likelihoods at the root buffer. Log scale factors of
    /// the given buffers are added back. Exact zeros give `-∞`.
    fn calculate_root_log_likelihoods(
        &mut self,
        root: usize,
        category_weights: &[f64],
        frequencies: &[f64],
        scale_indices: &[usize],
        out: &mut [f64],
    ) -> Result<()>;

    /// Weighted sum of per-pattern log likelihoods.
    fn sum_site_log_likelihoods(&self, site_log_likelihoods: &[f64]) -> f64;

    fn store_state(&mut self);

    fn restore_state(&mut self);

    fn get_transition_matrix(&self, index: usize, out: &mut [f64]) -> Result<()>;

    fn get_partials(&self, index: usize, out: &mut [f64]) -> Result<()>;
}

#[cfg(test)]
mod tests;
