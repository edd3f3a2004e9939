use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};

use crate::backends::{BackendDetails, BackendFlags, BackendKind};
use crate::likelihood::scheduler::ScaleAction;

/// Evaluations per window of the dynamic scheme.
pub const RESCALE_FREQUENCY: usize = 10000;
/// Evaluations at the start of each window that recompute scale factors.
pub const RESCALE_TIMES: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RescalingScheme {
    None,
    Always,
    Dynamic,
    /// Scaling happens inside the core.
    Auto,
}

impl RescalingScheme {
    /// Whether the engine keeps scale factor buffers for this scheme.
    pub fn uses_scale_buffers(&self) -> bool {
        matches!(self, RescalingScheme::Always | RescalingScheme::Dynamic)
    }
}

impl fmt::Display for RescalingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescalingScheme::None => write!(f, "none"),
            RescalingScheme::Always => write!(f, "always"),
            RescalingScheme::Dynamic => write!(f, "dynamic"),
            RescalingScheme::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for RescalingScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(RescalingScheme::None),
            "always" => Ok(RescalingScheme::Always),
            "dynamic" => Ok(RescalingScheme::Dynamic),
            "auto" => Ok(RescalingScheme::Auto),
            other => Err(format!(
                "unknown rescaling scheme '{}': expected one of none, always, dynamic, auto",
                other
            )),
        }
    }
}

/// Picks the scheme for a constructed core.
pub fn select_scheme(requested: Option<RescalingScheme>, details: &BackendDetails) -> RescalingScheme {
    let auto_supported = details.flags.contains(BackendFlags::SCALING_AUTO);
    let scheme = match requested {
        Some(RescalingScheme::Auto) if !auto_supported => {
            warn!(
                "Backend {} does not support auto scaling, using dynamic rescaling instead.",
                details.name
            );
            RescalingScheme::Dynamic
        }
        Some(scheme) => scheme,
        None if auto_supported => RescalingScheme::Auto,
        None if details.kind == BackendKind::Gpu => RescalingScheme::Dynamic,
        None => RescalingScheme::None,
    };
    info!("Using {} rescaling.", scheme);
    scheme
}

/// How the next pass handles scale factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassPlan {
    pub scale: ScaleAction,
    /// The whole tree has to be recomputed before this pass.
    pub make_all_dirty: bool,
}

impl PassPlan {
    fn new(scale: ScaleAction) -> Self {
        PassPlan {
            scale,
            make_all_dirty: false,
        }
    }
}

/// Decides per evaluation whether scale factors are ignored, recomputed or
/// reused, and whether an underflowing pass gets retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RescalingController {
    scheme: RescalingScheme,
    frequency: usize,
    ever_underflowed: bool,
    rescale_count: usize,
    recompute_count: usize,
}

impl RescalingController {
    pub fn new(scheme: RescalingScheme) -> Self {
        Self::with_frequency(scheme, RESCALE_FREQUENCY)
    }

    pub fn with_frequency(scheme: RescalingScheme, frequency: usize) -> Self {
        RescalingController {
            scheme,
            frequency: frequency.max(RESCALE_TIMES),
            ever_underflowed: false,
            rescale_count: 0,
            recompute_count: 0,
        }
    }

    pub fn scheme(&self) -> RescalingScheme {
        self.scheme
    }

    pub fn frequency(&self) -> usize {
        self.frequency
    }

    pub fn ever_underflowed(&self) -> bool {
        self.ever_underflowed
    }

    /// Plan for the first pass of an evaluation. Advances the dynamic window.
    pub fn plan(&mut self) -> PassPlan {
        match self.scheme {
            RescalingScheme::None | RescalingScheme::Auto => PassPlan::new(ScaleAction::None),
            RescalingScheme::Always => PassPlan::new(ScaleAction::Recompute),
            RescalingScheme::Dynamic if !self.ever_underflowed => PassPlan::new(ScaleAction::Reset),
            RescalingScheme::Dynamic => {
                let mut plan = PassPlan::new(ScaleAction::Reuse);
                if self.recompute_count < RESCALE_TIMES {
                    plan = PassPlan {
                        scale: ScaleAction::Recompute,
                        make_all_dirty: true,
                    };
                    self.recompute_count += 1;
                }
                self.rescale_count += 1;
                if self.rescale_count > self.frequency {
                    self.rescale_count = 0;
                    self.recompute_count = 0;
                }
                plan
            }
        }
    }

    /// Inspects the result of a pass. Returns the plan of a retry pass when
    /// the result underflowed on the first attempt of a dynamic evaluation.
    pub fn after_pass(&mut self, log_likelihood: f64, first_attempt: bool) -> Option<PassPlan> {
        if log_likelihood.is_finite() {
            return None;
        }
        if !self.ever_underflowed {
            debug!("Likelihood underflowed ({}), scale factors now in use.", log_likelihood);
        }
        self.ever_underflowed = true;
        if first_attempt && self.scheme == RescalingScheme::Dynamic {
            debug!("Retrying evaluation with recomputed scale factors.");
            return Some(PassPlan::new(ScaleAction::Recompute));
        }
        None
    }
}
