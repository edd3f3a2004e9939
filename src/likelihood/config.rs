use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use log::debug;

use crate::backends::{BackendFlags, BackendKind};
use crate::likelihood::rescaling::{RescalingScheme, RESCALE_FREQUENCY};
use crate::likelihood::EngineError;
use crate::Result;

/// How tip data is handed to the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TipMode {
    /// Compact state codes, partial ambiguities collapse to missing data.
    #[default]
    States,
    /// Full partial vectors, ambiguity codes are kept exactly.
    Partials,
}

impl fmt::Display for TipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipMode::States => write!(f, "states"),
            TipMode::Partials => write!(f, "partials"),
        }
    }
}

impl FromStr for TipMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "states" => Ok(TipMode::States),
            "partials" => Ok(TipMode::Partials),
            other => Err(format!(
                "unknown tip mode '{}': expected states or partials",
                other
            )),
        }
    }
}

pub const ENV_SCALING: &str = "TREELIK_SCALING";
pub const ENV_TIP_MODE: &str = "TREELIK_TIP_MODE";
pub const ENV_RESOURCE_ORDER: &str = "TREELIK_RESOURCE_ORDER";
pub const ENV_REQUIRED_FLAGS: &str = "TREELIK_REQUIRED_FLAGS";
pub const ENV_PREFERRED_FLAGS: &str = "TREELIK_PREFERRED_FLAGS";
pub const ENV_THREADS: &str = "TREELIK_THREADS";
pub const ENV_RESCALE_FREQUENCY: &str = "TREELIK_RESCALE_FREQUENCY";

/// Construction time settings of a `TreeLikelihood`.
#[derive(Clone, Debug, PartialEq)]
pub struct LikelihoodConfig {
    /// `None` lets the engine pick a scheme for the selected core.
    pub rescaling: Option<RescalingScheme>,
    pub tip_mode: TipMode,
    /// Empty means the default priority order.
    pub resource_order: Vec<BackendKind>,
    pub required_flags: BackendFlags,
    pub preferred_flags: BackendFlags,
    pub threads: usize,
    pub rescale_frequency: usize,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        LikelihoodConfig {
            rescaling: None,
            tip_mode: TipMode::States,
            resource_order: Vec::new(),
            required_flags: BackendFlags::empty(),
            preferred_flags: BackendFlags::empty(),
            threads: 1,
            rescale_frequency: RESCALE_FREQUENCY,
        }
    }
}

fn parse_var<T, E: fmt::Display>(
    name: &str,
    value: &str,
    parse: impl Fn(&str) -> std::result::Result<T, E>,
) -> Result<T> {
    match parse(value) {
        Ok(parsed) => Ok(parsed),
        Err(e) => bail!(EngineError::InvalidConfig(format!("{}: {}", name, e))),
    }
}

impl LikelihoodConfig {
    pub fn with_rescaling(mut self, scheme: RescalingScheme) -> Self {
        self.rescaling = Some(scheme);
        self
    }

    pub fn with_tip_mode(mut self, tip_mode: TipMode) -> Self {
        self.tip_mode = tip_mode;
        self
    }

    pub fn with_resource_order(mut self, order: Vec<BackendKind>) -> Self {
        self.resource_order = order;
        self
    }

    pub fn with_required_flags(mut self, flags: BackendFlags) -> Self {
        self.required_flags = flags;
        self
    }

    pub fn with_preferred_flags(mut self, flags: BackendFlags) -> Self {
        self.preferred_flags = flags;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_rescale_frequency(mut self, frequency: usize) -> Self {
        self.rescale_frequency = frequency;
        self
    }

    /// Default configuration with `TREELIK_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_lookup(|name| std::env::var(name).ok())
    }

    /// Applies overrides from a variable lookup on top of `self`.
    pub fn apply_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(value) = get(ENV_SCALING) {
            self.rescaling = Some(parse_var(ENV_SCALING, &value, RescalingScheme::from_str)?);
        }
        if let Some(value) = get(ENV_TIP_MODE) {
            self.tip_mode = parse_var(ENV_TIP_MODE, &value, TipMode::from_str)?;
        }
        if let Some(value) = get(ENV_RESOURCE_ORDER) {
            self.resource_order = parse_var(ENV_RESOURCE_ORDER, &value, BackendKind::parse_order)?;
        }
        if let Some(value) = get(ENV_REQUIRED_FLAGS) {
            self.required_flags = parse_var(ENV_REQUIRED_FLAGS, &value, BackendFlags::parse_list)?;
        }
        if let Some(value) = get(ENV_PREFERRED_FLAGS) {
            self.preferred_flags =
                parse_var(ENV_PREFERRED_FLAGS, &value, BackendFlags::parse_list)?;
        }
        if let Some(value) = get(ENV_THREADS) {
            self.threads = parse_var(ENV_THREADS, &value, usize::from_str)?;
        }
        if let Some(value) = get(ENV_RESCALE_FREQUENCY) {
            self.rescale_frequency = parse_var(ENV_RESCALE_FREQUENCY, &value, usize::from_str)?;
        }
        self.check()?;
        debug!("Likelihood configuration: {:?}", self);
        Ok(self)
    }

    pub fn check(&self) -> Result<()> {
        if self.threads == 0 {
            bail!(EngineError::InvalidConfig(String::from(
                "thread count must be at least 1"
            )));
        }
        if self.rescale_frequency == 0 {
            bail!(EngineError::InvalidConfig(String::from(
                "rescale frequency must be at least 1"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use rstest::*;

    use super::{LikelihoodConfig, TipMode};
    use crate::backends::{BackendFlags, BackendKind};
    use crate::likelihood::rescaling::RescalingScheme;
    use crate::likelihood::EngineError;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = LikelihoodConfig::default();
        assert_eq!(config.rescaling, None);
        assert_eq!(config.tip_mode, TipMode::States);
        assert!(config.resource_order.is_empty());
        assert_eq!(config.threads, 1);
        assert_eq!(config.rescale_frequency, 10000);
        assert_eq!(
            LikelihoodConfig::default().apply_lookup(lookup(&[])).unwrap(),
            config
        );
    }

    #[test]
    fn overrides_from_lookup() {
        let config = LikelihoodConfig::default()
            .with_threads(2)
            .apply_lookup(lookup(&[
                ("TREELIK_SCALING", "always"),
                ("TREELIK_TIP_MODE", "partials"),
                ("TREELIK_RESOURCE_ORDER", "reference, gpu"),
                ("TREELIK_REQUIRED_FLAGS", "double|cpu"),
                ("TREELIK_PREFERRED_FLAGS", "auto"),
                ("TREELIK_RESCALE_FREQUENCY", "50"),
                ("TREELIK_THREADS", " "),
            ]))
            .unwrap();
        assert_eq!(config.rescaling, Some(RescalingScheme::Always));
        assert_eq!(config.tip_mode, TipMode::Partials);
        assert_eq!(
            config.resource_order,
            vec![BackendKind::Reference, BackendKind::Gpu]
        );
        assert_eq!(
            config.required_flags,
            BackendFlags::PRECISION_DOUBLE | BackendFlags::PROCESSOR_CPU
        );
        assert_eq!(config.preferred_flags, BackendFlags::SCALING_AUTO);
        assert_eq!(config.rescale_frequency, 50);
        assert_eq!(config.threads, 2);
    }

    #[rstest]
    #[case::scheme("TREELIK_SCALING", "sometimes")]
    #[case::threads("TREELIK_THREADS", "many")]
    #[case::zero_threads("TREELIK_THREADS", "0")]
    #[case::flag("TREELIK_REQUIRED_FLAGS", "quantum")]
    #[case::order("TREELIK_RESOURCE_ORDER", "fpga")]
    fn invalid_overrides(#[case] name: &str, #[case] value: &str) {
        let err = LikelihoodConfig::default()
            .apply_lookup(lookup(&[(name, value)]))
            .unwrap_err();
        assert_matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidConfig(_))
        );
    }

    #[test]
    fn builders() {
        let config = LikelihoodConfig::default()
            .with_rescaling(RescalingScheme::Dynamic)
            .with_tip_mode(TipMode::Partials)
            .with_resource_order(vec![BackendKind::Native])
            .with_required_flags(BackendFlags::THREADING)
            .with_preferred_flags(BackendFlags::SCALING_AUTO)
            .with_rescale_frequency(7);
        assert_eq!(config.rescaling, Some(RescalingScheme::Dynamic));
        assert_eq!(config.resource_order, vec![BackendKind::Native]);
        assert_eq!(config.rescale_frequency, 7);
        assert!(config.check().is_ok());
        assert!(config.with_threads(0).check().is_err());
    }
}
