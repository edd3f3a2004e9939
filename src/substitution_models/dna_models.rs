use std::fmt::Display;

use anyhow::bail;
use log::{info, warn};

use crate::evolutionary_models::ModelError;
use crate::substitution_models::SubstModel;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub enum DNAModelType {
    JC69,
    K80,
    HKY,
    GTR,
    UNDEF,
}

impl Display for DNAModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DNAModelType::JC69 => write!(f, "JC69"),
            DNAModelType::K80 => write!(f, "K80"),
            DNAModelType::HKY => write!(f, "HKY"),
            DNAModelType::GTR => write!(f, "GTR"),
            DNAModelType::UNDEF => write!(f, "Undefined"),
        }
    }
}

impl From<&str> for DNAModelType {
    fn from(model_name: &str) -> Self {
        match model_name.to_uppercase().as_str() {
            "JC69" => DNAModelType::JC69,
            "K80" => DNAModelType::K80,
            "HKY" => DNAModelType::HKY,
            "GTR" => DNAModelType::GTR,
            _ => DNAModelType::UNDEF,
        }
    }
}

const EQUAL_FREQS: [f64; 4] = [0.25; 4];

/// Builds a nucleotide model (states in A, C, G, T order) from its type,
/// frequencies and parameters. Empty frequencies mean equal frequencies.
pub fn dna_model(model_type: DNAModelType, freqs: &[f64], params: &[f64]) -> Result<SubstModel> {
    let freqs = if freqs.is_empty() { &EQUAL_FREQS } else { freqs };
    match model_type {
        DNAModelType::JC69 => {
            if !params.is_empty() {
                warn!("Too many values provided for JC69, the model has no parameters.");
            }
            jc69()
        }
        DNAModelType::K80 => k80(single_kappa("K80", params)),
        DNAModelType::HKY => hky(freqs, single_kappa("HKY", params)),
        DNAModelType::GTR => {
            if params.len() != 6 {
                bail!(ModelError::InvalidRates(format!(
                    "{} parameters for the GTR model, expected 6, got {}",
                    if params.len() < 6 {
                        "Not enough"
                    } else {
                        "Too many"
                    },
                    params.len()
                )));
            }
            gtr(freqs, params)
        }
        DNAModelType::UNDEF => bail!(ModelError::InvalidRates(String::from(
            "Unknown DNA model requested"
        ))),
    }
}

fn single_kappa(name: &str, params: &[f64]) -> f64 {
    match params.len() {
        0 => {
            warn!("Too few values provided for {}, required 1 value, kappa.", name);
            warn!("Falling back to default kappa = 2.0.");
            2.0
        }
        1 => params[0],
        _ => {
            warn!("Too many values provided for {}, required 1 value, kappa.", name);
            warn!("Will only use the first value provided.");
            params[0]
        }
    }
}

pub fn jc69() -> Result<SubstModel> {
    info!("Setting up JC69.");
    SubstModel::reversible("JC69", &[1.0; 6], &EQUAL_FREQS)
}

/// Exchangeabilities in AC, AG, AT, CG, CT, GT order.
fn transition_transversion(kappa: f64) -> [f64; 6] {
    [1.0, kappa, 1.0, 1.0, kappa, 1.0]
}

pub fn k80(kappa: f64) -> Result<SubstModel> {
    info!("Setting up K80 with kappa = {}.", kappa);
    SubstModel::reversible("K80", &transition_transversion(kappa), &EQUAL_FREQS)
}

pub fn hky(freqs: &[f64], kappa: f64) -> Result<SubstModel> {
    info!("Setting up HKY with kappa = {} and frequencies {:?}.", kappa, freqs);
    SubstModel::reversible("HKY", &transition_transversion(kappa), freqs)
}

/// GTR with exchangeabilities in AC, AG, AT, CG, CT, GT order.
pub fn gtr(freqs: &[f64], rates: &[f64]) -> Result<SubstModel> {
    info!("Setting up GTR with rates {:?} and frequencies {:?}.", rates, freqs);
    SubstModel::reversible("GTR", rates, freqs)
}
