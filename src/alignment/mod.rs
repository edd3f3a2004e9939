use anyhow::bail;
use bio::io::fasta::Record;
use hashbrown::HashMap;
use log::{info, warn};

use crate::alphabets::Alphabet;
use crate::io::DataError;
use crate::Result;

/// Alignment compressed into unique site patterns.
///
/// Columns that are identical across all taxa are stored once and carry a
/// weight equal to the number of sites they stand for. Patterns keep the
/// order of their first occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Patterns {
    alphabet: Alphabet,
    taxa: Vec<String>,
    patterns: Vec<Vec<u8>>,
    weights: Vec<f64>,
    site_to_pattern: Vec<usize>,
}

impl Patterns {
    pub fn new(records: &[Record], alphabet: Alphabet) -> Result<Self> {
        if records.is_empty() {
            bail!(DataError {
                message: String::from("Alignment has no sequences")
            });
        }
        let site_count = records[0].seq().len();
        let mut index = HashMap::with_capacity(records.len());
        for (i, rec) in records.iter().enumerate() {
            if index.insert(rec.id(), i).is_some() {
                bail!(DataError {
                    message: format!("Duplicate sequence id {}", rec.id())
                });
            }
            if rec.seq().len() != site_count {
                bail!(DataError {
                    message: format!(
                        "Sequence {} has length {}, expected {}",
                        rec.id(),
                        rec.seq().len(),
                        site_count
                    )
                });
            }
            if let Some(pos) = rec.seq().iter().position(|&c| !alphabet.is_word(&[c])) {
                bail!(DataError {
                    message: format!(
                        "Sequence {} has unknown character '{}' at site {}",
                        rec.id(),
                        rec.seq()[pos] as char,
                        pos
                    )
                });
            }
        }
        if site_count == 0 {
            bail!(DataError {
                message: String::from("Alignment has no sites")
            });
        }

        let mut lookup = HashMap::<Vec<u8>, usize>::new();
        let mut patterns = Vec::new();
        let mut weights = Vec::new();
        let mut site_to_pattern = Vec::with_capacity(site_count);
        for site in 0..site_count {
            let column: Vec<u8> = records
                .iter()
                .map(|rec| rec.seq()[site].to_ascii_uppercase())
                .collect();
            let p = *lookup.entry(column).or_insert_with_key(|column| {
                patterns.push(column.clone());
                weights.push(0.0);
                patterns.len() - 1
            });
            weights[p] += 1.0;
            site_to_pattern.push(p);
        }
        info!(
            "Compressed {} sites of {} taxa into {} patterns.",
            site_count,
            records.len(),
            patterns.len()
        );
        Ok(Patterns {
            alphabet,
            taxa: records.iter().map(|rec| rec.id().to_string()).collect(),
            patterns,
            weights,
            site_to_pattern,
        })
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn state_count(&self) -> usize {
        self.alphabet.n()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn site_count(&self) -> usize {
        self.site_to_pattern.len()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn site_to_pattern(&self) -> &[usize] {
        &self.site_to_pattern
    }

    /// Characters of a pattern, one per taxon.
    pub fn pattern(&self, p: usize) -> &[u8] {
        &self.patterns[p]
    }

    pub fn taxon_index(&self, id: &str) -> Result<usize> {
        match self.taxa.iter().position(|t| t == id) {
            Some(idx) => Ok(idx),
            None => bail!(DataError {
                message: format!("Taxon {} is not in the alignment", id)
            }),
        }
    }

    /// Whether any pattern resolves the taxon to a proper subset of states
    /// with more than one member.
    pub fn has_partial_ambiguity(&self, taxon: usize) -> bool {
        self.patterns
            .iter()
            .any(|column| matches!(self.alphabet.state_code(column[taxon]), Ok(None)))
    }

    /// State codes of a taxon, one per pattern. Gaps and missing data map to
    /// `state_count()`, partial ambiguities are collapsed to missing data.
    pub fn tip_states(&self, taxon: usize) -> Result<Vec<usize>> {
        let n = self.state_count();
        let mut collapsed = 0;
        let states = self
            .patterns
            .iter()
            .map(|column| {
                Ok(match self.alphabet.state_code(column[taxon])? {
                    Some(code) => code,
                    None => {
                        collapsed += 1;
                        n
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if collapsed > 0 {
            warn!(
                "Treating {} ambiguous pattern(s) of taxon {} as missing data.",
                collapsed, self.taxa[taxon]
            );
        }
        Ok(states)
    }

    /// Indicator partials of a taxon, `pattern_count() × state_count()`
    /// values, pattern major.
    pub fn tip_partials(&self, taxon: usize) -> Result<Vec<f64>> {
        let mut partials = Vec::with_capacity(self.pattern_count() * self.state_count());
        for column in self.patterns.iter() {
            partials.extend(self.alphabet.char_encoding(column[taxon])?);
        }
        Ok(partials)
    }
}
