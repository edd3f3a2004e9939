use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::bail;
use bio::io::fasta::{Reader, Record};
use log::{debug, info};

use crate::alignment::Patterns;
use crate::alphabets::Alphabet;
use crate::tree::{tree_parser, Tree};
use crate::Result;

/// Malformed or inconsistent input data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataError {
    pub message: String,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for DataError {}

/// Reads all records of a fasta file. Sequences are upper-cased, their
/// characters are only validated when they are compressed into patterns.
pub fn read_sequences(path: &Path) -> Result<Vec<Record>> {
    info!("Reading sequences from {}.", path.display());
    let mut records = Vec::new();
    for record in Reader::from_file(path)?.records() {
        let record = record?;
        if let Err(e) = record.check() {
            bail!(DataError {
                message: format!("Record {}: {}", record.id(), e)
            });
        }
        records.push(Record::with_attrs(
            record.id(),
            record.desc(),
            &record.seq().to_ascii_uppercase(),
        ));
    }
    if records.is_empty() {
        bail!(DataError {
            message: format!("No sequences in {}", path.display())
        });
    }
    debug!("Read {} sequences.", records.len());
    Ok(records)
}

/// Reads a fasta alignment and compresses it into site patterns.
pub fn read_patterns(path: &Path, alphabet: Alphabet) -> Result<Patterns> {
    let patterns = Patterns::new(&read_sequences(path)?, alphabet)?;
    info!(
        "Alignment has {} taxa, {} sites and {} unique patterns.",
        patterns.taxon_count(),
        patterns.site_count(),
        patterns.pattern_count()
    );
    Ok(patterns)
}

/// Reads every newick tree in a file. Unrooted trees are rooted at their
/// trifurcation with a zero length branch.
pub fn read_newick_from_file(path: &Path) -> Result<Vec<Tree>> {
    info!("Reading newick trees from {}.", path.display());
    tree_parser::from_newick(&fs::read_to_string(path)?)
}

/// Reads the first tree of a newick file.
pub fn read_tree(path: &Path) -> Result<Tree> {
    match read_newick_from_file(path)?.into_iter().next() {
        Some(tree) => Ok(tree),
        None => bail!(DataError {
            message: format!("No tree in {}", path.display())
        }),
    }
}
