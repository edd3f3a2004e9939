use std::fmt;

use anyhow::bail;
use fixedbitset::FixedBitSet;
use lazy_static::lazy_static;

use crate::io::DataError;
use crate::Result;

pub static NUCLEOTIDES: &[u8] = b"ACGT";
pub static BINARY: &[u8] = b"01";
pub static GAP: u8 = b'-';
pub static MISSING: u8 = b'?';

static DNA_AMBIGUITIES: &[(u8, &[u8])] = &[
    (b'R', b"AG"),
    (b'Y', b"CT"),
    (b'S', b"CG"),
    (b'W', b"AT"),
    (b'K', b"GT"),
    (b'M', b"AC"),
    (b'B', b"CGT"),
    (b'D', b"AGT"),
    (b'H', b"ACT"),
    (b'V', b"ACG"),
    (b'N', b"ACGT"),
    (b'X', b"ACGT"),
    (b'U', b"T"),
];

lazy_static! {
    static ref DNA: Alphabet = {
        let mut alphabet = Alphabet::from_symbols(NUCLEOTIDES);
        for (code, states) in DNA_AMBIGUITIES {
            alphabet.insert_set(*code, states);
        }
        alphabet
    };
    static ref BINARY_TRAITS: Alphabet = Alphabet::from_symbols(BINARY);
}

/// Maps sequence characters onto the states of a discrete character model.
///
/// Every character is resolved to a set of compatible states. Plain symbols
/// resolve to a single state, ambiguity codes to several, gaps and missing
/// data to all of them. Lookups are case insensitive.
#[derive(Clone, PartialEq)]
pub struct Alphabet {
    symbols: Vec<u8>,
    char_sets: Vec<Option<FixedBitSet>>,
}

impl fmt::Debug for Alphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alphabet({})",
            String::from_utf8_lossy(&self.symbols).into_owned()
        )
    }
}

impl Alphabet {
    fn from_symbols(symbols: &[u8]) -> Self {
        let mut alphabet = Alphabet {
            symbols: symbols.to_ascii_uppercase(),
            char_sets: vec![None; 256],
        };
        for (i, &c) in alphabet.symbols.clone().iter().enumerate() {
            let mut set = FixedBitSet::with_capacity(symbols.len());
            set.insert(i);
            alphabet.set_char(c, set);
        }
        let mut all = FixedBitSet::with_capacity(symbols.len());
        all.insert_range(..);
        alphabet.set_char(GAP, all.clone());
        alphabet.set_char(MISSING, all);
        alphabet
    }

    fn set_char(&mut self, c: u8, set: FixedBitSet) {
        self.char_sets[c.to_ascii_uppercase() as usize] = Some(set.clone());
        self.char_sets[c.to_ascii_lowercase() as usize] = Some(set);
    }

    fn insert_set(&mut self, code: u8, states: &[u8]) {
        let mut set = FixedBitSet::with_capacity(self.n());
        for s in states {
            if let Some(idx) = self.symbols.iter().position(|c| c == s) {
                set.insert(idx);
            }
        }
        self.set_char(code, set);
    }

    /// Creates an alphabet over the given symbols. Gaps (`-`) and missing data
    /// (`?`) are always understood and map onto every state.
    pub fn new(symbols: &[u8]) -> Result<Self> {
        if symbols.len() < 2 {
            bail!(DataError {
                message: format!(
                    "An alphabet needs at least two states, got {}",
                    symbols.len()
                )
            });
        }
        let upper = symbols.to_ascii_uppercase();
        for (i, c) in upper.iter().enumerate() {
            if *c == GAP || *c == MISSING || upper[..i].contains(c) {
                bail!(DataError {
                    message: format!("Invalid or repeated alphabet symbol '{}'", *c as char)
                });
            }
        }
        Ok(Self::from_symbols(symbols))
    }

    /// Adds an ambiguity code that stands for the given set of symbols.
    pub fn with_ambiguity(mut self, code: u8, states: &[u8]) -> Result<Self> {
        if self.symbols.contains(&code.to_ascii_uppercase()) {
            bail!(DataError {
                message: format!("Ambiguity code '{}' is already a state", code as char)
            });
        }
        let upper = states.to_ascii_uppercase();
        if let Some(c) = upper.iter().find(|c| !self.symbols.contains(c)) {
            bail!(DataError {
                message: format!(
                    "Ambiguity code '{}' refers to unknown state '{}'",
                    code as char, *c as char
                )
            });
        }
        self.insert_set(code, &upper);
        Ok(self)
    }

    /// Number of states.
    pub fn n(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &[u8] {
        &self.symbols
    }

    pub fn is_word(&self, word: &[u8]) -> bool {
        word.iter().all(|&c| self.char_sets[c as usize].is_some())
    }

    /// Returns the set of states compatible with the character.
    pub fn state_set(&self, c: u8) -> Result<&FixedBitSet> {
        match &self.char_sets[c as usize] {
            Some(set) => Ok(set),
            None => bail!(DataError {
                message: format!("Unknown character '{}' for alphabet {:?}", c as char, self)
            }),
        }
    }

    /// Returns the state index of an unambiguous character, `n()` for gaps
    /// and missing data, and `None` for partial ambiguities.
    pub fn state_code(&self, c: u8) -> Result<Option<usize>> {
        let set = self.state_set(c)?;
        Ok(match set.count_ones(..) {
            1 => set.ones().next(),
            count if count == self.n() => Some(self.n()),
            _ => None,
        })
    }

    /// Indicator vector of the states compatible with the character.
    pub fn char_encoding(&self, c: u8) -> Result<Vec<f64>> {
        let set = self.state_set(c)?;
        Ok((0..self.n())
            .map(|i| if set.contains(i) { 1.0 } else { 0.0 })
            .collect())
    }
}

/// Nucleotide alphabet (A, C, G, T) with the IUPAC ambiguity codes.
pub fn dna_alphabet() -> Alphabet {
    DNA.clone()
}

/// Two-state alphabet for presence/absence or other binary characters.
pub fn binary_alphabet() -> Alphabet {
    BINARY_TRAITS.clone()
}
