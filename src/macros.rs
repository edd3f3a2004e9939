/// Fasta record without a description.
#[macro_export]
macro_rules! record {
    ($id:expr, $seq:expr) => {{
        use bio::io::fasta::Record;
        Record::with_attrs($id, None, $seq)
    }};
}

/// Parses a newick string holding a single tree, panics on malformed input.
#[macro_export]
macro_rules! tree {
    ($newick:expr) => {{
        use $crate::tree::Tree;
        Tree::from_newick($newick).unwrap()
    }};
}

#[macro_export]
macro_rules! frequencies {
    ($slice:expr) => {{
        use $crate::substitution_models::FreqVector;
        FreqVector::from_column_slice($slice)
    }};
}

/// Site patterns of `id => sequence` pairs over an alphabet, panics on
/// invalid data.
#[macro_export]
macro_rules! patterns {
    ($alphabet:expr; $($id:expr => $seq:expr),+ $(,)?) => {{
        use $crate::alignment::Patterns;
        Patterns::new(&[$($crate::record!($id, $seq)),+], $alphabet).unwrap()
    }};
}
