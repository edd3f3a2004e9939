use std::fmt;

use anyhow::bail;
use log::{info, warn};
use pest::{error::Error as PestError, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{ParsedNode, Tree};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub struct ParsingError(pub(crate) Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParsingError {}

/// Parses all trees in a newick string.
pub fn from_newick(newick_string: &str) -> Result<Vec<Tree>> {
    info!("Parsing newick trees.");
    let newick_rule = match NewickParser::parse(Rule::newick, newick_string) {
        Ok(mut pairs) => match pairs.next() {
            Some(rule) => rule,
            None => bail!("Empty newick parse result"),
        },
        Err(e) => bail!(ParsingError(Box::new(e))),
    };
    let mut trees = Vec::new();
    for tree_rule in newick_rule.into_inner() {
        if tree_rule.as_rule() != Rule::tree {
            continue;
        }
        let Some(rule) = tree_rule.into_inner().next() else {
            continue;
        };
        let mut parsed = Vec::new();
        let root = match rule.as_rule() {
            Rule::rooted => {
                let Some(inner) = rule.into_inner().next() else {
                    unreachable!()
                };
                parse_node_rule(inner, &mut parsed)
            }
            Rule::unrooted => parse_unrooted_rule(rule, &mut parsed),
            _ => unreachable!(),
        };
        trees.push(Tree::from_parsed(&parsed, root)?);
    }
    info!("Finished parsing {} newick tree(s) successfully.", trees.len());
    Ok(trees)
}

fn parse_unrooted_rule(tree_rule: Pair<Rule>, parsed: &mut Vec<ParsedNode>) -> usize {
    warn!("Found unrooted tree, will root at the trifurcation.");
    let mut children = Vec::with_capacity(3);
    for rule in tree_rule.into_inner() {
        match rule.as_rule() {
            Rule::leaf | Rule::internal => children.push(parse_node_rule(rule, parsed)),
            _ => {}
        }
    }
    parsed.push(ParsedNode {
        children: children[0..2].to_vec(),
        ..Default::default()
    });
    let joined = parsed.len() - 1;
    parsed.push(ParsedNode {
        children: vec![joined, children[2]],
        ..Default::default()
    });
    parsed.len() - 1
}

fn parse_node_rule(node_rule: Pair<Rule>, parsed: &mut Vec<ParsedNode>) -> usize {
    let mut node = ParsedNode::default();
    for rule in node_rule.into_inner() {
        match rule.as_rule() {
            Rule::label => node.id = parse_label_rule(rule),
            Rule::branch_length => node.blen = parse_branch_length_rule(rule),
            Rule::internal | Rule::leaf => node.children.push(parse_node_rule(rule, parsed)),
            _ => unreachable!(),
        }
    }
    parsed.push(node);
    parsed.len() - 1
}

fn parse_branch_length_rule(rule: Pair<Rule>) -> f64 {
    rule.into_inner()
        .next()
        .map(|float| float.as_str().trim().parse::<f64>().unwrap_or_default())
        .unwrap_or_default()
}

fn parse_label_rule(rule: Pair<Rule>) -> String {
    rule.as_str().trim_matches('\'').to_string()
}
