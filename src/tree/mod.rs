use std::fmt::Display;

use anyhow::bail;
use hashbrown::HashMap;

use crate::io::DataError;
use crate::Result;

mod tree_node;
pub mod tree_parser;

pub use tree_node::Node;
use NodeIdx::{Internal as Int, Leaf};

/// Index of a node in the tree arena. Both variants carry the global node
/// index: leaves occupy `0..leaf_count`, internal nodes the rest.
#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        match node_idx {
            Int(idx) => idx,
            Leaf(idx) => idx,
        }
    }
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        usize::from(*node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Int(idx) => write!(f, "Internal node {}", idx),
            Leaf(idx) => write!(f, "Leaf node {}", idx),
        }
    }
}

/// Rooted binary tree stored as an arena of nodes addressed by `NodeIdx`.
///
/// Nodes carry heights (time before present), branch lengths are derived as
/// the height difference to the parent. Leaves are numbered `0..n` in the
/// order they appear in the newick string, internal nodes follow in
/// postorder so the root is always the last node.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub(crate) root: NodeIdx,
    pub(crate) nodes: Vec<Node>,
    pub(crate) postorder: Vec<NodeIdx>,
    pub(crate) n: usize,
}

/// Intermediate node representation produced by the newick parser.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParsedNode {
    pub(crate) id: String,
    pub(crate) blen: f64,
    pub(crate) children: Vec<usize>,
}

impl Tree {
    /// Builds a tree from parsed nodes, `root` indexes into `parsed`.
    pub(crate) fn from_parsed(parsed: &[ParsedNode], root: usize) -> Result<Self> {
        // depth-first, children left to right
        let mut preorder = Vec::with_capacity(parsed.len());
        let mut depth = vec![0.0; parsed.len()];
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            preorder.push(idx);
            let node = &parsed[idx];
            if !node.children.is_empty() && node.children.len() != 2 {
                bail!(DataError {
                    message: format!(
                        "Only bifurcating trees are supported, node {} has {} children",
                        idx,
                        node.children.len()
                    )
                });
            }
            for &child in node.children.iter().rev() {
                depth[child] = depth[idx] + parsed[child].blen;
                stack.push(child);
            }
        }
        let leaves: Vec<usize> = preorder
            .iter()
            .copied()
            .filter(|&i| parsed[i].children.is_empty())
            .collect();
        let n = leaves.len();
        if n < 2 {
            bail!(DataError {
                message: String::from("A tree needs at least two leaves")
            });
        }
        let max_depth = leaves
            .iter()
            .map(|&i| depth[i])
            .fold(f64::NEG_INFINITY, f64::max);

        let mut new_idx = vec![Leaf(0); parsed.len()];
        let mut seen_ids = HashMap::with_capacity(n);
        for (i, &p) in leaves.iter().enumerate() {
            let id = &parsed[p].id;
            if id.is_empty() {
                bail!(DataError {
                    message: format!("Leaf {} has no label", i)
                });
            }
            if seen_ids.insert(id.clone(), i).is_some() {
                bail!(DataError {
                    message: format!("Duplicate leaf label {}", id)
                });
            }
            new_idx[p] = Leaf(i);
        }
        let mut next = n;
        for &p in preorder.iter().rev() {
            if !parsed[p].children.is_empty() {
                new_idx[p] = Int(next);
                next += 1;
            }
        }

        let mut nodes: Vec<Option<Node>> = vec![None; next];
        for &p in preorder.iter() {
            let height = max_depth - depth[p];
            let node = match new_idx[p] {
                Leaf(i) => Node::leaf(i, height, parsed[p].id.clone()),
                Int(i) => Node::internal(
                    i,
                    parsed[p].children.iter().map(|&c| new_idx[c]).collect(),
                    height,
                    parsed[p].id.clone(),
                ),
            };
            nodes[usize::from(new_idx[p])] = Some(node);
        }
        let mut nodes: Vec<Node> = nodes.into_iter().flatten().collect();
        for i in 0..nodes.len() {
            for c in nodes[i].children.clone() {
                nodes[usize::from(c)].parent = Some(nodes[i].idx);
            }
        }
        let mut tree = Tree {
            root: new_idx[root],
            nodes,
            postorder: Vec::new(),
            n,
        };
        tree.compute_postorder();
        Ok(tree)
    }

    pub fn from_newick(newick: &str) -> Result<Self> {
        match tree_parser::from_newick(newick)?.pop() {
            Some(tree) => Ok(tree),
            None => bail!(DataError {
                message: String::from("No tree found in newick string")
            }),
        }
    }

    pub(crate) fn compute_postorder(&mut self) {
        let mut order = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        let mut stack = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        stack.push(self.root);
        while let Some(cur) = stack.pop() {
            order.push(cur);
            if let Int(idx) = cur {
                for child in self.nodes[idx].children.iter() {
                    stack.push(*child);
                }
            }
        }
        order.reverse();
        self.postorder = order;
    }

    /// Returns a copy of the tree with leaves renumbered so that leaf `i`
    /// carries `ids[i]`. Fails if the label sets differ.
    pub fn with_leaf_order(&self, ids: &[String]) -> Result<Tree> {
        if ids.len() != self.n {
            bail!(DataError {
                message: format!(
                    "Expected {} leaf labels for reordering, got {}",
                    self.n,
                    ids.len()
                )
            });
        }
        let mut perm = vec![0; self.nodes.len()];
        for (new, id) in ids.iter().enumerate() {
            let old = self.idx(id)?;
            perm[usize::from(old)] = new;
        }
        for (i, p) in perm.iter_mut().enumerate().skip(self.n) {
            *p = i;
        }
        let remap = |idx: &NodeIdx| match idx {
            Leaf(i) => Leaf(perm[*i]),
            Int(i) => Int(*i),
        };
        let mut nodes = self.nodes.clone();
        for node in self.nodes.iter() {
            let new = &mut nodes[perm[usize::from(node.idx)]];
            new.idx = remap(&node.idx);
            new.parent = node.parent;
            new.children = node.children.iter().map(remap).collect();
            new.height = node.height;
            new.id.clone_from(&node.id);
        }
        let mut tree = Tree {
            root: self.root,
            nodes,
            postorder: Vec::new(),
            n: self.n,
        };
        tree.compute_postorder();
        Ok(tree)
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaf_count(&self) -> usize {
        self.n
    }

    pub fn internal_count(&self) -> usize {
        self.nodes.len() - self.n
    }

    pub fn leaves(&self) -> &[Node] {
        &self.nodes[..self.n]
    }

    pub fn internals(&self) -> &[Node] {
        &self.nodes[self.n..]
    }

    pub fn postorder(&self) -> &[NodeIdx] {
        &self.postorder
    }

    /// Converts a global node index into a `NodeIdx`.
    pub fn by_index(&self, idx: usize) -> Option<NodeIdx> {
        if idx < self.n {
            Some(Leaf(idx))
        } else if idx < self.nodes.len() {
            Some(Int(idx))
        } else {
            None
        }
    }

    pub fn node(&self, idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub fn parent(&self, idx: &NodeIdx) -> Option<&NodeIdx> {
        self.nodes[usize::from(idx)].parent.as_ref()
    }

    pub fn children(&self, idx: &NodeIdx) -> &[NodeIdx] {
        &self.nodes[usize::from(idx)].children
    }

    pub fn is_leaf(&self, idx: &NodeIdx) -> bool {
        matches!(idx, Leaf(_))
    }

    pub fn height(&self, idx: &NodeIdx) -> f64 {
        self.nodes[usize::from(idx)].height
    }

    /// Sets the height of a node. No ordering against the parent or the
    /// children is enforced here, inconsistent heights surface as negative
    /// branch lengths during likelihood evaluation.
    pub fn set_height(&mut self, idx: &NodeIdx, height: f64) {
        self.nodes[usize::from(idx)].height = height;
    }

    /// Length of the branch above the node, zero for the root.
    pub fn blen(&self, idx: &NodeIdx) -> f64 {
        match self.parent(idx) {
            Some(parent) => self.height(parent) - self.height(idx),
            None => 0.0,
        }
    }

    pub fn node_id(&self, idx: &NodeIdx) -> &str {
        &self.nodes[usize::from(idx)].id
    }

    pub fn leaf_ids(&self) -> Vec<String> {
        self.leaves().iter().map(|node| node.id.clone()).collect()
    }

    pub fn idx(&self, id: &str) -> Result<NodeIdx> {
        match self.leaves().iter().find(|node| node.id == id) {
            Some(node) => Ok(node.idx),
            None => bail!(DataError {
                message: format!("No leaf with id {} in the tree", id)
            }),
        }
    }

    pub fn to_newick(&self) -> String {
        format!("{};", self.subtree_to_newick(&self.root))
    }

    fn subtree_to_newick(&self, idx: &NodeIdx) -> String {
        let node = self.node(idx);
        let blen = if self.parent(idx).is_some() {
            format!(":{}", self.blen(idx))
        } else {
            String::new()
        };
        match idx {
            Leaf(_) => format!("{}{}", node.id, blen),
            Int(_) => format!(
                "({},{}){}{}",
                self.subtree_to_newick(&node.children[0]),
                self.subtree_to_newick(&node.children[1]),
                node.id,
                blen
            ),
        }
    }
}
