use std::fmt;

use approx::relative_eq;

use crate::tree::NodeIdx::{self, Internal as Int, Leaf};

/// Arena entry of a tree. Heights are measured back from the present, so a
/// node is never younger than its children in a consistent tree.
#[derive(Clone, Debug)]
pub struct Node {
    pub idx: NodeIdx,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
    pub height: f64,
    pub id: String,
}

impl Node {
    pub(crate) fn leaf(idx: usize, height: f64, id: String) -> Self {
        Node {
            idx: Leaf(idx),
            parent: None,
            children: Vec::new(),
            height,
            id,
        }
    }

    pub(crate) fn internal(idx: usize, children: Vec<NodeIdx>, height: f64, id: String) -> Self {
        Node {
            idx: Int(idx),
            parent: None,
            children,
            height,
            id,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.idx, Leaf(_))
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at height {}", self.idx, self.height)?;
        if !self.id.is_empty() {
            write!(f, " ({})", self.id)?;
        }
        Ok(())
    }
}

// child order does not matter, heights are compared with a tolerance
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        let mut children = self.children.clone();
        let mut other_children = other.children.clone();
        children.sort();
        other_children.sort();
        self.idx == other.idx
            && self.parent == other.parent
            && children == other_children
            && self.id == other.id
            && relative_eq!(self.height, other.height)
    }
}
