//! Index arithmetic over the array representation of a left-balanced binary
//! tree.  A tree with `n` leaves occupies `2n - 1` array slots; leaves sit at
//! even indices, parents at odd ones.  The tree is not padded to a power of
//! two, so `right` and `parent` clamp back into the array for partial
//! subtrees.

use crate::common::{Error, Result};
use crate::io::{Read, Write};
use crate::syntax::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafIndex(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LeafCount(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeCount(pub u32);

impl Serialize for LeafIndex {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.0.serialize(writer)
    }
}

impl Deserialize for LeafIndex {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self(u32::deserialize(reader)?))
    }
}

impl From<LeafIndex> for NodeIndex {
    fn from(i: LeafIndex) -> Self {
        Self(2 * i.0)
    }
}

impl TryFrom<NodeIndex> for LeafIndex {
    type Error = Error;

    fn try_from(i: NodeIndex) -> Result<Self> {
        if !i.is_leaf() {
            return Err(Error::InvalidParameter("node index is not a leaf"));
        }
        Ok(Self(i.0 / 2))
    }
}

impl From<LeafCount> for NodeCount {
    fn from(n: LeafCount) -> Self {
        if n.0 == 0 {
            Self(0)
        } else {
            Self(2 * n.0 - 1)
        }
    }
}

impl From<NodeCount> for LeafCount {
    fn from(n: NodeCount) -> Self {
        if n.0 == 0 {
            Self(0)
        } else {
            Self(n.0 / 2 + 1)
        }
    }
}

impl LeafCount {
    pub fn root(&self) -> NodeIndex {
        NodeCount::from(*self).root()
    }

    /// The ancestors of `leaf`, leaf excluded, up to and including the root.
    /// Empty for a singleton tree.
    pub fn direct_path(&self, leaf: LeafIndex) -> Vec<NodeIndex> {
        let width = NodeCount::from(*self);
        let mut path = Vec::new();

        let mut curr = NodeIndex::from(leaf);
        while let Some(parent) = curr.parent(width) {
            path.push(parent);
            curr = parent;
        }

        path
    }

    /// The sibling of the leaf and of every direct-path node below the root.
    /// Pairs one-to-one with the direct path.
    pub fn copath(&self, leaf: LeafIndex) -> Vec<NodeIndex> {
        let width = NodeCount::from(*self);

        let mut nodes = vec![NodeIndex::from(leaf)];
        nodes.extend(self.direct_path(leaf));
        nodes.pop(); // the root has no sibling

        nodes
            .into_iter()
            .filter_map(|n| n.sibling(width))
            .collect()
    }
}

impl NodeCount {
    pub fn root(&self) -> NodeIndex {
        // The root is the only index at the maximum level
        NodeIndex((1 << self.0.ilog2()) - 1)
    }
}

impl NodeIndex {
    /// The level of a node in the tree: leaves are level 0, their parents
    /// level 1, and so on.
    pub fn level(&self) -> u32 {
        self.0.trailing_ones()
    }

    pub fn is_leaf(&self) -> bool {
        self.0 & 0x01 == 0
    }

    pub fn left(&self) -> Option<Self> {
        let k = self.level();
        (k != 0).then_some(Self(self.0 ^ (0b01 << (k - 1))))
    }

    pub fn right(&self, width: NodeCount) -> Option<Self> {
        let k = self.level();
        if k == 0 {
            return None;
        }

        // Clamp into the tree for partial right subtrees
        let mut r = Self(self.0 ^ (0b11 << (k - 1)));
        while r.0 >= width.0 {
            r = r.left().unwrap();
        }
        Some(r)
    }

    fn parent_step(&self) -> Self {
        let k = self.level();
        let b = (self.0 >> (k + 1)) & 0x01;
        Self((self.0 | (1 << k)) ^ (b << (k + 1)))
    }

    pub fn parent(&self, width: NodeCount) -> Option<Self> {
        if *self == width.root() {
            return None;
        }

        let mut p = self.parent_step();
        while p.0 >= width.0 {
            p = p.parent_step();
        }
        Some(p)
    }

    pub fn sibling(&self, width: NodeCount) -> Option<Self> {
        let p = self.parent(width)?;
        if self.0 < p.0 {
            p.right(width)
        } else {
            p.left()
        }
    }

    /// Whether this node is `leaf` itself or one of its ancestors.
    pub fn is_above_or_eq(&self, leaf: LeafIndex) -> bool {
        let leaf = NodeIndex::from(leaf);
        let k = self.level();
        (self.0 >> (k + 1)) == (leaf.0 >> (k + 1))
    }
}

impl LeafIndex {
    /// The lowest common ancestor of two distinct leaves.
    pub fn ancestor(&self, other: LeafIndex) -> NodeIndex {
        let mut ln = NodeIndex::from(*self).0;
        let mut rn = NodeIndex::from(other).0;
        if ln == rn {
            return NodeIndex(ln);
        }

        let mut k = 0;
        while ln != rn {
            ln >>= 1;
            rn >>= 1;
            k += 1;
        }

        NodeIndex((ln << k) + (1 << (k - 1)) - 1)
    }
}
