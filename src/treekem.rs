//! TreeKEM: the shared ratchet tree of member KeyPackages and parent nodes,
//! plus each member's private view of the path secrets along its direct
//! path.  Any member can inject fresh entropy along its direct path with
//! [`TreeKemPublicKey::update_direct_path`]; every other member recovers the
//! same root secret from the resulting update path via
//! [`TreeKemPrivateKey::decap`].

use crate::common::{Error, Result};
use crate::crypto::{CipherSuite, HpkePrivateKey, HpkePublicKey, Secret, SignaturePrivateKey};
use crate::io::{Read, Write};
use crate::protocol::{KeyPackage, UpdatePath, UpdatePathNode};
use crate::syntax::{
    deserialize_opaque, deserialize_vector, serialize_opaque, serialize_vector, Deserialize,
    Serialize,
};
use crate::tree_math::{LeafCount, LeafIndex, NodeCount, NodeIndex};

use std::collections::BTreeMap;

use rand_core::CryptoRngCore;

/// One step of the path-secret chain.
fn path_step(suite: CipherSuite, secret: &Secret) -> Result<Secret> {
    suite.hkdf_expand(secret.as_ref(), b"path", suite.hash_size())
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ParentNode {
    pub public_key: HpkePublicKey,
    pub parent_hash: Vec<u8>,
    /// Members added below this node since it was last refreshed.  They hold
    /// no secret for it, so they are addressed individually during encap.
    pub unmerged_leaves: Vec<LeafIndex>,
}

impl Serialize for ParentNode {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<2>(&self.public_key.0, writer)?;
        serialize_opaque::<1>(&self.parent_hash, writer)?;
        serialize_vector::<4, _>(&self.unmerged_leaves, writer)
    }
}

impl Deserialize for ParentNode {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            public_key: HpkePublicKey(deserialize_opaque::<2>(reader)?),
            parent_hash: deserialize_opaque::<1>(reader)?,
            unmerged_leaves: deserialize_vector::<4, _>(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Node {
    Leaf(KeyPackage),
    Parent(ParentNode),
}

impl Node {
    pub fn public_key(&self) -> &HpkePublicKey {
        match self {
            Self::Leaf(kp) => &kp.init_key,
            Self::Parent(node) => &node.public_key,
        }
    }

    fn parent_hash(&self) -> Option<&[u8]> {
        match self {
            Self::Leaf(kp) => kp.parent_hash(),
            Self::Parent(node) => Some(&node.parent_hash),
        }
    }
}

impl Serialize for Node {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        match self {
            Self::Leaf(kp) => {
                1_u8.serialize(writer)?;
                kp.serialize(writer)
            }
            Self::Parent(node) => {
                2_u8.serialize(writer)?;
                node.serialize(writer)
            }
        }
    }
}

impl Deserialize for Node {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        match u8::deserialize(reader)? {
            1 => Ok(Self::Leaf(KeyPackage::deserialize(reader)?)),
            2 => Ok(Self::Parent(ParentNode::deserialize(reader)?)),
            _ => Err(Error::Protocol("unknown node type")),
        }
    }
}

/// A tree slot: blank or occupied, with a cached subtree hash.
#[derive(Clone, Debug, Default)]
pub struct OptionalNode {
    pub node: Option<Node>,
    hash: Option<Vec<u8>>,
}

impl OptionalNode {
    fn blank(&self) -> bool {
        self.node.is_none()
    }
}

// The hash cache is derived state; two trees are equal when their nodes are.
impl PartialEq for OptionalNode {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for OptionalNode {}

#[derive(Clone, PartialEq, Debug)]
pub struct TreeKemPublicKey {
    pub suite: CipherSuite,
    nodes: Vec<OptionalNode>,
}

impl TreeKemPublicKey {
    pub fn new(suite: CipherSuite) -> Self {
        Self {
            suite,
            nodes: Vec::new(),
        }
    }

    pub fn size(&self) -> LeafCount {
        LeafCount::from(NodeCount(self.nodes.len() as u32))
    }

    fn width(&self) -> NodeCount {
        NodeCount(self.nodes.len() as u32)
    }

    fn node_at(&self, n: NodeIndex) -> &OptionalNode {
        &self.nodes[n.0 as usize]
    }

    fn node_at_mut(&mut self, n: NodeIndex) -> &mut OptionalNode {
        &mut self.nodes[n.0 as usize]
    }

    pub fn key_package(&self, leaf: LeafIndex) -> Option<&KeyPackage> {
        if leaf.0 >= self.size().0 {
            return None;
        }

        match &self.node_at(NodeIndex::from(leaf)).node {
            Some(Node::Leaf(kp)) => Some(kp),
            _ => None,
        }
    }

    pub fn find(&self, target: &KeyPackage) -> Option<LeafIndex> {
        (0..self.size().0)
            .map(LeafIndex)
            .find(|&leaf| self.key_package(leaf) == Some(target))
    }

    pub fn occupied_leaves(&self) -> Vec<LeafIndex> {
        (0..self.size().0)
            .map(LeafIndex)
            .filter(|&leaf| self.key_package(leaf).is_some())
            .collect()
    }

    /// Fill the first blank leaf slot, or grow the tree by one leaf.  Parent
    /// nodes along the new member's direct path record it as unmerged.
    pub fn add_leaf(&mut self, key_package: KeyPackage) -> Result<LeafIndex> {
        if key_package.cipher_suite != self.suite {
            return Err(Error::InvalidParameter("key package cipher suite mismatch"));
        }

        let blank = (0..self.size().0)
            .map(LeafIndex)
            .find(|&leaf| self.node_at(NodeIndex::from(leaf)).blank());

        let joiner_leaf = match blank {
            Some(leaf) => leaf,
            None => {
                // Extend the array by a parent slot and a leaf slot
                if !self.nodes.is_empty() {
                    self.nodes.push(OptionalNode::default());
                }
                self.nodes.push(OptionalNode::default());
                LeafIndex(self.size().0 - 1)
            }
        };

        self.node_at_mut(NodeIndex::from(joiner_leaf)).node = Some(Node::Leaf(key_package));

        for parent in self.size().direct_path(joiner_leaf) {
            if let Some(Node::Parent(node)) = &mut self.node_at_mut(parent).node {
                node.unmerged_leaves.push(joiner_leaf);
            }
        }

        self.clear_hash_path(joiner_leaf);
        Ok(joiner_leaf)
    }

    /// Replace the KeyPackage at a leaf and blank the parents along its
    /// direct path; the old path secrets no longer cover the new leaf.
    pub fn update_leaf(&mut self, leaf: LeafIndex, key_package: KeyPackage) -> Result<()> {
        if self.key_package(leaf).is_none() {
            return Err(Error::InvalidParameter("leaf index out of range"));
        }

        self.node_at_mut(NodeIndex::from(leaf)).node = Some(Node::Leaf(key_package));
        for parent in self.size().direct_path(leaf) {
            self.node_at_mut(parent).node = None;
        }

        self.clear_hash_path(leaf);
        Ok(())
    }

    pub fn blank_path(&mut self, leaf: LeafIndex) -> Result<()> {
        if leaf.0 >= self.size().0 {
            return Err(Error::InvalidParameter("leaf index out of range"));
        }

        self.node_at_mut(NodeIndex::from(leaf)).node = None;
        for parent in self.size().direct_path(leaf) {
            self.node_at_mut(parent).node = None;
        }

        self.clear_hash_path(leaf);
        Ok(())
    }

    /// Drop trailing blank leaves so the highest leaf is non-blank.
    pub fn truncate(&mut self) {
        while self.size().0 > 1
            && self
                .node_at(NodeIndex::from(LeafIndex(self.size().0 - 1)))
                .blank()
        {
            self.nodes.truncate(self.nodes.len() - 2);
        }

        self.clear_hash_all();
    }

    /// The minimal set of non-blank nodes covering the subtree at `n`.
    pub fn resolve(&self, n: NodeIndex) -> Vec<NodeIndex> {
        match &self.node_at(n).node {
            Some(Node::Leaf(_)) => vec![n],
            Some(Node::Parent(node)) => {
                let mut res = vec![n];
                res.extend(node.unmerged_leaves.iter().map(|&leaf| NodeIndex::from(leaf)));
                res
            }
            None if n.is_leaf() => Vec::new(),
            None => {
                let mut res = self.resolve(n.left().unwrap());
                res.extend(self.resolve(n.right(self.width()).unwrap()));
                res
            }
        }
    }

    ///
    /// Tree hash
    ///

    pub fn root_hash(&mut self) -> Result<Vec<u8>> {
        let root = self.width().root();
        self.get_hash(root)
    }

    pub fn set_hash_all(&mut self) -> Result<()> {
        self.root_hash().map(|_| ())
    }

    fn get_hash(&mut self, n: NodeIndex) -> Result<Vec<u8>> {
        if let Some(hash) = &self.node_at(n).hash {
            return Ok(hash.clone());
        }

        let hash = if n.is_leaf() {
            self.leaf_hash_input(LeafIndex::try_from(n)?, &[])?
        } else {
            let left = self.get_hash(n.left().unwrap())?;
            let right = self.get_hash(n.right(self.width()).unwrap())?;
            self.parent_hash_input_at(n, &left, &right, &[])?
        };

        self.node_at_mut(n).hash = Some(hash.clone());
        Ok(hash)
    }

    // struct {
    //     uint32 leaf_index;
    //     optional<KeyPackage> key_package;
    // } LeafNodeHashInput;
    fn leaf_hash_input(&self, leaf: LeafIndex, except: &[LeafIndex]) -> Result<Vec<u8>> {
        let key_package = if except.contains(&leaf) {
            None
        } else {
            self.key_package(leaf)
        };

        let mut input = Vec::new();
        leaf.serialize(&mut input)?;
        key_package.serialize(&mut input)?;
        Ok(self.suite.digest(&input))
    }

    // struct {
    //     optional<ParentNode> parent_node;
    //     opaque left_hash<0..255>;
    //     opaque right_hash<0..255>;
    // } ParentNodeHashInput;
    fn parent_hash_input_at(
        &self,
        n: NodeIndex,
        left_hash: &[u8],
        right_hash: &[u8],
        except: &[LeafIndex],
    ) -> Result<Vec<u8>> {
        let parent_node = match &self.node_at(n).node {
            Some(Node::Parent(node)) => {
                let mut node = node.clone();
                node.unmerged_leaves.retain(|leaf| !except.contains(leaf));
                Some(node)
            }
            Some(Node::Leaf(_)) => return Err(Error::InvalidParameter("leaf at parent index")),
            None => None,
        };

        let mut input = Vec::new();
        parent_node.serialize(&mut input)?;
        serialize_opaque::<1>(left_hash, &mut input)?;
        serialize_opaque::<1>(right_hash, &mut input)?;
        Ok(self.suite.digest(&input))
    }

    /// Subtree hash with a set of leaves treated as blank and removed from
    /// unmerged-leaves lists.  This reconstructs the "original" subtree hash
    /// a parent hash was computed over, before later adds were recorded.
    fn hash_excluding(&self, n: NodeIndex, except: &[LeafIndex]) -> Result<Vec<u8>> {
        if n.is_leaf() {
            return self.leaf_hash_input(LeafIndex::try_from(n)?, except);
        }

        let left = self.hash_excluding(n.left().unwrap(), except)?;
        let right = self.hash_excluding(n.right(self.width()).unwrap(), except)?;
        self.parent_hash_input_at(n, &left, &right, except)
    }

    fn clear_hash_all(&mut self) {
        for node in &mut self.nodes {
            node.hash = None;
        }
    }

    fn clear_hash_path(&mut self, leaf: LeafIndex) {
        self.node_at_mut(NodeIndex::from(leaf)).hash = None;
        for parent in self.size().direct_path(leaf) {
            self.node_at_mut(parent).hash = None;
        }
    }

    ///
    /// Parent hashes
    ///

    // struct {
    //     HPKEPublicKey public_key;
    //     opaque original_sibling_tree_hash<0..255>;
    // } ParentHashInput;
    fn parent_hash_binding(
        &self,
        public_key: &HpkePublicKey,
        sibling_hash: &[u8],
    ) -> Result<Vec<u8>> {
        let mut input = Vec::new();
        serialize_opaque::<2>(&public_key.0, &mut input)?;
        serialize_opaque::<1>(sibling_hash, &mut input)?;
        Ok(self.suite.digest(&input))
    }

    fn parent_hash_at(&self, n: NodeIndex) -> Option<Vec<u8>> {
        self.node_at(n)
            .node
            .as_ref()
            .and_then(|node| node.parent_hash().map(<[u8]>::to_vec))
    }

    /// Install new public keys along the direct path of `from`, resetting
    /// unmerged leaves and recomputing the parent-hash chain top-down.
    /// Returns the parent hash the leaf must carry.
    fn merge_path_keys(
        &mut self,
        from: LeafIndex,
        public_keys: &[HpkePublicKey],
    ) -> Result<Vec<u8>> {
        let dirpath = self.size().direct_path(from);
        let copath = self.size().copath(from);
        if public_keys.len() != dirpath.len() {
            return Err(Error::Protocol("update path length mismatch"));
        }

        // The parent hash of the root is the empty byte string
        let mut parent_hash = Vec::new();
        for i in (0..dirpath.len()).rev() {
            self.node_at_mut(dirpath[i]).node = Some(Node::Parent(ParentNode {
                public_key: public_keys[i].clone(),
                parent_hash: parent_hash.clone(),
                unmerged_leaves: Vec::new(),
            }));

            let sibling_hash = self.hash_excluding(copath[i], &[])?;
            parent_hash = self.parent_hash_binding(&public_keys[i], &sibling_hash)?;
        }

        Ok(parent_hash)
    }

    /// Merge a peer's update path into the public tree.  The leaf KeyPackage
    /// must carry the parent hash recomputed here.
    pub fn merge(&mut self, from: LeafIndex, path: &UpdatePath) -> Result<()> {
        let public_keys: Vec<HpkePublicKey> =
            path.nodes.iter().map(|n| n.public_key.clone()).collect();
        let leaf_parent_hash = self.merge_path_keys(from, &public_keys)?;

        let expected = (!leaf_parent_hash.is_empty()).then_some(leaf_parent_hash.as_slice());
        if path.leaf_key_package.parent_hash() != expected {
            return Err(Error::Protocol("invalid parent hash chain"));
        }

        self.node_at_mut(NodeIndex::from(from)).node =
            Some(Node::Leaf(path.leaf_key_package.clone()));

        self.clear_hash_path(from);
        Ok(())
    }

    /// First half of encap: derive the path-secret chain from `leaf_secret`,
    /// install the new public keys, and re-sign the leaf KeyPackage with the
    /// refreshed parent hash.  The ciphertexts are added separately by
    /// [`Self::encrypt_path_secrets`] once the provisional group context,
    /// including the new tree hash, is known.
    pub fn update_direct_path(
        &mut self,
        from: LeafIndex,
        leaf_secret: &Secret,
        signature_priv: &SignaturePrivateKey,
    ) -> Result<(TreeKemPrivateKey, UpdatePath)> {
        let suite = self.suite;
        let dirpath = self.size().direct_path(from);

        let Some(key_package) = self.key_package(from) else {
            return Err(Error::InvalidParameter("encap from blank leaf"));
        };
        let mut key_package = key_package.clone();

        // ps_0 = path_step(leaf_secret); ps_{k+1} = path_step(ps_k)
        let mut path_secrets = BTreeMap::new();
        let mut last_secret = leaf_secret.clone();
        let mut public_keys = Vec::new();
        for &n in &dirpath {
            last_secret = path_step(suite, &last_secret)?;
            let (_, public_key) = suite.hpke_derive(&last_secret)?;
            public_keys.push(public_key);
            path_secrets.insert(n, last_secret.clone());
        }

        // The commit secret is one further step past the top of the path
        let update_secret = path_step(suite, &last_secret)?;

        let leaf_parent_hash = self.merge_path_keys(from, &public_keys)?;

        // Refresh the leaf: new HPKE key, new parent hash, new signature
        let (leaf_priv, leaf_key) = suite.hpke_derive(leaf_secret)?;
        key_package.init_key = leaf_key;
        if leaf_parent_hash.is_empty() {
            // Singleton tree: no parents, nothing to bind
        } else {
            key_package.set_parent_hash(&leaf_parent_hash);
        }
        key_package.sign(signature_priv)?;

        self.node_at_mut(NodeIndex::from(from)).node = Some(Node::Leaf(key_package.clone()));
        self.clear_hash_path(from);

        let mut private_keys = BTreeMap::new();
        private_keys.insert(NodeIndex::from(from), leaf_priv);

        let tree_priv = TreeKemPrivateKey {
            suite,
            self_index: from,
            update_secret,
            path_secrets,
            private_keys,
        };

        let update_path = UpdatePath {
            leaf_key_package: key_package,
            nodes: public_keys
                .into_iter()
                .map(|public_key| UpdatePathNode {
                    public_key,
                    encrypted_path_secret: Vec::new(),
                })
                .collect(),
        };

        Ok((tree_priv, update_path))
    }

    /// Second half of encap: for every node on the direct path, encrypt its
    /// path secret to each member of the copath sibling's resolution, with
    /// the serialized group context as the HPKE info.
    pub fn encrypt_path_secrets(
        &self,
        rng: &mut impl CryptoRngCore,
        from: LeafIndex,
        context: &[u8],
        tree_priv: &TreeKemPrivateKey,
        mut path: UpdatePath,
    ) -> Result<UpdatePath> {
        let dirpath = self.size().direct_path(from);
        let copath = self.size().copath(from);

        for (i, node) in path.nodes.iter_mut().enumerate() {
            let path_secret = tree_priv
                .path_secrets
                .get(&dirpath[i])
                .ok_or(Error::InvalidParameter("missing path secret"))?;

            for n in self.resolve(copath[i]) {
                let Some(target) = &self.node_at(n).node else {
                    return Err(Error::InvalidParameter("blank node in resolution"));
                };

                let ct = self.suite.hpke_seal(
                    rng,
                    target.public_key(),
                    context,
                    &[],
                    path_secret.as_ref(),
                )?;
                node.encrypted_path_secret.push(ct);
            }
        }

        Ok(path)
    }

    /// Validate the parent-hash chain over the whole tree: every non-blank
    /// parent must be vouched for by a child on the path to the leaf that
    /// created it.
    pub fn parent_hash_valid(&self) -> Result<bool> {
        let width = self.width();
        for p in (0..width.0).map(NodeIndex) {
            if p.is_leaf() {
                continue;
            }

            let Some(Node::Parent(parent)) = &self.node_at(p).node else {
                continue;
            };

            let l = p.left().unwrap();
            let r = p.right(width).unwrap();

            let lh = self.parent_hash_binding(
                &parent.public_key,
                &self.hash_excluding(r, &parent.unmerged_leaves)?,
            )?;
            let rh = self.parent_hash_binding(
                &parent.public_key,
                &self.hash_excluding(l, &parent.unmerged_leaves)?,
            )?;

            let left_match = self
                .resolve(l)
                .iter()
                .any(|&c| self.parent_hash_at(c).as_deref() == Some(&lh));
            let right_match = self
                .resolve(r)
                .iter()
                .any(|&c| self.parent_hash_at(c).as_deref() == Some(&rh));

            if !left_match && !right_match {
                return Ok(false);
            }
        }

        Ok(true)
    }

    ///
    /// Import/export for the ratchet-tree extension
    ///

    pub fn export(&self) -> Result<Vec<u8>> {
        let nodes: Vec<Option<&Node>> = self.nodes.iter().map(|n| n.node.as_ref()).collect();
        let mut buffer = Vec::new();
        serialize_vector::<4, _>(&nodes, &mut buffer)?;
        Ok(buffer)
    }

    pub fn import(suite: CipherSuite, data: &[u8]) -> Result<Self> {
        let mut reader: &[u8] = data;
        let nodes: Vec<Option<Node>> = deserialize_vector::<4, _>(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::Protocol("trailing bytes after encoded value"));
        }

        if nodes.is_empty() || nodes.len() % 2 == 0 || nodes.last().unwrap().is_none() {
            return Err(Error::Protocol("malformed ratchet tree"));
        }

        for (i, node) in nodes.iter().enumerate() {
            match node {
                Some(Node::Leaf(kp)) if i % 2 == 0 => {
                    if kp.cipher_suite != suite {
                        return Err(Error::Protocol("malformed ratchet tree"));
                    }
                }
                Some(Node::Parent(_)) if i % 2 == 1 => {}
                None => {}
                _ => return Err(Error::Protocol("malformed ratchet tree")),
            }
        }

        Ok(Self {
            suite,
            nodes: nodes
                .into_iter()
                .map(|node| OptionalNode { node, hash: None })
                .collect(),
        })
    }
}

/// The local member's private view of the tree: the leaf private key plus
/// path secrets for the ancestors it shares with the rest of the group.
#[derive(Clone, Debug)]
pub struct TreeKemPrivateKey {
    suite: CipherSuite,
    pub self_index: LeafIndex,
    /// The commit secret produced by the most recent encap or decap.
    pub update_secret: Secret,
    path_secrets: BTreeMap<NodeIndex, Secret>,
    private_keys: BTreeMap<NodeIndex, HpkePrivateKey>,
}

impl TreeKemPrivateKey {
    /// The private view of a group founder: just the leaf key.
    pub fn solo(suite: CipherSuite, index: LeafIndex, leaf_priv: HpkePrivateKey) -> Self {
        let mut private_keys = BTreeMap::new();
        private_keys.insert(NodeIndex::from(index), leaf_priv);

        Self {
            suite,
            self_index: index,
            update_secret: Secret::zero(suite.hash_size()),
            path_secrets: BTreeMap::new(),
            private_keys,
        }
    }

    /// The private view of a joiner: the leaf key plus the path secret the
    /// committer shared at the lowest common ancestor.
    pub fn joiner(
        suite: CipherSuite,
        size: LeafCount,
        index: LeafIndex,
        leaf_priv: HpkePrivateKey,
        intersect: NodeIndex,
        path_secret: Option<Secret>,
    ) -> Result<Self> {
        let mut tree_priv = Self::solo(suite, index, leaf_priv);
        if let Some(path_secret) = path_secret {
            tree_priv.implant(size, intersect, path_secret)?;
        }
        Ok(tree_priv)
    }

    /// Install a path secret at `start` and ratchet it up to the root,
    /// leaving `update_secret` one step past the top.
    fn implant(&mut self, size: LeafCount, start: NodeIndex, path_secret: Secret) -> Result<()> {
        let width = NodeCount::from(size);

        let mut secret = path_secret;
        self.private_keys.remove(&start);
        self.path_secrets.insert(start, secret.clone());

        let mut curr = start;
        while let Some(parent) = curr.parent(width) {
            secret = path_step(self.suite, &secret)?;
            self.private_keys.remove(&parent);
            self.path_secrets.insert(parent, secret.clone());
            curr = parent;
        }

        self.update_secret = path_step(self.suite, &secret)?;
        Ok(())
    }

    pub fn have_private_key(&self, n: NodeIndex) -> bool {
        self.private_keys.contains_key(&n) || self.path_secrets.contains_key(&n)
    }

    /// Private keys for path nodes are derived lazily from the recorded path
    /// secrets.
    pub fn private_key(&mut self, n: NodeIndex) -> Result<Option<HpkePrivateKey>> {
        if let Some(private_key) = self.private_keys.get(&n) {
            return Ok(Some(private_key.clone()));
        }

        let Some(path_secret) = self.path_secrets.get(&n) else {
            return Ok(None);
        };

        let (private_key, _) = self.suite.hpke_derive(path_secret)?;
        self.private_keys.insert(n, private_key.clone());
        Ok(Some(private_key))
    }

    /// Discard secrets for ancestors of a removed leaf; the nodes are blank
    /// now and will be re-keyed by the next update path.
    pub fn blank_path(&mut self, removed: LeafIndex) {
        self.path_secrets.retain(|n, _| !n.is_above_or_eq(removed));
        self.private_keys.retain(|n, _| !n.is_above_or_eq(removed));
    }

    /// Drop secrets for nodes beyond the current tree width.
    pub fn truncate(&mut self, size: LeafCount) {
        let width = NodeCount::from(size);
        self.path_secrets.retain(|n, _| n.0 < width.0);
        self.private_keys.retain(|n, _| n.0 < width.0);
    }

    /// The path secret at the lowest common ancestor with `to`, handed to a
    /// joiner in its Welcome.
    pub fn shared_path_secret(&self, to: LeafIndex) -> Result<(NodeIndex, Secret)> {
        let n = self.self_index.ancestor(to);
        let secret = self
            .path_secrets
            .get(&n)
            .ok_or(Error::InvalidParameter("missing path secret"))?;
        Ok((n, secret.clone()))
    }

    /// Recover the path secrets published in `path`, which has already been
    /// merged into `tree`.  Implants the secret at the lowest common
    /// ancestor, ratchets to the root, and cross-checks every derived public
    /// key against the update path.
    pub fn decap(
        &mut self,
        from: LeafIndex,
        tree: &TreeKemPublicKey,
        context: &[u8],
        path: &UpdatePath,
    ) -> Result<()> {
        let size = tree.size();
        let dirpath = size.direct_path(from);
        let copath = size.copath(from);

        if path.nodes.len() != dirpath.len() {
            return Err(Error::Protocol("update path length mismatch"));
        }

        let overlap = self.self_index.ancestor(from);
        let overlap_index = dirpath
            .iter()
            .position(|&n| n == overlap)
            .ok_or(Error::InvalidParameter("self not in tree"))?;

        // Find the resolution entry we can decrypt
        let resolution = tree.resolve(copath[overlap_index]);
        let encrypted = &path.nodes[overlap_index].encrypted_path_secret;
        if encrypted.len() != resolution.len() {
            return Err(Error::Protocol("update path ciphertext count mismatch"));
        }

        let mut path_secret = None;
        for (ct, &n) in encrypted.iter().zip(resolution.iter()) {
            let Some(private_key) = self.private_key(n)? else {
                continue;
            };

            let plaintext = self.suite.hpke_open(&private_key, ct, context, &[])?;
            path_secret = Some(Secret::from_bytes(plaintext));
            break;
        }

        let Some(path_secret) = path_secret else {
            return Err(Error::Protocol("no private key to decrypt path secret"));
        };

        self.implant(size, overlap, path_secret)?;

        // Every public key we can now derive must match the update path
        for (i, node) in path.nodes.iter().enumerate().skip(overlap_index) {
            let path_secret = self
                .path_secrets
                .get(&dirpath[i])
                .ok_or(Error::Protocol("missing path secret after implant"))?;
            let (_, public_key) = self.suite.hpke_derive(path_secret)?;
            if public_key != node.public_key {
                return Err(Error::Protocol("decap public-key mismatch"));
            }
        }

        Ok(())
    }

    /// Whether this private view matches the public tree.
    pub fn consistent(&self, tree: &TreeKemPublicKey) -> Result<bool> {
        let leaf_node = NodeIndex::from(self.self_index);
        if let Some(leaf_priv) = self.private_keys.get(&leaf_node) {
            let leaf_key = self.suite.hpke_priv_to_pub(leaf_priv)?;
            match tree.key_package(self.self_index) {
                Some(kp) if kp.init_key == leaf_key => {}
                _ => return Ok(false),
            }
        }

        for (&n, path_secret) in &self.path_secrets {
            let (_, public_key) = self.suite.hpke_derive(path_secret)?;
            match &tree.node_at(n).node {
                Some(node) if *node.public_key() == public_key => {}
                Some(Node::Parent(node)) if node.unmerged_leaves.contains(&self.self_index) => {}
                _ => return Ok(false),
            }
        }

        Ok(true)
    }
}
