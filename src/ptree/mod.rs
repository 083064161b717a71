//! Aggregate prefix tree over element bit strings.
//!
//! Every node covers the elements whose key starts with the node key and
//! stores, for each fixed evaluation point `x_i`, the product of `x_i - z`
//! over those elements.  Two trees holding the same subset therefore agree
//! on every sample value, and the ratio of two nodes' values is exactly what
//! [`crate::reconcile::reconcile`] interpolates.
//!
//! Nodes live in a [`NodeStore`] keyed by [`node_key`]; children are
//! addressed by extending the parent key with `bit_quantum` bits, so no node
//! ever holds a reference to another.

pub mod node;
pub mod store;

use std::collections::VecDeque;
use std::sync::Arc;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bitstring::Bitstring;
use crate::error::TreeError;
use crate::field::{p_sks, zpoints, Zp};

pub use node::{node_key, Node, NodeKind};
pub use store::{Batch, MemStore, NodeStore, RedbStore};

/// Shape parameters of a prefix tree.  Both sides of a recon session must
/// agree on `bit_quantum` and `mbar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PTreeConfig {
    /// Multiplier from `mbar` to the leaf split threshold.
    pub thresh_mult: usize,
    /// Key bits consumed per level; each internal node has `2^bit_quantum`
    /// children.
    pub bit_quantum: usize,
    /// Largest set difference a single node interpolation can recover.
    pub mbar: usize,
}

impl Default for PTreeConfig {
    fn default() -> Self {
        PTreeConfig {
            thresh_mult: 10,
            bit_quantum: 2,
            mbar: 5,
        }
    }
}

impl PTreeConfig {
    /// Evaluation points per node, `mbar + 1`.
    pub fn num_samples(&self) -> usize {
        self.mbar + 1
    }

    /// Largest element count a leaf may hold.
    pub fn split_threshold(&self) -> usize {
        self.thresh_mult * self.mbar
    }

    /// Internal nodes at or below this count collapse into a leaf.
    pub fn join_threshold(&self) -> usize {
        self.split_threshold() / 2
    }

    /// Children per internal node.
    pub fn num_children(&self) -> usize {
        1 << self.bit_quantum
    }
}

/// Per-depth counts reported by [`PrefixTree::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LevelStats {
    /// Depth below the root.
    pub depth: usize,
    /// Nodes at this depth.
    pub nodes: usize,
    /// Leaves at this depth.
    pub leaves: usize,
    /// Elements held directly by the leaves at this depth.
    pub elements: usize,
}

/// Shape summary of a whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// Total elements, as recorded at the root.
    pub size: usize,
    /// One entry per populated depth, shallowest first.
    pub levels: Vec<LevelStats>,
}

impl TreeStats {
    /// Total node count across all levels.
    pub fn node_count(&self) -> usize {
        self.levels.iter().map(|l| l.nodes).sum()
    }
}

/// A prefix tree backed by a node store.
pub struct PrefixTree<S: NodeStore> {
    config: PTreeConfig,
    p: Arc<BigUint>,
    points: Vec<Zp>,
    store: S,
}

impl PrefixTree<MemStore> {
    /// A tree over `P_SKS` held entirely in memory, root already created.
    pub fn in_memory(config: PTreeConfig) -> Result<Self, TreeError> {
        let mut tree = PrefixTree::new(config, MemStore::new());
        tree.create()?;
        Ok(tree)
    }
}

impl PrefixTree<RedbStore> {
    /// Closes the tree and deletes its database file.
    pub fn destroy(self) -> Result<(), TreeError> {
        self.store.destroy()
    }
}

impl<S: NodeStore> PrefixTree<S> {
    /// Wraps `store` as a tree over `P_SKS`.  Call [`create`](Self::create)
    /// before use.
    pub fn new(config: PTreeConfig, store: S) -> Self {
        Self::with_modulus(config, store, p_sks())
    }

    /// Wraps `store` as a tree over the field `p`.
    pub fn with_modulus(config: PTreeConfig, store: S, p: Arc<BigUint>) -> Self {
        let points = zpoints(&p, config.num_samples());
        PrefixTree {
            config,
            p,
            points,
            store,
        }
    }

    /// Writes an empty root unless one already exists.
    pub fn create(&mut self) -> Result<(), TreeError> {
        let root_key = Bitstring::new(0);
        if self.store.get_node(&node_key(&root_key))?.is_some() {
            return Ok(());
        }
        let root = Node::empty(root_key, &self.p, self.config.num_samples());
        let mut batch = Batch::default();
        batch.nodes.insert(node_key(&root.key), Some(root.encode()?));
        self.store.commit(batch)
    }

    /// Closes the tree, returning its store.
    pub fn close(self) -> S {
        self.store
    }

    /// Deletes every node and member.  The tree must be
    /// [created](Self::create) again before further use.
    pub fn drop_tree(&mut self) -> Result<(), TreeError> {
        self.store.clear()
    }

    /// Shape parameters.
    pub fn config(&self) -> &PTreeConfig {
        &self.config
    }

    /// Field modulus of the stored elements.
    pub fn modulus(&self) -> &Arc<BigUint> {
        &self.p
    }

    /// The fixed evaluation points, `0, -1, 1, -2, 2, ...`.
    pub fn points(&self) -> &[Zp] {
        &self.points
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The root node.
    pub fn root(&self) -> Result<Node, TreeError> {
        self.node(&Bitstring::new(0))
    }

    /// Number of elements in the tree.
    pub fn len(&self) -> Result<usize, TreeError> {
        Ok(self.root()?.size())
    }

    /// Whether the tree holds no elements.
    pub fn is_empty(&self) -> Result<bool, TreeError> {
        Ok(self.len()? == 0)
    }

    /// Whether `z` is a member.
    pub fn contains(&self, z: &Zp) -> Result<bool, TreeError> {
        self.store.has_element(&z.to_bytes())
    }

    /// The deepest existing node whose key is a prefix of `key`.
    ///
    /// The key is cut to a whole number of levels, then shortened
    /// `bit_quantum` bits at a time until a stored node is found; [`TreeError::NodeNotFound`] means not even the root exists.
    pub fn node(&self, key: &Bitstring) -> Result<Node, TreeError> {
        let bq = self.config.bit_quantum;
        let mut len = key.len() - key.len() % bq;
        loop {
            let prefix = key.prefix(len);
            if let Some(node) = self.load(&prefix)? {
                return Ok(node);
            }
            if len == 0 {
                return Err(TreeError::NodeNotFound(key.to_string()));
            }
            len -= bq;
        }
    }

    /// The node whose subtree `z` belongs to.
    pub fn find(&self, z: &Zp) -> Result<Node, TreeError> {
        self.node(&Bitstring::from_zp(z))
    }

    /// Parent of `node`, or `None` for the root.
    pub fn parent(&self, node: &Node) -> Result<Option<Node>, TreeError> {
        if node.key.is_empty() {
            return Ok(None);
        }
        let len = node.key.len().saturating_sub(self.config.bit_quantum);
        self.node(&node.key.prefix(len)).map(Some)
    }

    /// Children of an internal node in index order; empty for a leaf.
    pub fn children(&self, node: &Node) -> Result<Vec<Node>, TreeError> {
        if node.is_leaf() {
            return Ok(Vec::new());
        }
        (0..self.config.num_children())
            .map(|i| {
                let key = node.key.child(self.config.bit_quantum, i);
                self.load(&key)?
                    .ok_or_else(|| TreeError::NodeNotFound(key.to_string()))
            })
            .collect()
    }

    /// Every element in the subtree under `node`.
    pub fn elements(&self, node: &Node) -> Result<Vec<Zp>, TreeError> {
        let mut out = Vec::with_capacity(node.size());
        let mut queue = VecDeque::from([node.clone()]);
        while let Some(next) = queue.pop_front() {
            match &next.kind {
                NodeKind::Leaf(elements) => out.extend(elements.iter().cloned()),
                NodeKind::Internal => queue.extend(self.children(&next)?),
            }
        }
        Ok(out)
    }

    /// Visits every node breadth first, root first.
    pub fn walk<F>(&self, mut visit: F) -> Result<(), TreeError>
    where
        F: FnMut(&Node) -> Result<(), TreeError>,
    {
        let mut queue = VecDeque::from([self.root()?]);
        while let Some(node) = queue.pop_front() {
            visit(&node)?;
            queue.extend(self.children(&node)?);
        }
        Ok(())
    }

    /// Node, leaf and element counts per depth.
    pub fn stats(&self) -> Result<TreeStats, TreeError> {
        let bq = self.config.bit_quantum;
        let mut stats = TreeStats::default();
        self.walk(|node| {
            let depth = node.depth(bq);
            if stats.levels.len() <= depth {
                stats.levels.resize_with(depth + 1, LevelStats::default);
                stats.levels[depth].depth = depth;
            }
            let level = &mut stats.levels[depth];
            level.nodes += 1;
            if let NodeKind::Leaf(elements) = &node.kind {
                level.leaves += 1;
                level.elements += elements.len();
            }
            Ok(())
        })?;
        stats.size = self.len()?;
        Ok(stats)
    }

    /// Adds `z`, updating the sample values of every node on its path and
    /// splitting the leaf it lands in when the leaf is full.
    pub fn insert(&mut self, z: &Zp) -> Result<(), TreeError> {
        let element = z.to_bytes();
        if self.store.has_element(&element)? {
            return Err(TreeError::DuplicateElement(z.to_string()));
        }
        let marray = self.add_element_array(z)?;
        let mut txn = Txn::new(self);
        let root = txn.require(&Bitstring::new(0))?;
        txn.insert(root, z, &marray, &Bitstring::from_zp(z), 0)?;
        txn.batch.elements.insert(element, true);
        let batch = txn.batch;
        self.store.commit(batch)
    }

    /// Removes `z`, joining any internal node on its path that drops to the
    /// join threshold.
    pub fn remove(&mut self, z: &Zp) -> Result<(), TreeError> {
        let element = z.to_bytes();
        if !self.store.has_element(&element)? {
            return Err(TreeError::ElementNotFound(z.to_string()));
        }
        let marray = self.del_element_array(z)?;
        let mut txn = Txn::new(self);
        let root = txn.require(&Bitstring::new(0))?;
        txn.remove(root, z, &marray, &Bitstring::from_zp(z), 0)?;
        txn.batch.elements.insert(element, false);
        let batch = txn.batch;
        self.store.commit(batch)
    }

    fn add_element_array(&self, z: &Zp) -> Result<Vec<Zp>, TreeError> {
        self.points
            .iter()
            .map(|point| {
                let m = point - z;
                if m.is_zero() {
                    Err(TreeError::SamplePointElement(z.to_string()))
                } else {
                    Ok(m)
                }
            })
            .collect()
    }

    fn del_element_array(&self, z: &Zp) -> Result<Vec<Zp>, TreeError> {
        self.points
            .iter()
            .map(|point| (point - z).inv().map_err(TreeError::from))
            .collect()
    }

    fn load(&self, key: &Bitstring) -> Result<Option<Node>, TreeError> {
        self.store
            .get_node(&node_key(key))?
            .map(|record| self.decode(&record))
            .transpose()
    }

    fn decode(&self, record: &[u8]) -> Result<Node, TreeError> {
        Ok(Node::decode(record, &self.p, self.config.num_samples())?)
    }
}

/// Writes staged for one mutation, read back through before the store.
struct Txn<'a, S: NodeStore> {
    tree: &'a PrefixTree<S>,
    batch: Batch,
}

impl<'a, S: NodeStore> Txn<'a, S> {
    fn new(tree: &'a PrefixTree<S>) -> Self {
        Txn {
            tree,
            batch: Batch::default(),
        }
    }

    fn get(&self, key: &Bitstring) -> Result<Option<Node>, TreeError> {
        match self.batch.nodes.get(&node_key(key)) {
            Some(Some(record)) => self.tree.decode(record).map(Some),
            Some(None) => Ok(None),
            None => self.tree.load(key),
        }
    }

    fn require(&self, key: &Bitstring) -> Result<Node, TreeError> {
        self.get(key)?
            .ok_or_else(|| TreeError::NodeNotFound(key.to_string()))
    }

    fn put(&mut self, node: &Node) -> Result<(), TreeError> {
        self.batch
            .nodes
            .insert(node_key(&node.key), Some(node.encode()?));
        Ok(())
    }

    fn delete(&mut self, key: &Bitstring) {
        self.batch.nodes.insert(node_key(key), None);
    }

    fn child_key(&self, node: &Node, bs: &Bitstring, depth: usize) -> Bitstring {
        let bq = self.tree.config.bit_quantum;
        node.key.child(bq, bs.child_index(depth * bq, bq))
    }

    fn insert(
        &mut self,
        mut node: Node,
        z: &Zp,
        marray: &[Zp],
        bs: &Bitstring,
        mut depth: usize,
    ) -> Result<(), TreeError> {
        let split_threshold = self.tree.config.split_threshold();
        loop {
            node.mul_svalues(marray);
            node.num_elements += 1;
            if let NodeKind::Leaf(elements) = &mut node.kind {
                if elements.len() < split_threshold {
                    elements.push(z.clone());
                    return self.put(&node);
                }
            }
            if node.is_leaf() {
                self.split(&mut node, depth)?;
            } else {
                self.put(&node)?;
            }
            let key = self.child_key(&node, bs, depth);
            node = self.require(&key)?;
            depth += 1;
        }
    }

    /// Turns a full leaf into an internal node and pushes its elements one
    /// level down.  The caller has already counted the incoming element.
    fn split(&mut self, node: &mut Node, depth: usize) -> Result<(), TreeError> {
        let NodeKind::Leaf(elements) = std::mem::replace(&mut node.kind, NodeKind::Internal)
        else {
            return Ok(());
        };
        debug!(evt = "split", key = %node.key, elements = elements.len());
        self.put(node)?;
        let config = self.tree.config;
        for i in 0..config.num_children() {
            let child = Node::empty(
                node.key.child(config.bit_quantum, i),
                &self.tree.p,
                config.num_samples(),
            );
            self.put(&child)?;
        }
        for element in &elements {
            let bs = Bitstring::from_zp(element);
            let marray = self.tree.add_element_array(element)?;
            let child = self.require(&self.child_key(node, &bs, depth))?;
            self.insert(child, element, &marray, &bs, depth + 1)?;
        }
        Ok(())
    }

    fn remove(
        &mut self,
        mut node: Node,
        z: &Zp,
        marray: &[Zp],
        bs: &Bitstring,
        mut depth: usize,
    ) -> Result<(), TreeError> {
        let join_threshold = self.tree.config.join_threshold();
        loop {
            node.mul_svalues(marray);
            node.num_elements = node.num_elements.saturating_sub(1);
            if node.is_leaf() {
                break;
            }
            if node.num_elements <= join_threshold {
                self.join(&mut node)?;
                break;
            }
            self.put(&node)?;
            let key = self.child_key(&node, bs, depth);
            node = self.require(&key)?;
            depth += 1;
        }
        let NodeKind::Leaf(elements) = &mut node.kind else {
            return Err(TreeError::ElementNotFound(z.to_string()));
        };
        let Some(pos) = elements.iter().position(|e| e == z) else {
            return Err(TreeError::ElementNotFound(z.to_string()));
        };
        elements.remove(pos);
        self.put(&node)
    }

    /// Collapses every descendant of `node` into `node` as a single leaf.
    fn join(&mut self, node: &mut Node) -> Result<(), TreeError> {
        let bq = self.tree.config.bit_quantum;
        let fanout = self.tree.config.num_children();
        let mut elements = Vec::new();
        let mut queue: VecDeque<Bitstring> = (0..fanout).map(|i| node.key.child(bq, i)).collect();
        while let Some(key) = queue.pop_front() {
            let child = self.require(&key)?;
            match child.kind {
                NodeKind::Leaf(found) => elements.extend(found),
                NodeKind::Internal => queue.extend((0..fanout).map(|i| key.child(bq, i))),
            }
            self.delete(&key);
        }
        debug!(evt = "join", key = %node.key, elements = elements.len());
        node.kind = NodeKind::Leaf(elements);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zset::ZSet;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn zi(v: i64) -> Zp {
        Zp::from_i64(&p_sks(), v)
    }

    fn mem_tree() -> PrefixTree<MemStore> {
        PrefixTree::in_memory(PTreeConfig::default()).unwrap()
    }

    fn all_ones(node: &Node) -> bool {
        node.svalues().iter().all(Zp::is_one)
    }

    #[test]
    fn test_config_thresholds() {
        let config = PTreeConfig::default();
        assert_eq!(config.num_samples(), 6);
        assert_eq!(config.split_threshold(), 50);
        assert_eq!(config.join_threshold(), 25);
        assert_eq!(config.num_children(), 4);
    }

    #[test]
    fn test_insert_nodes_no_split() {
        let mut tree = mem_tree();
        for v in [100, 300, 500] {
            tree.insert(&zi(v)).unwrap();
        }
        let root = tree.root().unwrap();
        assert_eq!(root.size(), 3);
        assert!(root.is_leaf());
        assert_eq!(tree.elements(&root).unwrap().len(), 3);

        for v in [100, 300, 500] {
            tree.remove(&zi(v)).unwrap();
        }
        let root = tree.root().unwrap();
        assert!(tree.elements(&root).unwrap().is_empty());
        assert!(all_ones(&root));
    }

    #[test]
    fn test_just_one_key() {
        let p = p_sks();
        let mut tree = mem_tree();
        tree.insert(&Zp::parse(&p, "224045810486609649306292620830306652473").unwrap())
            .unwrap();
        let mut expect: ZSet = [
            "306467079064992673198834899522272784866",
            "306467079064992673198834899522272784865",
            "306467079064992673198834899522272784867",
            "306467079064992673198834899522272784864",
            "306467079064992673198834899522272784868",
            "306467079064992673198834899522272784863",
        ]
        .iter()
        .map(|s| Zp::parse(&p, s).unwrap())
        .collect();
        for sv in tree.root().unwrap().svalues() {
            assert!(expect.remove(sv), "unexpected svalue {sv}");
        }
        assert!(expect.is_empty());
    }

    #[test]
    fn test_insert_remove_protection() {
        let p = p_sks();
        let z = Zp::parse(&p, "224045810486609649306292620830306652473").unwrap();
        let mut tree = mem_tree();
        let orig = tree.root().unwrap().svalues().to_vec();

        tree.insert(&z).unwrap();
        let one = tree.root().unwrap().svalues().to_vec();
        assert!(orig.iter().zip(&one).all(|(a, b)| a != b));

        assert!(matches!(
            tree.insert(&z),
            Err(TreeError::DuplicateElement(_))
        ));
        assert_eq!(tree.root().unwrap().svalues(), one.as_slice());

        tree.remove(&z).unwrap();
        assert_eq!(tree.root().unwrap().svalues(), orig.as_slice());

        assert!(matches!(tree.remove(&z), Err(TreeError::ElementNotFound(_))));
        assert_eq!(tree.root().unwrap().svalues(), orig.as_slice());
    }

    #[test]
    fn test_sample_point_rejected() {
        let mut tree = mem_tree();
        assert!(matches!(
            tree.insert(&zi(-1)),
            Err(TreeError::SamplePointElement(_))
        ));
        assert_eq!(tree.len().unwrap(), 0);
    }

    #[test]
    fn test_insert_node_split_and_join() {
        let mut tree = mem_tree();
        let n = tree.config().split_threshold() * 4;
        for i in 0..n {
            tree.insert(&zi(i as i64 + 65536)).unwrap();
        }
        let root = tree.root().unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.size(), n);
        let children = tree.children(&root).unwrap();
        assert_eq!(children.len(), 4);
        assert_eq!(children.iter().map(Node::size).sum::<usize>(), n);
        assert_eq!(tree.elements(&root).unwrap().len(), n);

        let stats = tree.stats().unwrap();
        assert_eq!(stats.size, n);
        assert_eq!(stats.levels.iter().map(|l| l.elements).sum::<usize>(), n);
        for level in &stats.levels {
            assert!(level.leaves <= level.nodes);
        }

        for i in 0..n {
            tree.remove(&zi(i as i64 + 65536)).unwrap();
        }
        let root = tree.root().unwrap();
        assert!(root.is_leaf());
        assert!(all_ones(&root));
        assert!(tree.children(&root).unwrap().is_empty());
        assert!(tree.elements(&root).unwrap().is_empty());
        assert_eq!(tree.store().node_count(), 1);
    }

    #[test]
    fn test_leaves_respect_split_threshold() {
        let mut tree = mem_tree();
        let mut rng = StdRng::seed_from_u64(7);
        let p = p_sks();
        for _ in 0..500 {
            tree.insert(&Zp::random(&p, &mut rng)).unwrap();
        }
        let limit = tree.config().split_threshold();
        let bq = tree.config().bit_quantum;
        tree.walk(|node| {
            assert!(node.leaf_elements().len() <= limit);
            assert_eq!(node.key().len() % bq, 0);
            for e in node.leaf_elements() {
                assert!(node.key().is_prefix_of(&Bitstring::from_zp(e)));
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_node_walks_up_to_existing_ancestor() {
        let mut tree = mem_tree();
        tree.insert(&zi(65537)).unwrap();
        let z = zi(65537);
        let found = tree.find(&z).unwrap();
        assert!(found.key().is_empty());
        assert!(tree.parent(&found).unwrap().is_none());
    }

    #[test]
    fn test_key_match() {
        let mut tree1 = mem_tree();
        for i in 1..100 {
            tree1.insert(&zi(65537 * i + i)).unwrap();
        }
        for i in 1..50 {
            tree1.insert(&zi(68111 * i)).unwrap();
        }
        let mut tree2 = mem_tree();
        for i in 1..100 {
            tree2.insert(&zi(65537 * i)).unwrap();
        }
        for i in 1..20 {
            tree2.insert(&zi(70001 * i)).unwrap();
        }
        for i in 1..100 {
            let z = zi(65537 * i);
            let k1 = tree1.find(&z).unwrap().key().clone();
            let k2 = tree2.find(&z).unwrap().key().clone();
            assert!(k1.is_prefix_of(&k2) || k2.is_prefix_of(&k1), "{k1} vs {k2}");
        }
    }

    #[test]
    fn test_parent_of_child() {
        let mut tree = mem_tree();
        for i in 0..60 {
            tree.insert(&zi(i * 7919 + 3)).unwrap();
        }
        let root = tree.root().unwrap();
        let child = tree.children(&root).unwrap().remove(3);
        assert_eq!(child.key().to_string(), "11");
        assert_eq!(tree.parent(&child).unwrap().unwrap().key(), root.key());
    }

    #[test]
    fn test_redb_tree_persists_membership() {
        let path = store::tests::temp_db_path("ptree");
        let p = p_sks();
        let mut rng = StdRng::seed_from_u64(11);
        let config = PTreeConfig::default();
        let items: Vec<Zp> = (0..config.split_threshold() * 2)
            .map(|_| Zp::random(&p, &mut rng))
            .collect();
        let root_before = {
            let mut tree = PrefixTree::new(config, RedbStore::open(&path).unwrap());
            tree.create().unwrap();
            for z in &items {
                tree.insert(z).unwrap();
            }
            let root = tree.root().unwrap();
            drop(tree.close());
            root
        };

        let mut tree = PrefixTree::new(config, RedbStore::open(&path).unwrap());
        tree.create().unwrap();
        assert_eq!(tree.root().unwrap(), root_before);
        for z in &items {
            assert!(matches!(tree.insert(z), Err(TreeError::DuplicateElement(_))));
        }
        tree.drop_tree().unwrap();
        assert!(matches!(tree.root(), Err(TreeError::NodeNotFound(_))));
        tree.create().unwrap();
        assert_eq!(tree.len().unwrap(), 0);
        tree.destroy().unwrap();
        assert!(!path.exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_svalues_depend_only_on_membership(
            values in proptest::collection::btree_set(16i64..1_000_000_000, 1..150),
            keep_every in 2usize..5,
        ) {
            let values: Vec<i64> = values.into_iter().collect();
            let mut churned = mem_tree();
            for v in &values {
                churned.insert(&zi(*v)).unwrap();
            }
            let mut direct = mem_tree();
            for (i, v) in values.iter().enumerate() {
                if i % keep_every == 0 {
                    direct.insert(&zi(*v)).unwrap();
                } else {
                    churned.remove(&zi(*v)).unwrap();
                }
            }
            let a = churned.root().unwrap();
            let b = direct.root().unwrap();
            prop_assert_eq!(a.svalues(), b.svalues());
            prop_assert_eq!(a.size(), b.size());
            let left: ZSet = churned.elements(&a).unwrap().into_iter().collect();
            let right: ZSet = direct.elements(&b).unwrap().into_iter().collect();
            prop_assert_eq!(left, right);
        }
    }
}
