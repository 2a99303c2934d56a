//! Content-addressed Merkle radix trie backing the committed ledger states.
//!
//! Nodes are keyed by the blake3 hash of their encoding, so a root commitment
//! pins the whole state. The structure is canonical: the same key/value set
//! produces the same root no matter the order of updates. Paths are nibbles
//! (16-ary branching) with extension compression, the classic Patricia shape.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{TangleError, TangleResult};
use crate::types::Commitment;

/// Where trie nodes are loaded from. The persistent store implements this
/// over its trie column family; tests use an in-memory map.
pub trait NodeSource: Send + Sync {
    fn load_node(&self, commitment: &Commitment) -> TangleResult<Option<Vec<u8>>>;
}

impl NodeSource for HashMap<Commitment, Vec<u8>> {
    fn load_node(&self, commitment: &Commitment) -> TangleResult<Option<Vec<u8>>> {
        Ok(self.get(commitment).cloned())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Node {
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    /// Always points at a branch node.
    Extension {
        path: Vec<u8>,
        child: Commitment,
    },
    Branch {
        children: [Option<Commitment>; 16],
        value: Option<Vec<u8>>,
    },
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("node encoding is infallible")
    }

    fn decode(data: &[u8]) -> TangleResult<Self> {
        Ok(bincode::deserialize(data)?)
    }

    fn commitment(&self) -> Commitment {
        Commitment(*blake3::hash(&self.encode()).as_bytes())
    }
}

fn bytes_to_nibbles(data: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(data.len() * 2);
    for b in data {
        ret.push(b >> 4);
        ret.push(b & 0x0f);
    }
    ret
}

fn nibbles_to_bytes(nibbles: &[u8]) -> Vec<u8> {
    debug_assert!(nibbles.len() % 2 == 0, "key nibble count must be even");
    nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect()
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Shared read/cache plumbing of the reader and the updatable session. The
/// node cache mutates on every read, which is why [`Readable`] wraps the
/// reader in a mutex.
struct NodeCache {
    source: Arc<dyn NodeSource>,
    cache: HashMap<Commitment, Node>,
}

impl NodeCache {
    fn new(source: Arc<dyn NodeSource>) -> Self {
        Self {
            source,
            cache: HashMap::new(),
        }
    }

    fn load(&mut self, commitment: &Commitment) -> TangleResult<Node> {
        if let Some(node) = self.cache.get(commitment) {
            return Ok(node.clone());
        }
        let data = self.source.load_node(commitment)?.ok_or_else(|| {
            TangleError::NotFound(format!("trie node {commitment} missing from store"))
        })?;
        let node = Node::decode(&data)?;
        self.cache.insert(*commitment, node.clone());
        Ok(node)
    }
}

pub struct TrieReader {
    root: Commitment,
    nodes: NodeCache,
}

impl std::fmt::Debug for TrieReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieReader").field("root", &self.root).finish()
    }
}

impl TrieReader {
    pub fn new(source: Arc<dyn NodeSource>, root: Commitment) -> Self {
        Self {
            root,
            nodes: NodeCache::new(source),
        }
    }

    pub fn root(&self) -> Commitment {
        self.root
    }

    pub fn get(&mut self, key: &[u8]) -> TangleResult<Option<Vec<u8>>> {
        if self.root.is_empty() {
            return Ok(None);
        }
        let path = bytes_to_nibbles(key);
        self.get_at(self.root, &path)
    }

    pub fn has(&mut self, key: &[u8]) -> TangleResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn get_at(&mut self, commitment: Commitment, path: &[u8]) -> TangleResult<Option<Vec<u8>>> {
        let mut commitment = commitment;
        let mut path = path;
        loop {
            match self.nodes.load(&commitment)? {
                Node::Leaf {
                    path: leaf_path,
                    value,
                } => {
                    return Ok((leaf_path == path).then_some(value));
                }
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if path.len() < ext_path.len() || path[..ext_path.len()] != ext_path[..] {
                        return Ok(None);
                    }
                    path = &path[ext_path.len()..];
                    commitment = child;
                    continue;
                }
                Node::Branch { children, value } => {
                    if path.is_empty() {
                        return Ok(value);
                    }
                    match children[path[0] as usize] {
                        Some(child) => {
                            commitment = child;
                            path = &path[1..];
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// All key/value pairs whose key starts with `prefix`, ascending by key.
    pub fn iter_prefix(&mut self, prefix: &[u8]) -> TangleResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        if self.root.is_empty() {
            return Ok(out);
        }
        let prefix_nibbles = bytes_to_nibbles(prefix);
        self.collect(self.root, Vec::new(), &prefix_nibbles, &mut out)?;
        Ok(out)
    }

    fn collect(
        &mut self,
        commitment: Commitment,
        consumed: Vec<u8>,
        prefix: &[u8],
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> TangleResult<()> {
        let want = &prefix[consumed.len().min(prefix.len())..];
        match self.nodes.load(&commitment)? {
            Node::Leaf { path, value } => {
                let matches = if want.len() > path.len() {
                    false
                } else {
                    path[..want.len()] == want[..]
                };
                if matches {
                    let mut key = consumed;
                    key.extend_from_slice(&path);
                    out.push((nibbles_to_bytes(&key), value));
                }
            }
            Node::Extension { path, child } => {
                let overlap = want.len().min(path.len());
                if path[..overlap] != want[..overlap] {
                    return Ok(());
                }
                let mut consumed = consumed;
                consumed.extend_from_slice(&path);
                self.collect(child, consumed, prefix, out)?;
            }
            Node::Branch { children, value } => {
                if want.is_empty() {
                    if let Some(value) = value {
                        out.push((nibbles_to_bytes(&consumed), value));
                    }
                    for (idx, child) in children.iter().enumerate() {
                        if let Some(child) = child {
                            let mut consumed = consumed.clone();
                            consumed.push(idx as u8);
                            self.collect(*child, consumed, prefix, out)?;
                        }
                    }
                } else if let Some(child) = children[want[0] as usize] {
                    let mut consumed = consumed;
                    consumed.push(want[0]);
                    self.collect(child, consumed, prefix, out)?;
                }
            }
        }
        Ok(())
    }
}

/// Copy-on-write update session. Mutations build new nodes in memory;
/// `take_new_nodes` hands the nodes reachable from the final root to the
/// caller's storage batch.
pub struct TrieUpdatable {
    root: Commitment,
    nodes: NodeCache,
    pending: HashMap<Commitment, Node>,
}

impl TrieUpdatable {
    pub fn new(source: Arc<dyn NodeSource>, root: Commitment) -> Self {
        Self {
            root,
            nodes: NodeCache::new(source),
            pending: HashMap::new(),
        }
    }

    pub fn root(&self) -> Commitment {
        self.root
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> TangleResult<()> {
        let path = bytes_to_nibbles(key);
        let new_root = if self.root.is_empty() {
            self.store(Node::Leaf { path, value })
        } else {
            let node = self.insert_at(self.root, &path, value)?;
            self.store(node)
        };
        self.root = new_root;
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> TangleResult<()> {
        if self.root.is_empty() {
            return Ok(());
        }
        let path = bytes_to_nibbles(key);
        self.root = match self.remove_at(self.root, &path)? {
            Some(node) => self.store(node),
            None => Commitment::EMPTY,
        };
        Ok(())
    }

    /// Drains the new nodes reachable from the current root, encoded and
    /// keyed by commitment. Intermediate nodes orphaned by later mutations in
    /// the same session are dropped here, not persisted.
    pub fn take_new_nodes(&mut self) -> Vec<(Commitment, Vec<u8>)> {
        let mut reachable = Vec::new();
        let mut stack = vec![self.root];
        while let Some(commitment) = stack.pop() {
            let Some(node) = self.pending.remove(&commitment) else {
                continue;
            };
            match &node {
                Node::Leaf { .. } => {}
                Node::Extension { child, .. } => stack.push(*child),
                Node::Branch { children, .. } => {
                    stack.extend(children.iter().flatten().copied());
                }
            }
            reachable.push((commitment, node.encode()));
        }
        self.pending.clear();
        reachable
    }

    fn store(&mut self, node: Node) -> Commitment {
        let commitment = node.commitment();
        // also feed the read cache so chained mutations see the new node
        self.nodes.cache.insert(commitment, node.clone());
        self.pending.insert(commitment, node);
        commitment
    }

    fn load(&mut self, commitment: &Commitment) -> TangleResult<Node> {
        if let Some(node) = self.pending.get(commitment) {
            return Ok(node.clone());
        }
        self.nodes.load(commitment)
    }

    fn insert_at(
        &mut self,
        commitment: Commitment,
        path: &[u8],
        value: Vec<u8>,
    ) -> TangleResult<Node> {
        match self.load(&commitment)? {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path == path {
                    return Ok(Node::Leaf {
                        path: path.to_vec(),
                        value,
                    });
                }
                let common = common_prefix_len(&leaf_path, path);
                let mut children: [Option<Commitment>; 16] = Default::default();
                let mut branch_value = None;

                if leaf_path.len() == common {
                    branch_value = Some(leaf_value);
                } else {
                    let nib = leaf_path[common];
                    let child = self.store(Node::Leaf {
                        path: leaf_path[common + 1..].to_vec(),
                        value: leaf_value,
                    });
                    children[nib as usize] = Some(child);
                }
                if path.len() == common {
                    branch_value = Some(value);
                } else {
                    let nib = path[common];
                    let child = self.store(Node::Leaf {
                        path: path[common + 1..].to_vec(),
                        value,
                    });
                    children[nib as usize] = Some(child);
                }
                let branch = Node::Branch {
                    children,
                    value: branch_value,
                };
                Ok(self.wrap_extension(&path[..common], branch))
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix_len(&ext_path, path);
                if common == ext_path.len() {
                    let sub = self.insert_at(child, &path[common..], value)?;
                    let child = self.store(sub);
                    return Ok(Node::Extension {
                        path: ext_path,
                        child,
                    });
                }
                let mut children: [Option<Commitment>; 16] = Default::default();
                let mut branch_value = None;

                let ext_nib = ext_path[common];
                let ext_rest = &ext_path[common + 1..];
                children[ext_nib as usize] = Some(if ext_rest.is_empty() {
                    child
                } else {
                    self.store(Node::Extension {
                        path: ext_rest.to_vec(),
                        child,
                    })
                });
                if path.len() == common {
                    branch_value = Some(value);
                } else {
                    let nib = path[common];
                    let leaf = self.store(Node::Leaf {
                        path: path[common + 1..].to_vec(),
                        value,
                    });
                    children[nib as usize] = Some(leaf);
                }
                let branch = Node::Branch {
                    children,
                    value: branch_value,
                };
                Ok(self.wrap_extension(&path[..common], branch))
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return Ok(Node::Branch {
                        children,
                        value: Some(value),
                    });
                }
                let nib = path[0] as usize;
                let sub = match children[nib] {
                    Some(child) => self.insert_at(child, &path[1..], value)?,
                    None => Node::Leaf {
                        path: path[1..].to_vec(),
                        value,
                    },
                };
                children[nib] = Some(self.store(sub));
                Ok(Node::Branch {
                    children,
                    value: branch_value,
                })
            }
        }
    }

    fn wrap_extension(&mut self, prefix: &[u8], branch: Node) -> Node {
        if prefix.is_empty() {
            branch
        } else {
            let child = self.store(branch);
            Node::Extension {
                path: prefix.to_vec(),
                child,
            }
        }
    }

    fn remove_at(&mut self, commitment: Commitment, path: &[u8]) -> TangleResult<Option<Node>> {
        match self.load(&commitment)? {
            Node::Leaf {
                path: leaf_path,
                value,
            } => {
                if leaf_path == path {
                    Ok(None)
                } else {
                    Ok(Some(Node::Leaf {
                        path: leaf_path,
                        value,
                    }))
                }
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                if path.len() < ext_path.len() || path[..ext_path.len()] != ext_path[..] {
                    return Ok(Some(Node::Extension {
                        path: ext_path,
                        child,
                    }));
                }
                match self.remove_at(child, &path[ext_path.len()..])? {
                    None => Ok(None),
                    Some(sub) => Ok(Some(self.merge_extension(ext_path, sub))),
                }
            }
            Node::Branch {
                mut children,
                mut value,
            } => {
                if path.is_empty() {
                    value = None;
                } else {
                    let nib = path[0] as usize;
                    let Some(child) = children[nib] else {
                        return Ok(Some(Node::Branch { children, value }));
                    };
                    children[nib] = match self.remove_at(child, &path[1..])? {
                        Some(sub) => Some(self.store(sub)),
                        None => None,
                    };
                }
                self.normalize_branch(children, value)
            }
        }
    }

    /// Re-establishes canonical shape after a removal under a branch.
    fn normalize_branch(
        &mut self,
        children: [Option<Commitment>; 16],
        value: Option<Vec<u8>>,
    ) -> TangleResult<Option<Node>> {
        let occupied: Vec<usize> = children
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.map(|_| idx))
            .collect();
        match (occupied.len(), &value) {
            (0, None) => Ok(None),
            (0, Some(_)) => Ok(Some(Node::Leaf {
                path: Vec::new(),
                value: value.expect("checked above"),
            })),
            (1, None) => {
                let nib = occupied[0];
                let child = children[nib].expect("occupied slot");
                let sub = self.load(&child)?;
                Ok(Some(self.merge_extension(vec![nib as u8], sub)))
            }
            _ => Ok(Some(Node::Branch { children, value })),
        }
    }

    /// Prepends `prefix` to a node, collapsing leaf and extension chains.
    fn merge_extension(&mut self, mut prefix: Vec<u8>, node: Node) -> Node {
        match node {
            Node::Leaf { path, value } => {
                prefix.extend_from_slice(&path);
                Node::Leaf {
                    path: prefix,
                    value,
                }
            }
            Node::Extension { path, child } => {
                prefix.extend_from_slice(&path);
                Node::Extension {
                    path: prefix,
                    child,
                }
            }
            branch @ Node::Branch { .. } => {
                let child = self.store(branch);
                Node::Extension {
                    path: prefix,
                    child,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Store(HashMap<Commitment, Vec<u8>>);

    impl Store {
        fn new() -> Self {
            Store(HashMap::new())
        }

        fn apply(&mut self, updatable: &mut TrieUpdatable) -> Commitment {
            for (commitment, data) in updatable.take_new_nodes() {
                self.0.insert(commitment, data);
            }
            updatable.root()
        }
    }

    fn build(store: &mut Store, root: Commitment, kvs: &[(&[u8], &[u8])]) -> Commitment {
        let source = Arc::new(store.0.clone());
        let mut updatable = TrieUpdatable::new(source, root);
        for (k, v) in kvs {
            updatable.insert(k, v.to_vec()).unwrap();
        }
        store.apply(&mut updatable)
    }

    #[test]
    fn get_after_insert() {
        let mut store = Store::new();
        let root = build(
            &mut store,
            Commitment::EMPTY,
            &[(b"abc", b"1"), (b"abd", b"2"), (b"x", b"3")],
        );
        let mut reader = TrieReader::new(Arc::new(store.0.clone()), root);
        assert_eq!(reader.get(b"abc").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reader.get(b"abd").unwrap(), Some(b"2".to_vec()));
        assert_eq!(reader.get(b"x").unwrap(), Some(b"3".to_vec()));
        assert_eq!(reader.get(b"ab").unwrap(), None);
        assert_eq!(reader.get(b"abcd").unwrap(), None);
    }

    #[test]
    fn insertion_order_does_not_change_root() {
        let kvs: Vec<(Vec<u8>, Vec<u8>)> = (0u8..50)
            .map(|i| (vec![i / 16, i % 16, i], vec![i; 3]))
            .collect();
        let mut forward = Store::new();
        let mut root_forward = Commitment::EMPTY;
        for (k, v) in &kvs {
            root_forward = build(&mut forward, root_forward, &[(k, v)]);
        }
        let mut backward = Store::new();
        let mut root_backward = Commitment::EMPTY;
        for (k, v) in kvs.iter().rev() {
            root_backward = build(&mut backward, root_backward, &[(k, v)]);
        }
        assert_eq!(root_forward, root_backward);
    }

    #[test]
    fn removal_restores_previous_root() {
        let mut store = Store::new();
        let base = build(&mut store, Commitment::EMPTY, &[(b"aa", b"1"), (b"ab", b"2")]);
        let extended = build(&mut store, base, &[(b"ac", b"3"), (b"zz", b"4")]);
        assert_ne!(base, extended);

        let mut updatable = TrieUpdatable::new(Arc::new(store.0.clone()), extended);
        updatable.remove(b"ac").unwrap();
        updatable.remove(b"zz").unwrap();
        let rolled_back = store.apply(&mut updatable);
        assert_eq!(rolled_back, base);
    }

    #[test]
    fn remove_everything_yields_empty_root() {
        let mut store = Store::new();
        let root = build(&mut store, Commitment::EMPTY, &[(b"k1", b"v"), (b"k2", b"v")]);
        let mut updatable = TrieUpdatable::new(Arc::new(store.0.clone()), root);
        updatable.remove(b"k1").unwrap();
        updatable.remove(b"k2").unwrap();
        assert!(updatable.root().is_empty());
    }

    #[test]
    fn prefix_iteration_is_ordered() {
        let mut store = Store::new();
        let root = build(
            &mut store,
            Commitment::EMPTY,
            &[
                (b"a\x02x", b"3"),
                (b"a\x01y", b"2"),
                (b"a\x01x", b"1"),
                (b"b\x01x", b"9"),
            ],
        );
        let mut reader = TrieReader::new(Arc::new(store.0.clone()), root);
        let under_a = reader.iter_prefix(b"a").unwrap();
        let keys: Vec<Vec<u8>> = under_a.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![b"a\x01x".to_vec(), b"a\x01y".to_vec(), b"a\x02x".to_vec()]
        );
        let under_a1 = reader.iter_prefix(b"a\x01").unwrap();
        assert_eq!(under_a1.len(), 2);
        assert!(reader.iter_prefix(b"c").unwrap().is_empty());
    }

    #[test]
    fn updates_overwrite_in_place() {
        let mut store = Store::new();
        let root_v1 = build(&mut store, Commitment::EMPTY, &[(b"key", b"v1")]);
        let root_v2 = build(&mut store, root_v1, &[(b"key", b"v2")]);
        assert_ne!(root_v1, root_v2);
        // old root still readable: states are immutable
        let mut old = TrieReader::new(Arc::new(store.0.clone()), root_v1);
        assert_eq!(old.get(b"key").unwrap(), Some(b"v1".to_vec()));
        let mut new = TrieReader::new(Arc::new(store.0.clone()), root_v2);
        assert_eq!(new.get(b"key").unwrap(), Some(b"v2".to_vec()));
    }

    proptest::proptest! {
        #[test]
        fn canonical_root_for_any_history(
            entries in proptest::collection::btree_map(
                proptest::collection::vec(0u8..=255, 1..6),
                proptest::collection::vec(0u8..=255, 1..4),
                1..40,
            ),
            extra in proptest::collection::btree_map(
                proptest::collection::vec(0u8..=255, 1..6),
                proptest::collection::vec(0u8..=255, 1..4),
                0..10,
            ),
        ) {
            // history A: insert everything (entries + extra), remove extra
            let mut store_a = Store::new();
            let mut root_a = Commitment::EMPTY;
            for (k, v) in entries.iter().chain(extra.iter()) {
                root_a = build(&mut store_a, root_a, &[(k, v)]);
            }
            {
                let mut updatable = TrieUpdatable::new(Arc::new(store_a.0.clone()), root_a);
                for k in extra.keys() {
                    if !entries.contains_key(k) {
                        updatable.remove(k).unwrap();
                    } else {
                        // re-assert the surviving value
                        updatable.insert(k, entries[k].clone()).unwrap();
                    }
                }
                root_a = store_a.apply(&mut updatable);
            }
            // history B: insert the final set in reverse order
            let mut store_b = Store::new();
            let mut root_b = Commitment::EMPTY;
            for (k, v) in entries.iter().rev() {
                root_b = build(&mut store_b, root_b, &[(k, v)]);
            }
            proptest::prop_assert_eq!(root_a, root_b);
        }
    }
}
