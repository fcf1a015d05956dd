//! Copy-on-write transaction over a tree root.
//!
//! A transaction materializes only the path it actually touches: nodes
//! it never visits stay as unresolved block ids (`Child::Id`) and are
//! never re-read or re-written. Nodes it writes become in-memory
//! `Child::Node` values that `commit` serializes bottom-up into fresh,
//! content-addressed blocks — old blocks on an untouched path are
//! simply never referenced again by the new root, and stay valid for
//! any older root that still points at them.
//!
//! Storage refcounts follow the same bottom-up walk: `commit` compares,
//! per child, the block id it started from against the one it ends up
//! with, and only issues an `inc_ref`/`dec_ref` pair when they differ.
//! A subtree `delete_range` drops wholesale is never visited by
//! `commit` again, so that path does its own `dec_ref` at the point of
//! the drop.

use tfhfs_block::BlockId;
use tfhfs_storage::StorageHandle;

use crate::node::{Node, MAX_NODE_BYTES, MIN_FILL_FACTOR};
use crate::TreeError;

/// Stand-in for a not-yet-committed child's block id when estimating a
/// node's serialized size. `blake3` ids are always exactly this long,
/// so a node made of placeholders this size serializes to exactly the
/// length the real, committed node will.
const BLOCK_ID_LEN: usize = 32;

pub(crate) enum Child {
    Id(BlockId),
    /// `original` is the block id this node was resolved from, if any
    /// — `None` for a node that has never been committed (e.g. a fresh
    /// split sibling). `commit` uses it to know what on-disk reference
    /// it is replacing.
    Node { original: Option<BlockId>, node: Box<TreeNode> },
}

impl Child {
    fn new_node(node: TreeNode) -> Self {
        Child::Node { original: None, node: Box::new(node) }
    }

    /// The block id this child currently occupies on disk, if it has
    /// one — either because it's still unresolved, or because it was
    /// resolved from one and hasn't been proven to need a new id yet.
    fn known_id(&self) -> Option<&BlockId> {
        match self {
            Child::Id(id) => Some(id),
            Child::Node { original, .. } => original.as_ref(),
        }
    }
}

impl Clone for Child {
    fn clone(&self) -> Self {
        match self {
            Child::Id(id) => Child::Id(id.clone()),
            Child::Node { .. } => panic!("Child::Node is not meant to be cloned mid-transaction"),
        }
    }
}

pub(crate) enum TreeNode {
    Leaf { entries: Vec<(Vec<u8>, Vec<u8>)> },
    Internal { keys: Vec<Vec<u8>>, children: Vec<Child> },
}

impl TreeNode {
    fn len(&self) -> usize {
        match self {
            TreeNode::Leaf { entries } => entries.len(),
            TreeNode::Internal { keys, .. } => keys.len(),
        }
    }

    fn from_wire(node: Node) -> Self {
        match node {
            Node::Leaf { entries } => TreeNode::Leaf { entries },
            Node::Internal { keys, children } => TreeNode::Internal {
                keys,
                children: children.into_iter().map(Child::Id).collect(),
            },
        }
    }

    /// Exact serialized length this node would have if committed right
    /// now: real bytes for a leaf, and for an internal node a 32-byte
    /// placeholder per child not yet known by id (its real id will be
    /// exactly as long once committed).
    fn estimated_len(&self) -> usize {
        match self {
            TreeNode::Leaf { entries } => Node::Leaf { entries: entries.clone() }.serialize().len(),
            TreeNode::Internal { keys, children } => {
                let child_ids = children
                    .iter()
                    .map(|c| c.known_id().cloned().unwrap_or_else(|| vec![0u8; BLOCK_ID_LEN]))
                    .collect();
                Node::Internal { keys: keys.clone(), children: child_ids }.serialize().len()
            }
        }
    }

    fn needs_split(&self) -> bool {
        // Below the soft entry cap a node can never have grown past the
        // byte budget from a single insert, so skip the serialize.
        if self.len() <= crate::node::MAX_NODE_ENTRIES {
            return false;
        }
        self.estimated_len() > MAX_NODE_BYTES
    }

    fn underflows(&self) -> bool {
        self.estimated_len() < MAX_NODE_BYTES / MIN_FILL_FACTOR
    }

    fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf { .. })
    }
}

fn resolve<'a>(storage: &StorageHandle, child: &'a mut Child) -> Result<&'a mut TreeNode, TreeError> {
    if let Child::Id(id) = child {
        let bytes = storage.get_block(id).map_err(TreeError::Storage)?;
        let wire = Node::deserialize(&bytes).map_err(|_| TreeError::Corrupt)?;
        *child = Child::Node { original: Some(id.clone()), node: Box::new(TreeNode::from_wire(wire)) };
    }
    match child {
        Child::Node { node, .. } => Ok(node),
        Child::Id(_) => unreachable!("just resolved above"),
    }
}

/// Result of an insert that overflowed a node: the separator key for
/// the newly split-off right sibling, and the sibling itself.
struct Split {
    separator: Vec<u8>,
    right: Child,
}

fn insert(storage: &StorageHandle, child: &mut Child, key: Vec<u8>, value: Vec<u8>) -> Result<Option<Split>, TreeError> {
    if key.len() > crate::node::MAX_KEY_SIZE {
        return Err(TreeError::KeyTooLarge);
    }
    let node = resolve(storage, child)?;

    match node {
        TreeNode::Leaf { entries } => {
            match Node::leaf_search(entries, &key) {
                Ok(i) => entries[i].1 = value,
                Err(i) => entries.insert(i, (key, value)),
            }
            if node.needs_split() {
                let TreeNode::Leaf { entries } = node else { unreachable!() };
                let mid = entries.len() / 2;
                let right_entries = entries.split_off(mid);
                let separator = right_entries[0].0.clone();
                Ok(Some(Split {
                    separator,
                    right: Child::new_node(TreeNode::Leaf { entries: right_entries }),
                }))
            } else {
                Ok(None)
            }
        }
        TreeNode::Internal { keys, children } => {
            let idx = Node::child_index(keys, &key);
            let split = insert(storage, &mut children[idx], key, value)?;
            let Some(split) = split else { return Ok(None) };

            keys.insert(idx, split.separator);
            children.insert(idx + 1, split.right);

            if node.needs_split() {
                let TreeNode::Internal { keys, children } = node else { unreachable!() };
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.remove(mid);
                let right_children = children.split_off(mid + 1);
                Ok(Some(Split {
                    separator,
                    right: Child::new_node(TreeNode::Internal {
                        keys: right_keys,
                        children: right_children,
                    }),
                }))
            } else {
                Ok(None)
            }
        }
    }
}

fn get(storage: &StorageHandle, child: &mut Child, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
    let node = resolve(storage, child)?;
    match node {
        TreeNode::Leaf { entries } => Ok(Node::leaf_search(entries, key).ok().map(|i| entries[i].1.clone())),
        TreeNode::Internal { keys, children } => {
            let idx = Node::child_index(keys, key);
            get(storage, &mut children[idx], key)
        }
    }
}

pub(crate) enum DeleteOutcome {
    NotFound,
    Removed,
    /// The node this delete descended into is now completely empty;
    /// the caller must drop it (and the separator key pointing at it)
    /// rather than keep an empty child around.
    RemovedEmpty,
}

/// Deletes `key`, cascading `RemovedEmpty` up so an internal node
/// whose last child disappears also reports itself empty. This is what
/// makes "delete every key" converge back to a single empty leaf root
/// instead of leaving a skeleton of now-pointless internal nodes.
fn delete(storage: &StorageHandle, child: &mut Child, key: &[u8]) -> Result<DeleteOutcome, TreeError> {
    let node = resolve(storage, child)?;
    match node {
        TreeNode::Leaf { entries } => match Node::leaf_search(entries, key) {
            Ok(i) => {
                entries.remove(i);
                if entries.is_empty() {
                    Ok(DeleteOutcome::RemovedEmpty)
                } else {
                    Ok(DeleteOutcome::Removed)
                }
            }
            Err(_) => Ok(DeleteOutcome::NotFound),
        },
        TreeNode::Internal { keys, children } => {
            let idx = Node::child_index(keys, key);
            match delete(storage, &mut children[idx], key)? {
                DeleteOutcome::NotFound => Ok(DeleteOutcome::NotFound),
                DeleteOutcome::Removed => {
                    try_merge_with_sibling(storage, keys, children, idx)?;
                    Ok(DeleteOutcome::Removed)
                }
                DeleteOutcome::RemovedEmpty => {
                    children.remove(idx);
                    if !keys.is_empty() {
                        keys.remove(if idx == 0 { 0 } else { idx - 1 });
                    }
                    if children.is_empty() {
                        Ok(DeleteOutcome::RemovedEmpty)
                    } else {
                        Ok(DeleteOutcome::Removed)
                    }
                }
            }
        }
    }
}

/// If the child at `idx` underflowed, try to fold it into an adjacent
/// sibling. Prefers the right sibling; falls back to the left. Only
/// merges nodes of the same kind whose combined size still fits under
/// `MAX_NODE_BYTES`; otherwise leaves both as they are — an underfull
/// node that can't merge is still a correct tree, just a denser one.
fn try_merge_with_sibling(storage: &StorageHandle, keys: &mut Vec<Vec<u8>>, children: &mut Vec<Child>, idx: usize) -> Result<(), TreeError> {
    if !resolve(storage, &mut children[idx])?.underflows() {
        return Ok(());
    }

    let (left_idx, sep_idx) = if idx + 1 < children.len() {
        (idx, idx)
    } else if idx > 0 {
        (idx - 1, idx - 1)
    } else {
        return Ok(());
    };
    let right_idx = left_idx + 1;

    let (left_half, right_half) = children.split_at_mut(right_idx);
    let left = resolve(storage, &mut left_half[left_idx])?;
    let right = resolve(storage, &mut right_half[0])?;
    if left.is_leaf() != right.is_leaf() {
        return Ok(());
    }

    let merged_len = match (left, right) {
        (TreeNode::Leaf { entries: l }, TreeNode::Leaf { entries: r }) => {
            let mut combined = l.clone();
            combined.extend(r.iter().cloned());
            TreeNode::Leaf { entries: combined }.estimated_len()
        }
        (TreeNode::Internal { keys: lk, children: lc }, TreeNode::Internal { keys: rk, children: rc }) => {
            let mut combined_keys = lk.clone();
            combined_keys.push(keys[sep_idx].clone());
            combined_keys.extend(rk.iter().cloned());
            let mut combined_ids: Vec<BlockId> =
                lc.iter().map(|c| c.known_id().cloned().unwrap_or_else(|| vec![0u8; BLOCK_ID_LEN])).collect();
            combined_ids.extend(rc.iter().map(|c| c.known_id().cloned().unwrap_or_else(|| vec![0u8; BLOCK_ID_LEN])));
            Node::Internal { keys: combined_keys, children: combined_ids }.serialize().len()
        }
        _ => unreachable!("kind mismatch ruled out above"),
    };

    if merged_len > MAX_NODE_BYTES {
        return Ok(());
    }

    let right_child = children.remove(right_idx);
    keys.remove(sep_idx);
    let left = resolve(storage, &mut children[left_idx])?;
    match (left, right_child) {
        (TreeNode::Leaf { entries: l }, Child::Node { node, .. }) => {
            let TreeNode::Leaf { entries: r } = *node else { unreachable!() };
            l.extend(r);
        }
        (TreeNode::Leaf { entries: l }, Child::Id(id)) => {
            let bytes = storage.get_block(&id).map_err(TreeError::Storage)?;
            let Node::Leaf { entries: r } = Node::deserialize(&bytes).map_err(|_| TreeError::Corrupt)? else {
                unreachable!("kind mismatch ruled out above")
            };
            l.extend(r);
        }
        (TreeNode::Internal { keys: lk, children: lc }, right_child) => {
            let sep = keys.get(left_idx).cloned().unwrap_or_default();
            let (rk, rc) = match right_child {
                Child::Node { node, .. } => {
                    let TreeNode::Internal { keys, children } = *node else { unreachable!() };
                    (keys, children)
                }
                Child::Id(id) => {
                    let bytes = storage.get_block(&id).map_err(TreeError::Storage)?;
                    let Node::Internal { keys, children } = Node::deserialize(&bytes).map_err(|_| TreeError::Corrupt)? else {
                        unreachable!("kind mismatch ruled out above")
                    };
                    (keys, children.into_iter().map(Child::Id).collect())
                }
            };
            lk.push(sep);
            lk.extend(rk);
            lc.extend(rc);
        }
    }

    Ok(())
}

/// Closed-interval `[start, end]` span a child covers, derived from an
/// internal node's `keys`: child 0 starts unbounded, the last child
/// ends unbounded, everything else is bracketed by its neighbors.
fn child_span(keys: &[Vec<u8>], idx: usize) -> (Option<&[u8]>, Option<&[u8]>) {
    let lo = if idx == 0 { None } else { Some(keys[idx - 1].as_slice()) };
    let hi = if idx == keys.len() { None } else { Some(keys[idx].as_slice()) };
    (lo, hi)
}

/// Whether a span `[lo, hi)` (as stored by `child_span`; `hi` exclusive,
/// `None` meaning unbounded) overlaps the closed query range `[start, end]`.
fn span_overlaps(lo: Option<&[u8]>, hi: Option<&[u8]>, start: &[u8], end: &[u8]) -> bool {
    let below_start = hi.map(|h| h <= start).unwrap_or(false);
    let above_end = lo.map(|l| l > end).unwrap_or(false);
    !below_start && !above_end
}

/// Whether a span `[lo, hi)` is fully contained in the closed query
/// range `[start, end]` — safe to drop wholesale without resolving. The
/// upper bound must be finite and `<= end`; an unbounded upper bound
/// can never be proven contained, since there's no maximum key.
fn span_contained(lo: Option<&[u8]>, hi: Option<&[u8]>, start: &[u8], end: &[u8]) -> bool {
    let lo_ok = match lo {
        None => start.is_empty(),
        Some(l) => l >= start,
    };
    let hi_ok = match hi {
        None => false,
        Some(h) => h <= end,
    };
    lo_ok && hi_ok
}

fn delete_range_rec(storage: &StorageHandle, child: &mut Child, lo: Option<&[u8]>, hi: Option<&[u8]>, start: &[u8], end: &[u8]) -> Result<DeleteOutcome, TreeError> {
    if !span_overlaps(lo, hi, start, end) {
        return Ok(DeleteOutcome::NotFound);
    }

    if span_contained(lo, hi, start, end) {
        if let Some(id) = child.known_id() {
            storage.dec_ref(id);
        }
        return Ok(DeleteOutcome::RemovedEmpty);
    }

    let node = resolve(storage, child)?;
    match node {
        TreeNode::Leaf { entries } => {
            let before = entries.len();
            entries.retain(|(k, _)| !(k.as_slice() >= start && k.as_slice() <= end));
            if entries.is_empty() {
                Ok(DeleteOutcome::RemovedEmpty)
            } else if entries.len() != before {
                Ok(DeleteOutcome::Removed)
            } else {
                Ok(DeleteOutcome::NotFound)
            }
        }
        TreeNode::Internal { keys, children } => {
            let mut changed = false;
            let mut i = 0;
            while i < children.len() {
                let (child_lo, child_hi) = child_span(keys, i);
                let child_lo = child_lo.map(|s| s.to_vec());
                let child_hi = child_hi.map(|s| s.to_vec());
                match delete_range_rec(storage, &mut children[i], child_lo.as_deref(), child_hi.as_deref(), start, end)? {
                    DeleteOutcome::NotFound => i += 1,
                    DeleteOutcome::Removed => {
                        changed = true;
                        try_merge_with_sibling(storage, keys, children, i)?;
                        i += 1;
                    }
                    DeleteOutcome::RemovedEmpty => {
                        changed = true;
                        children.remove(i);
                        if !keys.is_empty() {
                            keys.remove(if i == 0 { 0 } else { i - 1 });
                        }
                    }
                }
            }
            if children.is_empty() {
                Ok(DeleteOutcome::RemovedEmpty)
            } else if changed {
                Ok(DeleteOutcome::Removed)
            } else {
                Ok(DeleteOutcome::NotFound)
            }
        }
    }
}

fn next_key(storage: &StorageHandle, child: &mut Child, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
    let mut best: Option<Vec<u8>> = None;
    collect_bound(storage, child, key, true, &mut best)?;
    Ok(best)
}

fn prev_key(storage: &StorageHandle, child: &mut Child, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
    let mut best: Option<Vec<u8>> = None;
    collect_bound(storage, child, key, false, &mut best)?;
    Ok(best)
}

/// Walks the whole tree looking for the tightest key greater-than (if
/// `forward`) or less-than `key`. A full walk rather than a guided
/// descent, which keeps this correct without a sibling-pointer layer
/// the node format doesn't carry — adequate for this tree's expected
/// size (filesystem metadata, not a billion-row index).
fn collect_bound(storage: &StorageHandle, child: &mut Child, key: &[u8], forward: bool, best: &mut Option<Vec<u8>>) -> Result<(), TreeError> {
    let node = resolve(storage, child)?;
    match node {
        TreeNode::Leaf { entries } => {
            for (k, _) in entries.iter() {
                let candidate = if forward { k.as_slice() > key } else { k.as_slice() < key };
                if candidate {
                    let better = match best {
                        None => true,
                        Some(b) => if forward { k < b } else { k > b },
                    };
                    if better {
                        *best = Some(k.clone());
                    }
                }
            }
            Ok(())
        }
        TreeNode::Internal { children, .. } => {
            for c in children.iter_mut() {
                collect_bound(storage, c, key, forward, best)?;
            }
            Ok(())
        }
    }
}

fn collect_all(storage: &StorageHandle, child: &mut Child, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), TreeError> {
    let node = resolve(storage, child)?;
    match node {
        TreeNode::Leaf { entries } => {
            out.extend(entries.iter().cloned());
            Ok(())
        }
        TreeNode::Internal { children, .. } => {
            for c in children.iter_mut() {
                collect_all(storage, c, out)?;
            }
            Ok(())
        }
    }
}

/// Diffs two subtrees key-by-key, short-circuiting whole subtrees that
/// still share a block id between the two sides — a subtree's content
/// is unchanged iff its id is unchanged, so this never has to resolve
/// (or even descend into) an identical shared branch.
fn diff_into(storage: &StorageHandle, mine: &mut Child, theirs: &mut Child, out: &mut Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>) -> Result<(), TreeError> {
    if let (Some(a), Some(b)) = (mine.known_id(), theirs.known_id()) {
        if a == b {
            return Ok(());
        }
    }

    let mut mine_entries = Vec::new();
    collect_all(storage, mine, &mut mine_entries)?;
    let mut their_entries = Vec::new();
    collect_all(storage, theirs, &mut their_entries)?;

    let mine_map: std::collections::BTreeMap<_, _> = mine_entries.into_iter().collect();
    let their_map: std::collections::BTreeMap<_, _> = their_entries.into_iter().collect();

    for (k, v) in mine_map.iter() {
        match their_map.get(k) {
            Some(old) if old == v => {}
            Some(old) => out.push((Some(old.clone()), Some(v.clone()))),
            None => out.push((None, Some(v.clone()))),
        }
    }
    for (k, old) in their_map.iter() {
        if !mine_map.contains_key(k) {
            out.push((Some(old.clone()), None));
        }
    }
    Ok(())
}

/// Commits a subtree bottom-up, issuing the refcount delta for each
/// child whose block id changed across the commit. A child resolved
/// from `id` and left untouched keeps `original == Some(id)` and is
/// returned as-is by the `Child::Id` short-circuit below, with no
/// refcount traffic at all.
fn commit(storage: &StorageHandle, child: &mut Child) -> Result<BlockId, TreeError> {
    if let Child::Id(id) = child {
        return Ok(id.clone());
    }

    let new_id = {
        let Child::Node { node, .. } = child else { unreachable!() };
        match node.as_mut() {
            TreeNode::Leaf { entries } => {
                let wire = Node::Leaf { entries: entries.clone() };
                let bytes = wire.serialize();
                let id = Node::content_id(&bytes);
                storage
                    .set_block(id.clone(), bytes, tfhfs_block::BlockStatus::Normal)
                    .map_err(TreeError::Storage)?;
                id
            }
            TreeNode::Internal { keys, children } => {
                let mut child_ids = Vec::with_capacity(children.len());
                for c in children.iter_mut() {
                    let old_child_id = c.known_id().cloned();
                    let new_child_id = commit(storage, c)?;
                    if old_child_id.as_ref() != Some(&new_child_id) {
                        if let Some(old) = old_child_id {
                            storage.dec_ref(&old);
                        }
                        storage.inc_ref(&new_child_id);
                    }
                    child_ids.push(new_child_id);
                }
                let wire = Node::Internal { keys: keys.clone(), children: child_ids };
                let bytes = wire.serialize();
                let id = Node::content_id(&bytes);
                storage
                    .set_block(id.clone(), bytes, tfhfs_block::BlockStatus::Normal)
                    .map_err(TreeError::Storage)?;
                id
            }
        }
    };

    *child = Child::Id(new_id.clone());
    Ok(new_id)
}

/// A copy-on-write working copy of one tree root.
pub struct Transaction {
    storage: StorageHandle,
    root: Child,
}

impl Transaction {
    pub(crate) fn new(storage: StorageHandle, root_id: Option<BlockId>) -> Self {
        let root = match root_id {
            Some(id) => Child::Id(id),
            None => Child::new_node(TreeNode::Leaf { entries: Vec::new() }),
        };
        Self { storage, root }
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        get(&self.storage, &mut self.root, key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), TreeError> {
        let split = insert(&self.storage, &mut self.root, key.to_vec(), value.to_vec())?;
        if let Some(split) = split {
            let old_root = std::mem::replace(&mut self.root, Child::Id(Vec::new()));
            self.root = Child::new_node(TreeNode::Internal {
                keys: vec![split.separator],
                children: vec![old_root, split.right],
            });
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool, TreeError> {
        match delete(&self.storage, &mut self.root, key)? {
            DeleteOutcome::NotFound => Ok(false),
            DeleteOutcome::Removed => Ok(true),
            DeleteOutcome::RemovedEmpty => {
                self.root = Child::new_node(TreeNode::Leaf { entries: Vec::new() });
                Ok(true)
            }
        }
    }

    /// Deletes every key in the closed interval `[start, end]`.
    /// Subtrees fully contained in the range are dropped wholesale
    /// (and their own block id dec-ref'd directly, since `commit` will
    /// never see them again) without resolving their contents; only
    /// subtrees straddling the range boundary are walked key-by-key.
    /// Returns whether anything was removed.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<bool, TreeError> {
        match delete_range_rec(&self.storage, &mut self.root, None, None, start, end)? {
            DeleteOutcome::NotFound => Ok(false),
            DeleteOutcome::Removed => Ok(true),
            DeleteOutcome::RemovedEmpty => {
                self.root = Child::new_node(TreeNode::Leaf { entries: Vec::new() });
                Ok(true)
            }
        }
    }

    pub fn next_key(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        next_key(&self.storage, &mut self.root, key)
    }

    pub fn prev_key(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        prev_key(&self.storage, &mut self.root, key)
    }

    /// Keys that differ between this transaction and `other`, as
    /// `(old_value, new_value)` pairs — `None` on one side for a pure
    /// add/delete. Shares a block id for an untouched subtree skip the
    /// walk entirely rather than resolving and re-diffing content that
    /// provably hasn't changed.
    pub fn iterate_delta(&mut self, other: &mut Transaction) -> Result<Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>, TreeError> {
        let mut delta = Vec::new();
        diff_into(&self.storage, &mut self.root, &mut other.root, &mut delta)?;
        Ok(delta)
    }

    /// Serializes every dirty node bottom-up and returns the new root
    /// block id. Calling this on a transaction with no pending writes
    /// returns the same id it started from without touching storage.
    pub fn commit(&mut self) -> Result<BlockId, TreeError> {
        let id = commit(&self.storage, &mut self.root)?;
        self.storage.flush().map_err(TreeError::Storage)?;
        Ok(id)
    }
}
