//! The B+ tree is the data structure behind both tables and indexes.
//!
//! Why a tree?
//! - Searching for a particular key is fast (logarithmic time)
//! - Inserting / deleting a key you have already found is fast
//! - Traversing a range of keys is fast (unlike a hash map)
//!
//! All data lives in the leaves; internal nodes only route. The leaves form
//! a doubly linked list in ascending key order, so ordered and ranged scans
//! walk sideways in O(k) instead of descending from the root per entry.
//!
//! Nodes are stored in a [`NodeArena`], a slab addressed by [`NodeId`].
//! The arena owns every node; parent and sibling links are bare ids, so the
//! child-parent cycle never turns into an ownership cycle. Releasing a node
//! returns its slot to a free list for reuse.

use super::node::{InternalNode, LeafNode, Node, NodeId};
use crate::errors::Error;
use std::fmt;
use tracing::trace;

/// Default order (maximum children per internal node) for trees that back
/// engine tables. Tests use much smaller orders to force rebalancing early.
pub const DEFAULT_ORDER: usize = 64;

/// Slab of nodes addressed by [`NodeId`]. Freed slots are recycled.
pub(crate) struct NodeArena<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
}

impl<K: Ord + Clone, V> NodeArena<K, V> {
    fn new() -> Self {
        NodeArena {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn get(&self, id: NodeId) -> Result<&Node<K, V>, Error> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| err!(Storage, "Node {} not found in arena", id.0))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut Node<K, V>, Error> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| err!(Storage, "Node {} not found in arena", id.0))
    }

    /// Takes the node out of the arena and recycles its slot.
    fn release(&mut self, id: NodeId) -> Result<Node<K, V>, Error> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| err!(Storage, "Node {} not found in arena", id.0))?;
        self.free.push(id.0);
        Ok(node)
    }

    /// Mutable access to two distinct nodes at once.
    fn pair_mut(
        &mut self,
        a: NodeId,
        b: NodeId,
    ) -> Result<(&mut Node<K, V>, &mut Node<K, V>), Error> {
        if a == b {
            return Err(err!(Storage, "Cannot borrow node {} twice", a.0));
        }
        let (low, high) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        if high >= self.nodes.len() {
            return Err(err!(Storage, "Node {} not found in arena", high));
        }
        let (head, tail) = self.nodes.split_at_mut(high);
        let low_node = head[low]
            .as_mut()
            .ok_or_else(|| err!(Storage, "Node {} not found in arena", low))?;
        let high_node = tail[0]
            .as_mut()
            .ok_or_else(|| err!(Storage, "Node {} not found in arena", high))?;
        if a.0 < b.0 {
            Ok((low_node, high_node))
        } else {
            Ok((high_node, low_node))
        }
    }
}

/// Ordered index over keys `K` with values `V`, balanced to the fixed order
/// chosen at construction.
pub struct BPlusTree<K, V> {
    arena: NodeArena<K, V>,
    root: NodeId,
    order: usize,
}

impl<K, V> BPlusTree<K, V>
where
    K: Ord + Clone + fmt::Debug,
{
    /// Creates an empty tree: a single empty leaf as root.
    ///
    /// # Panics
    /// Panics if `order` is below 3; a multiway node needs room for at least
    /// two keys.
    pub fn new(order: usize) -> Self {
        assert!(order >= 3, "B+ tree order must be at least 3");
        let mut arena = NodeArena::new();
        let root = arena.alloc(Node::Leaf(LeafNode::new()));
        BPlusTree { arena, root, order }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the value stored under `key`, if present.
    pub fn get(&self, key: &K) -> Option<&V> {
        let leaf_id = self.find_leaf(key).ok()?;
        self.arena.get(leaf_id).ok()?.as_leaf().ok()?.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries in the tree, computed as the recursive size of the
    /// root (leaf: key count; internal: sum over children).
    pub fn len(&self) -> usize {
        self.node_size(self.root).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Height of the tree: 1 for a lone leaf root, +1 per internal level.
    pub fn height(&self) -> usize {
        self.node_height(self.root).unwrap_or(0)
    }

    /// Smallest key in the tree.
    pub fn min_key(&self) -> Option<&K> {
        let leaf_id = self.first_leaf().ok()?;
        self.arena.get(leaf_id).ok()?.as_leaf().ok()?.keys.first()
    }

    /// Largest key in the tree.
    pub fn max_key(&self) -> Option<&K> {
        let leaf_id = self.last_leaf().ok()?;
        self.arena.get(leaf_id).ok()?.as_leaf().ok()?.keys.last()
    }

    /// Inserts a key-value pair. Returns `true` iff the key was new; an
    /// existing key has its value replaced and the size does not change.
    ///
    /// # Errors
    /// Returns `Error::Storage` only on internal structure corruption.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, Error> {
        let leaf_id = self.find_leaf(&key)?;
        let replaced = self
            .arena
            .get_mut(leaf_id)?
            .as_leaf_mut()?
            .insert(key, value)
            .is_some();
        if replaced {
            return Ok(false);
        }
        if self.arena.get(leaf_id)?.is_overfull(self.order) {
            self.split_node(leaf_id)?;
        }
        Ok(true)
    }

    /// Removes a key and returns its value.
    ///
    /// # Errors
    /// Returns `Error::Storage` when the key is absent.
    pub fn delete(&mut self, key: &K) -> Result<V, Error> {
        let leaf_id = self.find_leaf(key)?;
        let value = self
            .arena
            .get_mut(leaf_id)?
            .as_leaf_mut()?
            .remove(key)
            .ok_or_else(|| err!(Storage, "Key {:?} not found", key))?;
        self.rebalance(leaf_id)?;
        Ok(value)
    }

    /// Collects every entry with key in `[start, end]`, ascending.
    ///
    /// # Errors
    /// Returns `Error::Storage` when `start > end`.
    pub fn range_query(&self, start: &K, end: &K) -> Result<Vec<(K, V)>, Error>
    where
        V: Clone,
    {
        let mut entries = Vec::new();
        for (key, value) in self.range(start, end)? {
            entries.push((key.clone(), value.clone()));
        }
        Ok(entries)
    }

    /// Lazy iterator over entries with key in `[start, end]`, ascending.
    ///
    /// The start leaf is located by descending from the root, then the leaf
    /// list is walked forward until the first key past `end`.
    ///
    /// # Errors
    /// Returns `Error::Storage` when `start > end`.
    pub fn range(&self, start: &K, end: &K) -> Result<RangeIter<'_, K, V>, Error> {
        if start > end {
            return Err(err!(
                Storage,
                "Invalid range: start {:?} is greater than end {:?}",
                start,
                end
            ));
        }
        let leaf_id = self.find_leaf(start)?;
        let leaf = self.arena.get(leaf_id)?.as_leaf()?;
        let position = leaf.keys.partition_point(|key| key < start);
        Ok(RangeIter {
            tree: self,
            leaf: Some(leaf_id),
            position,
            end: end.clone(),
        })
    }

    /// Lazy iterator over all entries in ascending key order. Every call
    /// yields an independently positioned sequence.
    pub fn entries(&self) -> EntryIter<'_, K, V> {
        EntryIter {
            tree: self,
            leaf: self.first_leaf().ok(),
            position: 0,
        }
    }

    /// Lazy iterator over all keys in ascending order.
    pub fn keys(&self) -> KeyIter<'_, K, V> {
        KeyIter {
            inner: self.entries(),
        }
    }

    /// Lazy iterator over all values in ascending key order.
    pub fn values(&self) -> ValueIter<'_, K, V> {
        ValueIter {
            inner: self.entries(),
        }
    }

    /// Releases the whole node graph and resets to a fresh empty root.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.release_subtree(self.root)?;
        self.root = self.arena.alloc(Node::Leaf(LeafNode::new()));
        Ok(())
    }

    // --- descent helpers ---

    /// Descends from the root to the leaf whose range owns `key`.
    fn find_leaf(&self, key: &K) -> Result<NodeId, Error> {
        let mut current = self.root;
        loop {
            match self.arena.get(current)? {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(internal) => current = internal.child_for(key)?,
            }
        }
    }

    fn first_leaf(&self) -> Result<NodeId, Error> {
        let mut current = self.root;
        loop {
            match self.arena.get(current)? {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(internal) => {
                    current = internal
                        .children
                        .first()
                        .copied()
                        .ok_or_else(|| err!(Storage, "Internal node without children"))?;
                }
            }
        }
    }

    fn last_leaf(&self) -> Result<NodeId, Error> {
        let mut current = self.root;
        loop {
            match self.arena.get(current)? {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(internal) => {
                    current = internal
                        .children
                        .last()
                        .copied()
                        .ok_or_else(|| err!(Storage, "Internal node without children"))?;
                }
            }
        }
    }

    fn node_size(&self, id: NodeId) -> Result<usize, Error> {
        match self.arena.get(id)? {
            Node::Leaf(leaf) => Ok(leaf.keys.len()),
            Node::Internal(internal) => {
                let mut total = 0;
                for child in &internal.children {
                    total += self.node_size(*child)?;
                }
                Ok(total)
            }
        }
    }

    fn node_height(&self, id: NodeId) -> Result<usize, Error> {
        match self.arena.get(id)? {
            Node::Leaf(_) => Ok(1),
            Node::Internal(internal) => {
                // Every leaf sits at equal depth; the first child stands in
                // for all of them.
                let child = internal
                    .children
                    .first()
                    .copied()
                    .ok_or_else(|| err!(Storage, "Internal node without children"))?;
                Ok(1 + self.node_height(child)?)
            }
        }
    }

    // --- sibling navigation ---

    /// Position of this node in its parent's child array, by id identity.
    fn index_in_parent(&self, id: NodeId) -> Result<Option<usize>, Error> {
        let parent_id = match self.arena.get(id)?.parent() {
            Some(parent_id) => parent_id,
            None => return Ok(None),
        };
        let parent = self.arena.get(parent_id)?.as_internal()?;
        match parent.child_position(id) {
            Some(index) => Ok(Some(index)),
            None => Err(err!(
                Storage,
                "Node {} is not among its parent's children",
                id.0
            )),
        }
    }

    fn left_sibling(&self, id: NodeId) -> Result<Option<NodeId>, Error> {
        let index = match self.index_in_parent(id)? {
            Some(index) if index > 0 => index,
            _ => return Ok(None),
        };
        let parent_id = match self.arena.get(id)?.parent() {
            Some(parent_id) => parent_id,
            None => return Ok(None),
        };
        let parent = self.arena.get(parent_id)?.as_internal()?;
        Ok(parent.children.get(index - 1).copied())
    }

    fn right_sibling(&self, id: NodeId) -> Result<Option<NodeId>, Error> {
        let index = match self.index_in_parent(id)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let parent_id = match self.arena.get(id)?.parent() {
            Some(parent_id) => parent_id,
            None => return Ok(None),
        };
        let parent = self.arena.get(parent_id)?.as_internal()?;
        Ok(parent.children.get(index + 1).copied())
    }

    // --- split path ---

    /// Splits an overfull node and propagates the promoted separator upward,
    /// growing a new root when the split reaches it.
    fn split_node(&mut self, node_id: NodeId) -> Result<(), Error> {
        let order = self.order;
        let (promoted, right_node) = match self.arena.get_mut(node_id)? {
            Node::Leaf(leaf) => {
                trace!("Splitting a leaf node...");
                let (promoted, right) = leaf.split(order);
                (promoted, Node::Leaf(right))
            }
            Node::Internal(internal) => {
                trace!("Splitting an internal node...");
                let (promoted, right) = internal.split(order);
                (promoted, Node::Internal(right))
            }
        };
        let right_id = self.arena.alloc(right_node);

        // Whenever we split a leaf, splice the new leaf into the list right
        // after the original: old.next becomes the new leaf, and the new
        // leaf's next is whatever used to follow the old one.
        let mut stale_next = None;
        if let Node::Leaf(right_leaf) = self.arena.get_mut(right_id)? {
            right_leaf.prev = Some(node_id);
            stale_next = right_leaf.next;
        }
        if let Node::Leaf(left_leaf) = self.arena.get_mut(node_id)? {
            left_leaf.next = Some(right_id);
        }
        if let Some(next_id) = stale_next {
            self.arena.get_mut(next_id)?.as_leaf_mut()?.prev = Some(right_id);
        }

        // Children that moved to the right half now answer to it.
        self.reparent_children(right_id)?;

        match self.arena.get(node_id)?.parent() {
            None => {
                // The root split: a new internal root adopts both halves and
                // the tree grows one level.
                trace!("Creating a new root...");
                let mut new_root = InternalNode::new();
                new_root.keys.push(promoted);
                new_root.children.push(node_id);
                new_root.children.push(right_id);
                let root_id = self.arena.alloc(Node::Internal(new_root));
                self.arena.get_mut(node_id)?.set_parent(Some(root_id));
                self.arena.get_mut(right_id)?.set_parent(Some(root_id));
                self.root = root_id;
            }
            Some(parent_id) => {
                self.arena
                    .get_mut(parent_id)?
                    .insert_key_and_child(promoted, right_id)?;
                self.arena.get_mut(right_id)?.set_parent(Some(parent_id));
                if self.arena.get(parent_id)?.is_overfull(order) {
                    self.split_node(parent_id)?;
                }
            }
        }
        Ok(())
    }

    fn reparent_children(&mut self, node_id: NodeId) -> Result<(), Error> {
        let child_ids = match self.arena.get(node_id)? {
            Node::Internal(internal) => internal.children.clone(),
            Node::Leaf(_) => return Ok(()),
        };
        for child_id in child_ids {
            self.arena.get_mut(child_id)?.set_parent(Some(node_id));
        }
        Ok(())
    }

    // --- delete path ---

    /// Walks from a shrunken node upward, fixing every underflow by
    /// borrowing when a sibling has surplus and merging otherwise. Borrow is
    /// O(1); merge is O(node size) and can push the underflow one level up.
    fn rebalance(&mut self, start: NodeId) -> Result<(), Error> {
        let mut node_id = start;
        loop {
            if node_id == self.root {
                self.collapse_root()?;
                return Ok(());
            }
            if !self.arena.get(node_id)?.is_underfull(self.order) {
                return Ok(());
            }
            let parent_id = match self.arena.get(node_id)?.parent() {
                Some(parent_id) => parent_id,
                None => return Ok(()),
            };
            if self.try_borrow(node_id, parent_id)? {
                return Ok(());
            }
            self.merge_with_sibling(node_id, parent_id)?;
            node_id = parent_id;
        }
    }

    /// A zero-key internal root hands the tree over to its sole child and
    /// the height shrinks by one.
    fn collapse_root(&mut self) -> Result<(), Error> {
        let sole_child = match self.arena.get(self.root)? {
            Node::Internal(internal) if internal.keys.is_empty() => {
                internal.children.first().copied()
            }
            _ => None,
        };
        if let Some(child_id) = sole_child {
            trace!("Collapsing the root into its only child...");
            self.arena.release(self.root)?;
            self.arena.get_mut(child_id)?.set_parent(None);
            self.root = child_id;
        }
        Ok(())
    }

    /// Tries to pull one key from the left, then the right sibling.
    fn try_borrow(&mut self, node_id: NodeId, parent_id: NodeId) -> Result<bool, Error> {
        let index = match self.index_in_parent(node_id)? {
            Some(index) => index,
            None => return Ok(false),
        };
        if let Some(left_id) = self.left_sibling(node_id)? {
            if self.borrow_from(node_id, left_id, parent_id, index - 1, true)? {
                return Ok(true);
            }
        }
        if let Some(right_id) = self.right_sibling(node_id)? {
            if self.borrow_from(node_id, right_id, parent_id, index, false)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Moves exactly one key (and, between internal nodes, the adjacent
    /// child) across the sibling boundary. The parent separator at
    /// `separator_index` is replaced by the separator the move produced.
    fn borrow_from(
        &mut self,
        node_id: NodeId,
        sibling_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
        from_left: bool,
    ) -> Result<bool, Error> {
        let order = self.order;
        let separator = self
            .arena
            .get(parent_id)?
            .as_internal()?
            .keys
            .get(separator_index)
            .cloned()
            .ok_or_else(|| err!(Storage, "Missing separator at index {}", separator_index))?;

        let outcome = {
            let (node, sibling) = self.arena.pair_mut(node_id, sibling_id)?;
            match (node, sibling) {
                (Node::Leaf(node), Node::Leaf(sibling)) => {
                    let new_separator = if from_left {
                        node.borrow_from_left(sibling, order)
                    } else {
                        node.borrow_from_right(sibling, order)
                    };
                    new_separator.map(|separator| (separator, None))
                }
                (Node::Internal(node), Node::Internal(sibling)) => {
                    let moved = if from_left {
                        node.borrow_from_left(sibling, separator, order)
                    } else {
                        node.borrow_from_right(sibling, separator, order)
                    };
                    moved.map(|(separator, child)| (separator, Some(child)))
                }
                _ => None,
            }
        };

        match outcome {
            None => Ok(false),
            Some((new_separator, moved_child)) => {
                trace!("Borrowed one key from a sibling...");
                let parent = self.arena.get_mut(parent_id)?.as_internal_mut()?;
                if let Some(slot) = parent.keys.get_mut(separator_index) {
                    *slot = new_separator;
                }
                if let Some(child_id) = moved_child {
                    self.arena.get_mut(child_id)?.set_parent(Some(node_id));
                }
                Ok(true)
            }
        }
    }

    /// Merges the underflowing node with a sibling: into the left one when
    /// it exists, otherwise the right sibling is absorbed into the node.
    fn merge_with_sibling(&mut self, node_id: NodeId, parent_id: NodeId) -> Result<(), Error> {
        let index = self.index_in_parent(node_id)?.ok_or_else(|| {
            err!(Storage, "Cannot merge a node that has no parent")
        })?;
        let order = self.order;

        if let Some(left_id) = self.left_sibling(node_id)? {
            if self.arena.get(left_id)?.can_merge_with(self.arena.get(node_id)?, order) {
                return self.merge_nodes(left_id, node_id, parent_id, index - 1);
            }
        }
        if let Some(right_id) = self.right_sibling(node_id)? {
            if self.arena.get(node_id)?.can_merge_with(self.arena.get(right_id)?, order) {
                return self.merge_nodes(node_id, right_id, parent_id, index);
            }
        }
        Err(err!(
            Storage,
            "Unable to rebalance node {}: no sibling can absorb it",
            node_id.0
        ))
    }

    /// Absorbs `right_id` into `left_id`, consuming the parent separator at
    /// `separator_index` and releasing the donor node.
    fn merge_nodes(
        &mut self,
        left_id: NodeId,
        right_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
    ) -> Result<(), Error> {
        trace!("Merging a node into its sibling...");
        let separator = {
            let parent = self.arena.get_mut(parent_id)?.as_internal_mut()?;
            let separator = parent.keys.remove(separator_index);
            parent.children.remove(separator_index + 1);
            separator
        };

        let mut donor = self.arena.release(right_id)?;
        match (self.arena.get_mut(left_id)?, &mut donor) {
            (Node::Leaf(left), Node::Leaf(right)) => {
                // Leaf merges do not need the separator; leaf keys carry
                // their own order.
                left.merge_from(right);
            }
            (Node::Internal(left), Node::Internal(right)) => {
                left.merge_from(separator, right);
            }
            _ => return Err(err!(Storage, "Sibling kind mismatch during merge")),
        }

        // Re-link the leaf list across the removed node.
        let next = match self.arena.get(left_id)? {
            Node::Leaf(leaf) => leaf.next,
            Node::Internal(_) => None,
        };
        if let Some(next_id) = next {
            self.arena.get_mut(next_id)?.as_leaf_mut()?.prev = Some(left_id);
        }

        self.reparent_children(left_id)?;
        Ok(())
    }

    fn release_subtree(&mut self, id: NodeId) -> Result<(), Error> {
        let children = match self.arena.get(id)? {
            Node::Internal(internal) => internal.children.clone(),
            Node::Leaf(_) => Vec::new(),
        };
        for child_id in children {
            self.release_subtree(child_id)?;
        }
        self.arena.release(id)?;
        Ok(())
    }
}

/// Forward walk over every entry, leftmost leaf onward.
pub struct EntryIter<'a, K, V> {
    tree: &'a BPlusTree<K, V>,
    leaf: Option<NodeId>,
    position: usize,
}

impl<'a, K, V> Iterator for EntryIter<'a, K, V>
where
    K: Ord + Clone + fmt::Debug,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        loop {
            let leaf_id = self.leaf?;
            let leaf = tree.arena.get(leaf_id).ok()?.as_leaf().ok()?;
            if self.position < leaf.keys.len() {
                let index = self.position;
                self.position += 1;
                return Some((&leaf.keys[index], &leaf.values[index]));
            }
            self.leaf = leaf.next;
            self.position = 0;
        }
    }
}

/// Forward walk over every key.
pub struct KeyIter<'a, K, V> {
    inner: EntryIter<'a, K, V>,
}

impl<'a, K, V> Iterator for KeyIter<'a, K, V>
where
    K: Ord + Clone + fmt::Debug,
{
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }
}

/// Forward walk over every value, in ascending key order.
pub struct ValueIter<'a, K, V> {
    inner: EntryIter<'a, K, V>,
}

impl<'a, K, V> Iterator for ValueIter<'a, K, V>
where
    K: Ord + Clone + fmt::Debug,
{
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, value)| value)
    }
}

/// Forward walk over entries with keys in `[start, end]`.
pub struct RangeIter<'a, K, V> {
    tree: &'a BPlusTree<K, V>,
    leaf: Option<NodeId>,
    position: usize,
    end: K,
}

impl<'a, K, V> Iterator for RangeIter<'a, K, V>
where
    K: Ord + Clone + fmt::Debug,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        loop {
            let leaf_id = self.leaf?;
            let leaf = tree.arena.get(leaf_id).ok()?.as_leaf().ok()?;
            if self.position < leaf.keys.len() {
                let index = self.position;
                self.position += 1;
                let key = &leaf.keys[index];
                if *key > self.end {
                    self.leaf = None;
                    return None;
                }
                return Some((key, &leaf.values[index]));
            }
            self.leaf = leaf.next;
            self.position = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::{max_keys, min_keys};
    use std::collections::BTreeMap;

    /// Walks the whole structure and asserts every B+ tree invariant: key
    /// bounds per subtree, child/parent link symmetry, occupancy limits,
    /// uniform leaf depth, and a consistent doubly linked leaf list.
    fn check_invariants(tree: &BPlusTree<u32, String>) {
        let mut leaf_depth: Option<usize> = None;
        check_node(tree, tree.root, None, None, 1, &mut leaf_depth, true);

        // The leaf list must visit every key exactly once, ascending, with
        // mirrored prev links.
        let mut walked = 0;
        let mut last_key: Option<u32> = None;
        let mut prev_leaf: Option<NodeId> = None;
        let mut current = Some(tree.first_leaf().unwrap());
        while let Some(leaf_id) = current {
            let leaf = tree.arena.get(leaf_id).unwrap().as_leaf().unwrap();
            assert_eq!(leaf.prev, prev_leaf, "prev link out of sync");
            for key in &leaf.keys {
                if let Some(last) = last_key {
                    assert!(last < *key, "leaf list keys not strictly ascending");
                }
                last_key = Some(*key);
                walked += 1;
            }
            prev_leaf = Some(leaf_id);
            current = leaf.next;
        }
        assert_eq!(walked, tree.len(), "leaf list misses entries");
    }

    fn check_node(
        tree: &BPlusTree<u32, String>,
        id: NodeId,
        low: Option<u32>,
        high: Option<u32>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        is_root: bool,
    ) {
        let node = tree.arena.get(id).unwrap();
        if !is_root {
            assert!(
                node.key_count() >= min_keys(tree.order),
                "non-root node below minimum occupancy"
            );
        }
        assert!(
            node.key_count() <= max_keys(tree.order),
            "node above maximum occupancy"
        );

        match node {
            Node::Leaf(leaf) => {
                match leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) => assert_eq!(*expected, depth, "leaves at unequal depth"),
                }
                assert_eq!(leaf.keys.len(), leaf.values.len());
                for window in leaf.keys.windows(2) {
                    assert!(window[0] < window[1], "leaf keys not strictly ascending");
                }
                for key in &leaf.keys {
                    if let Some(low) = low {
                        assert!(*key >= low, "leaf key below subtree bound");
                    }
                    if let Some(high) = high {
                        assert!(*key < high, "leaf key above subtree bound");
                    }
                }
            }
            Node::Internal(internal) => {
                assert!(!internal.keys.is_empty() || is_root);
                assert_eq!(internal.children.len(), internal.keys.len() + 1);
                for window in internal.keys.windows(2) {
                    assert!(window[0] < window[1], "separators not strictly ascending");
                }
                for (child_index, child_id) in internal.children.iter().enumerate() {
                    let child = tree.arena.get(*child_id).unwrap();
                    assert_eq!(child.parent(), Some(id), "child parent link broken");
                    let child_low = if child_index == 0 {
                        low
                    } else {
                        Some(internal.keys[child_index - 1])
                    };
                    let child_high = if child_index == internal.keys.len() {
                        high
                    } else {
                        Some(internal.keys[child_index])
                    };
                    check_node(tree, *child_id, child_low, child_high, depth + 1, leaf_depth, false);
                }
            }
        }
    }

    fn tree_with(order: usize, keys: &[u32]) -> BPlusTree<u32, String> {
        let mut tree = BPlusTree::new(order);
        for key in keys {
            tree.insert(*key, format!("value-{}", key)).unwrap();
        }
        tree
    }

    #[test]
    fn test_empty_tree() {
        let tree: BPlusTree<u32, String> = BPlusTree::new(4);
        assert_eq!(tree.len(), 0);
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.min_key(), None);
        assert_eq!(tree.max_key(), None);
        assert_eq!(tree.entries().count(), 0);
    }

    #[test]
    fn test_insert_and_get_small_scenario() {
        // Order-4 scenario: {5, 1, 9, 3} fits in a single leaf... almost.
        let tree = tree_with(4, &[5, 1, 9, 3]);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.min_key(), Some(&1));
        assert_eq!(tree.max_key(), Some(&9));
        let keys: Vec<u32> = tree.keys().copied().collect();
        assert_eq!(keys, vec![1, 3, 5, 9]);
        assert_eq!(tree.get(&5), Some(&"value-5".to_string()));
        assert_eq!(tree.get(&4), None);
        check_invariants(&tree);
    }

    #[test]
    fn test_reinsert_existing_key_keeps_size() {
        let mut tree = tree_with(4, &[1, 2, 3]);
        assert!(!tree.insert(2, "replacement".to_string()).unwrap());
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get(&2), Some(&"replacement".to_string()));
    }

    #[test]
    fn test_sequential_insert_splits_root() {
        // Order 4: five sequential keys force exactly one leaf split.
        let tree = tree_with(4, &[1, 2, 3, 4, 5]);
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.len(), 5);

        // The two leaves partition the key set with no overlap or gap.
        let first = tree.first_leaf().unwrap();
        let left = tree.arena.get(first).unwrap().as_leaf().unwrap();
        let right_id = left.next.expect("two leaves expected");
        let right = tree.arena.get(right_id).unwrap().as_leaf().unwrap();
        assert_eq!(left.keys, vec![1, 2]);
        assert_eq!(right.keys, vec![3, 4, 5]);
        assert_eq!(right.next, None);
        check_invariants(&tree);
    }

    #[test]
    fn test_round_trip_insert_delete() {
        let mut tree = tree_with(4, &[10, 20, 30]);
        assert_eq!(tree.delete(&20).unwrap(), "value-20");
        assert_eq!(tree.get(&20), None);
        assert_eq!(tree.len(), 2);

        // A second delete of the same key is a structural error.
        let err = tree.delete(&20).unwrap_err();
        assert_eq!(err.code(), 1000);
    }

    #[test]
    fn test_delete_triggers_borrow_and_merge() {
        let mut tree = tree_with(4, &(1..=20).collect::<Vec<u32>>());
        check_invariants(&tree);
        for key in [4, 8, 12, 16, 20, 1, 2, 3] {
            tree.delete(&key).unwrap();
            check_invariants(&tree);
        }
        assert_eq!(tree.len(), 12);
    }

    #[test]
    fn test_drain_tree_collapses_to_single_leaf() {
        let keys: Vec<u32> = (1..=50).collect();
        let mut tree = tree_with(4, &keys);
        assert!(tree.height() > 2);
        for key in &keys {
            tree.delete(key).unwrap();
            check_invariants(&tree);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
    }

    #[test]
    fn test_range_query_laws() {
        let tree = tree_with(4, &[1, 3, 5, 7, 9, 11, 13]);

        let range: Vec<u32> = tree
            .range_query(&4, &11)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(range, vec![5, 7, 9, 11]);

        // A singleton range on a present key yields exactly that key.
        let single = tree.range_query(&7, &7).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].0, 7);

        // Bounds beyond both ends cover everything.
        assert_eq!(tree.range_query(&0, &100).unwrap().len(), 7);

        // Inverted bounds are refused.
        assert!(tree.range_query(&5, &4).is_err());
    }

    #[test]
    fn test_range_iterator_is_lazy_and_bounded() {
        let tree = tree_with(4, &(1..=30).collect::<Vec<u32>>());
        let collected: Vec<u32> = tree.range(&10, &15).unwrap().map(|(k, _)| *k).collect();
        assert_eq!(collected, vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_iterators_are_independently_positioned() {
        let tree = tree_with(4, &[2, 4, 6]);
        let mut first = tree.keys();
        let mut second = tree.keys();
        assert_eq!(first.next(), Some(&2));
        assert_eq!(first.next(), Some(&4));
        assert_eq!(second.next(), Some(&2));
    }

    #[test]
    fn test_values_iterator_in_key_order() {
        let tree = tree_with(4, &[3, 1, 2]);
        let values: Vec<&String> = tree.values().collect();
        assert_eq!(
            values,
            vec![&"value-1".to_string(), &"value-2".to_string(), &"value-3".to_string()]
        );
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut tree = tree_with(4, &(1..=40).collect::<Vec<u32>>());
        tree.clear().unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert!(tree.insert(7, "value-7".to_string()).unwrap());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_against_reference_model() {
        // Deterministic pseudo-random insert/delete stream checked against
        // std's ordered map after every operation.
        let mut tree: BPlusTree<u32, String> = BPlusTree::new(4);
        let mut model: BTreeMap<u32, String> = BTreeMap::new();
        let mut state: u64 = 0x5DEECE66D;
        for _ in 0..500 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let key = (state >> 33) as u32 % 64;
            let value = format!("value-{}", key);
            if state % 3 == 0 && model.contains_key(&key) {
                tree.delete(&key).unwrap();
                model.remove(&key);
            } else {
                let was_new = tree.insert(key, value.clone()).unwrap();
                assert_eq!(was_new, model.insert(key, value).is_none());
            }
            check_invariants(&tree);
        }
        let from_tree: Vec<(u32, String)> = tree
            .entries()
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        let from_model: Vec<(u32, String)> = model.into_iter().collect();
        assert_eq!(from_tree, from_model);
    }

    #[test]
    fn test_larger_order_stays_balanced() {
        let keys: Vec<u32> = (0..300).map(|i| (i * 37) % 1000).collect();
        let mut tree: BPlusTree<u32, String> = BPlusTree::new(8);
        let mut model = BTreeMap::new();
        for key in &keys {
            tree.insert(*key, format!("value-{}", key)).unwrap();
            model.insert(*key, ());
        }
        assert_eq!(tree.len(), model.len());
        let collected: Vec<u32> = tree.keys().copied().collect();
        let expected: Vec<u32> = model.keys().copied().collect();
        assert_eq!(collected, expected);
    }
}
