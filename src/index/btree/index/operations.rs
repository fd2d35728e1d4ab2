use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{internal_from_entries, BTreeNode, InternalNode, LeafNode};
use crate::index::btree::serialization::{deserialize_node, serialize_node};

use super::base::{BTreeIndex, WriteContext, WriteOp};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Point lookup. Descends with read latches, releasing each parent as
    /// soon as the child is latched.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root)?;
        drop(root);

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            match node {
                BTreeNode::Leaf(leaf) => return Ok(leaf.lookup(key)),
                BTreeNode::Internal(internal) => {
                    let child = internal.child(internal.find_child(key));
                    // Assignment latches the child before the parent guard
                    // drops, which is exactly the crabbing order.
                    guard = self.buffer_pool.fetch_page_read(child)?;
                }
            }
        }
    }

    /// Insert a key/value pair. Duplicate keys are rejected.
    pub fn insert(&self, key: K, value: Rid) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let root_guard = self.root_page_id.write();

        let mut ctx = WriteContext {
            header: Some(header),
            root_guard: Some(root_guard),
            path: Vec::new(),
        };

        if ctx.root_guard.as_ref().map(|g| **g) == Some(INVALID_PAGE_ID) {
            return self.start_new_tree(&mut ctx, key, value);
        }

        let mut leaf_entry = self.descend_for_write(&mut ctx, &key, WriteOp::Insert)?;
        let leaf = match &mut leaf_entry.node {
            BTreeNode::Leaf(leaf) => leaf,
            BTreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
        };

        let pos = match leaf.keys.binary_search(&key) {
            Ok(_) => return Err(BTreeError::DuplicateKey),
            Err(pos) => pos,
        };

        if leaf.keys.len() < self.leaf_max_size {
            leaf.insert_at(pos, key, value);
            return Self::write_node(&leaf_entry.node, &mut leaf_entry.guard);
        }

        // Full leaf: split before insert. The right sibling page is
        // allocated before anything is mutated so a pool failure leaves the
        // tree untouched.
        let (right_id, mut right_page) = self.buffer_pool.new_page()?;
        let size = leaf.keys.len();
        let (at, goes_left) = LeafNode::<K>::split_bound(pos, size);
        let mut right = leaf.split_off(at);
        if goes_left {
            leaf.insert_at(pos, key, value);
        } else {
            right.insert_at(pos - at, key, value);
        }
        leaf.next_leaf = right_id;
        let promoted = right.keys[0].clone();

        {
            let mut page = right_page.page().write();
            serialize_node(&BTreeNode::Leaf(right), &mut page)?;
        }
        right_page.mark_dirty();
        drop(right_page);

        Self::write_node(&leaf_entry.node, &mut leaf_entry.guard)?;
        let old_child_id = leaf_entry.page_id;
        drop(leaf_entry);

        self.insert_into_parent(&mut ctx, old_child_id, promoted, right_id)
    }

    /// Plant the first leaf of an empty tree and point the header at it.
    fn start_new_tree(
        &self,
        ctx: &mut WriteContext<'_, K>,
        key: K,
        value: Rid,
    ) -> Result<(), BTreeError> {
        let (root_id, mut root_page) = self.buffer_pool.new_page()?;
        let mut leaf = LeafNode::new();
        leaf.insert_at(0, key, value);
        {
            let mut page = root_page.page().write();
            serialize_node(&BTreeNode::Leaf(leaf), &mut page)?;
        }
        root_page.mark_dirty();

        ctx.install_root(root_id);
        Ok(())
    }

    /// Push a promoted separator up the retained path, splitting full
    /// internal pages, until a page absorbs it or a new root is built.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext<'_, K>,
        split_child: PageId,
        promoted: K,
        right_id: PageId,
    ) -> Result<(), BTreeError> {
        let mut promoted = promoted;
        let mut right_id = right_id;
        let mut last_split = split_child;

        while let Some(mut entry) = ctx.path.pop() {
            let node = match &mut entry.node {
                BTreeNode::Internal(node) => node,
                BTreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
            };

            if node.children.len() < self.internal_max_size {
                node.insert_child(promoted, right_id);
                return Self::write_node(&entry.node, &mut entry.guard);
            }

            let (new_right_id, mut new_right_page) = self.buffer_pool.new_page()?;
            let size = node.children.len();
            let entry_idx = node.entry_index(&promoted);
            let (at, goes_left) = InternalNode::<K>::split_bound(entry_idx, size);

            let entries = node.split_entries(at);
            let (separator, mut right_node) = internal_from_entries(entries);
            let mut separator = separator;
            if goes_left {
                node.insert_child(promoted, right_id);
            } else if promoted < separator {
                // The new entry becomes the right sibling's leading child;
                // its separator is the one promoted instead.
                right_node.keys.insert(0, separator);
                right_node.children.insert(0, right_id);
                separator = promoted;
            } else {
                right_node.insert_child(promoted, right_id);
            }

            {
                let mut page = new_right_page.page().write();
                serialize_node(&BTreeNode::Internal(right_node), &mut page)?;
            }
            new_right_page.mark_dirty();
            drop(new_right_page);

            Self::write_node(&entry.node, &mut entry.guard)?;
            last_split = entry.page_id;
            promoted = separator;
            right_id = new_right_id;
        }

        // Every page on the path split: grow the tree by one level. The
        // header latch is still held because no safe page was found.
        let (new_root_id, mut root_page) = self.buffer_pool.new_page()?;
        let root_node = InternalNode::new_root(last_split, promoted, right_id);
        {
            let mut page = root_page.page().write();
            serialize_node(&BTreeNode::Internal(root_node), &mut page)?;
        }
        root_page.mark_dirty();

        ctx.install_root(new_root_id);
        Ok(())
    }
}
