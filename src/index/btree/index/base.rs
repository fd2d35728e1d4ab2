use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::common::config::EngineConfig;
use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header::BTreeHeader;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::common::types::Rid;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::WritePageGuard;
use crate::transaction::IndexWriteUndo;

/// Which structural operation a write descent serves; decides when a page is
/// "safe" and ancestor latches can be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Insert,
    Delete,
}

/// One latched page on the descent path, together with its decoded node and
/// its position under its parent.
pub(crate) struct PathEntry<K> {
    pub page_id: PageId,
    pub guard: WritePageGuard,
    pub node: BTreeNode<K>,
    pub index_in_parent: usize,
    pub is_root: bool,
}

/// Latches held across a structural operation: the header page write latch,
/// the root-pointer lock, and the chain of page write latches that may still
/// see a split or merge. Dropping the context releases everything bottom-up.
pub(crate) struct WriteContext<'a, K> {
    pub header: Option<WritePageGuard>,
    pub root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    pub path: Vec<PathEntry<K>>,
}

impl<'a, K> WriteContext<'a, K> {
    /// A safe page was reached: nothing above it can change, so the header
    /// latch, the root-pointer lock, and all ancestor latches go away.
    pub fn release_ancestors(&mut self) {
        self.path.clear();
        self.root_guard = None;
        self.header = None;
    }

    /// Persist the new root pointer in the header page and the cached copy.
    pub fn install_root(&mut self, new_root: PageId) {
        if let Some(header_guard) = self.header.as_mut() {
            BTreeHeader {
                root_page_id: new_root,
            }
            .write_to(header_guard);
        }
        if let Some(root_guard) = self.root_guard.as_mut() {
            **root_guard = new_root;
        }
    }
}

/// A concurrent B+Tree index over the buffer pool. All state lives in pages;
/// the struct itself holds only the header page id, a cached root pointer,
/// and the fanout limits.
pub struct BTreeIndex<K> {
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) header_page_id: PageId,
    pub(crate) root_page_id: RwLock<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Create a fresh index: allocates the header page and starts empty.
    pub fn create(
        buffer_pool: Arc<BufferPoolManager>,
        config: &EngineConfig,
    ) -> Result<Self, BTreeError> {
        assert!(config.leaf_max_size >= 2, "leaf fanout must be at least 2");
        assert!(
            config.internal_max_size >= 3,
            "internal fanout must be at least 3"
        );

        let (header_page_id, mut header_guard) = buffer_pool.new_page()?;
        {
            let mut page = header_guard.page().write();
            BTreeHeader::empty().write_to(&mut page);
        }
        header_guard.mark_dirty();
        drop(header_guard);

        Ok(Self {
            buffer_pool,
            header_page_id,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Reattach to an index previously created with `create`; the root
    /// pointer is recovered from the header page.
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        header_page_id: PageId,
        config: &EngineConfig,
    ) -> Result<Self, BTreeError> {
        let root_page_id = {
            let guard = buffer_pool.fetch_page_read(header_page_id)?;
            BTreeHeader::read_from(&guard).root_page_id
        };

        Ok(Self {
            buffer_pool,
            header_page_id,
            root_page_id: RwLock::new(root_page_id),
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Stable handle for reopening the index later.
    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub(crate) fn leaf_min_size(&self) -> usize {
        (self.leaf_max_size + 1) / 2
    }

    pub(crate) fn internal_min_size(&self) -> usize {
        (self.internal_max_size + 1) / 2
    }

    /// A page is safe for the given operation if the operation cannot make a
    /// split or merge propagate above it.
    pub(crate) fn is_safe(&self, node: &BTreeNode<K>, is_root: bool, op: WriteOp) -> bool {
        match op {
            WriteOp::Insert => match node {
                BTreeNode::Leaf(_) => node.size() < self.leaf_max_size,
                BTreeNode::Internal(_) => node.size() < self.internal_max_size,
            },
            WriteOp::Delete => match node {
                BTreeNode::Leaf(_) if is_root => node.size() > 1,
                BTreeNode::Leaf(_) => node.size() > self.leaf_min_size(),
                BTreeNode::Internal(_) if is_root => node.size() > 2,
                BTreeNode::Internal(_) => node.size() > self.internal_min_size(),
            },
        }
    }

    /// Latch-crab from the root down to the leaf that covers `key`, keeping
    /// write latches on every page that might still be restructured. Returns
    /// the leaf's entry; the unsafe ancestors remain in `ctx.path`.
    pub(crate) fn descend_for_write(
        &self,
        ctx: &mut WriteContext<'_, K>,
        key: &K,
        op: WriteOp,
    ) -> Result<PathEntry<K>, BTreeError> {
        let mut cur_id = ctx
            .root_guard
            .as_ref()
            .map(|g| **g)
            .unwrap_or(INVALID_PAGE_ID);
        let mut index_in_parent = 0usize;
        let mut is_root = true;

        loop {
            let guard = self.buffer_pool.fetch_page_write(cur_id)?;
            let node: BTreeNode<K> = deserialize_node(&guard)?;

            if self.is_safe(&node, is_root, op) {
                ctx.release_ancestors();
            }

            let entry = PathEntry {
                page_id: cur_id,
                guard,
                node,
                index_in_parent,
                is_root,
            };

            let next = match &entry.node {
                BTreeNode::Leaf(_) => None,
                BTreeNode::Internal(internal) => {
                    let child_index = internal.find_child(key);
                    Some((child_index, internal.child(child_index)))
                }
            };
            match next {
                None => return Ok(entry),
                Some((child_index, child_id)) => {
                    cur_id = child_id;
                    index_in_parent = child_index;
                    is_root = false;
                    ctx.path.push(entry);
                }
            }
        }
    }

    /// Write a node back through its latch.
    pub(crate) fn write_node(
        node: &BTreeNode<K>,
        guard: &mut WritePageGuard,
    ) -> Result<(), BTreeError> {
        serialize_node(node, guard)
    }

    /// Height of the tree in pages; 0 for an empty tree.
    pub fn height(&self) -> Result<usize, BTreeError> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(0);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root)?;
        drop(root);

        let mut height = 1;
        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            match node {
                BTreeNode::Leaf(_) => return Ok(height),
                BTreeNode::Internal(internal) => {
                    guard = self.buffer_pool.fetch_page_read(internal.child(0))?;
                    height += 1;
                }
            }
        }
    }

    /// Number of keys in the tree, counted via the leaf chain.
    pub fn count(&self) -> Result<usize, BTreeError> {
        let mut total = 0;
        for entry in self.iter()? {
            entry?;
            total += 1;
        }
        Ok(total)
    }

    /// Verify the structural invariants: separator ordering, fanout bounds,
    /// uniform depth, and that the leaf chain visits every key in ascending
    /// order exactly once.
    pub fn check_integrity(&self) -> Result<(), BTreeError> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(());
        }
        let root_id = *root;
        drop(root);

        let mut leaf_count = 0usize;
        let mut key_count = 0usize;
        self.check_subtree(root_id, true, None, None, &mut leaf_count, &mut key_count)?;

        // Walk the chain from the leftmost leaf and compare against the
        // recursive walk.
        let mut chained_keys = 0usize;
        let mut chained_leaves = 0usize;
        let mut prev: Option<K> = None;
        let mut cur = self.leftmost_leaf()?;
        while cur != INVALID_PAGE_ID {
            let guard = self.buffer_pool.fetch_page_read(cur)?;
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            let leaf = match node {
                BTreeNode::Leaf(leaf) => leaf,
                BTreeNode::Internal(_) => {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "leaf chain reached internal page {}",
                        cur
                    )))
                }
            };
            for key in &leaf.keys {
                if let Some(p) = &prev {
                    if p >= key {
                        return Err(BTreeError::IntegrityViolation(
                            "leaf chain keys not strictly increasing".into(),
                        ));
                    }
                }
                prev = Some(key.clone());
                chained_keys += 1;
            }
            chained_leaves += 1;
            cur = leaf.next_leaf;
        }

        if chained_leaves != leaf_count || chained_keys != key_count {
            return Err(BTreeError::IntegrityViolation(format!(
                "leaf chain saw {} leaves/{} keys, tree walk saw {}/{}",
                chained_leaves, chained_keys, leaf_count, key_count
            )));
        }
        Ok(())
    }

    pub(crate) fn leftmost_leaf(&self) -> Result<PageId, BTreeError> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(INVALID_PAGE_ID);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root)?;
        drop(root);

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            match node {
                BTreeNode::Leaf(_) => return Ok(guard.page_id()),
                BTreeNode::Internal(internal) => {
                    guard = self.buffer_pool.fetch_page_read(internal.child(0))?;
                }
            }
        }
    }

    /// Recursive invariant check for one subtree. Returns its depth.
    fn check_subtree(
        &self,
        page_id: PageId,
        is_root: bool,
        lower: Option<&K>,
        upper: Option<&K>,
        leaf_count: &mut usize,
        key_count: &mut usize,
    ) -> Result<usize, BTreeError> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let node: BTreeNode<K> = deserialize_node(&guard)?;
        drop(guard);

        let keys: &Vec<K> = match &node {
            BTreeNode::Leaf(leaf) => &leaf.keys,
            BTreeNode::Internal(internal) => &internal.keys,
        };
        for pair in keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(BTreeError::IntegrityViolation(format!(
                    "page {} keys not strictly increasing",
                    page_id
                )));
            }
        }
        for key in keys {
            if let Some(lo) = lower {
                if key < lo {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "page {} key below subtree lower bound",
                        page_id
                    )));
                }
            }
            if let Some(hi) = upper {
                if key >= hi {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "page {} key at or above subtree upper bound",
                        page_id
                    )));
                }
            }
        }

        match &node {
            BTreeNode::Leaf(leaf) => {
                if !is_root && leaf.keys.len() < self.leaf_min_size() {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "leaf {} below minimum occupancy",
                        page_id
                    )));
                }
                if leaf.keys.len() > self.leaf_max_size {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "leaf {} above maximum occupancy",
                        page_id
                    )));
                }
                *leaf_count += 1;
                *key_count += leaf.keys.len();
                Ok(1)
            }
            BTreeNode::Internal(internal) => {
                let min = if is_root { 2 } else { self.internal_min_size() };
                if internal.children.len() < min {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "internal {} below minimum fanout",
                        page_id
                    )));
                }
                if internal.children.len() > self.internal_max_size {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "internal {} above maximum fanout",
                        page_id
                    )));
                }

                let mut depth = None;
                for (i, &child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(&internal.keys[i - 1])
                    };
                    let child_upper = if i == internal.children.len() - 1 {
                        upper
                    } else {
                        Some(&internal.keys[i])
                    };
                    let d = self.check_subtree(
                        child,
                        false,
                        child_lower,
                        child_upper,
                        leaf_count,
                        key_count,
                    )?;
                    match depth {
                        None => depth = Some(d),
                        Some(prev) if prev != d => {
                            return Err(BTreeError::IntegrityViolation(format!(
                                "internal {} has children of unequal depth",
                                page_id
                            )));
                        }
                        Some(_) => {}
                    }
                }
                Ok(depth.unwrap_or(0) + 1)
            }
        }
    }
}

/// Rollback integration: an aborting transaction inverts its index writes
/// through these hooks. Keys arrive in their bincode encoding.
impl<K> IndexWriteUndo for BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    fn undo_insert(&self, key: &[u8]) -> anyhow::Result<()> {
        let key: K = bincode::deserialize(key)?;
        self.remove(&key)?;
        Ok(())
    }

    fn undo_delete(&self, key: &[u8], rid: Rid) -> anyhow::Result<()> {
        let key: K = bincode::deserialize(key)?;
        match self.insert(key, rid) {
            Ok(()) | Err(BTreeError::DuplicateKey) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
