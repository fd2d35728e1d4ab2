use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::ReadPageGuard;

use super::base::BTreeIndex;

/// Forward iterator over the leaf chain. Holds at most one read guard at a
/// time; advancing past a leaf releases it before the next leaf is latched.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    leaf: Option<LeafNode<K>>,
    index: usize,
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        leaf: LeafNode<K>,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            guard: Some(guard),
            leaf: Some(leaf),
            index,
        }
    }

    /// The exhausted iterator; also what `iter_from` returns for a missing
    /// key.
    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            guard: None,
            leaf: None,
            index: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = Result<(K, Rid), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;

            if self.index < leaf.keys.len() {
                let item = (leaf.keys[self.index].clone(), leaf.values[self.index]);
                self.index += 1;
                return Some(Ok(item));
            }

            let next_page = leaf.next_leaf;
            // Release the current guard before touching the next leaf; the
            // chain only ever moves rightward, so this cannot deadlock with
            // a descending writer.
            self.guard = None;
            self.leaf = None;
            self.index = 0;

            if next_page == INVALID_PAGE_ID {
                return None;
            }

            let guard = match self.buffer_pool.fetch_page_read(next_page) {
                Ok(guard) => guard,
                Err(e) => return Some(Err(e.into())),
            };
            let node: BTreeNode<K> = match deserialize_node(&guard) {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };
            match node {
                BTreeNode::Leaf(leaf) => {
                    self.guard = Some(guard);
                    self.leaf = Some(leaf);
                }
                BTreeNode::Internal(_) => return Some(Err(BTreeError::InvalidPageFormat)),
            }
        }
    }
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate the whole tree in ascending key order.
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        self.begin_at_leftmost()
    }

    /// Iterate starting at `key`. If the key is absent the iterator is
    /// already exhausted, mirroring a point lookup that finds nothing.
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        self.begin_at_key(key)
    }

    fn begin_at_leftmost(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.buffer_pool)));
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root)?;
        drop(root);

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            match node {
                BTreeNode::Leaf(leaf) => {
                    return Ok(BTreeIterator::new(
                        Arc::clone(&self.buffer_pool),
                        guard,
                        leaf,
                        0,
                    ));
                }
                BTreeNode::Internal(internal) => {
                    guard = self.buffer_pool.fetch_page_read(internal.child(0))?;
                }
            }
        }
    }

    fn begin_at_key(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let root = self.root_page_id.read();
        if *root == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.buffer_pool)));
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root)?;
        drop(root);

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            match node {
                BTreeNode::Leaf(leaf) => {
                    return Ok(match leaf.keys.binary_search(key) {
                        Ok(index) => BTreeIterator::new(
                            Arc::clone(&self.buffer_pool),
                            guard,
                            leaf,
                            index,
                        ),
                        Err(_) => BTreeIterator::end(Arc::clone(&self.buffer_pool)),
                    });
                }
                BTreeNode::Internal(internal) => {
                    guard = self.buffer_pool.fetch_page_read(internal.child(internal.find_child(key)))?;
                }
            }
        }
    }
}
