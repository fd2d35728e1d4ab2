use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;

use super::base::{BTreeIndex, PathEntry, WriteContext, WriteOp};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let root_guard = self.root_page_id.write();

        if *root_guard == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = WriteContext {
            header: Some(header),
            root_guard: Some(root_guard),
            path: Vec::new(),
        };

        let mut leaf_entry = self.descend_for_write(&mut ctx, key, WriteOp::Delete)?;
        let leaf = match &mut leaf_entry.node {
            BTreeNode::Leaf(leaf) => leaf,
            BTreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
        };

        let pos = match leaf.keys.binary_search(key) {
            Ok(pos) => pos,
            Err(_) => return Ok(()),
        };
        leaf.remove_at(pos);

        if leaf_entry.is_root {
            if leaf.keys.is_empty() {
                // Last key of a leaf root: the tree is empty again. The old
                // root page stays allocated but unreachable.
                ctx.install_root(INVALID_PAGE_ID);
                return Ok(());
            }
            return Self::write_node(&leaf_entry.node, &mut leaf_entry.guard);
        }

        if leaf.keys.len() >= self.leaf_min_size() {
            return Self::write_node(&leaf_entry.node, &mut leaf_entry.guard);
        }

        let orphans = self.rebalance_upward(&mut ctx, leaf_entry)?;
        drop(ctx);

        // Internal pages freed by merges are unreachable once the latches
        // are gone; merged leaves stay allocated because a paused range
        // scan may still chain into them.
        for page_id in orphans {
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                warn!("could not reclaim merged page {}: {}", page_id, e);
            }
        }
        Ok(())
    }

    /// Rebalance an underflowed node by borrowing from or merging with a
    /// sibling, repeating up the retained path while merges propagate.
    /// Returns the internal pages that became unreachable.
    fn rebalance_upward(
        &self,
        ctx: &mut WriteContext<'_, K>,
        mut entry: PathEntry<K>,
    ) -> Result<Vec<PageId>, BTreeError> {
        let mut orphans = Vec::new();

        loop {
            // `entry` is underflowed and not the root; its parent is the
            // last retained path element.
            let parent_entry = match ctx.path.last_mut() {
                Some(p) => p,
                None => return Err(BTreeError::InvalidPageFormat),
            };
            let parent = match &mut parent_entry.node {
                BTreeNode::Internal(node) => node,
                BTreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
            };

            let idx = entry.index_in_parent;
            let sibling_on_right = idx + 1 < parent.children.len();
            let sib_idx = if sibling_on_right { idx + 1 } else { idx - 1 };
            let sib_id = parent.children[sib_idx];

            // The parent's write latch is held, so latching the sibling
            // cannot race another structural operation in this subtree.
            let mut sib_guard = self.buffer_pool.fetch_page_write(sib_id)?;
            let mut sib_node: BTreeNode<K> = deserialize_node(&sib_guard)?;

            let min = match entry.node {
                BTreeNode::Leaf(_) => self.leaf_min_size(),
                BTreeNode::Internal(_) => self.internal_min_size(),
            };
            let total = entry.node.size() + sib_node.size();

            if total >= 2 * min {
                // Redistribute so both nodes reach minimum occupancy.
                match (&mut entry.node, &mut sib_node) {
                    (BTreeNode::Leaf(cur), BTreeNode::Leaf(sib)) => {
                        if sibling_on_right {
                            let moves = sib.keys.len() - total / 2;
                            for _ in 0..moves {
                                let (k, v) = sib.remove_at(0);
                                let end = cur.keys.len();
                                cur.insert_at(end, k, v);
                            }
                            parent.keys[idx] = sib.keys[0].clone();
                        } else {
                            let moves = total / 2 - cur.keys.len();
                            for _ in 0..moves {
                                let last = sib.keys.len() - 1;
                                let (k, v) = sib.remove_at(last);
                                cur.insert_at(0, k, v);
                            }
                            parent.keys[idx - 1] = cur.keys[0].clone();
                        }
                    }
                    (BTreeNode::Internal(cur), BTreeNode::Internal(sib)) => {
                        if sibling_on_right {
                            let moves = sib.children.len() - total / 2;
                            for _ in 0..moves {
                                cur.keys.push(parent.keys[idx].clone());
                                cur.children.push(sib.children.remove(0));
                                parent.keys[idx] = sib.keys.remove(0);
                            }
                        } else {
                            let moves = total / 2 - cur.children.len();
                            for _ in 0..moves {
                                let child = match sib.children.pop() {
                                    Some(c) => c,
                                    None => return Err(BTreeError::InvalidPageFormat),
                                };
                                let key = match sib.keys.pop() {
                                    Some(k) => k,
                                    None => return Err(BTreeError::InvalidPageFormat),
                                };
                                cur.keys.insert(0, parent.keys[idx - 1].clone());
                                cur.children.insert(0, child);
                                parent.keys[idx - 1] = key;
                            }
                        }
                    }
                    _ => return Err(BTreeError::InvalidPageFormat),
                }

                Self::write_node(&entry.node, &mut entry.guard)?;
                Self::write_node(&sib_node, &mut sib_guard)?;
                Self::write_node(&parent_entry.node, &mut parent_entry.guard)?;
                return Ok(orphans);
            }

            // Merge the pair; the content survives on whichever page sits
            // on the left, and the other page becomes unreachable.
            let merged_is_leaf = entry.node.is_leaf();
            let (survivor_is_cur, sep_idx) = if sibling_on_right {
                (true, idx)
            } else {
                (false, idx - 1)
            };

            match (&mut entry.node, sib_node) {
                (BTreeNode::Leaf(cur), BTreeNode::Leaf(mut sib)) => {
                    if survivor_is_cur {
                        cur.keys.append(&mut sib.keys);
                        cur.values.append(&mut sib.values);
                        cur.next_leaf = sib.next_leaf;
                    } else {
                        sib.keys.append(&mut cur.keys);
                        sib.values.append(&mut cur.values);
                        sib.next_leaf = cur.next_leaf;
                        std::mem::swap(cur, &mut sib);
                    }
                }
                (BTreeNode::Internal(cur), BTreeNode::Internal(mut sib)) => {
                    let separator = parent.keys[sep_idx].clone();
                    if survivor_is_cur {
                        cur.merge_right(separator, sib);
                    } else {
                        sib.merge_right(separator, cur.clone());
                        *cur = sib;
                    }
                }
                _ => return Err(BTreeError::InvalidPageFormat),
            }

            let vanished_page = if survivor_is_cur { sib_id } else { entry.page_id };
            parent.remove_entry(sep_idx, if survivor_is_cur { sib_idx } else { idx });

            // The merged content lands on the left page of the pair.
            if survivor_is_cur {
                Self::write_node(&entry.node, &mut entry.guard)?;
            } else {
                Self::write_node(&entry.node, &mut sib_guard)?;
            }
            drop(sib_guard);
            drop(entry);

            if !merged_is_leaf {
                orphans.push(vanished_page);
            }

            // Pop the parent and decide whether the merge propagates.
            let mut parent_entry = match ctx.path.pop() {
                Some(p) => p,
                None => return Err(BTreeError::InvalidPageFormat),
            };

            if parent_entry.is_root {
                let collapse_to = match &parent_entry.node {
                    BTreeNode::Internal(node) if node.children.len() == 1 => Some(node.child(0)),
                    _ => None,
                };
                match collapse_to {
                    Some(child) => {
                        ctx.install_root(child);
                        orphans.push(parent_entry.page_id);
                    }
                    None => {
                        Self::write_node(&parent_entry.node, &mut parent_entry.guard)?;
                    }
                }
                return Ok(orphans);
            }

            Self::write_node(&parent_entry.node, &mut parent_entry.guard)?;
            if parent_entry.node.size() >= self.internal_min_size() {
                return Ok(orphans);
            }

            entry = parent_entry;
        }
    }
}
