use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;

use crate::common::types::{Page, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode};
use crate::index::btree::serialization::encoding::NODE_HEADER_SIZE;

/// Deserialize a B+Tree node from a page written by `serialize_node`.
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de> + Clone + Ord,
{
    let is_leaf = match page.data[0] {
        0 => false,
        1 => true,
        _ => return Err(BTreeError::InvalidPageFormat),
    };
    let key_count = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let next_leaf = LittleEndian::read_u32(&page.data[3..7]);

    let mut offset = NODE_HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        if offset + 2 > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;
        if offset + len > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key = bincode::deserialize(&page.data[offset..offset + len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
        offset += len;
        keys.push(key);
    }

    if is_leaf {
        let mut values = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::InvalidPageFormat);
            }
            let page_id = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            offset += 4;
            let slot_num = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            offset += 4;
            values.push(Rid::new(page_id, slot_num));
        }
        Ok(BTreeNode::Leaf(LeafNode {
            keys,
            values,
            next_leaf,
        }))
    } else {
        let child_count = key_count + 1;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::InvalidPageFormat);
            }
            children.push(LittleEndian::read_u32(&page.data[offset..offset + 4]));
            offset += 4;
        }
        Ok(BTreeNode::Internal(InternalNode { keys, children }))
    }
}
