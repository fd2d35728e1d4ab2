use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

// Node header layout:
// - is_leaf: u8 (1 byte)
// - key_count: u16 (2 bytes)
// - next_leaf: u32 (4 bytes, 0 if none; unused for internal nodes)
pub(crate) const NODE_HEADER_SIZE: usize = 7;

/// Serialize a B+Tree node into a page. Keys are bincode-encoded with a u16
/// length prefix; record IDs and child pointers are fixed-width.
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    page.data.fill(0);

    let (keys, key_count) = match node {
        BTreeNode::Leaf(leaf) => {
            page.data[0] = 1;
            LittleEndian::write_u32(&mut page.data[3..7], leaf.next_leaf);
            (&leaf.keys, leaf.keys.len())
        }
        BTreeNode::Internal(internal) => {
            page.data[0] = 0;
            (&internal.keys, internal.keys.len())
        }
    };
    LittleEndian::write_u16(&mut page.data[1..3], key_count as u16);

    let mut offset = NODE_HEADER_SIZE;
    for key in keys {
        let key_bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;

        if offset + 2 + key_bytes.len() > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }

        LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
        offset += 2;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    match node {
        BTreeNode::Leaf(leaf) => {
            for value in &leaf.values {
                if offset + 8 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.page_id);
                offset += 4;
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.slot_num);
                offset += 4;
            }
        }
        BTreeNode::Internal(internal) => {
            for child in &internal.children {
                if offset + 4 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], *child);
                offset += 4;
            }
        }
    }

    Ok(())
}
