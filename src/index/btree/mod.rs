pub mod error;
pub mod header;
pub mod index;
pub mod node;
pub mod serialization;

pub use error::BTreeError;
pub use index::{BTreeIndex, BTreeIterator};
pub use node::BTreeNode;
pub use serialization::{deserialize_node, serialize_node};
