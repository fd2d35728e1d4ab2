mod decoding;
mod encoding;

pub use decoding::deserialize_node;
pub use encoding::serialize_node;
