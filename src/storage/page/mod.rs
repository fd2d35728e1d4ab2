mod guard;

pub use guard::{PageGuard, ReadPageGuard, WritePageGuard};
