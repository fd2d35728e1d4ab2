use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, INVALID_PAGE_ID};

/// Layout of the tree's header page: a single root pointer. The header page
/// id is the stable handle an index is reopened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeHeader {
    pub root_page_id: PageId,
}

impl BTreeHeader {
    pub fn empty() -> Self {
        Self {
            root_page_id: INVALID_PAGE_ID,
        }
    }

    pub fn write_to(&self, page: &mut Page) {
        LittleEndian::write_u32(&mut page.data[0..4], self.root_page_id);
    }

    pub fn read_from(page: &Page) -> Self {
        Self {
            root_page_id: LittleEndian::read_u32(&page.data[0..4]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut page = Page::new(1);
        BTreeHeader { root_page_id: 42 }.write_to(&mut page);
        assert_eq!(BTreeHeader::read_from(&page).root_page_id, 42);
    }

    #[test]
    fn test_empty_header() {
        let page = Page::new(1);
        assert_eq!(
            BTreeHeader::read_from(&page).root_page_id,
            INVALID_PAGE_ID
        );
    }
}
