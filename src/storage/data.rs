use super::page::{Page, PageId, PageType, PAGE_HEADER_SIZE};
use super::pager::PageManager;
use crate::error::{DbError, Result};

const SLOT_SIZE: usize = 5; // offset:u16 + length:u16 + state:u8
const HEAP_PTR_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SlotState {
    Live = 0,
    Tombstone = 1,
    /// Content is an `{ extPageId: u32, totalLength: u32 }` overflow pointer
    /// into an `Extension` page chain rather than inline bytes.
    Overflow = 2,
}

impl SlotState {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => SlotState::Live,
            1 => SlotState::Tombstone,
            2 => SlotState::Overflow,
            other => return Err(DbError::Serialization(format!("bad slot state {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    offset: u16,
    length: u16,
    state: SlotState,
}

/// A document's location within the collection's data-page chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub page_id: PageId,
    pub slot: u16,
}

fn heap_start(payload: &[u8]) -> usize {
    u16::from_le_bytes(payload[0..2].try_into().unwrap()) as usize
}

fn set_heap_start(payload: &mut [u8], v: usize) {
    payload[0..2].copy_from_slice(&(v as u16).to_le_bytes());
}

fn slot_offset(index: u16) -> usize {
    HEAP_PTR_SIZE + index as usize * SLOT_SIZE
}

fn read_slot(payload: &[u8], index: u16) -> Result<SlotEntry> {
    let at = slot_offset(index);
    Ok(SlotEntry {
        offset: u16::from_le_bytes(payload[at..at + 2].try_into().unwrap()),
        length: u16::from_le_bytes(payload[at + 2..at + 4].try_into().unwrap()),
        state: SlotState::from_u8(payload[at + 4])?,
    })
}

fn write_slot(payload: &mut [u8], index: u16, slot: SlotEntry) {
    let at = slot_offset(index);
    payload[at..at + 2].copy_from_slice(&slot.offset.to_le_bytes());
    payload[at + 2..at + 4].copy_from_slice(&slot.length.to_le_bytes());
    payload[at + 4] = slot.state as u8;
}

fn init_data_page(page: &mut Page) {
    let len = page.payload().len();
    set_heap_start(page.payload_mut(), len);
}

fn free_space(payload: &[u8], item_count: u16) -> usize {
    let dir_end = slot_offset(item_count);
    let heap = heap_start(payload);
    heap.saturating_sub(dir_end)
}

/// Writes `content` into the page's slot directory + heap if there's room.
/// Returns the new slot index, or `None` if the page can't fit it.
fn try_insert(page: &mut Page, content: &[u8], state: SlotState) -> Result<Option<u16>> {
    let mut header = page.header()?;
    let needed = content.len() + SLOT_SIZE;
    if free_space(page.payload(), header.item_count) < needed {
        return Ok(None);
    }
    let payload = page.payload_mut();
    let new_heap = heap_start(payload) - content.len();
    payload[new_heap..new_heap + content.len()].copy_from_slice(content);
    set_heap_start(payload, new_heap);
    let index = header.item_count;
    write_slot(payload, index, SlotEntry { offset: new_heap as u16, length: content.len() as u16, state });
    header.item_count += 1;
    header.free_bytes = free_space(page.payload(), header.item_count) as u16;
    page.set_header(&header);
    page.recompute_checksum();
    Ok(Some(index))
}

fn read_content<'a>(payload: &'a [u8], slot: SlotEntry) -> &'a [u8] {
    let start = slot.offset as usize;
    &payload[start..start + slot.length as usize]
}

/// Writes the document chain as a sequence of `Extension` pages, returning
/// the head page id. Used when a document exceeds what a single `Data`
/// page slot can hold.
fn write_extension_chain(pager: &PageManager, bytes: &[u8]) -> Result<PageId> {
    let chunk_cap = pager.page_size() as usize - PAGE_HEADER_SIZE;
    let mut chunks: Vec<&[u8]> = bytes.chunks(chunk_cap).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let mut page_ids = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        page_ids.push(pager.allocate(PageType::Extension)?);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = pager.read(page_ids[i])?;
        let mut header = page.header()?;
        header.next_page_id = page_ids.get(i + 1).copied().unwrap_or(0);
        header.prev_page_id = if i == 0 { 0 } else { page_ids[i - 1] };
        page.set_header(&header);
        page.payload_mut()[..chunk.len()].copy_from_slice(chunk);
        page.recompute_checksum();
        pager.write(page_ids[i], page)?;
    }
    Ok(page_ids[0])
}

fn read_extension_chain(pager: &PageManager, head: PageId, total_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len);
    let mut current = head;
    while current != 0 && out.len() < total_len {
        let page = pager.read(current)?;
        let remaining = total_len - out.len();
        let take = remaining.min(page.payload().len());
        out.extend_from_slice(&page.payload()[..take]);
        current = page.header()?.next_page_id;
    }
    Ok(out)
}

fn free_extension_chain(pager: &PageManager, head: PageId) -> Result<()> {
    let mut current = head;
    while current != 0 {
        let next = pager.read(current)?.header()?.next_page_id;
        pager.free(current)?;
        current = next;
    }
    Ok(())
}

/// Manages the doubly-linked `Data`/`Extension` page chain for one
/// collection. Does not own the chain head itself; callers persist
/// `first_data_page` in the collection's metadata record.
pub struct DataLayout<'a> {
    pager: &'a PageManager,
}

impl<'a> DataLayout<'a> {
    pub fn new(pager: &'a PageManager) -> Self {
        Self { pager }
    }

    fn overflow_threshold(&self) -> usize {
        self.pager.page_size() as usize - PAGE_HEADER_SIZE - SLOT_SIZE - HEAP_PTR_SIZE
    }

    /// Inserts `bytes`, allocating a new tail data page if the chain has no
    /// room. Returns the location and the (possibly newly allocated) chain
    /// head, which the caller must persist if it changed.
    pub fn insert(&self, head: PageId, bytes: &[u8]) -> Result<(RecordLocation, PageId)> {
        if bytes.len() > self.overflow_threshold() {
            let ext_head = write_extension_chain(self.pager, bytes)?;
            let mut pointer = Vec::with_capacity(8);
            pointer.extend_from_slice(&ext_head.to_le_bytes());
            pointer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            return self.insert_slot(head, &pointer, SlotState::Overflow);
        }
        self.insert_slot(head, bytes, SlotState::Live)
    }

    fn insert_slot(&self, head: PageId, content: &[u8], state: SlotState) -> Result<(RecordLocation, PageId)> {
        let mut new_head = head;
        let mut current = head;
        let mut last = head;
        loop {
            if current == 0 {
                let fresh = self.pager.allocate(PageType::Data)?;
                let mut page = self.pager.read(fresh)?;
                init_data_page(&mut page);
                page.recompute_checksum();
                self.pager.write(fresh, page)?;
                if last != 0 {
                    self.link_tail(last, fresh)?;
                } else {
                    new_head = fresh;
                }
                current = fresh;
            }
            let mut page = self.pager.read(current)?;
            if page.header()?.item_count == 0 && page.payload()[0] == 0 && page.payload()[1] == 0 {
                init_data_page(&mut page);
            }
            if let Some(slot) = try_insert(&mut page, content, state)? {
                self.pager.write(current, page)?;
                return Ok((RecordLocation { page_id: current, slot }, new_head));
            }
            last = current;
            let next = page.header()?.next_page_id;
            if next == 0 {
                current = 0;
                continue;
            }
            current = next;
        }
    }

    fn link_tail(&self, tail: PageId, fresh: PageId) -> Result<()> {
        let mut tail_page = self.pager.read(tail)?;
        let mut header = tail_page.header()?;
        header.next_page_id = fresh;
        tail_page.set_header(&header);
        tail_page.recompute_checksum();
        self.pager.write(tail, tail_page)?;

        let mut fresh_page = self.pager.read(fresh)?;
        let mut fresh_header = fresh_page.header()?;
        fresh_header.prev_page_id = tail;
        fresh_page.set_header(&fresh_header);
        fresh_page.recompute_checksum();
        self.pager.write(fresh, fresh_page)?;
        Ok(())
    }

    pub fn get(&self, loc: RecordLocation) -> Result<Option<Vec<u8>>> {
        let page = self.pager.read(loc.page_id)?;
        let header = page.header()?;
        if loc.slot >= header.item_count {
            return Ok(None);
        }
        let slot = read_slot(page.payload(), loc.slot)?;
        match slot.state {
            SlotState::Tombstone => Ok(None),
            SlotState::Live => Ok(Some(read_content(page.payload(), slot).to_vec())),
            SlotState::Overflow => {
                let content = read_content(page.payload(), slot);
                let ext_head = u32::from_le_bytes(content[0..4].try_into().unwrap());
                let total_len = u32::from_le_bytes(content[4..8].try_into().unwrap()) as usize;
                Ok(Some(read_extension_chain(self.pager, ext_head, total_len)?))
            }
        }
    }

    /// Updates in place if `new_bytes` fits the existing slot (and it isn't
    /// overflow-backed); otherwise tombstones the old slot and inserts fresh,
    /// returning the new location. The pre-image the caller needs for
    /// rollback is the bytes previously at `loc`.
    pub fn update(&self, head: PageId, loc: RecordLocation, new_bytes: &[u8]) -> Result<(RecordLocation, PageId)> {
        let mut page = self.pager.read(loc.page_id)?;
        let header = page.header()?;
        if loc.slot < header.item_count {
            let slot = read_slot(page.payload(), loc.slot)?;
            if slot.state == SlotState::Live && new_bytes.len() <= slot.length as usize {
                let start = slot.offset as usize;
                page.payload_mut()[start..start + new_bytes.len()].copy_from_slice(new_bytes);
                let mut updated = slot;
                updated.length = new_bytes.len() as u16;
                write_slot(page.payload_mut(), loc.slot, updated);
                page.recompute_checksum();
                self.pager.write(loc.page_id, page)?;
                return Ok((loc, head));
            }
        }
        self.delete(loc)?;
        self.insert(head, new_bytes)
    }

    /// Undoes an in-place update whose pre-image is known to fit: the heap
    /// span at `loc`'s offset was originally sized for `pre_image`, so
    /// writing it back can never overflow the page.
    pub fn restore_in_place(&self, loc: RecordLocation, pre_image: &[u8]) -> Result<()> {
        let mut page = self.pager.read(loc.page_id)?;
        let header = page.header()?;
        if loc.slot >= header.item_count {
            return Err(DbError::Internal("restore target slot missing".into()));
        }
        let slot = read_slot(page.payload(), loc.slot)?;
        let start = slot.offset as usize;
        page.payload_mut()[start..start + pre_image.len()].copy_from_slice(pre_image);
        write_slot(page.payload_mut(), loc.slot, SlotEntry { offset: slot.offset, length: pre_image.len() as u16, state: SlotState::Live });
        page.recompute_checksum();
        self.pager.write(loc.page_id, page)
    }

    /// Undoes a delete, restoring `pre_image` at the tombstoned slot. If
    /// the original record was overflow-backed (its extension chain having
    /// already been freed by `delete`), a fresh chain is written and the
    /// slot's overflow pointer updated to it.
    pub fn restore(&self, loc: RecordLocation, pre_image: &[u8]) -> Result<()> {
        let mut page = self.pager.read(loc.page_id)?;
        let header = page.header()?;
        if loc.slot >= header.item_count {
            return Err(DbError::Internal("restore target slot missing".into()));
        }
        if pre_image.len() > self.overflow_threshold() {
            let ext_head = write_extension_chain(self.pager, pre_image)?;
            let mut pointer = Vec::with_capacity(8);
            pointer.extend_from_slice(&ext_head.to_le_bytes());
            pointer.extend_from_slice(&(pre_image.len() as u32).to_le_bytes());
            let slot = read_slot(page.payload(), loc.slot)?;
            let start = slot.offset as usize;
            page.payload_mut()[start..start + pointer.len()].copy_from_slice(&pointer);
            write_slot(page.payload_mut(), loc.slot, SlotEntry { offset: slot.offset, length: pointer.len() as u16, state: SlotState::Overflow });
        } else {
            let slot = read_slot(page.payload(), loc.slot)?;
            let start = slot.offset as usize;
            page.payload_mut()[start..start + pre_image.len()].copy_from_slice(pre_image);
            write_slot(page.payload_mut(), loc.slot, SlotEntry { offset: slot.offset, length: pre_image.len() as u16, state: SlotState::Live });
        }
        page.recompute_checksum();
        self.pager.write(loc.page_id, page)
    }

    pub fn delete(&self, loc: RecordLocation) -> Result<Option<Vec<u8>>> {
        let mut page = self.pager.read(loc.page_id)?;
        let header = page.header()?;
        if loc.slot >= header.item_count {
            return Ok(None);
        }
        let slot = read_slot(page.payload(), loc.slot)?;
        if slot.state == SlotState::Tombstone {
            return Ok(None);
        }
        let pre_image = match slot.state {
            SlotState::Overflow => {
                let content = read_content(page.payload(), slot);
                let ext_head = u32::from_le_bytes(content[0..4].try_into().unwrap());
                let total_len = u32::from_le_bytes(content[4..8].try_into().unwrap()) as usize;
                let bytes = read_extension_chain(self.pager, ext_head, total_len)?;
                free_extension_chain(self.pager, ext_head)?;
                bytes
            }
            _ => read_content(page.payload(), slot).to_vec(),
        };
        write_slot(page.payload_mut(), loc.slot, SlotEntry { offset: slot.offset, length: 0, state: SlotState::Tombstone });
        page.recompute_checksum();
        self.pager.write(loc.page_id, page)?;
        Ok(Some(pre_image))
    }

    /// Iterates every live document in chain order, following `nextPageId`.
    pub fn scan(&self, head: PageId) -> Result<Vec<(RecordLocation, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut current = head;
        while current != 0 {
            let page = self.pager.read(current)?;
            let header = page.header()?;
            for index in 0..header.item_count {
                let slot = read_slot(page.payload(), index)?;
                let loc = RecordLocation { page_id: current, slot: index };
                match slot.state {
                    SlotState::Live => out.push((loc, read_content(page.payload(), slot).to_vec())),
                    SlotState::Overflow => {
                        let content = read_content(page.payload(), slot);
                        let ext_head = u32::from_le_bytes(content[0..4].try_into().unwrap());
                        let total_len = u32::from_le_bytes(content[4..8].try_into().unwrap()) as usize;
                        out.push((loc, read_extension_chain(self.pager, ext_head, total_len)?));
                    }
                    SlotState::Tombstone => {}
                }
            }
            current = header.next_page_id;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pager() -> (tempfile::TempDir, PageManager) {
        let dir = tempfile::tempdir().unwrap();
        let pager = PageManager::open(dir.path().join("data.db"), 4096, 64).unwrap();
        (dir, pager)
    }

    #[test]
    fn insert_get_delete_round_trip() {
        let (_dir, pager) = pager();
        let layout = DataLayout::new(&pager);
        let (loc, head) = layout.insert(0, b"hello").unwrap();
        assert_eq!(layout.get(loc).unwrap(), Some(b"hello".to_vec()));
        layout.delete(loc).unwrap();
        assert_eq!(layout.get(loc).unwrap(), None);
        assert_ne!(head, 0);
    }

    #[test]
    fn update_in_place_when_shrinking() {
        let (_dir, pager) = pager();
        let layout = DataLayout::new(&pager);
        let (loc, head) = layout.insert(0, b"0123456789").unwrap();
        let (new_loc, head) = layout.update(head, loc, b"short").unwrap();
        assert_eq!(new_loc, loc);
        assert_eq!(layout.get(new_loc).unwrap(), Some(b"short".to_vec()));
        assert_ne!(head, 0);
    }

    #[test]
    fn update_relocates_when_growing_past_old_slot() {
        let (_dir, pager) = pager();
        let layout = DataLayout::new(&pager);
        let (loc, head) = layout.insert(0, b"tiny").unwrap();
        let big = vec![b'x'; 200];
        let (new_loc, head) = layout.update(head, loc, &big).unwrap();
        assert_eq!(layout.get(new_loc).unwrap(), Some(big));
        assert_eq!(layout.get(loc).unwrap(), None);
        assert_ne!(head, 0);
    }

    #[test]
    fn large_document_spills_to_extension_chain() {
        let (_dir, pager) = pager();
        let layout = DataLayout::new(&pager);
        let big = vec![b'z'; 10_000];
        let (loc, _head) = layout.insert(0, &big).unwrap();
        assert_eq!(layout.get(loc).unwrap(), Some(big));
    }

    #[test]
    fn scan_skips_tombstones() {
        let (_dir, pager) = pager();
        let layout = DataLayout::new(&pager);
        let (loc_a, head) = layout.insert(0, b"a").unwrap();
        let (_loc_b, head) = layout.insert(head, b"b").unwrap();
        layout.delete(loc_a).unwrap();
        let scanned = layout.scan(head).unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].1, b"b");
    }

    #[test]
    fn chain_grows_across_pages_when_full() {
        let (_dir, pager) = pager();
        let layout = DataLayout::new(&pager);
        let mut head = 0;
        let mut locs = Vec::new();
        for i in 0..200u32 {
            let payload = format!("record-{i:04}").into_bytes();
            let (loc, new_head) = layout.insert(head, &payload).unwrap();
            head = new_head;
            locs.push((loc, payload));
        }
        for (loc, payload) in &locs {
            assert_eq!(layout.get(*loc).unwrap().as_ref(), Some(payload));
        }
    }
}
