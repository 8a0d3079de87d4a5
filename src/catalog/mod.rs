//! Collection directory: maps collection names to their metadata page, and
//! each collection's metadata to its data-chain head and index descriptors.

use crate::document::{read_str, read_u32, write_str};
use crate::error::{DbError, Result};
use crate::storage::data::{DataLayout, RecordLocation};
use crate::storage::page::{PageId, PageType};
use crate::storage::pager::PageManager;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::instrument;

/// One secondary index declared on a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub field: String,
    pub unique: bool,
    pub root_page: PageId,
}

impl IndexDescriptor {
    fn encode(&self, out: &mut Vec<u8>) {
        write_str(out, &self.field);
        out.push(self.unique as u8);
        out.extend_from_slice(&self.root_page.to_le_bytes());
    }

    fn decode(bytes: &[u8], cursor: &mut usize) -> Result<Self> {
        let field = read_str(bytes, cursor)?;
        let unique = bytes[*cursor] != 0;
        *cursor += 1;
        let root_page = read_u32(bytes, cursor)?;
        Ok(Self { field, unique, root_page })
    }
}

/// The persisted metadata record for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    pub name: String,
    pub created_unix_nanos: u64,
    pub first_data_page: PageId,
    pub free_page_head: PageId,
    /// Root of the hidden unique index over `_id`, used by `find_by_id`.
    /// Stores the packed `{pageId, slot}` location rather than a second id
    /// in each leaf's doc-id slot — see the B+ tree module for the packing.
    pub primary_index_root: PageId,
    pub indexes: Vec<IndexDescriptor>,
}

impl CollectionMeta {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_unix_nanos: now_unix_nanos(),
            first_data_page: 0,
            free_page_head: 0,
            primary_index_root: 0,
            indexes: Vec::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_str(&mut out, &self.name);
        out.extend_from_slice(&self.created_unix_nanos.to_le_bytes());
        out.extend_from_slice(&self.first_data_page.to_le_bytes());
        out.extend_from_slice(&self.free_page_head.to_le_bytes());
        out.extend_from_slice(&self.primary_index_root.to_le_bytes());
        out.extend_from_slice(&(self.indexes.len() as u32).to_le_bytes());
        for idx in &self.indexes {
            idx.encode(&mut out);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let name = read_str(bytes, &mut cursor)?;
        if bytes.len() < cursor + 20 {
            return Err(DbError::Serialization("collection meta truncated".into()));
        }
        let created_unix_nanos = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
        let first_data_page = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let free_page_head = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let primary_index_root = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let count = read_u32(bytes, &mut cursor)? as usize;
        let mut indexes = Vec::with_capacity(count);
        for _ in 0..count {
            indexes.push(IndexDescriptor::decode(bytes, &mut cursor)?);
        }
        Ok(Self { name, created_unix_nanos, first_data_page, free_page_head, primary_index_root, indexes })
    }
}

fn now_unix_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

struct DirEntry {
    name: String,
    meta_page: PageId,
}

impl DirEntry {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.meta_page.to_le_bytes());
        write_str(&mut out, &self.name);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let meta_page = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mut cursor = 4usize;
        let name = read_str(bytes, &mut cursor)?;
        Ok(Self { name, meta_page })
    }
}

/// Name -> metadata-page directory for all collections in the database.
///
/// The directory's own entries live in a `Data`-page chain just like a
/// collection's documents do; `cache` mirrors the name -> location mapping
/// in memory so lookups don't require a chain scan.
pub struct CollectionDirectory {
    root: RwLock<PageId>,
    cache: RwLock<HashMap<String, (PageId, RecordLocation)>>,
}

impl CollectionDirectory {
    pub fn open(pager: &PageManager, root: PageId) -> Result<Self> {
        let mut cache = HashMap::new();
        if root != 0 {
            let layout = DataLayout::new(pager);
            for (loc, bytes) in layout.scan(root)? {
                let entry = DirEntry::decode(&bytes)?;
                cache.insert(entry.name, (entry.meta_page, loc));
            }
        }
        Ok(Self { root: RwLock::new(root), cache: RwLock::new(cache) })
    }

    pub fn root(&self) -> PageId {
        *self.root.read()
    }

    pub fn names(&self) -> Vec<String> {
        self.cache.read().keys().cloned().collect()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.cache.read().contains_key(name)
    }

    pub fn meta_page(&self, name: &str) -> Option<PageId> {
        self.cache.read().get(name).map(|(page, _)| *page)
    }

    #[instrument(skip(self, pager))]
    pub fn create(&self, pager: &PageManager, name: &str) -> Result<PageId> {
        if self.exists(name) {
            return Err(DbError::AlreadyExists(name.to_string()));
        }
        let meta_page = pager.allocate(PageType::Collection)?;
        let meta = CollectionMeta::new(name);
        self.write_meta(pager, meta_page, &meta)?;

        let layout = DataLayout::new(pager);
        let entry = DirEntry { name: name.to_string(), meta_page };
        let (loc, new_root) = layout.insert(self.root(), &entry.encode())?;
        if new_root != self.root() {
            *self.root.write() = new_root;
            pager.set_collection_directory_root(new_root)?;
        }
        self.cache.write().insert(name.to_string(), (meta_page, loc));
        Ok(meta_page)
    }

    #[instrument(skip(self, pager))]
    pub fn drop_collection(&self, pager: &PageManager, name: &str) -> Result<()> {
        let (meta_page, loc) = self
            .cache
            .write()
            .remove(name)
            .ok_or_else(|| DbError::NotFound(name.to_string()))?;
        let layout = DataLayout::new(pager);
        layout.delete(loc)?;
        let meta = self.read_meta(pager, meta_page)?;
        let mut current = meta.first_data_page;
        while current != 0 {
            let next = pager.read(current)?.header()?.next_page_id;
            pager.free(current)?;
            current = next;
        }
        pager.free(meta_page)?;
        Ok(())
    }

    pub fn read_meta(&self, pager: &PageManager, meta_page: PageId) -> Result<CollectionMeta> {
        let page = pager.read(meta_page)?;
        let len = u32::from_le_bytes(page.payload()[0..4].try_into().unwrap()) as usize;
        CollectionMeta::decode(&page.payload()[4..4 + len])
    }

    pub fn write_meta(&self, pager: &PageManager, meta_page: PageId, meta: &CollectionMeta) -> Result<()> {
        let body = meta.encode();
        let mut page = pager.read(meta_page)?;
        page.payload_mut()[0..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
        page.payload_mut()[4..4 + body.len()].copy_from_slice(&body);
        page.recompute_checksum();
        pager.write(meta_page, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_find_and_drop_collection() {
        let dir = tempfile::tempdir().unwrap();
        let pager = PageManager::open(dir.path().join("data.db"), 4096, 64).unwrap();
        let directory = CollectionDirectory::open(&pager, 0).unwrap();
        let meta_page = directory.create(&pager, "users").unwrap();
        assert!(directory.exists("users"));
        assert_eq!(directory.meta_page("users"), Some(meta_page));

        let meta = directory.read_meta(&pager, meta_page).unwrap();
        assert_eq!(meta.name, "users");

        directory.drop_collection(&pager, "users").unwrap();
        assert!(!directory.exists("users"));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pager = PageManager::open(dir.path().join("data.db"), 4096, 64).unwrap();
        let directory = CollectionDirectory::open(&pager, 0).unwrap();
        directory.create(&pager, "users").unwrap();
        assert!(matches!(directory.create(&pager, "users"), Err(DbError::AlreadyExists(_))));
    }

    #[test]
    fn reopen_recovers_directory_from_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let root = {
            let pager = PageManager::open(&path, 4096, 64).unwrap();
            let directory = CollectionDirectory::open(&pager, 0).unwrap();
            directory.create(&pager, "users").unwrap();
            directory.create(&pager, "orders").unwrap();
            directory.root()
        };
        let pager = PageManager::open(&path, 4096, 64).unwrap();
        let directory = CollectionDirectory::open(&pager, root).unwrap();
        let mut names = directory.names();
        names.sort();
        assert_eq!(names, vec!["orders".to_string(), "users".to_string()]);
    }
}
