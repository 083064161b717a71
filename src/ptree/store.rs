//! Key-value backends for the prefix tree.
//!
//! The tree never touches a backend directly while it restructures nodes.
//! Each `insert` or `remove` stages its writes in a [`Batch`] and hands the
//! batch to [`NodeStore::commit`], so a crash between a split and the
//! matching parent update cannot leave a half-written tree behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use redb::{Database, TableDefinition};

use crate::error::TreeError;

/// Table: prefix tree nodes
/// Key:   encoded key bit string
/// Value: node record
const NODES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ptree-nodes-1");

/// Table: membership index
/// Key:   element bytes
/// Value: `()`
const ELEMENTS_TABLE: TableDefinition<&[u8], ()> = TableDefinition::new("ptree-elements-1");

/// Staged node and membership writes, applied atomically.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    /// `Some(record)` to upsert, `None` to delete.
    pub nodes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// `true` to add a member, `false` to remove it.
    pub elements: BTreeMap<Vec<u8>, bool>,
}

impl Batch {
    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.elements.is_empty()
    }
}

/// Persistence seam for [`PrefixTree`](super::PrefixTree).
pub trait NodeStore: Send + Sync {
    /// Reads a node record.
    fn get_node(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError>;
    /// Membership lookup by element bytes.
    fn has_element(&self, element: &[u8]) -> Result<bool, TreeError>;
    /// Applies a batch atomically.
    fn commit(&mut self, batch: Batch) -> Result<(), TreeError>;
    /// Removes every node and member.
    fn clear(&mut self) -> Result<(), TreeError>;
}

/// In-memory store for tests and throwaway trees.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    nodes: BTreeMap<Vec<u8>, Vec<u8>>,
    elements: BTreeMap<Vec<u8>, ()>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored node records.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl NodeStore for MemStore {
    fn get_node(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        Ok(self.nodes.get(key).cloned())
    }

    fn has_element(&self, element: &[u8]) -> Result<bool, TreeError> {
        Ok(self.elements.contains_key(element))
    }

    fn commit(&mut self, batch: Batch) -> Result<(), TreeError> {
        for (key, value) in batch.nodes {
            match value {
                Some(record) => {
                    self.nodes.insert(key, record);
                }
                None => {
                    self.nodes.remove(&key);
                }
            }
        }
        for (element, present) in batch.elements {
            if present {
                self.elements.insert(element, ());
            } else {
                self.elements.remove(&element);
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), TreeError> {
        self.nodes.clear();
        self.elements.clear();
        Ok(())
    }
}

/// On-disk store backed by a `redb` database file.
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl RedbStore {
    /// Opens or creates the database at `path` and ensures both tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TreeError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;
        let write_tx = db.begin_write()?;
        {
            let _nodes = write_tx.open_table(NODES_TABLE)?;
            let _elements = write_tx.open_table(ELEMENTS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(RedbStore { db, path })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the database and deletes its file.
    pub fn destroy(self) -> Result<(), TreeError> {
        let path = self.path.clone();
        drop(self.db);
        std::fs::remove_file(&path).map_err(|err| TreeError::Store(err.to_string()))
    }
}

impl NodeStore for RedbStore {
    fn get_node(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(NODES_TABLE)?;
        let Some(record) = table.get(key)? else {
            return Ok(None);
        };
        Ok(Some(record.value().to_vec()))
    }

    fn has_element(&self, element: &[u8]) -> Result<bool, TreeError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(ELEMENTS_TABLE)?;
        Ok(table.get(element)?.is_some())
    }

    fn commit(&mut self, batch: Batch) -> Result<(), TreeError> {
        if batch.is_empty() {
            return Ok(());
        }
        let write_tx = self.db.begin_write()?;
        {
            let mut nodes = write_tx.open_table(NODES_TABLE)?;
            for (key, value) in &batch.nodes {
                match value {
                    Some(record) => {
                        nodes.insert(key.as_slice(), record.as_slice())?;
                    }
                    None => {
                        nodes.remove(key.as_slice())?;
                    }
                }
            }
            let mut elements = write_tx.open_table(ELEMENTS_TABLE)?;
            for (element, present) in &batch.elements {
                if *present {
                    elements.insert(element.as_slice(), ())?;
                } else {
                    elements.remove(element.as_slice())?;
                }
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), TreeError> {
        let write_tx = self.db.begin_write()?;
        write_tx.delete_table(NODES_TABLE)?;
        write_tx.delete_table(ELEMENTS_TABLE)?;
        {
            let _nodes = write_tx.open_table(NODES_TABLE)?;
            let _elements = write_tx.open_table(ELEMENTS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(())
    }
}
