//! Master catalog.
//!
//! The catalog is a JSON document owned by the system collection and always
//! stored at [`MASTER_ROW`]. It lists every collection with its id, its
//! automatic id kind and its indexes (including the sentinel addresses of
//! each skip list).

use crate::error::{Result, StorageError};
use crate::types::{PageId, RowAddress, SYSTEM_COLLECTION_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row address of the catalog document
pub const MASTER_ROW: RowAddress = RowAddress::new(PageId::new(1), 0);

/// Name of the primary key index present on every collection
pub const PK_INDEX: &str = "_id";

/// Expression of the primary key index
pub const PK_EXPRESSION: &str = "$._id";

/// Most indexes a collection can carry, primary key included
pub const MAX_INDEXES: usize = 32;

const MAX_NAME_LENGTH: usize = 60;

/// Type of generated document ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoId {
    #[default]
    Int32,
    Int64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    /// Tag stored in every node of this index
    pub slot: u8,
    pub expression: String,
    pub unique: bool,
    pub head: RowAddress,
    pub tail: RowAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub id: u8,
    pub name: String,
    pub auto_id: AutoId,
    pub indexes: BTreeMap<String, IndexMeta>,
}

impl CollectionMeta {
    pub fn new(id: u8, name: &str, auto_id: AutoId) -> Self {
        Self {
            id,
            name: name.to_string(),
            auto_id,
            indexes: BTreeMap::new(),
        }
    }

    pub fn pk(&self) -> Result<&IndexMeta> {
        self.index(PK_INDEX)
    }

    pub fn index(&self, name: &str) -> Result<&IndexMeta> {
        self.indexes
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound(format!("{}.{}", self.name, name)))
    }

    /// Indexes ordered by slot; the primary key comes first
    pub fn indexes_by_slot(&self) -> Vec<&IndexMeta> {
        let mut indexes: Vec<&IndexMeta> = self.indexes.values().collect();
        indexes.sort_by_key(|index| index.slot);
        indexes
    }

    /// Lowest unused index slot
    pub fn next_slot(&self) -> Result<u8> {
        (0..MAX_INDEXES as u8)
            .find(|slot| self.indexes.values().all(|index| index.slot != *slot))
            .ok_or_else(|| {
                StorageError::invalid_operation(format!(
                    "collection '{}' already has {} indexes",
                    self.name, MAX_INDEXES
                ))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub collections: BTreeMap<String, CollectionMeta>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn get(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.get(name)
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionMeta> {
        self.get(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))
    }

    pub fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionMeta> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn add(&mut self, meta: CollectionMeta) {
        self.collections.insert(meta.name.clone(), meta);
    }

    pub fn remove(&mut self, name: &str) -> Option<CollectionMeta> {
        self.collections.remove(name)
    }

    /// Lowest collection id not in use. Id 0 marks unowned extents and the
    /// system collection holds the highest id.
    pub fn next_collection_id(&self) -> Result<u8> {
        (1..SYSTEM_COLLECTION_ID)
            .find(|id| self.collections.values().all(|meta| meta.id != *id))
            .ok_or_else(|| StorageError::invalid_operation("too many collections"))
    }

    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LENGTH
            && !name.starts_with('$')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$');
        if valid {
            Ok(())
        } else {
            Err(StorageError::invalid_operation(format!(
                "invalid collection or index name '{}'",
                name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(name: &str, slot: u8) -> IndexMeta {
        IndexMeta {
            name: name.to_string(),
            slot,
            expression: format!("$.{}", name),
            unique: false,
            head: RowAddress::new(PageId::new(9), 0),
            tail: RowAddress::new(PageId::new(9), 1),
        }
    }

    #[test]
    fn test_catalog_document() -> Result<()> {
        let mut catalog = Catalog::new();
        let mut users = CollectionMeta::new(1, "users", AutoId::Int64);
        users.indexes.insert(PK_INDEX.to_string(), index(PK_INDEX, 0));
        users.indexes.insert("age".to_string(), index("age", 1));
        catalog.add(users);

        let loaded = Catalog::from_bytes(&catalog.to_bytes()?)?;
        assert_eq!(loaded, catalog);

        let users = loaded.collection("users")?;
        assert_eq!(users.pk()?.slot, 0);
        assert_eq!(users.indexes_by_slot()[1].name, "age");
        assert_eq!(users.next_slot()?, 2);
        assert!(matches!(users.index("name"), Err(StorageError::IndexNotFound(_))));
        assert!(matches!(loaded.collection("orders"), Err(StorageError::CollectionNotFound(_))));
        Ok(())
    }

    #[test]
    fn test_collection_ids_are_reused() -> Result<()> {
        let mut catalog = Catalog::new();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            catalog.add(CollectionMeta::new(id, name, AutoId::Int32));
        }
        assert_eq!(catalog.next_collection_id()?, 4);

        catalog.remove("b");
        assert_eq!(catalog.next_collection_id()?, 2);
        Ok(())
    }

    #[test]
    fn test_name_validation() {
        assert!(Catalog::validate_name("users").is_ok());
        assert!(Catalog::validate_name("order_items-2").is_ok());
        assert!(Catalog::validate_name("").is_err());
        assert!(Catalog::validate_name("$master").is_err());
        assert!(Catalog::validate_name("white space").is_err());
        assert!(Catalog::validate_name(&"x".repeat(61)).is_err());
    }
}
