//! Secondary indexes: a named B+ tree of postings lists.
//!
//! One index key (a column value rendered as a string) maps to the list of
//! primary record ids carrying that value. The index itself only stores and
//! returns whole postings lists. Keeping a list's membership correct
//! (appending on insert, removing on delete, dropping the key once the list
//! empties) is the engine's responsibility.

use super::btree::BPlusTree;
use super::RecordId;
use crate::errors::Error;

pub struct Index {
    name: String,
    primary: bool,
    tree: BPlusTree<String, Vec<RecordId>>,
}

impl Index {
    pub fn new(name: &str, primary: bool, order: usize) -> Self {
        Index {
            name: name.to_string(),
            primary,
            tree: BPlusTree::new(order),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Stores the postings list for a key, replacing any previous list.
    pub fn insert(&mut self, key: &str, postings: Vec<RecordId>) -> Result<(), Error> {
        self.tree.insert(key.to_string(), postings)?;
        Ok(())
    }

    /// The postings list for a key, if the key is indexed.
    pub fn search(&self, key: &str) -> Option<&Vec<RecordId>> {
        self.tree.get(&key.to_string())
    }

    /// Drops a key and its postings list.
    ///
    /// # Errors
    /// Returns `Error::Storage` when the key is not indexed.
    pub fn remove(&mut self, key: &str) -> Result<Vec<RecordId>, Error> {
        self.tree.delete(&key.to_string())
    }

    /// Number of distinct keys in the index.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Adds one id to a key's postings list, creating the list on first use.
    /// This is the append half of the membership contract the engine drives.
    pub fn add_posting(&mut self, key: &str, id: RecordId) -> Result<(), Error> {
        let mut postings = match self.search(key) {
            Some(existing) => existing.clone(),
            None => Vec::new(),
        };
        if !postings.contains(&id) {
            postings.push(id);
        }
        self.insert(key, postings)
    }

    /// Removes one id from a key's postings list, dropping the key once the
    /// list empties.
    pub fn remove_posting(&mut self, key: &str, id: RecordId) -> Result<(), Error> {
        let mut postings = match self.search(key) {
            Some(existing) => existing.clone(),
            None => return Ok(()),
        };
        postings.retain(|posting| *posting != id);
        if postings.is_empty() {
            self.remove(key)?;
        } else {
            self.insert(key, postings)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_search() {
        let mut index = Index::new("users_by_email", false, 4);
        index.insert("a@x.com", vec![1]).unwrap();
        assert_eq!(index.search("a@x.com"), Some(&vec![1]));
        assert_eq!(index.search("b@x.com"), None);
        assert_eq!(index.len(), 1);
        assert!(!index.is_primary());
        assert_eq!(index.name(), "users_by_email");
    }

    #[test]
    fn test_postings_accumulate_per_key() {
        let mut index = Index::new("accounts_by_owner", false, 4);
        index.add_posting("alice", 1).unwrap();
        index.add_posting("alice", 2).unwrap();
        index.add_posting("bob", 3).unwrap();
        assert_eq!(index.search("alice"), Some(&vec![1, 2]));
        assert_eq!(index.search("bob"), Some(&vec![3]));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_add_posting_is_idempotent_per_id() {
        let mut index = Index::new("accounts_by_owner", false, 4);
        index.add_posting("alice", 1).unwrap();
        index.add_posting("alice", 1).unwrap();
        assert_eq!(index.search("alice"), Some(&vec![1]));
    }

    #[test]
    fn test_emptied_postings_list_is_deleted() {
        let mut index = Index::new("accounts_by_owner", false, 4);
        index.add_posting("alice", 1).unwrap();
        index.add_posting("alice", 2).unwrap();
        index.remove_posting("alice", 1).unwrap();
        assert_eq!(index.search("alice"), Some(&vec![2]));
        index.remove_posting("alice", 2).unwrap();
        assert_eq!(index.search("alice"), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_absent_key_errors() {
        let mut index = Index::new("users_by_email", false, 4);
        assert!(index.remove("ghost").is_err());
    }
}
