//! Append-only, hash-chained ledger backed by a Merkle tree.
//!
//! Every entry commits to the hash of its predecessor, and every entry hash
//! is a leaf of the Merkle tree. When a store is attached, each entry is
//! written to `ledger/entry/{position:020}` before `append` returns, and
//! [`MerkleLedger::open`] replays and re-verifies the stored chain.

use std::sync::Arc;

use tessera_crypto::blake3;
use tessera_store::{get_json, set_json, KeyValueStore};
use tessera_types::ledger::{LedgerEntry, ProofStep};
use tessera_types::{Hash, GENESIS_HASH};
use tracing::{debug, error, info};

use crate::merkle::{compute_root, MerkleSnapshot, MerkleTree};
use crate::{LedgerError, Result};

const ENTRY_PREFIX: &str = "ledger/entry/";

fn entry_key(position: u64) -> String {
    format!("{ENTRY_PREFIX}{position:020}")
}

/// Hash of an entry: the Merkle leaf hash of its canonical encoding.
pub fn entry_hash(entry: &LedgerEntry) -> Hash {
    blake3::merkle_leaf(&entry.canonical_bytes())
}

/// The ledger. Single writer; readers take a [`LedgerSnapshot`].
pub struct MerkleLedger {
    entries: Vec<LedgerEntry>,
    tree: MerkleTree,
    store: Option<Arc<dyn KeyValueStore>>,
}

/// Consistent read-only view of the ledger at one point in time.
#[derive(Clone, Debug)]
pub struct LedgerSnapshot {
    pub entries: Vec<LedgerEntry>,
    pub tree: MerkleSnapshot,
}

impl MerkleLedger {
    /// An empty, in-memory ledger.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            tree: MerkleTree::new(),
            store: None,
        }
    }

    /// Open a persistent ledger, replaying every stored entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::IntegrityViolation`] if the stored entries do
    /// not form an unbroken hash chain.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut ledger = Self::new();
        let keys = store.list_keys(ENTRY_PREFIX)?;
        for (expected, key) in keys.iter().enumerate() {
            if *key != entry_key(expected as u64) {
                return Err(LedgerError::IntegrityViolation(format!(
                    "missing entry at position {expected}"
                )));
            }
            let entry: LedgerEntry = get_json(&*store, key)?.ok_or_else(|| {
                LedgerError::IntegrityViolation(format!("entry {expected} vanished during load"))
            })?;
            ledger.check_link(&entry)?;
            ledger.tree.push(entry_hash(&entry));
            ledger.entries.push(entry);
        }
        ledger.store = Some(store);
        info!(entries = ledger.len(), root = %hex::encode(ledger.root()), "Ledger opened");
        Ok(ledger)
    }

    /// Append a payload. The payload itself is not kept, only its hash.
    pub fn append(&mut self, payload: &[u8], timestamp: u64) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            payload_hash: blake3::hash(payload),
            previous_hash: self.head_hash(),
            chain_position: self.entries.len() as u64,
            timestamp,
        };
        if let Some(store) = &self.store {
            if let Err(e) = set_json(&**store, &entry_key(entry.chain_position), &entry) {
                error!(position = entry.chain_position, "Failed to persist ledger entry: {e}");
                return Err(e.into());
            }
        }
        self.tree.push(entry_hash(&entry));
        self.entries.push(entry.clone());
        debug!(
            position = entry.chain_position,
            root = %hex::encode(self.root()),
            "Appended ledger entry"
        );
        Ok(entry)
    }

    fn head_hash(&self) -> Hash {
        self.entries.last().map_or(GENESIS_HASH, entry_hash)
    }

    fn check_link(&self, entry: &LedgerEntry) -> Result<()> {
        let position = self.entries.len() as u64;
        if entry.chain_position != position {
            return Err(LedgerError::IntegrityViolation(format!(
                "entry at {position} claims position {}",
                entry.chain_position
            )));
        }
        if !blake3::digest_eq(&entry.previous_hash, &self.head_hash()) {
            return Err(LedgerError::IntegrityViolation(format!(
                "chain break at position {position}"
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, position: u64) -> Option<&LedgerEntry> {
        self.entries.get(usize::try_from(position).ok()?)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    /// Historical root over the first `tree_size` entries.
    pub fn root_at(&self, tree_size: u64) -> Result<Hash> {
        self.tree.root_at(tree_size as usize)
    }

    pub fn get_proof(&self, index: u64) -> Result<Vec<ProofStep>> {
        self.tree.get_proof(index as usize)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            entries: self.entries.clone(),
            tree: self.tree.snapshot(),
        }
    }

    /// Re-check every link of the hash chain and the tree over it.
    pub fn verify_chain(&self) -> Result<()> {
        let mut previous = GENESIS_HASH;
        let mut hashes = Vec::with_capacity(self.entries.len());
        for (position, entry) in self.entries.iter().enumerate() {
            if entry.chain_position != position as u64 {
                return Err(LedgerError::IntegrityViolation(format!(
                    "entry at {position} claims position {}",
                    entry.chain_position
                )));
            }
            if !blake3::digest_eq(&entry.previous_hash, &previous) {
                return Err(LedgerError::IntegrityViolation(format!(
                    "chain break at position {position}"
                )));
            }
            previous = entry_hash(entry);
            hashes.push(previous);
        }
        if hashes.as_slice() != self.tree.leaves()
            || !blake3::digest_eq(&compute_root(&hashes), &self.root())
        {
            return Err(LedgerError::IntegrityViolation(
                "merkle tree disagrees with entries".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MerkleLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MerkleLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleLedger")
            .field("entries", &self.entries.len())
            .field("root", &hex::encode(self.root()))
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl LedgerSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn root(&self) -> Hash {
        self.tree.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_store::MemoryStore;

    fn ledger_with(n: u64) -> MerkleLedger {
        let mut ledger = MerkleLedger::new();
        for i in 0..n {
            ledger
                .append(format!("tx-{i}").as_bytes(), 1_000 + i)
                .expect("append");
        }
        ledger
    }

    #[test]
    fn test_genesis_and_chain() {
        let ledger = ledger_with(3);
        let entries = ledger.entries();
        assert_eq!(entries[0].previous_hash, GENESIS_HASH);
        assert_eq!(entries[1].previous_hash, entry_hash(&entries[0]));
        assert_eq!(entries[2].previous_hash, entry_hash(&entries[1]));
        assert_eq!(entries[2].chain_position, 2);
        assert_eq!(entries[0].payload_hash, blake3::hash(b"tx-0"));
        ledger.verify_chain().expect("intact");
    }

    #[test]
    fn test_root_matches_recursive_hash() {
        let ledger = ledger_with(6);
        let hashes: Vec<Hash> = ledger.entries().iter().map(entry_hash).collect();
        assert_eq!(ledger.root(), compute_root(&hashes));
    }

    #[test]
    fn test_every_entry_provable() {
        let ledger = ledger_with(7);
        for entry in ledger.entries() {
            let proof = ledger.get_proof(entry.chain_position).expect("proof");
            assert!(MerkleTree::verify_proof(&entry_hash(entry), &proof, &ledger.root()));
        }
    }

    #[test]
    fn test_post_hoc_alteration_detected() {
        let mut ledger = ledger_with(5);
        let old_root = ledger.root();
        let proof = ledger.get_proof(2).expect("proof");

        ledger.entries[2].payload_hash = blake3::hash(b"forged");
        assert!(matches!(
            ledger.verify_chain(),
            Err(LedgerError::IntegrityViolation(_))
        ));
        // The altered entry no longer proves against the published root.
        assert!(!MerkleTree::verify_proof(
            &entry_hash(&ledger.entries[2]),
            &proof,
            &old_root
        ));
    }

    #[test]
    fn test_altered_tree_detected() {
        let mut ledger = ledger_with(4);
        ledger.tree = MerkleTree::from_leaves(&[[0u8; 32]; 4]);
        assert!(ledger.verify_chain().is_err());
    }

    #[test]
    fn test_root_at_is_historical() {
        let mut ledger = ledger_with(3);
        let root3 = ledger.root();
        ledger.append(b"later", 9_999).expect("append");
        assert_eq!(ledger.root_at(3).expect("root"), root3);
        assert_ne!(ledger.root(), root3);
        assert!(ledger.root_at(5).is_err());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let mut ledger = ledger_with(2);
        let snapshot = ledger.snapshot();
        ledger.append(b"more", 5).expect("append");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.root(), ledger.root_at(2).expect("root"));
    }

    #[test]
    fn test_persistence_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let root = {
            let mut ledger = MerkleLedger::open(store.clone()).expect("open");
            for i in 0..4u64 {
                ledger.append(&i.to_le_bytes(), i).expect("append");
            }
            ledger.root()
        };
        let mut reopened = MerkleLedger::open(store.clone()).expect("reopen");
        assert_eq!(reopened.len(), 4);
        assert_eq!(reopened.root(), root);
        let next = reopened.append(b"after reload", 10).expect("append");
        assert_eq!(next.chain_position, 4);
        assert_eq!(next.previous_hash, entry_hash(&reopened.entries()[3]));
    }

    #[test]
    fn test_tampered_store_rejected_on_open() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut ledger = MerkleLedger::open(store.clone()).expect("open");
        for i in 0..3u64 {
            ledger.append(&i.to_le_bytes(), i).expect("append");
        }

        let mut forged = ledger.entries()[1].clone();
        forged.timestamp += 1;
        set_json(&*store, &entry_key(1), &forged).expect("overwrite");
        assert!(matches!(
            MerkleLedger::open(store.clone()),
            Err(LedgerError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_gap_in_store_rejected() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut ledger = MerkleLedger::open(store.clone()).expect("open");
        ledger.append(b"a", 1).expect("append");
        ledger.append(b"b", 2).expect("append");
        store.delete(&entry_key(0)).expect("delete");
        assert!(MerkleLedger::open(store).is_err());
    }
}
