//! Key storage as seen by the recon peer.
//!
//! Storage owns the key material.  The tree only ever holds digests: every
//! key is hashed to a field element, and [`KeyChange`] events tell the peer
//! which digests to add or drop.  Recovered digests go the other way, through
//! a fetch function that turns them into key material for [`Storage::insert`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::field::Zp;
use crate::net::{Peer, Recover};
use crate::ptree::NodeStore;

/// Bytes of the key hash kept as the element value.
pub const DIGEST_LEN: usize = 16;

/// Hashes key material to its tree element.
pub fn key_digest(p: &Arc<BigUint>, key: &[u8]) -> Zp {
    let hash = Sha256::digest(key);
    Zp::from_bytes(p, &hash[..DIGEST_LEN])
}

/// A change to the stored key set, by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    /// A new key was stored.
    Added(Zp),
    /// A key was deleted.
    Removed(Zp),
    /// A key was replaced by an updated version.
    Replaced {
        /// Digest of the old version.
        old: Zp,
        /// Digest of the new version.
        new: Zp,
    },
}

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("key rejected: {0}")]
    /// A key could not be stored.
    Rejected(String),
    #[error("no key with digest {0}")]
    /// A digest has no stored key.
    NotFound(String),
    #[error("key source unavailable: {0}")]
    /// Recovered keys could not be fetched.
    Unavailable(String),
}

/// A key store the peer can reconcile.
pub trait Storage: Send + Sync {
    /// Stores keys, returning how many were new alongside the first error.
    fn insert(&self, keys: Vec<Vec<u8>>) -> (usize, Result<(), StorageError>);

    /// Receives every subsequent change.
    fn subscribe(&self) -> broadcast::Receiver<KeyChange>;

    /// Looks keys up by digest, skipping unknown ones.
    fn fetch(&self, digests: &[Zp]) -> Vec<Vec<u8>>;
}

/// In-memory [`Storage`] keyed by digest.
pub struct MemStorage {
    p: Arc<BigUint>,
    keys: RwLock<BTreeMap<Zp, Vec<u8>>>,
    changes: broadcast::Sender<KeyChange>,
}

impl MemStorage {
    /// An empty store digesting into the field `p`.
    pub fn new(p: Arc<BigUint>) -> Self {
        let (changes, _) = broadcast::channel(1024);
        MemStorage {
            p,
            keys: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Digests of every stored key.
    pub fn digests(&self) -> Vec<Zp> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.keys().cloned().collect()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes the key with `digest`.
    pub fn remove(&self, digest: &Zp) -> Result<(), StorageError> {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if keys.remove(digest).is_none() {
            return Err(StorageError::NotFound(digest.to_string()));
        }
        drop(keys);
        let _ = self.changes.send(KeyChange::Removed(digest.clone()));
        Ok(())
    }

    /// Swaps the key with digest `old` for `key`.
    pub fn replace(&self, old: &Zp, key: Vec<u8>) -> Result<Zp, StorageError> {
        let new = key_digest(&self.p, &key);
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if keys.remove(old).is_none() {
            return Err(StorageError::NotFound(old.to_string()));
        }
        keys.insert(new.clone(), key);
        drop(keys);
        let _ = self.changes.send(KeyChange::Replaced {
            old: old.clone(),
            new: new.clone(),
        });
        Ok(new)
    }
}

impl Storage for MemStorage {
    fn insert(&self, new_keys: Vec<Vec<u8>>) -> (usize, Result<(), StorageError>) {
        let mut added = Vec::new();
        let mut result = Ok(());
        {
            let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
            for key in new_keys {
                if key.is_empty() {
                    if result.is_ok() {
                        result = Err(StorageError::Rejected("empty key".into()));
                    }
                    continue;
                }
                let digest = key_digest(&self.p, &key);
                if keys.contains_key(&digest) {
                    continue;
                }
                keys.insert(digest.clone(), key);
                added.push(digest);
            }
        }
        let n = added.len();
        for digest in added {
            let _ = self.changes.send(KeyChange::Added(digest));
        }
        (n, result)
    }

    fn subscribe(&self) -> broadcast::Receiver<KeyChange> {
        self.changes.subscribe()
    }

    fn fetch(&self, digests: &[Zp]) -> Vec<Vec<u8>> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        digests.iter().filter_map(|d| keys.get(d).cloned()).collect()
    }
}

fn apply_change<S: NodeStore + 'static>(peer: &Peer<S>, change: KeyChange) {
    match change {
        KeyChange::Added(digest) => peer.insert([digest]),
        KeyChange::Removed(digest) => peer.remove([digest]),
        KeyChange::Replaced { old, new } => {
            peer.remove([old]);
            peer.insert([new]);
        }
    }
}

/// Mirrors storage changes into the peer's tree until the storage side
/// closes.  Changes that arrive together are applied in one flush.
pub async fn pipe_storage_to_peer<S: NodeStore + 'static>(
    mut changes: broadcast::Receiver<KeyChange>,
    peer: Arc<Peer<S>>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                apply_change(&peer, change);
                while let Ok(change) = changes.try_recv() {
                    apply_change(&peer, change);
                }
                peer.flush().await;
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "storage changes dropped; tree may be stale until rebuilt");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("storage change feed closed");
}

/// Resolves each recovery into key material with `fetch`, stores it, and
/// signals the producing session.  Runs until the peer drops its sender.
pub async fn drain_recoveries<T, F>(mut recoveries: mpsc::Receiver<Recover>, storage: Arc<T>, fetch: F)
where
    T: Storage + ?Sized,
    F: Fn(&Recover) -> Result<Vec<Vec<u8>>, StorageError>,
{
    while let Some(recover) = recoveries.recv().await {
        let partner = recover
            .hkp_addr()
            .unwrap_or_else(|| recover.remote_addr.ip().to_string());
        match fetch(&recover) {
            Ok(keys) => {
                let fetched = keys.len();
                let (added, result) = storage.insert(keys);
                if let Err(err) = result {
                    warn!(%partner, %err, "some recovered keys were not stored");
                }
                info!(
                    %partner,
                    requested = recover.remote_elements.len(),
                    fetched,
                    added,
                    "recovered keys"
                );
            }
            Err(err) => warn!(%partner, %err, "cannot fetch recovered keys"),
        }
        recover.complete();
    }
}
