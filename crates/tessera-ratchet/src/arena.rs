//! Session arena: owner of every live conversation.
//!
//! Each successful `send`/`receive` produces a new session state that is
//! written to the store before the caller sees the result. The state is CBOR
//! encoded and sealed with the active `ratchet-state` managed key:
//!
//! ```text
//! ratchet/session/{session_id} = CBOR{ key_version, sealed }
//! sealed = ChaCha20-Poly1305(derive(key[key_version], "STATE_AT_REST"),
//!                            CBOR(SessionRecord),
//!                            aad = LP(session_id) || LP(LE32 key_version))
//! ```
//!
//! The key version is pinned in the record, so sessions written before a
//! rotation stay readable for the retention window.
//! [`SessionArena::reencrypt_all`] moves them to the current version.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_crypto::blake3;
use tessera_crypto::chacha20::SealedBox;
use tessera_crypto::x25519::{KeyPair, X25519PublicKey};
use tessera_keys::{AtRestCipher, KeyError, KeyLifecycleManager, RATCHET_STATE_KEY_ID};
use tessera_store::{cbor, KeyValueStore, StoreError};
use tessera_types::message::EncryptedMessage;
use tessera_types::SessionId;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::engine::RatchetConfig;
use crate::session::{Session, SessionRecord};
use crate::{RatchetError, Result};

const SESSION_PREFIX: &str = "ratchet/session/";

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    key_version: u32,
    sealed: Vec<u8>,
}

fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

fn state_aad(session_id: &str, key_version: u32) -> Vec<u8> {
    blake3::encode_multi_field(&[session_id.as_bytes(), &key_version.to_le_bytes()])
}

fn persistence(e: StoreError) -> RatchetError {
    RatchetError::Persistence(e.to_string())
}

/// Owns all sessions and their encrypted persistence.
pub struct SessionArena {
    store: Arc<dyn KeyValueStore>,
    cipher: AtRestCipher,
    config: RatchetConfig,
    sessions: HashMap<SessionId, Session>,
}

impl SessionArena {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: Arc<KeyLifecycleManager>,
        config: RatchetConfig,
    ) -> Self {
        Self {
            store,
            cipher: AtRestCipher::new(keys, RATCHET_STATE_KEY_ID),
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    /// Create and persist a session as the initiator.
    pub fn initiate(
        &mut self,
        session_id: &str,
        shared_secret: &[u8; 32],
        remote_ratchet_public: &X25519PublicKey,
    ) -> Result<()> {
        self.ensure_absent(session_id)?;
        let session =
            Session::initiate(session_id, shared_secret, remote_ratchet_public, self.config)?;
        self.commit(session)?;
        info!(session_id, "Session initiated");
        Ok(())
    }

    /// Create and persist a session as the responder.
    pub fn respond(
        &mut self,
        session_id: &str,
        shared_secret: &[u8; 32],
        own_ratchet: KeyPair,
    ) -> Result<()> {
        self.ensure_absent(session_id)?;
        let session = Session::respond(session_id, shared_secret, own_ratchet, self.config)?;
        self.commit(session)?;
        info!(session_id, "Session accepted");
        Ok(())
    }

    fn ensure_absent(&self, session_id: &str) -> Result<()> {
        let stored = self
            .store
            .get(&session_key(session_id))
            .map_err(persistence)?
            .is_some();
        if stored || self.sessions.contains_key(session_id) {
            return Err(RatchetError::SessionExists(session_id.to_string()));
        }
        Ok(())
    }

    /// Encrypt a message on `session_id`.
    pub fn send(
        &mut self,
        session_id: &str,
        plaintext: &[u8],
        timestamp: u64,
    ) -> Result<EncryptedMessage> {
        let mut next = self.working_copy(session_id)?;
        let message = next.send(plaintext, timestamp)?;
        self.commit(next)?;
        Ok(message)
    }

    /// Verify and decrypt a message on `session_id`.
    pub fn receive(&mut self, session_id: &str, message: &EncryptedMessage) -> Result<Vec<u8>> {
        let mut next = self.working_copy(session_id)?;
        let plaintext = next.receive(message)?;
        self.commit(next)?;
        Ok(plaintext)
    }

    fn working_copy(&mut self, session_id: &str) -> Result<Session> {
        if !self.sessions.contains_key(session_id) {
            self.load(session_id)?;
        }
        self.sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| RatchetError::SessionNotFound(session_id.to_string()))
    }

    /// Persist `session`, then make it the live state.
    fn commit(&mut self, session: Session) -> Result<()> {
        self.persist(&session)?;
        self.sessions
            .insert(session.session_id().to_string(), session);
        Ok(())
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let session_id = session.session_id();
        let plain = Zeroizing::new(cbor::to_vec(&session.to_record()).map_err(persistence)?);
        let (key_version, sealed) = self
            .cipher
            .seal(&plain, |version| state_aad(session_id, version))?;
        let record = PersistedSession {
            key_version,
            sealed: sealed.to_bytes(),
        };
        let bytes = cbor::to_vec(&record).map_err(persistence)?;
        if let Err(e) = self.store.set(&session_key(session_id), &bytes) {
            error!(session_id, error = %e, "Failed to persist session state");
            return Err(persistence(e));
        }
        debug!(session_id, key_version, "Persisted session");
        Ok(())
    }

    /// Load a stored session into memory, replacing any in-memory copy.
    pub fn load(&mut self, session_id: &str) -> Result<()> {
        let bytes = self
            .store
            .get(&session_key(session_id))
            .map_err(persistence)?
            .ok_or_else(|| RatchetError::SessionNotFound(session_id.to_string()))?;
        let record: PersistedSession = cbor::from_slice(&bytes).map_err(persistence)?;

        let sealed = SealedBox::from_bytes(&record.sealed)?;
        let plain = Zeroizing::new(
            self.cipher
                .open(
                    record.key_version,
                    &sealed,
                    &state_aad(session_id, record.key_version),
                )
                .map_err(|e| match e {
                    KeyError::Crypto(_) => RatchetError::AuthenticationFailure,
                    other => RatchetError::Key(other),
                })?,
        );
        let session_record: SessionRecord = cbor::from_slice(&plain).map_err(persistence)?;
        let session = Session::from_record(&session_record, self.config);
        if session.session_id() != session_id {
            return Err(RatchetError::Persistence(format!(
                "record for {session_id} names {}",
                session.session_id()
            )));
        }
        self.sessions.insert(session_id.to_string(), session);
        debug!(session_id, key_version = record.key_version, "Loaded session");
        Ok(())
    }

    /// Load every stored session. Returns how many were loaded.
    pub fn load_all(&mut self) -> Result<usize> {
        let ids: Vec<String> = self
            .store
            .list_keys(SESSION_PREFIX)
            .map_err(persistence)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(SESSION_PREFIX).map(str::to_string))
            .collect();
        for id in &ids {
            self.load(id)?;
        }
        Ok(ids.len())
    }

    /// Re-seal every in-memory session under the active `ratchet-state`
    /// version. Returns how many were rewritten.
    pub fn reencrypt_all(&mut self) -> Result<usize> {
        for session in self.sessions.values() {
            self.persist(session)?;
        }
        info!(sessions = self.sessions.len(), "Re-encrypted session state");
        Ok(self.sessions.len())
    }

    /// Delete the stored state and zeroize the session.
    pub fn close(&mut self, session_id: &str) -> Result<()> {
        let in_memory = self.sessions.remove(session_id);
        let key = session_key(session_id);
        let stored = self.store.get(&key).map_err(persistence)?.is_some();
        if in_memory.is_none() && !stored {
            return Err(RatchetError::SessionNotFound(session_id.to_string()));
        }
        self.store.delete(&key).map_err(persistence)?;
        if let Some(mut session) = in_memory {
            session.close();
        }
        info!(session_id, "Session closed");
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tessera_crypto::x25519;
    use tessera_keys::{ManualClock, MasterKey, MasterKeySource};
    use tessera_store::MemoryStore;
    use tessera_types::keys::{KeyAlgorithm, KeyUsage, RotationReason};

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_sessions: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> tessera_store::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> tessera_store::Result<()> {
            if self.fail_sessions.load(Ordering::SeqCst) && key.starts_with(SESSION_PREFIX) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> tessera_store::Result<()> {
            self.inner.delete(key)
        }

        fn list_keys(&self, prefix: &str) -> tessera_store::Result<Vec<String>> {
            self.inner.list_keys(prefix)
        }
    }

    fn manager(store: Arc<dyn KeyValueStore>) -> Arc<KeyLifecycleManager> {
        let manager = KeyLifecycleManager::open(
            store,
            MasterKey::from_bytes([7; 32], MasterKeySource::UserProvisioned),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Default::default(),
        )
        .expect("open manager");
        manager
            .register(
                RATCHET_STATE_KEY_ID,
                KeyAlgorithm::ChaCha20Poly1305,
                KeyUsage::Encryption,
            )
            .expect("register");
        Arc::new(manager)
    }

    fn arenas(store: Arc<FlakyStore>) -> (SessionArena, SessionArena, Arc<KeyLifecycleManager>) {
        let keys = manager(store.clone());
        let bob_keys = x25519::generate_key_pair();
        let secret = [0x42; 32];
        let mut alice = SessionArena::new(store.clone(), keys.clone(), RatchetConfig::default());
        alice
            .initiate("alice->bob", &secret, &bob_keys.public)
            .expect("initiate");
        let bob_store = Arc::new(MemoryStore::new());
        let mut bob = SessionArena::new(bob_store.clone(), manager(bob_store), RatchetConfig::default());
        bob.respond("alice->bob", &secret, bob_keys).expect("respond");
        (alice, bob, keys)
    }

    #[test]
    fn test_send_receive_persists() {
        let store = Arc::new(FlakyStore::default());
        let (mut alice, mut bob, keys) = arenas(store.clone());
        let m1 = alice.send("alice->bob", b"hello", 1).expect("send");
        assert_eq!(bob.receive("alice->bob", &m1).expect("receive"), b"hello");

        let mut reloaded = SessionArena::new(store.clone(), keys, RatchetConfig::default());
        assert_eq!(reloaded.load_all().expect("load"), 1);
        let session = reloaded.get("alice->bob").expect("loaded");
        assert_eq!(session.next_sequence(), 1);
        let m2 = reloaded.send("alice->bob", b"from disk", 2).expect("send");
        assert_eq!(bob.receive("alice->bob", &m2).expect("receive"), b"from disk");
    }

    #[test]
    fn test_stored_state_is_encrypted() {
        let store = Arc::new(FlakyStore::default());
        let (mut alice, _, _) = arenas(store.clone());
        alice.send("alice->bob", b"secret plaintext", 1).expect("send");
        let bytes = store
            .get(&session_key("alice->bob"))
            .expect("get")
            .expect("stored");
        let record: PersistedSession = cbor::from_slice(&bytes).expect("decode");
        assert_eq!(record.key_version, 1);
        assert!(cbor::from_slice::<SessionRecord>(&record.sealed).is_err());
    }

    #[test]
    fn test_persistence_failure_does_not_advance() {
        let store = Arc::new(FlakyStore::default());
        let (mut alice, mut bob, _) = arenas(store.clone());

        store.fail_sessions.store(true, Ordering::SeqCst);
        assert!(matches!(
            alice.send("alice->bob", b"lost", 1),
            Err(RatchetError::Persistence(_))
        ));
        let session = alice.get("alice->bob").expect("session");
        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.engine().sending_counter(), 0);

        store.fail_sessions.store(false, Ordering::SeqCst);
        let message = alice.send("alice->bob", b"kept", 2).expect("send");
        assert_eq!(message.sequence_number, 0);
        assert_eq!(message.ratchet_header.counter, 0);
        assert_eq!(bob.receive("alice->bob", &message).expect("receive"), b"kept");
    }

    #[test]
    fn test_rotation_keeps_old_sessions_readable() {
        let store = Arc::new(FlakyStore::default());
        let (mut alice, _, keys) = arenas(store.clone());
        alice.send("alice->bob", b"one", 1).expect("send");

        keys.rotate(RATCHET_STATE_KEY_ID, RotationReason::Manual)
            .expect("rotate");
        let mut reloaded = SessionArena::new(store.clone(), keys.clone(), RatchetConfig::default());
        reloaded.load("alice->bob").expect("load under v1");

        assert_eq!(reloaded.reencrypt_all().expect("reencrypt"), 1);
        let bytes = store
            .get(&session_key("alice->bob"))
            .expect("get")
            .expect("stored");
        let record: PersistedSession = cbor::from_slice(&bytes).expect("decode");
        assert_eq!(record.key_version, 2);
    }

    #[test]
    fn test_duplicate_and_missing_sessions() {
        let store = Arc::new(FlakyStore::default());
        let (mut alice, _, keys) = arenas(store.clone());
        let remote = x25519::generate_key_pair().public;
        assert!(matches!(
            alice.initiate("alice->bob", &[1; 32], &remote),
            Err(RatchetError::SessionExists(_))
        ));

        let mut fresh = SessionArena::new(store.clone(), keys, RatchetConfig::default());
        assert!(matches!(
            fresh.initiate("alice->bob", &[1; 32], &remote),
            Err(RatchetError::SessionExists(_))
        ));
        assert!(matches!(
            fresh.send("nobody", b"x", 1),
            Err(RatchetError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_close_deletes_state() {
        let store = Arc::new(FlakyStore::default());
        let (mut alice, _, _) = arenas(store.clone());
        alice.close("alice->bob").expect("close");
        assert!(alice.is_empty());
        assert!(store
            .get(&session_key("alice->bob"))
            .expect("get")
            .is_none());
        assert!(matches!(
            alice.close("alice->bob"),
            Err(RatchetError::SessionNotFound(_))
        ));
    }
}
