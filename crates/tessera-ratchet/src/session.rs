//! One conversation: ratchet engine, session MAC key and outbound sequence
//! numbers.
//!
//! The MAC key is derived once from the handshake secret and bound to the
//! session id, so records from one conversation never verify in another.
//! The session id is also the AEAD associated data of every message.

use serde::{Deserialize, Serialize};
use tessera_crypto::blake3::{self, contexts};
use tessera_crypto::kdf::{self, labels};
use tessera_crypto::x25519::{KeyPair, X25519PublicKey};
use tessera_types::message::{EncryptedMessage, MessageType};
use tessera_types::SessionId;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codec;
use crate::engine::{DoubleRatchet, RatchetConfig};
use crate::state::{RatchetState, Role};
use crate::Result;

/// Serializable form of a [`Session`], encrypted by the arena before it is
/// stored.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionRecord {
    #[zeroize(skip)]
    pub(crate) session_id: SessionId,
    pub(crate) state: RatchetState,
    pub(crate) mac_key: [u8; 32],
    pub(crate) next_sequence: u64,
    pub(crate) established: bool,
}

/// A live conversation.
#[derive(Clone)]
pub struct Session {
    session_id: SessionId,
    engine: DoubleRatchet,
    mac_key: Zeroizing<[u8; 32]>,
    next_sequence: u64,
    /// The peer has been heard from at least once.
    established: bool,
}

fn session_mac_key(session_id: &str, shared_secret: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    let bound = Zeroizing::new(blake3::derive_key(
        contexts::SESSION_ID,
        &blake3::encode_multi_field(&[session_id.as_bytes(), shared_secret]),
    ));
    Ok(Zeroizing::new(kdf::derive_32(&bound, labels::SESSION_MAC_KEY)?))
}

impl Session {
    /// Start a conversation as the initiator.
    pub fn initiate(
        session_id: &str,
        shared_secret: &[u8; 32],
        remote_ratchet_public: &X25519PublicKey,
        config: RatchetConfig,
    ) -> Result<Self> {
        Ok(Self {
            session_id: session_id.to_string(),
            engine: DoubleRatchet::initiate(shared_secret, remote_ratchet_public, config)?,
            mac_key: session_mac_key(session_id, shared_secret)?,
            next_sequence: 0,
            established: false,
        })
    }

    /// Accept a conversation as the responder.
    pub fn respond(
        session_id: &str,
        shared_secret: &[u8; 32],
        own_ratchet: KeyPair,
        config: RatchetConfig,
    ) -> Result<Self> {
        Ok(Self {
            session_id: session_id.to_string(),
            engine: DoubleRatchet::respond(shared_secret, own_ratchet, config)?,
            mac_key: session_mac_key(session_id, shared_secret)?,
            next_sequence: 0,
            established: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn engine(&self) -> &DoubleRatchet {
        &self.engine
    }

    /// Sequence number the next outbound message will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Encrypt and MAC one outbound message.
    pub fn send(&mut self, plaintext: &[u8], timestamp: u64) -> Result<EncryptedMessage> {
        let message_type = if self.engine.state().role() == Role::Initiator && !self.established
        {
            MessageType::Prekey
        } else {
            MessageType::Message
        };
        let (bundle, header) = self
            .engine
            .encrypt_next(plaintext, self.session_id.as_bytes())?;
        let message = codec::wrap(
            bundle,
            header,
            &self.mac_key,
            self.next_sequence,
            timestamp,
            message_type,
        );
        self.next_sequence += 1;
        Ok(message)
    }

    /// Verify the MAC, then decrypt. On any error the session is unchanged.
    pub fn receive(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>> {
        if self.engine.is_closed() {
            return Err(crate::RatchetError::SessionClosed);
        }
        let verified = codec::unwrap(message, &self.mac_key)?;
        let plaintext =
            self.engine
                .decrypt_at(&verified.header, &verified.bundle, self.session_id.as_bytes())?;
        self.established = true;
        Ok(plaintext)
    }

    /// Zeroize all key material. The session refuses further use.
    pub fn close(&mut self) {
        self.engine.close();
        self.mac_key.zeroize();
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            state: self.engine.state().clone(),
            mac_key: *self.mac_key,
            next_sequence: self.next_sequence,
            established: self.established,
        }
    }

    pub fn from_record(record: &SessionRecord, config: RatchetConfig) -> Self {
        Self {
            session_id: record.session_id.clone(),
            engine: DoubleRatchet::from_state(record.state.clone(), config),
            mac_key: Zeroizing::new(record.mac_key),
            next_sequence: record.next_sequence,
            established: record.established,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("next_sequence", &self.next_sequence)
            .field("established", &self.established)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
