//! Wiring of store, keys, sessions and ledger into one running node.

use std::sync::Arc;

use anyhow::Context;
use tessera_crypto::argon2id::CostParams;
use tessera_crypto::ed25519::SigningKey;
use tessera_keys::{
    KeyLifecycleManager, KeyRotated, MasterKey, SystemClock, LEDGER_SEAL_KEY_ID,
    RATCHET_STATE_KEY_ID,
};
use tessera_ledger::{LedgerError, LocalSigner, MerkleLedger, TransactionSealer, Witness};
use tessera_ratchet::SessionArena;
use tessera_store::{KeyValueStore, SqliteStore};
use tessera_types::keys::{KeyAlgorithm, KeyUsage};
use tessera_types::ledger::TransactionSeal;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::config::DaemonConfig;
use crate::device;

const SIGNER_PREFIX: &str = "ledger/signer/";

/// A payload reached the ledger but its seal could not be produced.
#[derive(Debug, thiserror::Error)]
#[error("ledger entry {position} appended but not sealed")]
pub struct UnsealedEntry {
    pub position: u64,
    #[source]
    pub source: LedgerError,
}

/// Daemon-wide shared state.
pub struct Node {
    keys: Arc<KeyLifecycleManager>,
    arena: Mutex<SessionArena>,
    ledger: Mutex<MerkleLedger>,
    sealer: TransactionSealer,
}

impl Node {
    /// Open (or create) the node's state under `config.data_dir()`.
    pub fn open(
        config: &DaemonConfig,
        passphrase: Option<&[u8]>,
        params: CostParams,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open_in_dir(&data_dir)?);
        let device = device::load_or_create(&data_dir)?;

        let master = MasterKey::initialize(passphrase, &device, store.as_ref(), params)
            .context("initialising master key")?;
        let signers = open_signers(store.as_ref(), &master, config.ledger.min_witnesses)?;

        let keys = KeyLifecycleManager::open(
            store.clone(),
            master,
            Arc::new(SystemClock),
            config.lifecycle(),
        )?;
        keys.ensure_registered(
            RATCHET_STATE_KEY_ID,
            KeyAlgorithm::ChaCha20Poly1305,
            KeyUsage::Encryption,
        )?;
        keys.ensure_registered(
            LEDGER_SEAL_KEY_ID,
            KeyAlgorithm::ChaCha20Poly1305,
            KeyUsage::Encryption,
        )?;
        let keys = Arc::new(keys);

        let mut arena = SessionArena::new(store.clone(), keys.clone(), config.ratchet());
        let sessions = arena.load_all()?;
        let ledger = MerkleLedger::open(store.clone())?;

        let sealer = TransactionSealer::new(
            signers.transaction,
            Arc::new(signers.authority),
            signers.witnesses,
            keys.clone(),
            config.sealer(),
        )
        .context("configuring transaction sealer")?;

        info!(
            data_dir = %data_dir.display(),
            sessions,
            ledger_entries = ledger.len(),
            "Node opened"
        );
        Ok(Self {
            keys,
            arena: Mutex::new(arena),
            ledger: Mutex::new(ledger),
            sealer,
        })
    }

    pub fn keys(&self) -> &Arc<KeyLifecycleManager> {
        &self.keys
    }

    /// Append a payload to the ledger and seal the new entry.
    ///
    /// The append is durable before sealing starts. If sealing then fails the
    /// error is an [`UnsealedEntry`] naming the position, which stays in the
    /// ledger and can be sealed again with [`Node::seal_entry`].
    pub async fn record(&self, payload: &[u8], now: u64) -> anyhow::Result<TransactionSeal> {
        let mut ledger = self.ledger.lock().await;
        let position = ledger.append(payload, now)?.chain_position;
        self.sealer.seal(&ledger, position, now).map_err(|source| {
            warn!(position, "Ledger entry appended but not sealed: {source}");
            anyhow::Error::new(UnsealedEntry { position, source })
        })
    }

    /// Seal an entry already in the ledger.
    pub async fn seal_entry(&self, position: u64, now: u64) -> anyhow::Result<TransactionSeal> {
        let ledger = self.ledger.lock().await;
        Ok(self.sealer.seal(&ledger, position, now)?)
    }

    /// React to a key rotation.
    pub async fn handle_rotation(&self, rotated: &KeyRotated) {
        if rotated.key_id != RATCHET_STATE_KEY_ID {
            debug!(
                key_id = %rotated.key_id,
                version = rotated.new_version,
                "Rotation needs no re-encryption"
            );
            return;
        }
        self.reencrypt_sessions().await;
    }

    async fn reencrypt_sessions(&self) {
        let mut arena = self.arena.lock().await;
        if let Err(e) = arena.reencrypt_all() {
            error!("Re-encrypting session state failed: {e}");
        }
    }
}

/// Forward rotation notifications to the node until shutdown.
pub async fn watch_rotations(node: Arc<Node>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut rotations = node.keys().subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            event = rotations.recv() => match event {
                Ok(rotated) => node.handle_rotation(&rotated).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed rotation notifications");
                    node.reencrypt_sessions().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

struct Signers {
    transaction: SigningKey,
    authority: LocalSigner,
    witnesses: Vec<Arc<dyn Witness>>,
}

fn open_signers(
    store: &dyn KeyValueStore,
    master: &MasterKey,
    witnesses: usize,
) -> anyhow::Result<Signers> {
    let transaction = signing_key(store, master, "transaction")?;
    let authority = LocalSigner::new(signing_key(store, master, "authority")?);
    let witnesses = (0..witnesses)
        .map(|i| {
            let key = signing_key(store, master, &format!("witness-{i}"))?;
            Ok(Arc::new(LocalSigner::new(key)) as Arc<dyn Witness>)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Signers {
        transaction,
        authority,
        witnesses,
    })
}

/// Load a named Ed25519 key wrapped under the master key, creating it on
/// first use.
fn signing_key(
    store: &dyn KeyValueStore,
    master: &MasterKey,
    name: &str,
) -> anyhow::Result<SigningKey> {
    let slot = format!("{SIGNER_PREFIX}{name}");
    if let Some(wrapped) = store.get(&slot)? {
        let mut seed = master.unwrap(slot.as_bytes(), &wrapped)?;
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        return Ok(key);
    }
    let key = SigningKey::generate();
    let mut seed = key.to_bytes();
    let wrapped = master.wrap(slot.as_bytes(), &seed);
    seed.zeroize();
    store.set(&slot, &wrapped?)?;
    info!(name, "Created ledger signing key");
    Ok(key)
}
