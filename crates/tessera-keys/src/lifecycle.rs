//! Key lifecycle manager.
//!
//! Tracks every version of every managed key, rotates on schedule or on
//! demand, enforces the retention window for superseded versions and
//! destroys expired material.
//!
//! ## Persistence layout
//!
//! | Store key | Value |
//! |---|---|
//! | `keys/meta/{key_id}/{version:010}` | [`KeyMetadata`] as JSON |
//! | `keys/material/{key_id}/{version:010}` | material wrapped under the master key |
//! | `keys/escrow/{key_id}/{version:010}` | material encrypted by the KMS (optional) |
//! | `keys/audit/{seq:020}` | one [`RotationEvent`] as JSON |
//!
//! ## Status rules
//!
//! - Versions start at 1 and increase by exactly 1 per rotation.
//! - Status only moves forward: `active -> deprecated -> revoked`.
//! - At most one version of a key is active: the newest.
//! - A deprecated version is readable until `deprecated_at + retention_window`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use tessera_store::KeyValueStore;
use tessera_types::keys::{
    KeyAlgorithm, KeyMetadata, KeyStatus, KeyUsage, RotationEvent, RotationReason,
};
use tessera_types::KeyId;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::audit::{RotationAuditLog, DEFAULT_CAPACITY};
use crate::clock::Clock;
use crate::kms::KmsClient;
use crate::master::MasterKey;
use crate::{KeyError, Result};

const META_PREFIX: &str = "keys/meta/";
const MATERIAL_PREFIX: &str = "keys/material/";
const ESCROW_PREFIX: &str = "keys/escrow/";
const AUDIT_PREFIX: &str = "keys/audit/";

/// Capacity of the rotation notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle timing and retention settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Time from a version's creation until it is due for scheduled rotation.
    pub rotation_interval: Duration,
    /// How long a deprecated version stays readable.
    pub retention_window: Duration,
    /// Age after which non-active material is destroyed regardless of status.
    pub max_key_age: Duration,
    /// Maximum number of retained audit records.
    pub audit_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(90 * 24 * 60 * 60),
            retention_window: Duration::from_secs(30 * 24 * 60 * 60),
            max_key_age: Duration::from_secs(365 * 24 * 60 * 60),
            audit_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Key material pinned to one version. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct VersionedKey {
    #[zeroize(skip)]
    key_id: KeyId,
    #[zeroize(skip)]
    version: u32,
    material: [u8; 32],
}

impl VersionedKey {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn material(&self) -> &[u8; 32] {
        &self.material
    }
}

impl std::fmt::Debug for VersionedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedKey")
            .field("key_id", &self.key_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Notification sent to dependents after a successful rotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRotated {
    pub key_id: KeyId,
    pub old_version: u32,
    pub new_version: u32,
    pub reason: RotationReason,
}

/// Outcome of one [`KeyLifecycleManager::run_due_rotations`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub rotated: Vec<(KeyId, u32)>,
    pub failed: Vec<(KeyId, String)>,
}

#[derive(Default)]
struct KeyRecord {
    versions: BTreeMap<u32, KeyMetadata>,
}

impl KeyRecord {
    fn latest(&self) -> Option<&KeyMetadata> {
        self.versions.values().next_back()
    }

    fn active(&self) -> Option<&KeyMetadata> {
        self.versions
            .values()
            .rev()
            .find(|m| m.status == KeyStatus::Active)
    }

    fn usable_count(&self) -> usize {
        self.versions
            .values()
            .filter(|m| m.status != KeyStatus::Revoked && !m.material_destroyed)
            .count()
    }
}

struct Inner {
    keys: BTreeMap<KeyId, KeyRecord>,
    audit: RotationAuditLog,
}

/// Manages versioned symmetric keys.
///
/// `Send + Sync`; all mutation happens under one internal mutex. [`fetch`]
/// always returns a [`VersionedKey`] pinned to a version, so a rotation that
/// lands after a fetch never changes the key an in-flight operation uses.
///
/// [`fetch`]: KeyLifecycleManager::fetch
pub struct KeyLifecycleManager {
    store: Arc<dyn KeyValueStore>,
    master: MasterKey,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    kms: Option<Arc<dyn KmsClient>>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<KeyRotated>,
}

fn version_suffix(key_id: &str, version: u32) -> String {
    format!("{key_id}/{version:010}")
}

fn audit_key(seq: u64) -> String {
    format!("{AUDIT_PREFIX}{seq:020}")
}

fn meta_key(key_id: &str, version: u32) -> String {
    format!("{META_PREFIX}{}", version_suffix(key_id, version))
}

fn material_key(key_id: &str, version: u32) -> String {
    format!("{MATERIAL_PREFIX}{}", version_suffix(key_id, version))
}

fn escrow_key(key_id: &str, version: u32) -> String {
    format!("{ESCROW_PREFIX}{}", version_suffix(key_id, version))
}

/// Associated data binding wrapped material to its key id and version.
fn wrap_aad(key_id: &str, version: u32) -> Vec<u8> {
    tessera_crypto::blake3::encode_multi_field(&[key_id.as_bytes(), &version.to_le_bytes()])
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn new_event_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl KeyLifecycleManager {
    /// Load all key metadata and the audit log from `store`.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        master: MasterKey,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Result<Self> {
        let mut keys: BTreeMap<KeyId, KeyRecord> = BTreeMap::new();
        for store_key in store.list_keys(META_PREFIX)? {
            let Some(meta) = tessera_store::get_json::<KeyMetadata>(store.as_ref(), &store_key)?
            else {
                continue;
            };
            keys.entry(meta.key_id.clone())
                .or_default()
                .versions
                .insert(meta.version, meta);
        }

        // A crash between writing a new version and demoting the old one can
        // leave two active versions; the newest wins.
        for record in keys.values_mut() {
            let newest_active = record.active().map(|m| m.version);
            for meta in record.versions.values_mut() {
                if meta.status == KeyStatus::Active && Some(meta.version) != newest_active {
                    warn!(key_id = %meta.key_id, version = meta.version, "Demoting stale active version");
                    meta.status = KeyStatus::Deprecated;
                    meta.deprecated_at = Some(meta.deprecated_at.unwrap_or(meta.created_at));
                    tessera_store::set_json(
                        store.as_ref(),
                        &meta_key(&meta.key_id, meta.version),
                        &*meta,
                    )?;
                }
            }
        }

        let mut audit_records = Vec::new();
        for store_key in store.list_keys(AUDIT_PREFIX)? {
            let Some(seq) = store_key
                .strip_prefix(AUDIT_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            else {
                warn!(%store_key, "Skipping malformed audit record key");
                continue;
            };
            if let Some(event) =
                tessera_store::get_json::<RotationEvent>(store.as_ref(), &store_key)?
            {
                audit_records.push((seq, event));
            }
        }
        let (audit, dropped) =
            RotationAuditLog::from_records(audit_records, config.audit_capacity);
        for seq in dropped {
            store.delete(&audit_key(seq))?;
        }

        info!(keys = keys.len(), "Key lifecycle manager opened");
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            master,
            clock,
            config,
            kms: None,
            inner: Mutex::new(Inner { keys, audit }),
            events,
        })
    }

    /// Attach an external KMS.
    pub fn with_kms(mut self, kms: Arc<dyn KmsClient>) -> Self {
        self.kms = Some(kms);
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master
    }

    /// Subscribe to rotation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyRotated> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| KeyError::Poisoned)
    }

    /// Register a new key at version 1, status active.
    pub fn register(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        usage: KeyUsage,
    ) -> Result<KeyMetadata> {
        let now = self.clock.now_millis();
        let mut inner = self.lock()?;
        if inner.keys.contains_key(key_id) {
            return Err(KeyError::AlreadyRegistered(key_id.to_string()));
        }

        let meta = KeyMetadata {
            key_id: key_id.to_string(),
            version: 1,
            previous_version: None,
            algorithm,
            usage,
            created_at: now,
            rotation_due: now + millis(self.config.rotation_interval),
            status: KeyStatus::Active,
            deprecated_at: None,
            revoked_at: None,
            material_destroyed: false,
        };

        let mut material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        let persisted = self.persist_new_version(&meta, &material, None);
        if persisted.is_ok() {
            self.escrow(key_id, 1, &material);
        }
        material.zeroize();
        persisted?;

        if let Some(kms) = &self.kms {
            if let Err(e) = kms.create_key(key_id, usage) {
                warn!(key_id, error = %e, "KMS key creation failed; continuing locally");
            }
        }

        let mut record = KeyRecord::default();
        record.versions.insert(1, meta.clone());
        inner.keys.insert(key_id.to_string(), record);
        info!(key_id, ?algorithm, ?usage, "Registered key");
        Ok(meta)
    }

    /// Register `key_id` unless it already exists. Returns its active metadata.
    pub fn ensure_registered(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        usage: KeyUsage,
    ) -> Result<KeyMetadata> {
        match self.register(key_id, algorithm, usage) {
            Err(KeyError::AlreadyRegistered(_)) => {
                let inner = self.lock()?;
                inner
                    .keys
                    .get(key_id)
                    .and_then(KeyRecord::latest)
                    .cloned()
                    .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))
            }
            other => other,
        }
    }

    /// Rotate `key_id` to a new version. Returns the new version number.
    pub fn rotate(&self, key_id: &str, reason: RotationReason) -> Result<u32> {
        self.rotate_at(key_id, reason, self.clock.now_millis())
    }

    /// Rotate immediately, regardless of the schedule.
    pub fn emergency_rotate(&self, key_id: &str) -> Result<u32> {
        warn!(key_id, "Emergency rotation requested");
        self.rotate(key_id, RotationReason::Emergency)
    }

    fn rotate_at(&self, key_id: &str, reason: RotationReason, now: u64) -> Result<u32> {
        let mut inner = self.lock()?;
        let (old, active_old) = {
            let record = inner
                .keys
                .get(key_id)
                .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
            let latest = record
                .latest()
                .cloned()
                .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
            (latest, record.active().cloned())
        };
        let old_version = old.version;
        let new_version = old_version + 1;

        if let Some(kms) = &self.kms {
            if let Err(e) = kms.rotate(key_id) {
                warn!(key_id, error = %e, "KMS rotation failed; rotating locally");
                self.record_event(
                    &mut inner,
                    key_id,
                    old_version,
                    new_version,
                    now,
                    RotationReason::Kms,
                    Some(e.to_string()),
                );
            }
        }

        let new_meta = KeyMetadata {
            key_id: key_id.to_string(),
            version: new_version,
            previous_version: Some(old_version),
            algorithm: old.algorithm,
            usage: old.usage,
            created_at: now,
            rotation_due: now + millis(self.config.rotation_interval),
            status: KeyStatus::Active,
            deprecated_at: None,
            revoked_at: None,
            material_destroyed: false,
        };
        let demoted = active_old.map(|mut m| {
            m.status = KeyStatus::Deprecated;
            m.deprecated_at = Some(now);
            m
        });

        let mut material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        let persisted = self.persist_new_version(&new_meta, &material, demoted.as_ref());
        if persisted.is_ok() {
            self.escrow(key_id, new_version, &material);
        }
        material.zeroize();

        if let Err(e) = persisted {
            error!(key_id, error = %e, "Key rotation failed; previous version stays active");
            self.record_event(
                &mut inner,
                key_id,
                old_version,
                new_version,
                now,
                reason,
                Some(e.to_string()),
            );
            // Due now so the scheduler retries on its next pass.
            if let Some(active) = inner
                .keys
                .get_mut(key_id)
                .and_then(|r| r.versions.values_mut().rev().find(|m| m.status == KeyStatus::Active))
            {
                active.rotation_due = now;
            }
            return Err(KeyError::RotationFailure {
                key_id: key_id.to_string(),
                reason: e.to_string(),
            });
        }

        if let Some(record) = inner.keys.get_mut(key_id) {
            if let Some(demoted) = demoted {
                record.versions.insert(demoted.version, demoted);
            }
            record.versions.insert(new_version, new_meta);
        }
        self.record_event(&mut inner, key_id, old_version, new_version, now, reason, None);
        drop(inner);

        info!(key_id, old_version, new_version, ?reason, "Rotated key");
        let _ = self.events.send(KeyRotated {
            key_id: key_id.to_string(),
            old_version,
            new_version,
            reason,
        });
        Ok(new_version)
    }

    /// Write material then metadata for a new version, and the demoted
    /// predecessor last. Partial writes are rolled back best-effort.
    fn persist_new_version(
        &self,
        meta: &KeyMetadata,
        material: &[u8; 32],
        demoted: Option<&KeyMetadata>,
    ) -> Result<()> {
        let wrapped = self
            .master
            .wrap(&wrap_aad(&meta.key_id, meta.version), material)?;
        let material_slot = material_key(&meta.key_id, meta.version);
        let meta_slot = meta_key(&meta.key_id, meta.version);

        let result = (|| -> Result<()> {
            self.store.set(&material_slot, &wrapped)?;
            tessera_store::set_json(self.store.as_ref(), &meta_slot, meta)?;
            if let Some(demoted) = demoted {
                tessera_store::set_json(
                    self.store.as_ref(),
                    &meta_key(&demoted.key_id, demoted.version),
                    demoted,
                )?;
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = self.store.delete(&meta_slot);
            let _ = self.store.delete(&material_slot);
        }
        result
    }

    fn escrow(&self, key_id: &str, version: u32, material: &[u8; 32]) {
        let Some(kms) = &self.kms else {
            return;
        };
        match kms.encrypt_data_key(key_id, material) {
            Ok(wrapped) => {
                if let Err(e) = self.store.set(&escrow_key(key_id, version), &wrapped) {
                    warn!(key_id, version, error = %e, "Failed to persist KMS escrow");
                }
            }
            Err(e) => warn!(key_id, version, error = %e, "KMS escrow failed"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_event(
        &self,
        inner: &mut Inner,
        key_id: &str,
        old_version: u32,
        new_version: u32,
        timestamp: u64,
        reason: RotationReason,
        error: Option<String>,
    ) {
        let event = RotationEvent {
            event_id: new_event_id(),
            key_id: key_id.to_string(),
            old_version,
            new_version,
            timestamp,
            reason,
            success: error.is_none(),
            error,
        };
        let row = audit_key(inner.audit.next_seq());
        let persisted = tessera_store::set_json(self.store.as_ref(), &row, &event);
        let (seq, dropped) = inner.audit.push(event);
        if let Err(e) = persisted {
            warn!(seq, error = %e, "Failed to persist rotation audit record");
        }
        for old in dropped {
            if let Err(e) = self.store.delete(&audit_key(old)) {
                warn!(seq = old, error = %e, "Failed to drop truncated audit record");
            }
        }
    }

    /// Fetch key material.
    ///
    /// `None` returns the active version. Deprecated versions are readable
    /// until their retention window elapses.
    pub fn fetch(&self, key_id: &str, version: Option<u32>) -> Result<VersionedKey> {
        let now = self.clock.now_millis();
        let meta = {
            let inner = self.lock()?;
            let record = inner
                .keys
                .get(key_id)
                .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
            match version {
                Some(v) => record
                    .versions
                    .get(&v)
                    .cloned()
                    .ok_or_else(|| KeyError::KeyNotFound(format!("{key_id} v{v}")))?,
                None => match record.active() {
                    Some(active) => active.clone(),
                    None => {
                        let latest = record
                            .latest()
                            .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
                        return Err(KeyError::KeyRevoked {
                            key_id: key_id.to_string(),
                            version: latest.version,
                        });
                    }
                },
            }
        };

        self.check_readable(&meta, now)?;

        let wrapped = self
            .store
            .get(&material_key(key_id, meta.version))?
            .ok_or_else(|| KeyError::KeyExpired {
                key_id: key_id.to_string(),
                version: meta.version,
            })?;
        let material = self
            .master
            .unwrap(&wrap_aad(key_id, meta.version), &wrapped)?;
        debug!(key_id, version = meta.version, "Fetched key");
        Ok(VersionedKey {
            key_id: key_id.to_string(),
            version: meta.version,
            material,
        })
    }

    fn check_readable(&self, meta: &KeyMetadata, now: u64) -> Result<()> {
        let expired = || KeyError::KeyExpired {
            key_id: meta.key_id.clone(),
            version: meta.version,
        };
        match meta.status {
            KeyStatus::Revoked => Err(KeyError::KeyRevoked {
                key_id: meta.key_id.clone(),
                version: meta.version,
            }),
            _ if meta.material_destroyed => Err(expired()),
            KeyStatus::Deprecated => {
                let since = meta.deprecated_at.unwrap_or(meta.created_at);
                if now >= since + millis(self.config.retention_window) {
                    Err(expired())
                } else {
                    Ok(())
                }
            }
            KeyStatus::Active => Ok(()),
        }
    }

    /// Rotate every key whose active version is due at `now`.
    pub fn run_due_rotations(&self, now: u64) -> Result<RotationReport> {
        let due: Vec<KeyId> = {
            let inner = self.lock()?;
            inner
                .keys
                .iter()
                .filter(|(_, r)| r.active().is_some_and(|m| now >= m.rotation_due))
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut report = RotationReport::default();
        for key_id in due {
            match self.rotate_at(&key_id, RotationReason::Scheduled, now) {
                Ok(version) => report.rotated.push((key_id, version)),
                Err(e) => report.failed.push((key_id, e.to_string())),
            }
        }
        if !report.rotated.is_empty() || !report.failed.is_empty() {
            info!(
                rotated = report.rotated.len(),
                failed = report.failed.len(),
                "Scheduled rotation pass complete"
            );
        }
        Ok(report)
    }

    /// Destroy material of non-active versions whose retention window or
    /// maximum age has passed. Metadata is kept with `material_destroyed`.
    ///
    /// Returns the `(key_id, version)` pairs destroyed in this pass.
    pub fn cleanup_expired(&self, now: u64) -> Result<Vec<(KeyId, u32)>> {
        let retention = millis(self.config.retention_window);
        let max_age = millis(self.config.max_key_age);
        let mut inner = self.lock()?;
        let mut destroyed = Vec::new();

        for (key_id, record) in inner.keys.iter_mut() {
            for meta in record.versions.values_mut() {
                if meta.status == KeyStatus::Active || meta.material_destroyed {
                    continue;
                }
                let past_retention = match meta.status {
                    KeyStatus::Deprecated => {
                        now >= meta.deprecated_at.unwrap_or(meta.created_at) + retention
                    }
                    _ => true,
                };
                let too_old = now >= meta.created_at + max_age;
                if !(past_retention || too_old) {
                    continue;
                }

                self.store.delete(&material_key(key_id, meta.version))?;
                self.store.delete(&escrow_key(key_id, meta.version))?;
                meta.material_destroyed = true;
                tessera_store::set_json(
                    self.store.as_ref(),
                    &meta_key(key_id, meta.version),
                    &*meta,
                )?;
                info!(key_id = %key_id, version = meta.version, "Destroyed expired key material");
                destroyed.push((key_id.clone(), meta.version));
            }
        }
        Ok(destroyed)
    }

    /// Revoke one version.
    ///
    /// Refuses to revoke the last usable version of a key unless
    /// `allow_last` is set; that case is recorded in the audit log like any
    /// other revocation.
    pub fn revoke(&self, key_id: &str, version: u32, allow_last: bool) -> Result<()> {
        let now = self.clock.now_millis();
        let mut inner = self.lock()?;
        let record = inner
            .keys
            .get_mut(key_id)
            .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
        let usable = record.usable_count();
        let meta = record
            .versions
            .get_mut(&version)
            .ok_or_else(|| KeyError::KeyNotFound(format!("{key_id} v{version}")))?;

        if !meta.status.can_transition_to(KeyStatus::Revoked) {
            return Err(KeyError::InvalidTransition {
                key_id: key_id.to_string(),
                version,
                from: meta.status,
                to: KeyStatus::Revoked,
            });
        }
        let counts_as_usable = !meta.material_destroyed;
        if counts_as_usable && usable <= 1 && !allow_last {
            return Err(KeyError::LastActiveVersion(key_id.to_string()));
        }

        let mut updated = meta.clone();
        updated.status = KeyStatus::Revoked;
        updated.revoked_at = Some(now);
        tessera_store::set_json(self.store.as_ref(), &meta_key(key_id, version), &updated)?;
        *meta = updated;

        warn!(key_id, version, "Revoked key version");
        self.record_event(
            &mut inner,
            key_id,
            version,
            version,
            now,
            RotationReason::Revocation,
            None,
        );
        Ok(())
    }

    /// Recover a version's material from KMS escrow and re-wrap it locally.
    pub fn restore_from_escrow(&self, key_id: &str, version: u32) -> Result<()> {
        let kms = self
            .kms
            .as_ref()
            .ok_or_else(|| KeyError::Kms("no KMS configured".into()))?;
        let escrowed = self
            .store
            .get(&escrow_key(key_id, version))?
            .ok_or_else(|| KeyError::KeyNotFound(format!("{key_id} v{version} escrow")))?;
        let mut plain = kms.decrypt_data_key(key_id, &escrowed)?;
        let material: std::result::Result<[u8; 32], _> = plain.as_slice().try_into();
        plain.zeroize();
        let mut material =
            material.map_err(|_| KeyError::Kms("escrowed key has wrong length".into()))?;
        let wrapped = self.master.wrap(&wrap_aad(key_id, version), &material);
        material.zeroize();
        self.store.set(&material_key(key_id, version), &wrapped?)?;
        info!(key_id, version, "Restored key material from KMS escrow");
        Ok(())
    }

    /// Metadata of every version of `key_id`, oldest first.
    pub fn metadata(&self, key_id: &str) -> Result<Vec<KeyMetadata>> {
        let inner = self.lock()?;
        let record = inner
            .keys
            .get(key_id)
            .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
        Ok(record.versions.values().cloned().collect())
    }

    /// Current active version of `key_id`, if any.
    pub fn active_version(&self, key_id: &str) -> Option<u32> {
        let inner = self.inner.lock().ok()?;
        inner.keys.get(key_id)?.active().map(|m| m.version)
    }

    /// All registered key ids.
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.inner
            .lock()
            .map(|inner| inner.keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the rotation audit log, oldest first.
    pub fn audit_log(&self) -> Vec<RotationEvent> {
        self.inner
            .lock()
            .map(|inner| inner.audit.events())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for KeyLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLifecycleManager")
            .field("config", &self.config)
            .field("master", &self.master)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::master::MasterKeySource;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tessera_crypto::chacha20;
    use tessera_store::{MemoryStore, StoreError};
    use tessera_types::MILLIS_PER_DAY;

    const T0: u64 = 1_700_000_000_000;

    fn manager_with(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<ManualClock>,
    ) -> KeyLifecycleManager {
        KeyLifecycleManager::open(
            store,
            MasterKey::from_bytes([0x5A; 32], MasterKeySource::UserProvisioned),
            clock,
            LifecycleConfig::default(),
        )
        .expect("open manager")
    }

    fn setup() -> (KeyLifecycleManager, Arc<ManualClock>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        (manager_with(store.clone(), clock.clone()), clock, store)
    }

    fn register_k1(manager: &KeyLifecycleManager) -> KeyMetadata {
        manager
            .register("k1", KeyAlgorithm::ChaCha20Poly1305, KeyUsage::Encryption)
            .expect("register")
    }

    #[test]
    fn test_register_starts_at_v1_active() {
        let (manager, _, _) = setup();
        let meta = register_k1(&manager);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.status, KeyStatus::Active);
        assert_eq!(meta.previous_version, None);
        assert_eq!(meta.rotation_due, T0 + 90 * MILLIS_PER_DAY);
        assert!(matches!(
            manager.register("k1", KeyAlgorithm::ChaCha20Poly1305, KeyUsage::Encryption),
            Err(KeyError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_rotate_increments_and_deprecates() {
        let (manager, _, _) = setup();
        register_k1(&manager);
        let mut rx = manager.subscribe();

        let v2 = manager.rotate("k1", RotationReason::Manual).expect("rotate");
        assert_eq!(v2, 2);

        let versions = manager.metadata("k1").expect("metadata");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].status, KeyStatus::Deprecated);
        assert_eq!(versions[0].deprecated_at, Some(T0));
        assert_eq!(versions[1].status, KeyStatus::Active);
        assert_eq!(versions[1].previous_version, Some(1));

        let note = rx.try_recv().expect("rotation notification");
        assert_eq!(note.old_version, 1);
        assert_eq!(note.new_version, 2);

        let audit = manager.audit_log();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].success);
        assert_eq!(audit[0].reason, RotationReason::Manual);
    }

    #[test]
    fn test_fetch_old_version_within_retention_then_expired() {
        let (manager, clock, _) = setup();
        register_k1(&manager);

        let v1 = manager.fetch("k1", None).expect("fetch v1");
        let v1_material = *v1.material();
        let sealed = chacha20::seal(&v1_material, b"hello", b"").expect("seal");

        manager.rotate("k1", RotationReason::Manual).expect("rotate");

        let old = manager.fetch("k1", Some(1)).expect("old version readable");
        assert_eq!(old.material(), &v1_material);
        let plain = chacha20::open_box(old.material(), &sealed, b"").expect("open");
        assert_eq!(plain, b"hello");

        let current = manager.fetch("k1", None).expect("fetch current");
        assert_eq!(current.version(), 2);
        assert_ne!(current.material(), &v1_material);

        clock.advance(Duration::from_secs(30 * 24 * 60 * 60));
        assert!(matches!(
            manager.fetch("k1", Some(1)),
            Err(KeyError::KeyExpired { version: 1, .. })
        ));
        assert!(manager.fetch("k1", Some(2)).is_ok());
    }

    #[test]
    fn test_fetch_unknown() {
        let (manager, _, _) = setup();
        assert!(matches!(manager.fetch("nope", None), Err(KeyError::KeyNotFound(_))));
        register_k1(&manager);
        assert!(matches!(manager.fetch("k1", Some(9)), Err(KeyError::KeyNotFound(_))));
    }

    #[test]
    fn test_due_rotation_runs_only_when_due() {
        let (manager, _, _) = setup();
        let meta = register_k1(&manager);

        let report = manager.run_due_rotations(meta.rotation_due - 1).expect("run");
        assert!(report.rotated.is_empty());

        let report = manager.run_due_rotations(meta.rotation_due).expect("run");
        assert_eq!(report.rotated, vec![("k1".to_string(), 2)]);
        assert_eq!(manager.active_version("k1"), Some(2));

        let audit = manager.audit_log();
        assert_eq!(audit[0].reason, RotationReason::Scheduled);
        assert_eq!(audit[0].timestamp, meta.rotation_due);
    }

    #[test]
    fn test_emergency_rotation_bypasses_schedule() {
        let (manager, _, _) = setup();
        register_k1(&manager);
        assert_eq!(manager.emergency_rotate("k1").expect("rotate"), 2);
        assert_eq!(manager.audit_log()[0].reason, RotationReason::Emergency);
    }

    #[test]
    fn test_cleanup_destroys_material_after_retention() {
        let (manager, _, store) = setup();
        register_k1(&manager);
        manager.rotate("k1", RotationReason::Manual).expect("rotate");

        let early = manager.cleanup_expired(T0 + MILLIS_PER_DAY).expect("cleanup");
        assert!(early.is_empty());

        let destroyed = manager
            .cleanup_expired(T0 + 30 * MILLIS_PER_DAY)
            .expect("cleanup");
        assert_eq!(destroyed, vec![("k1".to_string(), 1)]);
        assert!(store.get(&material_key("k1", 1)).expect("get").is_none());

        let versions = manager.metadata("k1").expect("metadata");
        assert!(versions[0].material_destroyed);
        assert!(!versions[1].material_destroyed);
        assert!(matches!(
            manager.fetch("k1", Some(1)),
            Err(KeyError::KeyExpired { .. })
        ));
    }

    #[test]
    fn test_active_version_never_destroyed_by_age() {
        let (manager, _, _) = setup();
        register_k1(&manager);
        let destroyed = manager
            .cleanup_expired(T0 + 400 * MILLIS_PER_DAY)
            .expect("cleanup");
        assert!(destroyed.is_empty());
        assert!(manager.fetch("k1", None).is_ok());
    }

    #[test]
    fn test_revoke_rules() {
        let (manager, _, _) = setup();
        register_k1(&manager);
        assert!(matches!(
            manager.revoke("k1", 1, false),
            Err(KeyError::LastActiveVersion(_))
        ));

        manager.rotate("k1", RotationReason::Manual).expect("rotate");
        manager.revoke("k1", 1, false).expect("revoke deprecated");
        assert!(matches!(
            manager.fetch("k1", Some(1)),
            Err(KeyError::KeyRevoked { version: 1, .. })
        ));
        assert!(matches!(
            manager.revoke("k1", 1, false),
            Err(KeyError::InvalidTransition { .. })
        ));

        manager.revoke("k1", 2, true).expect("explicit last revocation");
        assert!(matches!(
            manager.fetch("k1", None),
            Err(KeyError::KeyRevoked { version: 2, .. })
        ));
        let revocations = manager
            .audit_log()
            .into_iter()
            .filter(|e| e.reason == RotationReason::Revocation)
            .count();
        assert_eq!(revocations, 2);
    }

    #[test]
    fn test_state_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let material = {
            let manager = manager_with(store.clone(), clock.clone());
            register_k1(&manager);
            manager.rotate("k1", RotationReason::Manual).expect("rotate");
            *manager.fetch("k1", None).expect("fetch").material()
        };

        let reopened = manager_with(store, clock);
        assert_eq!(reopened.active_version("k1"), Some(2));
        assert_eq!(reopened.fetch("k1", None).expect("fetch").material(), &material);
        assert!(reopened.fetch("k1", Some(1)).is_ok());
        assert_eq!(reopened.audit_log().len(), 1);
    }

    #[test]
    fn test_audit_records_are_appended_per_event() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let config = LifecycleConfig {
            audit_capacity: 2,
            ..LifecycleConfig::default()
        };
        let open = |store: Arc<MemoryStore>| {
            KeyLifecycleManager::open(
                store,
                MasterKey::from_bytes([0x5A; 32], MasterKeySource::UserProvisioned),
                clock.clone(),
                config.clone(),
            )
            .expect("open manager")
        };

        let manager = open(store.clone());
        register_k1(&manager);
        manager.rotate("k1", RotationReason::Manual).expect("rotate");
        let first = store.get(&audit_key(0)).expect("get").expect("first row");
        manager.rotate("k1", RotationReason::Manual).expect("rotate");
        assert_eq!(store.get(&audit_key(0)).expect("get"), Some(first));

        manager.rotate("k1", RotationReason::Manual).expect("rotate");
        let rows = store.list_keys(AUDIT_PREFIX).expect("list");
        assert_eq!(rows, vec![audit_key(1), audit_key(2)]);
        drop(manager);

        let reopened = open(store.clone());
        let audit = reopened.audit_log();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].new_version, 4);
        reopened.rotate("k1", RotationReason::Manual).expect("rotate");
        let rows = store.list_keys(AUDIT_PREFIX).expect("list");
        assert_eq!(rows, vec![audit_key(2), audit_key(3)]);
    }

    /// Store that starts failing writes on demand.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> tessera_store::Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> tessera_store::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) && key.starts_with("keys/material/") {
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

    #[test]
    fn test_persistence_failure_keeps_previous_active() {
        let store = Arc::new(FlakyStore::default());
        let clock = Arc::new(ManualClock::new(T0));
        let manager = manager_with(store.clone(), clock.clone());
        register_k1(&manager);

        clock.advance(Duration::from_secs(60));
        store.fail_writes.store(true, Ordering::SeqCst);
        let result = manager.rotate("k1", RotationReason::Manual);
        assert!(matches!(result, Err(KeyError::RotationFailure { .. })));

        assert_eq!(manager.active_version("k1"), Some(1));
        let versions = manager.metadata("k1").expect("metadata");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].rotation_due, T0 + 60_000);

        let audit = manager.audit_log();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].success);
        assert!(audit[0].error.is_some());

        store.fail_writes.store(false, Ordering::SeqCst);
        let report = manager.run_due_rotations(clock.now_millis()).expect("retry");
        assert_eq!(report.rotated, vec![("k1".to_string(), 2)]);
    }

    struct DownKms;

    impl KmsClient for DownKms {
        fn create_key(&self, _: &str, _: KeyUsage) -> Result<String> {
            Err(KeyError::Kms("unreachable".into()))
        }
        fn rotate(&self, _: &str) -> Result<u32> {
            Err(KeyError::Kms("unreachable".into()))
        }
        fn encrypt_data_key(&self, _: &str, _: &[u8]) -> Result<Vec<u8>> {
            Err(KeyError::Kms("unreachable".into()))
        }
        fn decrypt_data_key(&self, _: &str, _: &[u8]) -> Result<Vec<u8>> {
            Err(KeyError::Kms("unreachable".into()))
        }
    }

    /// KMS that "encrypts" by XOR with a fixed byte.
    struct XorKms;

    impl KmsClient for XorKms {
        fn create_key(&self, key_id: &str, _: KeyUsage) -> Result<String> {
            Ok(format!("kms-{key_id}"))
        }
        fn rotate(&self, _: &str) -> Result<u32> {
            Ok(1)
        }
        fn encrypt_data_key(&self, _: &str, data_key: &[u8]) -> Result<Vec<u8>> {
            Ok(data_key.iter().map(|b| b ^ 0xA5).collect())
        }
        fn decrypt_data_key(&self, _: &str, wrapped: &[u8]) -> Result<Vec<u8>> {
            Ok(wrapped.iter().map(|b| b ^ 0xA5).collect())
        }
    }

    #[test]
    fn test_kms_outage_falls_back_to_local_rotation() {
        let (manager, _, _) = setup();
        let manager = manager.with_kms(Arc::new(DownKms));
        register_k1(&manager);

        assert_eq!(manager.rotate("k1", RotationReason::Manual).expect("rotate"), 2);
        let audit = manager.audit_log();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].reason, RotationReason::Kms);
        assert!(!audit[0].success);
        assert!(audit[1].success);
    }

    #[test]
    fn test_restore_from_escrow() {
        let (manager, _, store) = setup();
        let manager = manager.with_kms(Arc::new(XorKms));
        register_k1(&manager);
        let material = *manager.fetch("k1", None).expect("fetch").material();

        store.delete(&material_key("k1", 1)).expect("lose material");
        assert!(manager.fetch("k1", None).is_err());

        manager.restore_from_escrow("k1", 1).expect("restore");
        assert_eq!(manager.fetch("k1", None).expect("fetch").material(), &material);
    }
}
