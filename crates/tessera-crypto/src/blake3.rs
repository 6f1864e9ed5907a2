//! Domain-separated BLAKE3 hashing.
//!
//! BLAKE3 backs every hash in Tessera: ledger payload hashes, Merkle nodes,
//! message MACs and all key derivation. Cross-domain collisions are prevented by
//! BLAKE3's built-in mode flags plus a registered context string per purpose.
//!
//! ## Modes
//!
//! - [`hash`] — Pure hashing: payload hashes, Merkle leaves, seal integrity hashes
//! - [`derive_key`] — Key derivation (see also [`crate::kdf`])
//! - [`keyed_hash`] — Keyed MAC: message authentication codes, Merkle inner nodes

/// Registered BLAKE3 context strings. Using an unregistered context string is a bug.
pub mod contexts {
    pub const KDF_ROUND: &str = "Tessera v1 kdf-round";
    pub const KDF_OUTPUT: &str = "Tessera v1 kdf-output";
    pub const MERKLE_INNER_NODE: &str = "Tessera v1 merkle-inner-node";
    pub const LEDGER_SIGNATURE: &str = "Tessera v1 ledger-signature";
    pub const LEDGER_TIMESTAMP: &str = "Tessera v1 ledger-timestamp";
    pub const LEDGER_WITNESS: &str = "Tessera v1 ledger-witness";
    pub const DEVICE_BINDING: &str = "Tessera v1 device-binding";
    pub const SESSION_ID: &str = "Tessera v1 session-id";
    pub const MASTER_KEY_CHECK: &str = "Tessera v1 master-key-check";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        KDF_ROUND,
        KDF_OUTPUT,
        MERKLE_INNER_NODE,
        LEDGER_SIGNATURE,
        LEDGER_TIMESTAMP,
        LEDGER_WITNESS,
        DEVICE_BINDING,
        SESSION_ID,
        MASTER_KEY_CHECK,
    ];
}

/// Compute BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// # Arguments
///
/// * `context` - A registered context string (must start with "Tessera v1 ")
/// * `key_material` - The input key material
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Derive a variable-length key using BLAKE3's key derivation mode and XOF output.
pub fn derive_key_xof(context: &str, key_material: &[u8], output: &mut [u8]) {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    hasher.finalize_xof().fill(output);
}

/// Compute a keyed BLAKE3 hash (MAC/PRF).
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Compare two digests in constant time.
///
/// Comparison goes through [`::blake3::Hash`], whose `PartialEq` is constant-time.
pub fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ::blake3::Hash::from(*a) == ::blake3::Hash::from(*b)
}

/// Verify that a context string is registered.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

/// Compute a Merkle tree leaf hash with domain separation.
///
/// Leaf nodes use `BLAKE3::hash(0x00 || data)` to prevent second-preimage attacks.
pub fn merkle_leaf(data: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new();
    hasher.update(&[0x00]);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute a Merkle tree inner node hash with domain separation.
///
/// Inner nodes use `BLAKE3::keyed_hash(K_inner, left || right)` where
/// `K_inner = BLAKE3::derive_key("Tessera v1 merkle-inner-node", "")`.
pub fn merkle_inner(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let k_inner = derive_key(contexts::MERKLE_INNER_NODE, b"");
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(left);
    message[32..].copy_from_slice(right);
    keyed_hash(&k_inner, &message)
}

/// Encode multiple dynamic fields using length-prefixed encoding.
///
/// `LE32(len(field1)) || field1 || LE32(len(field2)) || field2 || ...`
///
/// Every MAC, signature message and multi-input derivation in Tessera goes
/// through this encoding so that field boundaries cannot be shifted.
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}
