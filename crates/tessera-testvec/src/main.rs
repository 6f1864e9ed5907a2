//! Test vector generator for Tessera's deterministic primitives.
//!
//! Covers the ratchet KDF labels, Merkle hashing, the ledger entry hash, the
//! ledger signature message and the message MAC. Anything built on random
//! keys or nonces is out of scope.
//!
//! Usage:
//!   tessera-testvec              # Generate test_vectors.json
//!   tessera-testvec --verify     # Verify test vectors match expected values

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tessera_crypto::blake3;
use tessera_crypto::ed25519::SigningKey;
use tessera_crypto::kdf::{self, labels};
use tessera_ledger::{entry_hash, witness, MerkleTree};
use tessera_ratchet::codec;
use tessera_types::ledger::LedgerEntry;
use tessera_types::message::{MessageType, RatchetHeader};
use tessera_types::GENESIS_HASH;

const VECTORS_PATH: &str = "tests/fixtures/test_vectors.json";

#[derive(Serialize, Deserialize)]
struct TestVectors {
    version: String,
    generated_by: String,
    vectors: BTreeMap<String, TestVector>,
}

#[derive(Serialize, Deserialize)]
struct TestVector {
    description: String,
    inputs: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
}

fn fields<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn generate_kdf_vectors() -> anyhow::Result<BTreeMap<String, TestVector>> {
    let mut vectors = BTreeMap::new();
    let zero = [0u8; 32];

    for label in [
        labels::CHAIN_KEY_ADVANCE,
        labels::MESSAGE_KEY,
        labels::SESSION_MAC_KEY,
        labels::STATE_AT_REST,
    ] {
        vectors.insert(
            format!("kdf_{}", label.to_lowercase()),
            TestVector {
                description: format!("derive_32(0x00*32, \"{label}\")"),
                inputs: fields([
                    ("input_key", hex::encode(zero)),
                    ("label", label.to_string()),
                ]),
                outputs: fields([("key", hex::encode(kdf::derive_32(&zero, label)?))]),
            },
        );
    }

    // Message key bound to a counter
    let message_key = kdf::derive_at(&[0x42; 32], labels::MESSAGE_KEY, 7)?;
    vectors.insert(
        "kdf_message_key_at_7".to_string(),
        TestVector {
            description: "derive_at(0x42*32, \"MESSAGE_KEY\", 7)".to_string(),
            inputs: fields([
                ("input_key", hex::encode([0x42u8; 32])),
                ("counter", "7".to_string()),
            ]),
            outputs: fields([("key", hex::encode(message_key))]),
        },
    );

    // Root step: LP(root) || LP(dh_out) split into (root, chain)
    let root_input = blake3::encode_multi_field(&[&zero, &[0xFF; 32]]);
    let (root, chain) = kdf::derive_pair(&root_input, labels::ROOT_KEY_UPDATE)?;
    vectors.insert(
        "kdf_root_key_update".to_string(),
        TestVector {
            description: "derive_pair(LP(0x00*32) || LP(0xFF*32), \"ROOT_KEY_UPDATE\")"
                .to_string(),
            inputs: fields([
                ("root_key", hex::encode(zero)),
                ("dh_output", hex::encode([0xFFu8; 32])),
            ]),
            outputs: fields([
                ("new_root_key", hex::encode(root)),
                ("chain_key", hex::encode(chain)),
            ]),
        },
    );

    Ok(vectors)
}

fn generate_merkle_vectors() -> anyhow::Result<BTreeMap<String, TestVector>> {
    let mut vectors = BTreeMap::new();

    let leaves: Vec<[u8; 32]> = [b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]
        .iter()
        .map(|data| blake3::merkle_leaf(data))
        .collect();
    let tree = MerkleTree::from_leaves(&leaves);
    let proof = tree.get_proof(2)?;
    let steps: Vec<String> = proof
        .iter()
        .map(|step| {
            format!(
                "{}:{}:{}",
                step.level,
                if step.is_left_sibling { "L" } else { "R" },
                hex::encode(step.sibling_hash)
            )
        })
        .collect();

    vectors.insert(
        "merkle_three_leaves".to_string(),
        TestVector {
            description: "Root of leaves a, b, c (odd node paired with itself) and proof for c"
                .to_string(),
            inputs: fields([("leaves", "a,b,c".to_string())]),
            outputs: fields([
                ("leaf_a", hex::encode(leaves[0])),
                ("root", hex::encode(tree.root())),
                ("proof_c", steps.join(",")),
            ]),
        },
    );

    let entry = LedgerEntry {
        payload_hash: blake3::hash(b"hello"),
        previous_hash: GENESIS_HASH,
        chain_position: 0,
        timestamp: 1_700_000_000_000,
    };
    vectors.insert(
        "ledger_genesis_entry".to_string(),
        TestVector {
            description: "Genesis entry for payload \"hello\" at t=1700000000000".to_string(),
            inputs: fields([
                ("payload", "hello".to_string()),
                ("timestamp", entry.timestamp.to_string()),
            ]),
            outputs: fields([
                ("canonical_bytes", hex::encode(entry.canonical_bytes())),
                ("entry_hash", hex::encode(entry_hash(&entry))),
            ]),
        },
    );

    Ok(vectors)
}

fn generate_signature_vectors() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    let signer = SigningKey::from_bytes(&[0x01; 32]);
    let payload_hash = blake3::hash(b"hello");
    let message = witness::signature_message(&payload_hash, 1_700_000_000_000);
    let signature = signer.sign(&message);
    vectors.insert(
        "ledger_signature".to_string(),
        TestVector {
            description: "Ed25519 signature over the ledger signature message".to_string(),
            inputs: fields([
                ("secret_key", hex::encode([0x01u8; 32])),
                ("payload_hash", hex::encode(payload_hash)),
                ("timestamp", "1700000000000".to_string()),
            ]),
            outputs: fields([
                ("public_key", hex::encode(signer.verifying_key().to_bytes())),
                ("message", hex::encode(&message)),
                ("signature", hex::encode(signature.to_bytes())),
            ]),
        },
    );

    vectors
}

fn generate_mac_vectors() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    let header = RatchetHeader {
        dh_public_key: [0x09; 32],
        chain_index: 1,
        previous_counter: 0,
        counter: 3,
    };
    let mac = codec::compute_mac(
        &[0x11; 32],
        b"ciphertext",
        &[0x22; 12],
        4,
        1_700_000_000_000,
        &[0x33; 16],
        &header,
        MessageType::Message,
    );
    vectors.insert(
        "message_mac".to_string(),
        TestVector {
            description: "Keyed BLAKE3 record MAC over a fixed message".to_string(),
            inputs: fields([
                ("session_key", hex::encode([0x11u8; 32])),
                ("ciphertext", hex::encode(b"ciphertext")),
                ("nonce", hex::encode([0x22u8; 12])),
                ("sequence_number", "4".to_string()),
                ("timestamp", "1700000000000".to_string()),
                ("auth_tag", hex::encode([0x33u8; 16])),
                ("header", hex::encode(header.to_bytes())),
                ("message_type", MessageType::Message.as_byte().to_string()),
            ]),
            outputs: fields([("mac", hex::encode(mac))]),
        },
    );

    vectors
}

fn generate_all_vectors() -> anyhow::Result<TestVectors> {
    let mut all_vectors = BTreeMap::new();

    all_vectors.extend(generate_kdf_vectors()?);
    all_vectors.extend(generate_merkle_vectors()?);
    all_vectors.extend(generate_signature_vectors());
    all_vectors.extend(generate_mac_vectors());

    Ok(TestVectors {
        version: "1.0".to_string(),
        generated_by: "tessera-testvec".to_string(),
        vectors: all_vectors,
    })
}

fn verify_vectors(vectors: &TestVectors) -> anyhow::Result<bool> {
    let regenerated = generate_all_vectors()?;
    let mut all_pass = true;

    for (name, expected) in &vectors.vectors {
        match regenerated.vectors.get(name) {
            Some(actual) if actual.outputs == expected.outputs => eprintln!("PASS: {name}"),
            Some(actual) => {
                eprintln!("FAIL: {name}");
                eprintln!("  expected: {:?}", expected.outputs);
                eprintln!("  actual:   {:?}", actual.outputs);
                all_pass = false;
            }
            None => {
                eprintln!("MISSING: {name}");
                all_pass = false;
            }
        }
    }

    Ok(all_pass)
}

fn write_vectors(path: &Path, vectors: &TestVectors) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(vectors)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    eprintln!("Generated {} test vectors to {}", vectors.vectors.len(), path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let verify = std::env::args().any(|a| a == "--verify");
    let path = Path::new(VECTORS_PATH);

    let vectors = if verify && path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).context("test vectors are not valid JSON")?
    } else {
        let vectors = generate_all_vectors()?;
        write_vectors(path, &vectors)?;
        vectors
    };

    if verify_vectors(&vectors)? {
        eprintln!("All test vectors verified successfully.");
        Ok(())
    } else {
        anyhow::bail!("test vector verification failed")
    }
}
