//! Merkle secret tree derivation
//!
//! Partial-fill orders carry N+1 part secrets (the last unlocks completion)
//! whose hashes form a Merkle tree. The escrow contracts commit to
//! `merkle:<root>` instead of a plain hashlock, so the derivation here must
//! match byte for byte what they verify.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lowercase hex sha256 of a string
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the N+1 part secrets for an N-part order.
///
/// `secrets[i] = sha256(master_secret ++ "-" ++ i)` for i in 0..=N; the
/// final entry is the completion secret.
pub fn derive_part_secrets(master_secret: &str, total_parts: u32) -> Vec<String> {
    (0..=total_parts)
        .map(|i| sha256_hex(&format!("{}-{}", master_secret, i)))
        .collect()
}

/// Fold the part secrets into a Merkle root: hash each secret into a leaf,
/// then pairwise-hash adjacent nodes (duplicating the final node when a
/// level has odd length) until one hash remains.
pub fn merkle_root(secrets: &[String]) -> String {
    let mut level: Vec<String> = secrets.iter().map(|s| sha256_hex(s)).collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(sha256_hex(&format!("{}{}", left, right)));
        }
        level = next;
    }

    level.into_iter().next().unwrap_or_default()
}

/// Hashlock commitment string the escrows use for partial-fill orders
pub fn merkle_hashlock(root: &str) -> String {
    format!("merkle:{}", root)
}

/// Merkle inclusion proof accompanying a reveal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub proof: Vec<String>,
    pub index: u32,
}

/// Structural validation of a proof: hex-shaped nodes and an index within
/// the tree. Inclusion itself is checked by the escrow contract on chain.
pub fn validate_proof_structure(proof: &MerkleProof, total_parts: u32) -> Result<(), String> {
    if proof.index == 0 || proof.index > total_parts + 1 {
        return Err(format!(
            "index {} out of range for {} parts",
            proof.index, total_parts
        ));
    }
    if proof.proof.is_empty() {
        return Err("empty proof".to_string());
    }
    for node in &proof.proof {
        if node.len() != 64 || !node.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("malformed proof node: {}", node));
        }
    }
    Ok(())
}
