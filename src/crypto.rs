// src/crypto.rs

use sha2::{Digest, Sha256, Sha512};

use crate::types::{Address, Hash};

/// SHA-512 truncated to its leading 256 bits. Every identifier in the
/// ledger (node hashes, transaction ids, ledger hashes) comes from here.
pub fn sha512_half(data: &[u8]) -> Hash {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

/// Derive a 20-byte address from an ed25519 verifying key.
pub fn addr_from_pubkey(pubkey: &[u8; 32]) -> Address {
    let digest = Sha256::digest(pubkey);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    out
}

pub fn addr_hex(addr: &Address) -> String {
    hex::encode(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha512_half_is_deterministic() {
        let a = sha512_half(b"ledger");
        let b = sha512_half(b"ledger");
        assert_eq!(a, b);
        assert_ne!(a, sha512_half(b"ledger2"));
    }

    #[test]
    fn addresses_differ_per_key() {
        let a = addr_from_pubkey(&[1u8; 32]);
        let b = addr_from_pubkey(&[2u8; 32]);
        assert_ne!(a, b);
        assert_eq!(addr_hex(&a).len(), 40);
    }
}
