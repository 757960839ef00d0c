// src/types.rs

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::codec::{DecodeError, Reader, Serializer};
use crate::crypto::{addr_from_pubkey, sha512_half};

pub type Hash = [u8; 32];
pub type Address = [u8; 20];

pub const ZERO_HASH: Hash = [0u8; 32];

/// Where a transaction stands relative to a ledger. This is a view-side
/// annotation derived from context, never part of the stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    New,
    Included,
    Committed,
    Removed,
}

/// Canonical signed length: fields (64) + pubkey (32) + signature (64).
pub const TX_ENCODED_LEN: usize = 160;

/// A signed value transfer. `raw` is the canonical signed blob, exactly
/// the bytes the transaction trie stores; `id` is its SHA-512-half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Hash,
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
    /// Sequence of the source account at signing time.
    pub from_seq: u32,
    /// Ledger the sender targeted; must not exceed the applying ledger.
    pub ledger_seq: u32,
    pub raw: Vec<u8>,
    pub status: TxStatus,
}

impl Transaction {
    /// Build and sign a transfer. The source address is derived from the
    /// verifying key, so `from` always matches the embedded pubkey.
    pub fn sign(
        key: &SigningKey,
        to: Address,
        amount: u64,
        fee: u64,
        from_seq: u32,
        ledger_seq: u32,
    ) -> Self {
        let pubkey = key.verifying_key().to_bytes();
        let from = addr_from_pubkey(&pubkey);

        let mut s = Serializer::with_capacity(TX_ENCODED_LEN);
        s.add_u160(&from);
        s.add_u160(&to);
        s.add_u64(amount);
        s.add_u64(fee);
        s.add_u32(from_seq);
        s.add_u32(ledger_seq);
        s.add_u256(&pubkey);

        let sig = key.sign(s.as_bytes()).to_bytes();
        let mut raw = s.into_bytes();
        raw.extend_from_slice(&sig);

        let id = sha512_half(&raw);
        Self {
            id,
            from,
            to,
            amount,
            fee,
            from_seq,
            ledger_seq,
            raw,
            status: TxStatus::New,
        }
    }

    /// Decode a canonical signed blob back into a transaction. The id is
    /// recomputed from the bytes; the signature is not checked here.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        let from = r.get_u160()?;
        let to = r.get_u160()?;
        let amount = r.get_u64()?;
        let fee = r.get_u64()?;
        let from_seq = r.get_u32()?;
        let ledger_seq = r.get_u32()?;
        r.get_u256()?; // pubkey
        r.get_bytes(64)?; // signature
        r.finish()?;

        Ok(Self {
            id: sha512_half(raw),
            from,
            to,
            amount,
            fee,
            from_seq,
            ledger_seq,
            raw: raw.to_vec(),
            status: TxStatus::New,
        })
    }

    /// Check the embedded ed25519 signature against the embedded pubkey,
    /// and that the source address was derived from that pubkey.
    pub fn verify_sig(&self) -> bool {
        if self.raw.len() != TX_ENCODED_LEN {
            return false;
        }
        let (payload, sig_bytes) = self.raw.split_at(TX_ENCODED_LEN - 64);
        let pubkey: [u8; 32] = payload[64..96].try_into().unwrap();
        if addr_from_pubkey(&pubkey) != self.from {
            return false;
        }
        let vk = match VerifyingKey::from_bytes(&pubkey) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let sig_bytes: [u8; 64] = sig_bytes.try_into().unwrap();
        let sig = Signature::from_bytes(&sig_bytes);
        vk.verify(payload, &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> SigningKey {
        SigningKey::from_bytes(&[byte; 32])
    }

    #[test]
    fn sign_then_decode_round_trips() {
        let key = test_key(1);
        let to = [9u8; 20];
        let tx = Transaction::sign(&key, to, 2500, 10, 0, 1);
        assert_eq!(tx.raw.len(), TX_ENCODED_LEN);
        assert_eq!(tx.status, TxStatus::New);

        let decoded = Transaction::decode(&tx.raw).expect("canonical bytes");
        assert_eq!(decoded.id, tx.id);
        assert_eq!(decoded.from, tx.from);
        assert_eq!(decoded.to, to);
        assert_eq!(decoded.amount, 2500);
        assert_eq!(decoded.fee, 10);
        assert_eq!(decoded.from_seq, 0);
        assert_eq!(decoded.ledger_seq, 1);
    }

    #[test]
    fn id_is_digest_of_signed_bytes() {
        let tx = Transaction::sign(&test_key(2), [7u8; 20], 1, 0, 0, 1);
        assert_eq!(tx.id, crate::crypto::sha512_half(&tx.raw));
    }

    #[test]
    fn signature_verifies_and_tamper_fails() {
        let tx = Transaction::sign(&test_key(3), [7u8; 20], 100, 1, 4, 2);
        assert!(tx.verify_sig());

        let mut bad = tx.clone();
        bad.raw[40] ^= 1; // flip a bit inside the amount field
        assert!(!bad.verify_sig());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let tx = Transaction::sign(&test_key(4), [7u8; 20], 1, 0, 0, 1);
        assert!(Transaction::decode(&tx.raw[..TX_ENCODED_LEN - 1]).is_err());
        let mut long = tx.raw.clone();
        long.push(0);
        assert!(Transaction::decode(&long).is_err());
    }
}
