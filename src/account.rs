// src/account.rs

use crate::codec::{DecodeError, Reader, Serializer};
use crate::types::{Address, Hash};

/// Encoded size: balance (8) + sequence (4).
pub const ACCOUNT_STATE_LEN: usize = 12;

/// Per-account record stored as a trie leaf: spendable balance and the
/// replay-guard sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountState {
    pub balance: u64,
    pub sequence: u32,
}

impl AccountState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&mut self, amount: u64) {
        self.balance = self.balance.checked_add(amount).expect("balance overflow");
    }

    /// Caller has already checked the balance covers `amount`.
    pub fn charge(&mut self, amount: u64) {
        self.balance = self.balance.checked_sub(amount).expect("balance underflow");
    }

    pub fn inc_seq(&mut self) {
        self.sequence += 1;
    }

    pub fn dec_seq(&mut self) {
        self.sequence -= 1;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = Serializer::with_capacity(ACCOUNT_STATE_LEN);
        s.add_u64(self.balance);
        s.add_u32(self.sequence);
        s.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let balance = r.get_u64()?;
        let sequence = r.get_u32()?;
        r.finish()?;
        Ok(Self { balance, sequence })
    }
}

/// Trie key for an account: the 20 address bytes in the leading
/// positions, zero tail.
pub fn account_key(addr: &Address) -> Hash {
    let mut key = [0u8; 32];
    key[..20].copy_from_slice(addr);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let state = AccountState { balance: 100_000, sequence: 7 };
        let bytes = state.encode();
        assert_eq!(bytes.len(), ACCOUNT_STATE_LEN);
        assert_eq!(AccountState::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn decode_rejects_bad_lengths() {
        assert!(AccountState::decode(&[0u8; 11]).is_err());
        assert!(AccountState::decode(&[0u8; 13]).is_err());
    }

    #[test]
    fn credit_charge_and_sequence() {
        let mut state = AccountState::new();
        state.credit(500);
        state.charge(200);
        assert_eq!(state.balance, 300);

        state.inc_seq();
        state.inc_seq();
        state.dec_seq();
        assert_eq!(state.sequence, 1);
    }

    #[test]
    fn key_places_address_first() {
        let addr = [0xaa; 20];
        let key = account_key(&addr);
        assert_eq!(&key[..20], &addr);
        assert_eq!(&key[20..], &[0u8; 12]);
    }
}
