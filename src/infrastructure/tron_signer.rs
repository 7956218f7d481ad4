//! TRON addresses and local transaction signing
//!
//! An address is base58check over 21 bytes: `0x41` followed by the last 20 bytes
//! of the Keccak-256 hash of the uncompressed public key. A transaction's id is
//! the SHA-256 of its `raw_data`, and its signature is `r || s || v` over that id.
//! Private keys never leave the process.

use crate::domain::entities::payment::SweepKey;
use crate::domain::errors::LedgerError;
use crate::domain::repositories::ledger_client::LedgerResult;
use ethers::core::k256::ecdsa::{signature::hazmat::PrehashSigner, RecoveryId, Signature, SigningKey};
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::utils::keccak256;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const ADDRESS_PREFIX: u8 = 0x41;
const ADDRESS_LEN: usize = 21;

/// Base58 address to its `41…` hex form.
pub fn address_to_hex(address: &str) -> LedgerResult<String> {
    let bytes = bs58::decode(address.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| LedgerError::InvalidAddress(format!("{}: {}", address, e)))?;
    if bytes.len() != ADDRESS_LEN || bytes[0] != ADDRESS_PREFIX {
        return Err(LedgerError::InvalidAddress(address.to_string()));
    }
    Ok(hex::encode(bytes))
}

/// `41…` hex form to the base58 address.
pub fn hex_to_address(hex_address: &str) -> LedgerResult<String> {
    let bytes = hex::decode(hex_address)
        .map_err(|_| LedgerError::InvalidAddress(hex_address.to_string()))?;
    if bytes.len() != ADDRESS_LEN || bytes[0] != ADDRESS_PREFIX {
        return Err(LedgerError::InvalidAddress(hex_address.to_string()));
    }
    Ok(bs58::encode(bytes).with_check().into_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDigest {
    pub tx_id: String,
    pub signature: String,
}

pub struct TronSigner {
    key: SigningKey,
}

impl TronSigner {
    /// Parse a hex private key (optionally `0x`-prefixed).
    pub fn from_sweep_key(key: &SweepKey) -> LedgerResult<Self> {
        let raw = Zeroizing::new(
            hex::decode(key.expose().trim().trim_start_matches("0x"))
                .map_err(|_| LedgerError::InvalidKey("sweep key is not hex".to_string()))?,
        );
        let key = SigningKey::from_slice(&raw)
            .map_err(|_| LedgerError::InvalidKey("sweep key is not a secp256k1 scalar".to_string()))?;
        Ok(Self { key })
    }

    fn address_bytes(&self) -> Vec<u8> {
        let point = self.key.verifying_key().to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut bytes = Vec::with_capacity(ADDRESS_LEN);
        bytes.push(ADDRESS_PREFIX);
        bytes.extend_from_slice(&hash[12..]);
        bytes
    }

    pub fn hex_address(&self) -> String {
        hex::encode(self.address_bytes())
    }

    /// Base58 address controlled by this key.
    pub fn address(&self) -> String {
        bs58::encode(self.address_bytes()).with_check().into_string()
    }

    /// Sign a transaction given its `raw_data_hex`.
    pub fn sign(&self, raw_data_hex: &str) -> LedgerResult<SignedDigest> {
        let raw = hex::decode(raw_data_hex)
            .map_err(|_| LedgerError::MalformedResponse("raw_data_hex is not hex".to_string()))?;
        let digest: [u8; 32] = Sha256::digest(&raw).into();

        let (signature, recovery_id): (Signature, RecoveryId) = self
            .key
            .sign_prehash(&digest)
            .map_err(|e| LedgerError::InvalidKey(format!("signing failed: {}", e)))?;

        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        Ok(SignedDigest {
            tx_id: hex::encode(digest),
            signature: hex::encode(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::core::k256::ecdsa::VerifyingKey;

    const USDT_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
    const USDT_CONTRACT_HEX: &str = "41a614f803b6fd780986a42c78ec9c7f77e6ded13c";
    const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_address_hex_conversion() {
        assert_eq!(address_to_hex(USDT_CONTRACT).unwrap(), USDT_CONTRACT_HEX);
        assert_eq!(hex_to_address(USDT_CONTRACT_HEX).unwrap(), USDT_CONTRACT);
    }

    #[test]
    fn test_bad_addresses_rejected() {
        // Last character changed: checksum mismatch
        assert!(address_to_hex("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u").is_err());
        assert!(address_to_hex("0xa614f803b6fd780986a42c78ec9c7f77e6ded13c").is_err());
        assert!(hex_to_address("42a614f803b6fd780986a42c78ec9c7f77e6ded13c").is_err());
        assert!(hex_to_address("41zz").is_err());
    }

    #[test]
    fn test_address_derived_from_key() {
        let signer = TronSigner::from_sweep_key(&SweepKey::new(KEY_ONE)).unwrap();
        assert_eq!(signer.hex_address(), "417e5f4552091a69125d5dfcb7b8c2659029395bdf");
        assert_eq!(signer.address(), "TMVQGm1qAQYVdetCeGRRkTWYYrLXuHK2HC");

        let prefixed = TronSigner::from_sweep_key(&SweepKey::new(format!("0x{}", KEY_ONE))).unwrap();
        assert_eq!(prefixed.address(), signer.address());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert!(TronSigner::from_sweep_key(&SweepKey::new("not-hex")).is_err());
        assert!(TronSigner::from_sweep_key(&SweepKey::new("00")).is_err());
        let zero = "0".repeat(64);
        assert!(TronSigner::from_sweep_key(&SweepKey::new(zero)).is_err());
    }

    #[test]
    fn test_signature_recovers_to_signer() {
        let signer = TronSigner::from_sweep_key(&SweepKey::new(KEY_ONE)).unwrap();
        let raw_data_hex = "0a0207902208e1b9de559665c6714080c49789bb2c5a67";
        let signed = signer.sign(raw_data_hex).unwrap();

        let digest: [u8; 32] = Sha256::digest(hex::decode(raw_data_hex).unwrap()).into();
        assert_eq!(signed.tx_id, hex::encode(digest));

        let bytes = hex::decode(&signed.signature).unwrap();
        assert_eq!(bytes.len(), 65);
        assert!(bytes[64] == 27 || bytes[64] == 28);
        let signature = Signature::from_slice(&bytes[..64]).unwrap();
        let recovery_id = RecoveryId::from_byte(bytes[64] - 27).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id).unwrap();
        assert_eq!(&recovered, signer.key.verifying_key());

        // Deterministic signatures
        assert_eq!(signer.sign(raw_data_hex).unwrap(), signed);
    }
}
