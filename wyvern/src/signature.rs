use once_cell::sync::Lazy;
use secp256k1::{
    recovery::{RecoverableSignature, RecoveryId},
    Message, Secp256k1, VerifyOnly,
};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use web3::types::{Address, H256};

use crate::{
    order::{Error, OrderParams},
    require,
};

static CONTEXT: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// An ECDSA signature over an order's prefix hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub v: u8,
    pub r: H256,
    pub s: H256,
}

impl Signature {
    /// Recover the signer of the given digest. Returns `None` when the
    /// signature does not decode to a curve point.
    #[must_use]
    pub fn recover(&self, digest: &H256) -> Option<Address> {
        let recovery_id = match self.v {
            0 | 27 => 0,
            1 | 28 => 1,
            _ => return None,
        };
        let mut compact = [0_u8; 64];
        compact[..32].copy_from_slice(self.r.as_bytes());
        compact[32..].copy_from_slice(self.s.as_bytes());

        let message = Message::from_slice(digest.as_bytes()).ok()?;
        let recovery_id = RecoveryId::from_i32(recovery_id).ok()?;
        let signature = RecoverableSignature::from_compact(&compact, recovery_id).ok()?;
        let public_key = CONTEXT.recover(&message, &signature).ok()?;

        // Hash public key into address
        let public_key = public_key.serialize_uncompressed();
        debug_assert_eq!(public_key[0], 0x04);
        let hash = {
            let mut hasher = Keccak256::new();
            hasher.update(&public_key[1..]);
            hasher.finalize()
        };
        Some(Address::from_slice(&hash[12..]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    #[serde(flatten)]
    pub order:     OrderParams,
    pub signature: Signature,
}

impl SignedOrder {
    #[must_use]
    pub fn hash(&self) -> H256 {
        self.order.hash()
    }

    #[must_use]
    pub fn prefix_hash(&self) -> H256 {
        self.order.prefix_hash()
    }

    /// Validate intrinsic parameters and the maker signature.
    pub fn verify(&self) -> Result<(), Error> {
        self.order.validate()?;
        let signer = self
            .signature
            .recover(&self.prefix_hash())
            .ok_or(Error::InvalidSignature)?;
        require!(signer == self.order.maker, Error::InvalidSignature);
        Ok(())
    }

    /// The payload a wallet is asked to sign for this order.
    #[must_use]
    pub fn signature_data(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "eth_sign",
            "digest": self.prefix_hash(),
        })
    }
}

#[cfg(test)]
pub mod test {
    use secp256k1::{PublicKey, SecretKey, SignOnly};

    use super::*;
    use crate::order::test::example_order;

    fn signing_context() -> Secp256k1<SignOnly> {
        Secp256k1::signing_only()
    }

    fn address_of(secret: &SecretKey) -> Address {
        let public = PublicKey::from_secret_key(&signing_context(), secret);
        let public = public.serialize_uncompressed();
        let mut hasher = Keccak256::new();
        hasher.update(&public[1..]);
        let hash = hasher.finalize();
        Address::from_slice(&hash[12..])
    }

    fn sign(digest: &H256, secret: &SecretKey) -> Signature {
        let message = Message::from_slice(digest.as_bytes()).unwrap();
        let signature = signing_context().sign_recoverable(&message, secret);
        let (recovery_id, compact) = signature.serialize_compact();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Signature {
            v: 27 + recovery_id.to_i32() as u8,
            r: H256::from_slice(&compact[..32]),
            s: H256::from_slice(&compact[32..]),
        }
    }

    fn signed_example() -> (SignedOrder, SecretKey) {
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let mut order = example_order();
        order.maker = address_of(&secret);
        let signature = sign(&order.prefix_hash(), &secret);
        (SignedOrder { order, signature }, secret)
    }

    #[test]
    fn test_verify_accepts_maker_signature() {
        let (signed, _secret) = signed_example();
        signed.verify().unwrap();
    }

    #[test]
    fn test_verify_rejects_foreign_signature() {
        let (mut signed, _secret) = signed_example();
        signed.order.maker = "0x8d5e5b5b5d187bdce2e0143eb6b3cc44eef3c0cb".parse().unwrap();
        assert!(signed.verify().is_err());
    }

    #[test]
    fn test_recover_rejects_bad_v() {
        let (mut signed, _secret) = signed_example();
        signed.signature.v = 17;
        assert_eq!(signed.signature.recover(&signed.prefix_hash()), None);
    }
}
