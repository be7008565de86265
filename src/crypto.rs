//! Homomorphic encryption as an opaque capability used by the training protocols.
//!
//! Two profiles are provided behind the same [`Scheme`] trait:
//!
//! * [`paillier::Paillier`], an additive scheme: ciphertexts can be added to each other and to
//!   plaintexts, and multiplied by plaintext scalars, but never multiplied with each other.
//! * [`leveled::Leveled`], a CKKS-like scheme in which every multiplication consumes one of a fixed
//!   number of levels. Once the levels are used up the scheme keeps computing, but decryption
//!   silently returns wrong values. Tracking the budget is up to the protocol, see
//!   [`crate::linear::schedule`].
//!
//! [`plain::Plain`] implements the same trait without any encryption and serves as a reference
//! for the encrypted runs.
//!
//! The secret key never leaves the party that generated it: secret keys and [`Scheme::Mask`]s
//! are deliberately not serializable.

use std::fmt::Debug;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub(crate) mod encoding;
pub mod leveled;
pub mod paillier;
pub mod plain;

/// Errors raised by homomorphic operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The value can not be represented in the plaintext space.
    #[error("{0} can not be encoded in the plaintext space")]
    Unencodable(f64),
    /// A decrypted value lies outside of the range of valid encodings.
    #[error("decrypted value overflowed the plaintext space")]
    Overflow,
    /// The key parameters are unusable.
    #[error("invalid key parameters: {0}")]
    InvalidParams(String),
    /// A ciphertext does not belong to the given key.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Which kind of homomorphism a scheme offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Addition only, scalar multiplication is unlimited.
    Additive,
    /// Addition plus a bounded number of multiplications between refreshes.
    Leveled,
    /// No encryption at all.
    Plaintext,
}

/// A homomorphic encryption scheme over real numbers.
pub trait Scheme: Send + Sync + 'static {
    /// Parameters of key generation.
    type Params: Clone + Debug + Send + Sync;
    /// The key that lets any party encrypt and compute on ciphertexts.
    type PublicKey: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// The decryption key, owned exclusively by the party that generated it.
    type SecretKey: Send + Sync;
    /// An encrypted real number.
    type Ciphertext: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// The decryption of a masked ciphertext, meaningless without the mask.
    type MaskedPlaintext: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Additive blinding factor, consumed when it is removed again.
    type Mask: Send;

    /// The name used in logs.
    const NAME: &'static str;
    /// The homomorphism this scheme offers.
    const PROFILE: Profile;

    /// Generates a fresh key pair.
    fn keygen<R: Rng + ?Sized>(
        params: &Self::Params,
        rng: &mut R,
    ) -> Result<(Self::PublicKey, Self::SecretKey), Error>;

    /// Encrypts a real number.
    fn encrypt<R: Rng + ?Sized>(
        pk: &Self::PublicKey,
        value: f64,
        rng: &mut R,
    ) -> Result<Self::Ciphertext, Error>;

    /// Decrypts a ciphertext.
    fn decrypt(sk: &Self::SecretKey, ct: &Self::Ciphertext) -> Result<f64, Error>;

    /// Adds two ciphertexts.
    fn add(
        pk: &Self::PublicKey,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, Error>;

    /// Adds a plaintext to a ciphertext.
    fn add_plain(
        pk: &Self::PublicKey,
        a: &Self::Ciphertext,
        value: f64,
    ) -> Result<Self::Ciphertext, Error>;

    /// Multiplies a ciphertext by a plaintext scalar.
    fn mul_plain(
        pk: &Self::PublicKey,
        a: &Self::Ciphertext,
        value: f64,
    ) -> Result<Self::Ciphertext, Error>;

    /// Negates a ciphertext.
    fn neg(pk: &Self::PublicKey, a: &Self::Ciphertext) -> Result<Self::Ciphertext, Error>;

    /// Draws a fresh uniformly random mask.
    fn draw_mask<R: Rng + ?Sized>(pk: &Self::PublicKey, rng: &mut R) -> Self::Mask;

    /// Adds a mask to a ciphertext.
    fn apply_mask(
        pk: &Self::PublicKey,
        ct: &Self::Ciphertext,
        mask: &Self::Mask,
    ) -> Result<Self::Ciphertext, Error>;

    /// Decrypts a masked ciphertext without decoding it.
    fn decrypt_masked(
        sk: &Self::SecretKey,
        ct: &Self::Ciphertext,
    ) -> Result<Self::MaskedPlaintext, Error>;

    /// Removes the mask from a decrypted masked value.
    fn unmask(
        pk: &Self::PublicKey,
        masked: &Self::MaskedPlaintext,
        mask: Self::Mask,
    ) -> Result<f64, Error>;

    /// A short stable hash of the public key, used to detect key mix-ups.
    fn fingerprint(pk: &Self::PublicKey) -> Result<String, Error> {
        let bytes = bincode::serialize(pk).map_err(|e| Error::Malformed(e.to_string()))?;
        let hash = blake3::hash(&bytes).to_hex();
        Ok(hash[..16].to_string())
    }
}

/// A scheme whose multiplications consume a bounded budget of levels.
pub trait LeveledScheme: Scheme {
    /// The number of multiplications a fresh ciphertext supports.
    fn multiply_depth(pk: &Self::PublicKey) -> u32;

    /// The number of multiplications the ciphertext still supports.
    fn levels_remaining(ct: &Self::Ciphertext) -> u32;

    /// Decrypts and re-encrypts a ciphertext at the top level (secret key holder only).
    fn refresh<R: Rng + ?Sized>(
        pk: &Self::PublicKey,
        sk: &Self::SecretKey,
        ct: &Self::Ciphertext,
        rng: &mut R,
    ) -> Result<Self::Ciphertext, Error>;

    /// Homomorphically removes a mask that was applied before a refresh.
    fn remove_mask(
        pk: &Self::PublicKey,
        ct: &Self::Ciphertext,
        mask: Self::Mask,
    ) -> Result<Self::Ciphertext, Error>;
}

/// A generator for masks and encryption randomness, seeded from the thread-local generator.
pub(crate) fn fresh_rng() -> ChaCha20Rng {
    ChaCha20Rng::from_seed(rand::random())
}

/// Encrypts every value of a vector.
pub fn encrypt_all<S: Scheme, R: Rng + ?Sized>(
    pk: &S::PublicKey,
    values: &[f64],
    rng: &mut R,
) -> Result<Vec<S::Ciphertext>, Error> {
    values.iter().map(|&v| S::encrypt(pk, v, rng)).collect()
}

/// Sums ciphertexts, returning `None` for an empty input.
pub fn sum<'a, S: Scheme>(
    pk: &S::PublicKey,
    cts: impl IntoIterator<Item = &'a S::Ciphertext>,
) -> Result<Option<S::Ciphertext>, Error> {
    let mut acc: Option<S::Ciphertext> = None;
    for ct in cts {
        acc = Some(match acc {
            None => ct.clone(),
            Some(acc) => S::add(pk, &acc, ct)?,
        });
    }
    Ok(acc)
}

/// Computes `Σ weights[i] * cts[i]`, skipping zero weights, as repeated addition.
///
/// Returns an encryption of zero (at the level of the first ciphertext) if every weight is zero.
pub fn dot_plain<S: Scheme>(
    pk: &S::PublicKey,
    cts: &[S::Ciphertext],
    weights: impl IntoIterator<Item = f64>,
) -> Result<S::Ciphertext, Error> {
    let mut acc: Option<S::Ciphertext> = None;
    for (ct, w) in cts.iter().zip(weights) {
        if w == 0.0 {
            continue;
        }
        let term = S::mul_plain(pk, ct, w)?;
        acc = Some(match acc {
            None => term,
            Some(acc) => S::add(pk, &acc, &term)?,
        });
    }
    match (acc, cts.first()) {
        (Some(acc), _) => Ok(acc),
        (None, Some(first)) => S::mul_plain(pk, first, 0.0),
        (None, None) => Err(Error::Malformed("dot product over no ciphertexts".into())),
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::crypto::{paillier::Paillier, plain::Plain};

    fn dot_matches<S: Scheme>(params: &S::Params) -> Result<(), Error> {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (pk, sk) = S::keygen(params, &mut rng)?;
        let cts = encrypt_all::<S, _>(&pk, &[1.5, -2.0, 0.25], &mut rng)?;
        let dot = dot_plain::<S>(&pk, &cts, [2.0, 0.0, -4.0])?;
        assert!((S::decrypt(&sk, &dot)? - 2.0).abs() < 1e-6);
        let zero = dot_plain::<S>(&pk, &cts, [0.0, 0.0, 0.0])?;
        assert!(S::decrypt(&sk, &zero)?.abs() < 1e-6);
        let total = sum::<S>(&pk, &cts)?.ok_or(Error::Overflow)?;
        assert!((S::decrypt(&sk, &total)? + 0.25).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn dot_product_over_schemes() -> Result<(), Error> {
        dot_matches::<Plain>(&())?;
        dot_matches::<Paillier>(&paillier::Params::insecure_for_tests())
    }

    #[test]
    fn fingerprints_differ_between_keys() -> Result<(), Error> {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let params = paillier::Params::insecure_for_tests();
        let (pk1, _) = Paillier::keygen(&params, &mut rng)?;
        let (pk2, _) = Paillier::keygen(&params, &mut rng)?;
        assert_eq!(Paillier::fingerprint(&pk1)?, Paillier::fingerprint(&pk1.clone())?);
        assert_ne!(Paillier::fingerprint(&pk1)?, Paillier::fingerprint(&pk2)?);
        Ok(())
    }
}
