//! A leveled, CKKS-like scheme over a single real slot.
//!
//! Ciphertexts are public-key LWE samples `(a, b)` with `b - <a, s> = x·Δ + e (mod Q_l)`, where
//! `Δ = 2^scale_bits` and the modulus of level `l` is `Q_l = 2^(base_bits + l·scale_bits)`. Fresh
//! ciphertexts live at the top level `L = multiply_depth`. A plaintext multiplication squares the
//! scale, which is brought back to `Δ` by dividing the ciphertext by `2^scale_bits`, dropping one
//! level. At level 0 there is nothing left to divide by: the multiplication still succeeds, but
//! the result decrypts to garbage. The caller must track the budget (see
//! [`LeveledScheme::levels_remaining`]) and refresh in time.

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    Error, LeveledScheme, Profile, Scheme,
    encoding::{center, from_fixed, random_below, random_signed, reduce, to_fixed},
};

/// Lattice and encoding parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Length of the secret vector.
    pub dimension: usize,
    /// Number of LWE samples in the public key.
    pub samples: usize,
    /// Bits of the encoding scale `Δ`, also the bits dropped by every rescale.
    pub scale_bits: u32,
    /// Bits of the modulus at level 0.
    pub base_bits: u32,
    /// Number of plaintext multiplications a fresh ciphertext supports.
    pub multiply_depth: u32,
    /// Bound on the absolute value of every error term.
    pub noise_bound: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            dimension: 32,
            samples: 64,
            scale_bits: 30,
            base_bits: 100,
            multiply_depth: 4,
            noise_bound: 4,
        }
    }
}

impl Params {
    fn modulus(&self, level: u32) -> BigUint {
        BigUint::one() << (self.base_bits + level * self.scale_bits)
    }

    fn mask_bits(&self) -> u64 {
        self.base_bits as u64 - 2
    }

    fn check(&self) -> Result<(), Error> {
        if self.dimension == 0 || self.samples == 0 {
            return Err(Error::InvalidParams("empty lattice".into()));
        }
        if self.scale_bits < 8 || self.base_bits < 2 * self.scale_bits + 16 {
            return Err(Error::InvalidParams(format!(
                "a {}-bit base modulus leaves no room for products at scale 2^{}",
                self.base_bits, self.scale_bits
            )));
        }
        if self.multiply_depth == 0 {
            return Err(Error::InvalidParams("the multiply depth must be positive".into()));
        }
        Ok(())
    }
}

/// LWE samples `(A, A·s + e)` at the top level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    params: Params,
    a: Vec<Vec<BigUint>>,
    b: Vec<BigUint>,
}

/// A binary secret vector.
pub struct SecretKey {
    params: Params,
    s: Vec<bool>,
}

impl SecretKey {
    fn decrypt_raw(&self, ct: &Ciphertext) -> Result<BigInt, Error> {
        if ct.a.len() != self.s.len() {
            return Err(Error::Malformed(format!(
                "ciphertext of dimension {}, expected {}",
                ct.a.len(),
                self.s.len()
            )));
        }
        let q = self.params.modulus(ct.level);
        let inner = ct
            .a
            .iter()
            .zip(&self.s)
            .filter(|(_, s)| **s)
            .fold(BigUint::zero(), |acc, (a, _)| acc + a);
        let raw = (&ct.b + &q - inner % &q) % &q;
        Ok(center(&raw, &q))
    }
}

/// An encrypted real number at some level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    a: Vec<BigUint>,
    b: BigUint,
    level: u32,
}

impl Ciphertext {
    fn map(&self, q: &BigUint, f: impl Fn(&BigUint) -> BigUint) -> Ciphertext {
        Ciphertext {
            a: self.a.iter().map(|x| f(x) % q).collect(),
            b: f(&self.b) % q,
            level: self.level,
        }
    }

    fn at_level(&self, params: &Params, level: u32) -> Ciphertext {
        if level >= self.level {
            return self.clone();
        }
        let q = params.modulus(level);
        Ciphertext {
            level,
            ..self.map(&q, |x| x.clone())
        }
    }
}

/// The scaled plaintext plus mask, without noise removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedPlaintext(BigInt);

/// A wide signed integer added to the scaled plaintext.
pub struct Mask(BigInt);

/// The leveled scheme.
#[derive(Debug, Clone, Copy)]
pub struct Leveled;

fn scale(params: &Params, value: f64) -> Result<BigInt, Error> {
    to_fixed(value, params.scale_bits)
}

fn unscale(params: &Params, raw: &BigInt) -> Result<f64, Error> {
    from_fixed(raw, params.scale_bits)
}

fn noise<R: Rng + ?Sized>(params: &Params, rng: &mut R) -> BigInt {
    let bound = params.noise_bound as i64;
    BigInt::from(rng.random_range(-bound..=bound))
}

impl Leveled {
    fn encrypt_raw<R: Rng + ?Sized>(pk: &PublicKey, raw: &BigInt, rng: &mut R) -> Ciphertext {
        let params = &pk.params;
        let q = params.modulus(params.multiply_depth);
        let mut a = vec![BigUint::zero(); params.dimension];
        let mut b = reduce(&(raw + noise(params, rng)), &q);
        for (row, bi) in pk.a.iter().zip(&pk.b) {
            if rng.random_bool(0.5) {
                for (acc, x) in a.iter_mut().zip(row) {
                    *acc = (&*acc + x) % &q;
                }
                b = (b + bi) % &q;
            }
        }
        Ciphertext {
            a,
            b,
            level: params.multiply_depth,
        }
    }

    fn check_dimension(pk: &PublicKey, ct: &Ciphertext) -> Result<(), Error> {
        if ct.a.len() != pk.params.dimension || ct.level > pk.params.multiply_depth {
            return Err(Error::Malformed(format!(
                "ciphertext of dimension {} at level {} does not match the key",
                ct.a.len(),
                ct.level
            )));
        }
        Ok(())
    }

    fn shift_b(pk: &PublicKey, ct: &Ciphertext, raw: &BigInt) -> Result<Ciphertext, Error> {
        Self::check_dimension(pk, ct)?;
        let q = pk.params.modulus(ct.level);
        Ok(Ciphertext {
            a: ct.a.clone(),
            b: (&ct.b + reduce(raw, &q)) % &q,
            level: ct.level,
        })
    }
}

impl Scheme for Leveled {
    type Params = Params;
    type PublicKey = PublicKey;
    type SecretKey = SecretKey;
    type Ciphertext = Ciphertext;
    type MaskedPlaintext = MaskedPlaintext;
    type Mask = Mask;

    const NAME: &'static str = "leveled";
    const PROFILE: Profile = Profile::Leveled;

    fn keygen<R: Rng + ?Sized>(
        params: &Params,
        rng: &mut R,
    ) -> Result<(PublicKey, SecretKey), Error> {
        params.check()?;
        let q = params.modulus(params.multiply_depth);
        let s: Vec<bool> = (0..params.dimension).map(|_| rng.random_bool(0.5)).collect();
        let mut a = Vec::with_capacity(params.samples);
        let mut b = Vec::with_capacity(params.samples);
        for _ in 0..params.samples {
            let row: Vec<BigUint> = (0..params.dimension)
                .map(|_| random_below(&q, rng))
                .collect();
            let inner = row
                .iter()
                .zip(&s)
                .filter(|(_, s)| **s)
                .fold(BigUint::zero(), |acc, (x, _)| acc + x);
            b.push(reduce(&(BigInt::from(inner) + noise(params, rng)), &q));
            a.push(row);
        }
        let pk = PublicKey {
            params: params.clone(),
            a,
            b,
        };
        let sk = SecretKey {
            params: params.clone(),
            s,
        };
        Ok((pk, sk))
    }

    fn encrypt<R: Rng + ?Sized>(
        pk: &PublicKey,
        value: f64,
        rng: &mut R,
    ) -> Result<Ciphertext, Error> {
        let raw = scale(&pk.params, value)?;
        let limit = BigInt::from(pk.params.modulus(0) >> 2u32);
        if raw > limit || raw < -limit {
            return Err(Error::Unencodable(value));
        }
        Ok(Self::encrypt_raw(pk, &raw, rng))
    }

    fn decrypt(sk: &SecretKey, ct: &Ciphertext) -> Result<f64, Error> {
        unscale(&sk.params, &sk.decrypt_raw(ct)?)
    }

    fn add(pk: &PublicKey, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, Error> {
        Self::check_dimension(pk, a)?;
        Self::check_dimension(pk, b)?;
        let level = a.level.min(b.level);
        let (a, b) = (a.at_level(&pk.params, level), b.at_level(&pk.params, level));
        let q = pk.params.modulus(level);
        Ok(Ciphertext {
            a: a.a.iter().zip(&b.a).map(|(x, y)| (x + y) % &q).collect(),
            b: (a.b + b.b) % &q,
            level,
        })
    }

    fn add_plain(pk: &PublicKey, a: &Ciphertext, value: f64) -> Result<Ciphertext, Error> {
        Self::shift_b(pk, a, &scale(&pk.params, value)?)
    }

    fn mul_plain(pk: &PublicKey, a: &Ciphertext, value: f64) -> Result<Ciphertext, Error> {
        Self::check_dimension(pk, a)?;
        let params = &pk.params;
        let q = params.modulus(a.level);
        let k = reduce(&scale(params, value)?, &q);
        let product = a.map(&q, |x| x * &k);
        if product.level == 0 {
            return Ok(product);
        }
        let level = product.level - 1;
        let q_next = params.modulus(level);
        let half = BigUint::one() << (params.scale_bits - 1);
        let shift = params.scale_bits;
        Ok(Ciphertext {
            level,
            ..product.map(&q_next, |x| (x + &half) >> shift)
        })
    }

    fn neg(pk: &PublicKey, a: &Ciphertext) -> Result<Ciphertext, Error> {
        Self::check_dimension(pk, a)?;
        let q = pk.params.modulus(a.level);
        Ok(a.map(&q, |x| &q - x))
    }

    fn draw_mask<R: Rng + ?Sized>(pk: &PublicKey, rng: &mut R) -> Mask {
        Mask(random_signed(pk.params.mask_bits(), rng))
    }

    fn apply_mask(pk: &PublicKey, ct: &Ciphertext, mask: &Mask) -> Result<Ciphertext, Error> {
        Self::shift_b(pk, ct, &mask.0)
    }

    fn decrypt_masked(sk: &SecretKey, ct: &Ciphertext) -> Result<MaskedPlaintext, Error> {
        Ok(MaskedPlaintext(sk.decrypt_raw(ct)?))
    }

    fn unmask(pk: &PublicKey, masked: &MaskedPlaintext, mask: Mask) -> Result<f64, Error> {
        unscale(&pk.params, &(&masked.0 - mask.0))
    }
}

impl LeveledScheme for Leveled {
    fn multiply_depth(pk: &PublicKey) -> u32 {
        pk.params.multiply_depth
    }

    fn levels_remaining(ct: &Ciphertext) -> u32 {
        ct.level
    }

    fn refresh<R: Rng + ?Sized>(
        pk: &PublicKey,
        sk: &SecretKey,
        ct: &Ciphertext,
        rng: &mut R,
    ) -> Result<Ciphertext, Error> {
        let raw = sk.decrypt_raw(ct)?;
        Ok(Self::encrypt_raw(pk, &raw, rng))
    }

    fn remove_mask(pk: &PublicKey, ct: &Ciphertext, mask: Mask) -> Result<Ciphertext, Error> {
        Self::shift_b(pk, ct, &-mask.0)
    }
}
