//! The Paillier cryptosystem with fixed-point encoded real numbers.
//!
//! A plaintext `x` with exponent `e` is the integer `round(x * 2^e) mod n`. Every ciphertext
//! carries its exponent, additions align exponents and scalar multiplications add them. Negative
//! numbers live in the upper third of `[0, n)`, the middle third is treated as an overflow.

use num_bigint::{BigInt, BigUint};
use num_integer::Integer;
use num_traits::One;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    Error, Profile, Scheme,
    encoding::{
        center, from_fixed, mod_inverse, random_below, random_prime, reduce, to_fixed,
    },
};

/// Key generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Bit length of the modulus `n`.
    pub key_bits: u64,
    /// Fractional bits of the fixed-point encoding.
    pub precision_bits: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            key_bits: 2048,
            precision_bits: 32,
        }
    }
}

impl Params {
    /// A small modulus that keeps tests fast. Offers no security whatsoever.
    pub fn insecure_for_tests() -> Self {
        Self {
            key_bits: 256,
            precision_bits: 32,
        }
    }
}

/// The Paillier public key `n` (with generator `g = n + 1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    n: BigUint,
    precision_bits: u32,
}

impl PublicKey {
    fn n_squared(&self) -> BigUint {
        &self.n * &self.n
    }

    fn encode(&self, value: f64, exponent: u32) -> Result<BigUint, Error> {
        let v = to_fixed(value, exponent)?;
        let max = BigInt::from(&self.n / 3u32);
        if v > max || v < -max {
            return Err(Error::Unencodable(value));
        }
        Ok(reduce(&v, &self.n))
    }

    fn decode(&self, m: &BigUint, exponent: u32) -> Result<f64, Error> {
        let third = &self.n / 3u32;
        if m > &third && m < &(&self.n - &third) {
            return Err(Error::Overflow);
        }
        from_fixed(&center(m, &self.n), exponent)
    }

    /// Computes `g^m * c mod n^2`, i.e. adds the raw plaintext `m`.
    fn add_raw(&self, c: &BigUint, m: &BigUint) -> BigUint {
        let n_sq = self.n_squared();
        let gm = (BigUint::one() + m * &self.n) % &n_sq;
        (gm * c) % n_sq
    }

    /// Multiplies the plaintext of `ct` by `2^shift`, raising its exponent.
    fn rescale(&self, ct: &Ciphertext, exponent: u32) -> Ciphertext {
        if ct.exponent >= exponent {
            return ct.clone();
        }
        let factor = BigUint::one() << (exponent - ct.exponent);
        Ciphertext {
            c: ct.c.modpow(&factor, &self.n_squared()),
            exponent,
        }
    }
}

/// The Paillier secret key `(λ, μ)`.
pub struct SecretKey {
    pk: PublicKey,
    lambda: BigUint,
    mu: BigUint,
}

impl SecretKey {
    fn decrypt_raw(&self, ct: &Ciphertext) -> BigUint {
        let n = &self.pk.n;
        let u = ct.c.modpow(&self.lambda, &self.pk.n_squared());
        let l = (u - BigUint::one()) / n;
        (l * &self.mu) % n
    }
}

/// An encrypted fixed-point number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    c: BigUint,
    exponent: u32,
}

impl Ciphertext {
    /// The number of fractional bits of the encrypted plaintext.
    pub fn exponent(&self) -> u32 {
        self.exponent
    }
}

/// A decrypted but still masked plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedPlaintext {
    value: BigUint,
    exponent: u32,
}

/// A uniformly random element of `Z_n`, perfectly hiding any plaintext it is added to.
pub struct Mask(BigUint);

/// The additive Paillier scheme.
#[derive(Debug, Clone, Copy)]
pub struct Paillier;

impl Scheme for Paillier {
    type Params = Params;
    type PublicKey = PublicKey;
    type SecretKey = SecretKey;
    type Ciphertext = Ciphertext;
    type MaskedPlaintext = MaskedPlaintext;
    type Mask = Mask;

    const NAME: &'static str = "paillier";
    const PROFILE: Profile = Profile::Additive;

    fn keygen<R: Rng + ?Sized>(
        params: &Params,
        rng: &mut R,
    ) -> Result<(PublicKey, SecretKey), Error> {
        if params.key_bits < 128 {
            return Err(Error::InvalidParams(format!(
                "a {}-bit modulus is too small",
                params.key_bits
            )));
        }
        // products of two encodings need twice the precision, plus headroom for sums
        if 2 * params.precision_bits as u64 + 64 > params.key_bits {
            return Err(Error::InvalidParams(format!(
                "{} fractional bits do not fit into a {}-bit modulus",
                params.precision_bits, params.key_bits
            )));
        }
        loop {
            let p = random_prime(params.key_bits / 2, rng);
            let q = random_prime(params.key_bits - params.key_bits / 2, rng);
            if p == q {
                continue;
            }
            let n = &p * &q;
            let lambda = (&p - 1u32).lcm(&(&q - 1u32));
            // with g = n + 1, L(g^λ mod n^2) = λ mod n
            let Some(mu) = mod_inverse(&(&lambda % &n), &n) else {
                continue;
            };
            let pk = PublicKey {
                n,
                precision_bits: params.precision_bits,
            };
            let sk = SecretKey {
                pk: pk.clone(),
                lambda,
                mu,
            };
            return Ok((pk, sk));
        }
    }

    fn encrypt<R: Rng + ?Sized>(
        pk: &PublicKey,
        value: f64,
        rng: &mut R,
    ) -> Result<Ciphertext, Error> {
        let m = pk.encode(value, pk.precision_bits)?;
        let r = loop {
            let r = random_below(&pk.n, rng);
            if r > BigUint::one() {
                break r;
            }
        };
        let rn = r.modpow(&pk.n, &pk.n_squared());
        Ok(Ciphertext {
            c: pk.add_raw(&rn, &m),
            exponent: pk.precision_bits,
        })
    }

    fn decrypt(sk: &SecretKey, ct: &Ciphertext) -> Result<f64, Error> {
        sk.pk.decode(&sk.decrypt_raw(ct), ct.exponent)
    }

    fn add(pk: &PublicKey, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, Error> {
        let exponent = a.exponent.max(b.exponent);
        let (a, b) = (pk.rescale(a, exponent), pk.rescale(b, exponent));
        Ok(Ciphertext {
            c: (a.c * b.c) % pk.n_squared(),
            exponent,
        })
    }

    fn add_plain(pk: &PublicKey, a: &Ciphertext, value: f64) -> Result<Ciphertext, Error> {
        let m = pk.encode(value, a.exponent)?;
        Ok(Ciphertext {
            c: pk.add_raw(&a.c, &m),
            exponent: a.exponent,
        })
    }

    fn mul_plain(pk: &PublicKey, a: &Ciphertext, value: f64) -> Result<Ciphertext, Error> {
        let k = pk.encode(value, pk.precision_bits)?;
        Ok(Ciphertext {
            c: a.c.modpow(&k, &pk.n_squared()),
            exponent: a.exponent + pk.precision_bits,
        })
    }

    fn neg(pk: &PublicKey, a: &Ciphertext) -> Result<Ciphertext, Error> {
        let minus_one = &pk.n - 1u32;
        Ok(Ciphertext {
            c: a.c.modpow(&minus_one, &pk.n_squared()),
            exponent: a.exponent,
        })
    }

    fn draw_mask<R: Rng + ?Sized>(pk: &PublicKey, rng: &mut R) -> Mask {
        Mask(random_below(&pk.n, rng))
    }

    fn apply_mask(pk: &PublicKey, ct: &Ciphertext, mask: &Mask) -> Result<Ciphertext, Error> {
        Ok(Ciphertext {
            c: pk.add_raw(&ct.c, &mask.0),
            exponent: ct.exponent,
        })
    }

    fn decrypt_masked(sk: &SecretKey, ct: &Ciphertext) -> Result<MaskedPlaintext, Error> {
        Ok(MaskedPlaintext {
            value: sk.decrypt_raw(ct),
            exponent: ct.exponent,
        })
    }

    fn unmask(pk: &PublicKey, masked: &MaskedPlaintext, mask: Mask) -> Result<f64, Error> {
        if masked.value >= pk.n {
            return Err(Error::Malformed("masked value exceeds the modulus".into()));
        }
        let m = (&masked.value + &pk.n - &mask.0) % &pk.n;
        pk.decode(&m, masked.exponent)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn keys(seed: u64) -> (PublicKey, SecretKey, ChaCha20Rng) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let (pk, sk) = Paillier::keygen(&Params::insecure_for_tests(), &mut rng)
            .expect("test parameters are valid");
        (pk, sk, rng)
    }

    #[test]
    fn rejects_tiny_moduli() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let params = Params {
            key_bits: 64,
            precision_bits: 8,
        };
        assert!(Paillier::keygen(&params, &mut rng).is_err());
    }

    #[test]
    fn scalar_multiplication_raises_the_exponent() -> Result<(), Error> {
        let (pk, sk, mut rng) = keys(11);
        let a = Paillier::encrypt(&pk, -1.5, &mut rng)?;
        let b = Paillier::mul_plain(&pk, &a, 0.25)?;
        assert_eq!(b.exponent(), 64);
        assert_eq!(Paillier::decrypt(&sk, &b)?, -0.375);
        let c = Paillier::add(&pk, &a, &b)?;
        assert_eq!(Paillier::decrypt(&sk, &c)?, -1.875);
        let d = Paillier::neg(&pk, &c)?;
        assert_eq!(Paillier::decrypt(&sk, &d)?, 1.875);
        Ok(())
    }

    #[test]
    fn same_value_encrypts_differently() -> Result<(), Error> {
        let (pk, _, mut rng) = keys(12);
        let a = Paillier::encrypt(&pk, 1.0, &mut rng)?;
        let b = Paillier::encrypt(&pk, 1.0, &mut rng)?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn masked_decryption_hides_the_value() -> Result<(), Error> {
        let (pk, sk, mut rng) = keys(13);
        let g = Paillier::encrypt(&pk, 0.125, &mut rng)?;
        let m1 = Paillier::draw_mask(&pk, &mut rng);
        let m2 = Paillier::draw_mask(&pk, &mut rng);
        let seen1 = Paillier::decrypt_masked(&sk, &Paillier::apply_mask(&pk, &g, &m1)?)?;
        let seen2 = Paillier::decrypt_masked(&sk, &Paillier::apply_mask(&pk, &g, &m2)?)?;
        assert_ne!(seen1, seen2);
        assert_eq!(Paillier::unmask(&pk, &seen1, m1)?, 0.125);
        assert_eq!(Paillier::unmask(&pk, &seen2, m2)?, 0.125);
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn additive_homomorphism(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            let (pk, sk, mut rng) = keys(14);
            let ca = Paillier::encrypt(&pk, a, &mut rng).unwrap();
            let cb = Paillier::encrypt(&pk, b, &mut rng).unwrap();
            let sum = Paillier::decrypt(&sk, &Paillier::add(&pk, &ca, &cb).unwrap()).unwrap();
            prop_assert!((sum - (a + b)).abs() < 1e-8);
        }

        #[test]
        fn masking_is_exact(g in -1e6f64..1e6) {
            let (pk, sk, mut rng) = keys(15);
            let encoded = from_fixed(&to_fixed(g, pk.precision_bits).unwrap(), pk.precision_bits).unwrap();
            let ct = Paillier::encrypt(&pk, g, &mut rng).unwrap();
            let mask = Paillier::draw_mask(&pk, &mut rng);
            let masked = Paillier::decrypt_masked(&sk, &Paillier::apply_mask(&pk, &ct, &mask).unwrap()).unwrap();
            prop_assert_eq!(Paillier::unmask(&pk, &masked, mask).unwrap(), encoded);
        }
    }
}
