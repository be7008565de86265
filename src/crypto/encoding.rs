//! Fixed-point encoding and big-integer helpers shared by the schemes.

use num_bigint::{BigInt, BigUint};
use num_integer::{ExtendedGcd, Integer};
use num_traits::{FromPrimitive, One, Signed, ToPrimitive, Zero};
use rand::Rng;

use crate::crypto::Error;

const SMALL_PRIMES: [u32; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// Rounds `value * 2^frac_bits` to the nearest integer.
pub(crate) fn to_fixed(value: f64, frac_bits: u32) -> Result<BigInt, Error> {
    let scaled = (value * 2f64.powi(frac_bits as i32)).round();
    BigInt::from_f64(scaled).ok_or(Error::Unencodable(value))
}

/// Interprets an integer as a fixed-point number with `frac_bits` fractional bits.
pub(crate) fn from_fixed(value: &BigInt, frac_bits: u32) -> Result<f64, Error> {
    let v = value.to_f64().ok_or(Error::Overflow)? / 2f64.powi(frac_bits as i32);
    if v.is_finite() { Ok(v) } else { Err(Error::Overflow) }
}

/// Maps a signed integer to its representative in `[0, modulus)`.
pub(crate) fn reduce(value: &BigInt, modulus: &BigUint) -> BigUint {
    let m = BigInt::from(modulus.clone());
    value
        .mod_floor(&m)
        .to_biguint()
        .unwrap_or_else(BigUint::zero)
}

/// Maps a residue in `[0, modulus)` to `(-modulus/2, modulus/2]`.
pub(crate) fn center(value: &BigUint, modulus: &BigUint) -> BigInt {
    let v = BigInt::from(value.clone());
    if value > &(modulus >> 1u32) {
        v - BigInt::from(modulus.clone())
    } else {
        v
    }
}

/// A uniformly random integer in `[0, 2^bits)`.
pub(crate) fn random_bits<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> BigUint {
    let nbytes = bits.div_ceil(8) as usize;
    let mut bytes = vec![0u8; nbytes];
    rng.fill_bytes(&mut bytes);
    let excess = 8 * nbytes as u64 - bits;
    if let Some(first) = bytes.first_mut() {
        *first &= 0xFFu8 >> excess;
    }
    BigUint::from_bytes_be(&bytes)
}

/// A uniformly random integer in `[0, bound)`, by rejection sampling.
pub(crate) fn random_below<R: Rng + ?Sized>(bound: &BigUint, rng: &mut R) -> BigUint {
    let bits = bound.bits();
    loop {
        let candidate = random_bits(bits, rng);
        if &candidate < bound {
            return candidate;
        }
    }
}

/// A uniformly random signed integer in `(-2^bits, 2^bits)`.
pub(crate) fn random_signed<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> BigInt {
    let magnitude = BigInt::from(random_bits(bits, rng));
    if rng.random_bool(0.5) {
        -magnitude
    } else {
        magnitude
    }
}

/// Miller-Rabin with `rounds` random witnesses.
pub(crate) fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: u32, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    if n == &two {
        return true;
    }
    if n.is_even() {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if n == &p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }
    let one = BigUint::one();
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;
    let witness_range = n - 3u32;
    'witness: for _ in 0..rounds {
        let a = random_below(&witness_range, rng) + &two;
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// A random prime with exactly `bits` bits.
pub(crate) fn random_prime<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> BigUint {
    let top = BigUint::one() << (bits - 1);
    loop {
        let candidate = random_bits(bits, rng) | &top | BigUint::one();
        if is_probable_prime(&candidate, 40, rng) {
            return candidate;
        }
    }
}

/// The inverse of `a` modulo `m`, if it exists.
pub(crate) fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let a = BigInt::from(a.clone());
    let m = BigInt::from(m.clone());
    let ExtendedGcd { gcd, x, .. } = a.extended_gcd(&m);
    if !gcd.abs().is_one() {
        return None;
    }
    (x * gcd.signum()).mod_floor(&m).to_biguint()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn fixed_point_round_trips_negative_values() -> Result<(), Error> {
        let x = to_fixed(-3.25, 16)?;
        assert_eq!(x, BigInt::from(-212_992i64));
        assert_eq!(from_fixed(&x, 16)?, -3.25);
        assert!(to_fixed(f64::NAN, 8).is_err());
        Ok(())
    }

    #[test]
    fn center_and_reduce_are_inverse() {
        let q = BigUint::from(1000u32);
        for v in [-499i64, -1, 0, 1, 500] {
            let r = reduce(&BigInt::from(v), &q);
            assert_eq!(center(&r, &q), BigInt::from(v));
        }
    }

    #[test]
    fn primality() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        assert!(is_probable_prime(&BigUint::from(104_729u32), 20, &mut rng));
        assert!(!is_probable_prime(&BigUint::from(104_730u32), 20, &mut rng));
        // Carmichael number
        assert!(!is_probable_prime(&BigUint::from(561u32), 20, &mut rng));
        let p = random_prime(64, &mut rng);
        assert_eq!(p.bits(), 64);
    }

    #[test]
    fn inverse() {
        let inv = mod_inverse(&BigUint::from(3u32), &BigUint::from(11u32));
        assert_eq!(inv, Some(BigUint::from(4u32)));
        assert_eq!(mod_inverse(&BigUint::from(4u32), &BigUint::from(8u32)), None);
    }
}
