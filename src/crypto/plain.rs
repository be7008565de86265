//! A scheme that does not encrypt at all.
//!
//! Running a protocol with [`Plain`] executes exactly the same choreography and message flow as
//! an encrypted run, which makes it the reference for accuracy comparisons.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{Error, LeveledScheme, Profile, Scheme};

/// A "ciphertext" that is the plaintext itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cleartext(pub f64);

/// A mask, drawn uniformly from `[-2^20, 2^20)`.
pub struct Mask(f64);

/// The identity scheme.
#[derive(Debug, Clone, Copy)]
pub struct Plain;

fn finite(value: f64) -> Result<Cleartext, Error> {
    if value.is_finite() {
        Ok(Cleartext(value))
    } else {
        Err(Error::Unencodable(value))
    }
}

impl Scheme for Plain {
    type Params = ();
    type PublicKey = ();
    type SecretKey = ();
    type Ciphertext = Cleartext;
    type MaskedPlaintext = Cleartext;
    type Mask = Mask;

    const NAME: &'static str = "plain";
    const PROFILE: Profile = Profile::Plaintext;

    fn keygen<R: Rng + ?Sized>(_: &(), _: &mut R) -> Result<((), ()), Error> {
        Ok(((), ()))
    }

    fn encrypt<R: Rng + ?Sized>(_: &(), value: f64, _: &mut R) -> Result<Cleartext, Error> {
        finite(value)
    }

    fn decrypt(_: &(), ct: &Cleartext) -> Result<f64, Error> {
        Ok(ct.0)
    }

    fn add(_: &(), a: &Cleartext, b: &Cleartext) -> Result<Cleartext, Error> {
        finite(a.0 + b.0)
    }

    fn add_plain(_: &(), a: &Cleartext, value: f64) -> Result<Cleartext, Error> {
        finite(a.0 + value)
    }

    fn mul_plain(_: &(), a: &Cleartext, value: f64) -> Result<Cleartext, Error> {
        finite(a.0 * value)
    }

    fn neg(_: &(), a: &Cleartext) -> Result<Cleartext, Error> {
        Ok(Cleartext(-a.0))
    }

    fn draw_mask<R: Rng + ?Sized>(_: &(), rng: &mut R) -> Mask {
        let bound = (1u32 << 20) as f64;
        Mask(rng.random_range(-bound..bound))
    }

    fn apply_mask(_: &(), ct: &Cleartext, mask: &Mask) -> Result<Cleartext, Error> {
        finite(ct.0 + mask.0)
    }

    fn decrypt_masked(_: &(), ct: &Cleartext) -> Result<Cleartext, Error> {
        Ok(*ct)
    }

    fn unmask(_: &(), masked: &Cleartext, mask: Mask) -> Result<f64, Error> {
        Ok(masked.0 - mask.0)
    }
}

/// Plaintexts never run out of levels.
impl LeveledScheme for Plain {
    fn multiply_depth(_: &()) -> u32 {
        u32::MAX
    }

    fn levels_remaining(_: &Cleartext) -> u32 {
        u32::MAX
    }

    fn refresh<R: Rng + ?Sized>(
        _: &(),
        _: &(),
        ct: &Cleartext,
        _: &mut R,
    ) -> Result<Cleartext, Error> {
        Ok(*ct)
    }

    fn remove_mask(_: &(), ct: &Cleartext, mask: Mask) -> Result<Cleartext, Error> {
        finite(ct.0 - mask.0)
    }
}
