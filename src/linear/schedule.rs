//! Round counting and refresh scheduling for leveled ciphertexts.
//!
//! A leveled scheme does not complain when its budget is exhausted, it just decrypts to garbage.
//! The schedule therefore decides up front, from the multiply depth alone, after how many
//! iterations every party refreshes its ciphertexts. All parties derive the same schedule and
//! thus agree on when a refresh round happens without exchanging any message about it.

use crate::error::Error;

/// A monotonic counter of protocol rounds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundCounter(u64);

impl RoundCounter {
    /// Returns the current round and advances the counter.
    pub fn advance(&mut self) -> u64 {
        let round = self.0;
        self.0 += 1;
        round
    }
}

/// Decides before every iteration whether a refresh must happen first.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    max_iter: u32,
    since_refresh: u32,
    rounds: RoundCounter,
}

impl RefreshSchedule {
    /// A schedule that refreshes every `floor(multiply_depth / multiplies_per_iteration)`
    /// iterations.
    pub fn new(multiply_depth: u32, multiplies_per_iteration: u32) -> Result<Self, Error> {
        let max_iter = multiply_depth
            .checked_div(multiplies_per_iteration)
            .unwrap_or(u32::MAX);
        if max_iter == 0 {
            return Err(Error::CryptoBudgetExceeded {
                needed: multiplies_per_iteration,
                remaining: multiply_depth,
            });
        }
        Ok(Self {
            max_iter,
            since_refresh: 0,
            rounds: RoundCounter::default(),
        })
    }

    /// Iterations that fit between two refreshes.
    pub fn max_iter(&self) -> u32 {
        self.max_iter
    }

    /// Starts the next iteration, returning its round and whether to refresh before it.
    pub fn begin_iteration(&mut self) -> (u64, bool) {
        let refresh = self.since_refresh == self.max_iter;
        if refresh {
            self.since_refresh = 0;
        }
        self.since_refresh += 1;
        (self.rounds.advance(), refresh)
    }
}

/// Fails if a ciphertext can not absorb `needed` more multiplications.
pub fn ensure_budget(remaining: u32, needed: u32) -> Result<(), Error> {
    if remaining < needed {
        Err(Error::CryptoBudgetExceeded { needed, remaining })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refreshes_every_max_iter_iterations() -> Result<(), Error> {
        let mut schedule = RefreshSchedule::new(5, 2)?;
        assert_eq!(schedule.max_iter(), 2);
        let refreshed: Vec<u64> = (0..7)
            .map(|_| schedule.begin_iteration())
            .filter(|(_, refresh)| *refresh)
            .map(|(round, _)| round)
            .collect();
        assert_eq!(refreshed, vec![2, 4, 6]);
        Ok(())
    }

    #[test]
    fn too_shallow_depth_is_rejected() {
        assert!(matches!(
            RefreshSchedule::new(1, 2),
            Err(Error::CryptoBudgetExceeded {
                needed: 2,
                remaining: 1
            })
        ));
        assert!(ensure_budget(1, 2).is_err());
        assert!(ensure_budget(2, 2).is_ok());
    }

    #[test]
    fn unbounded_depth_never_refreshes() -> Result<(), Error> {
        let mut schedule = RefreshSchedule::new(u32::MAX, 2)?;
        assert!((0..1000).all(|_| !schedule.begin_iteration().1));
        Ok(())
    }
}
