//! Random value delivered to the contract for each request.
//!
//! Values are drawn uniformly from [`MIN_RANDOM_NUMBER`]`..=`[`MAX_RANDOM_NUMBER`]
//! using the operating system's CSPRNG.

use rand::Rng;
use rand::rngs::OsRng;

pub const MIN_RANDOM_NUMBER: u64 = 1;
pub const MAX_RANDOM_NUMBER: u64 = 10_000;

/// Draw a random number for a fulfillment.
pub fn draw_random_number() -> u64 {
    OsRng.gen_range(MIN_RANDOM_NUMBER..=MAX_RANDOM_NUMBER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_bounds() {
        for _ in 0..10_000 {
            let n = draw_random_number();
            assert!((MIN_RANDOM_NUMBER..=MAX_RANDOM_NUMBER).contains(&n));
        }
    }

    #[test]
    fn is_not_constant() {
        let first = draw_random_number();
        assert!((0..64).any(|_| draw_random_number() != first));
    }
}
