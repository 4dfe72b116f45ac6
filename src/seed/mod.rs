//! Seeds and seed spaces
//!
//! A seed selects one candidate mutation of a target's base source. Each
//! target exposes a [`SeedSpace`] describing which seeds exist; the space is
//! turned into a per-target stream by [`seed_stream`], and the streams of all
//! targets are interleaved by [`cycle::SeedCycle`].
//!
//! # Seed Spaces
//!
//! - **Random**: unbounded, a fresh random value each time
//! - **Counted(n)**: every value in `[0, n)` exactly once, in shuffled order
//! - **Enumerated**: an explicit list, emitted in order
//!
//! # Forced Seeds
//!
//! A forced seed replays a single candidate. For a random space the forced
//! seed repeats forever; for a finite space it is emitted exactly once.
//!
//! ```
//! use permuter::seed::Seed;
//!
//! let seed: Seed = "5,10".parse().unwrap();
//! assert_eq!(seed.rng_seed, 5);
//! assert_eq!(seed.value, 10);
//! assert_eq!(seed.to_string(), "5,10");
//! ```

use anyhow::{bail, Context};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter;
use std::str::FromStr;

pub mod cycle;
pub mod walk;

pub use cycle::{SeedCycle, WorkItem};
pub use walk::AffineWalk;

/// One mutation selector
///
/// `rng_seed` of zero means "continue the evaluator's own random stream";
/// a non-zero value reseeds the evaluator first so a reported candidate can
/// be reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seed {
    pub rng_seed: u64,
    pub value: u64,
}

impl Seed {
    pub fn new(rng_seed: u64, value: u64) -> Self {
        Self { rng_seed, value }
    }

    /// A seed that selects `value` without forcing the evaluator's RNG
    pub fn from_value(value: u64) -> Self {
        Self { rng_seed: 0, value }
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rng_seed != 0 {
            write!(f, "{},{}", self.rng_seed, self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

impl FromStr for Seed {
    type Err = anyhow::Error;

    /// Parse either `SEED` or `RNG_SEED,SEED`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [value] => Ok(Seed::from_value(parse_part(value)?)),
            [rng_seed, value] => Ok(Seed::new(parse_part(rng_seed)?, parse_part(value)?)),
            _ => bail!("Invalid seed '{}': expected SEED or RNG_SEED,SEED", s),
        }
    }
}

fn parse_part(part: &str) -> anyhow::Result<u64> {
    part.parse::<u64>()
        .with_context(|| format!("Invalid seed component '{}'", part))
}

/// Set of seeds a target can be mutated with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedSpace {
    /// Unbounded; draws a random value per candidate
    Random,
    /// Every value in `[0, n)` exactly once
    Counted(u64),
    /// An explicit, ordered list
    Enumerated(Vec<u64>),
}

impl SeedSpace {
    pub fn is_random(&self) -> bool {
        matches!(self, SeedSpace::Random)
    }

    /// Number of seeds, or `None` when unbounded
    pub fn len(&self) -> Option<u64> {
        match self {
            SeedSpace::Random => None,
            SeedSpace::Counted(n) => Some(*n),
            SeedSpace::Enumerated(seeds) => Some(seeds.len() as u64),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Display for SeedSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedSpace::Random => write!(f, "random"),
            SeedSpace::Counted(n) => write!(f, "{} seeds", n),
            SeedSpace::Enumerated(seeds) => write!(f, "{} listed seeds", seeds.len()),
        }
    }
}

/// Boxed seed stream for one target
pub type SeedStream = Box<dyn Iterator<Item = Seed> + Send>;

/// Build the stream of seeds for one target
///
/// `rng` drives random draws and the permutation of counted spaces; give
/// each target its own generator so streams do not depend on each other.
pub fn seed_stream(space: &SeedSpace, forced: Option<Seed>, mut rng: Xoshiro256PlusPlus) -> SeedStream {
    match (forced, space) {
        (Some(seed), SeedSpace::Random) => Box::new(iter::repeat(seed)),
        (Some(seed), _) => Box::new(iter::once(seed)),
        (None, SeedSpace::Random) => Box::new(iter::repeat_with(move || Seed::from_value(rng.gen()))),
        (None, SeedSpace::Enumerated(seeds)) => Box::new(seeds.clone().into_iter().map(Seed::from_value)),
        (None, SeedSpace::Counted(n)) => Box::new(AffineWalk::new(*n, &mut rng).map(Seed::from_value)),
    }
}

/// Build one stream per target, each with an independent generator derived
/// from `master`
pub fn seed_streams<'a, I>(spaces: I, forced: Option<Seed>, master: &mut Xoshiro256PlusPlus) -> Vec<SeedStream>
where
    I: IntoIterator<Item = &'a SeedSpace>,
{
    spaces
        .into_iter()
        .map(|space| seed_stream(space, forced, Xoshiro256PlusPlus::seed_from_u64(master.gen())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn rng() -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(7)
    }

    #[test]
    fn test_parse_plain_seed() {
        let seed: Seed = "10".parse().unwrap();
        assert_eq!(seed, Seed::new(0, 10));
        assert_eq!(seed.to_string(), "10");
    }

    #[test]
    fn test_parse_rng_and_seed() {
        let seed: Seed = "5, 10".parse().unwrap();
        assert_eq!(seed, Seed::new(5, 10));
        assert_eq!(seed.to_string(), "5,10");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Seed>().is_err());
        assert!("a".parse::<Seed>().is_err());
        assert!("1,2,3".parse::<Seed>().is_err());
        assert!("-4".parse::<Seed>().is_err());
    }

    #[test]
    fn test_counted_stream_visits_every_seed_once() {
        let values: Vec<u64> = seed_stream(&SeedSpace::Counted(97), None, rng())
            .map(|s| s.value)
            .collect();
        assert_eq!(values.len(), 97);
        let unique: HashSet<u64> = values.iter().copied().collect();
        assert_eq!(unique.len(), 97);
        assert!(values.iter().all(|v| *v < 97));
    }

    #[test]
    fn test_enumerated_stream_keeps_order() {
        let space = SeedSpace::Enumerated(vec![4, 1, 9]);
        let values: Vec<u64> = seed_stream(&space, None, rng()).map(|s| s.value).collect();
        assert_eq!(values, vec![4, 1, 9]);
    }

    #[test]
    fn test_random_stream_is_unbounded() {
        let mut stream = seed_stream(&SeedSpace::Random, None, rng());
        for _ in 0..1000 {
            assert!(stream.next().is_some());
        }
    }

    #[test]
    fn test_forced_seed_on_finite_space_is_emitted_once() {
        let forced = Seed::new(3, 12);
        let values: Vec<Seed> = seed_stream(&SeedSpace::Counted(50), Some(forced), rng()).collect();
        assert_eq!(values, vec![forced]);
    }

    #[test]
    fn test_forced_seed_on_random_space_repeats() {
        let forced = Seed::from_value(42);
        let values: Vec<Seed> = seed_stream(&SeedSpace::Random, Some(forced), rng())
            .take(5)
            .collect();
        assert_eq!(values, vec![forced; 5]);
    }

    #[test]
    fn test_parsed_forced_seed_replays() {
        let forced: Seed = "5,10".parse().unwrap();
        assert_eq!(forced, Seed::new(5, 10));

        let mut stream = seed_stream(&SeedSpace::Random, Some(forced), rng());
        assert!((0..1000).all(|_| stream.next() == Some(Seed::new(5, 10))));

        let once: Vec<Seed> = seed_stream(&SeedSpace::Enumerated(vec![1, 2, 3]), Some(forced), rng()).collect();
        assert_eq!(once, vec![Seed::new(5, 10)]);
    }

    #[test]
    fn test_space_len() {
        assert_eq!(SeedSpace::Random.len(), None);
        assert_eq!(SeedSpace::Counted(3).len(), Some(3));
        assert!(SeedSpace::Enumerated(vec![]).is_empty());
    }
}
