//! Round-robin interleaving of per-target seed streams
//!
//! The cycle visits targets in rotation, taking one seed from each. A target
//! whose stream runs dry is dropped from the rotation without disturbing the
//! position of the others, so no target is served twice in a row while
//! another still has seeds left.

use super::{seed_streams, Seed, SeedSpace, SeedStream};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// A unit of work: evaluate `seed` against target number `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub target: usize,
    pub seed: Seed,
}

/// Lazy, fair interleaving of every target's seed stream
pub struct SeedCycle {
    /// Live streams tagged with their target index, in rotation order
    streams: Vec<(usize, SeedStream)>,
    /// Next stream to draw from
    pos: usize,
}

impl SeedCycle {
    /// Interleave `streams`, where stream `i` belongs to target `i`
    pub fn new(streams: Vec<SeedStream>) -> Self {
        Self {
            streams: streams.into_iter().enumerate().collect(),
            pos: 0,
        }
    }

    /// Build streams for every space and interleave them
    pub fn from_spaces<'a, I>(spaces: I, forced: Option<Seed>, master: &mut Xoshiro256PlusPlus) -> Self
    where
        I: IntoIterator<Item = &'a SeedSpace>,
    {
        Self::new(seed_streams(spaces, forced, master))
    }

    /// Number of targets that still have seeds
    pub fn live_targets(&self) -> usize {
        self.streams.len()
    }
}

impl Iterator for SeedCycle {
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        while !self.streams.is_empty() {
            if self.pos >= self.streams.len() {
                self.pos = 0;
            }

            let (target, stream) = &mut self.streams[self.pos];
            match stream.next() {
                Some(seed) => {
                    let item = WorkItem { target: *target, seed };
                    self.pos += 1;
                    return Some(item);
                }
                None => {
                    // Removal shifts the next stream into `pos`
                    self.streams.remove(self.pos);
                }
            }
        }
        None
    }
}
