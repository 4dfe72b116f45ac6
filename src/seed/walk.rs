//! Shuffled walk over a counted seed space
//!
//! Visits every value in `[0, n)` exactly once without materializing the
//! range: value `i` of the walk is `(a * i + b) mod n` with `a` coprime to
//! `n`, which is a bijection on `[0, n)`.

use rand::Rng;

/// Full-period affine walk over `[0, n)`
#[derive(Debug, Clone)]
pub struct AffineWalk {
    n: u64,
    a: u64,
    b: u64,
    index: u64,
}

impl AffineWalk {
    /// Create a walk with a random stride and offset
    pub fn new<R: Rng + ?Sized>(n: u64, rng: &mut R) -> Self {
        if n <= 2 {
            let b = if n == 0 { 0 } else { rng.gen_range(0..n) };
            return Self { n, a: 1, b, index: 0 };
        }

        let a = loop {
            let candidate = rng.gen_range(1..n);
            if gcd(candidate, n) == 1 {
                break candidate;
            }
        };
        let b = rng.gen_range(0..n);
        Self { n, a, b, index: 0 }
    }
}

impl Iterator for AffineWalk {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.index >= self.n {
            return None;
        }
        let value = (self.a as u128 * self.index as u128 + self.b as u128) % self.n as u128;
        self.index += 1;
        Some(value as u64)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.n - self.index) as usize;
        (remaining, Some(remaining))
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
