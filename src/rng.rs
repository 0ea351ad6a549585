//! Small non-cryptographic PRNG for freelist shuffling and mesh cadence.
//!
//! Seeds come from the std hasher's per-process random state, so every heap
//! (and every miniheap seed drawn from it) sees fresh OS entropy without
//! pulling in an RNG dependency.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

pub struct Rng {
  state: u64,
}

impl Rng {
  /// Seeds from OS entropy via the process hash-seed state.
  pub fn from_entropy() -> Self {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(0x6d65_7368_616c_6c6f);
    Self::with_seed(hasher.finish())
  }

  pub fn with_seed(seed: u64) -> Self {
    Self { state: seed }
  }

  /// splitmix64 step.
  #[inline]
  pub fn next_u64(&mut self) -> u64 {
    self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = self.state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
  }

  /// Uniform draw in `[0, n)`. `n` must be nonzero.
  #[inline]
  pub fn below(&mut self, n: u64) -> u64 {
    debug_assert!(n > 0);
    ((self.next_u64() as u128 * n as u128) >> 64) as u64
  }

  /// Uniform draw in `[1, n]`, the mesh-cadence shape.
  #[inline]
  pub fn one_to(&mut self, n: u64) -> u64 {
    1 + self.below(n)
  }

  /// Fisher-Yates permutation.
  pub fn shuffle<T>(&mut self, items: &mut [T]) {
    for i in (1..items.len()).rev() {
      let j = self.below(i as u64 + 1) as usize;
      items.swap(i, j);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deterministic_for_fixed_seed() {
    let mut a = Rng::with_seed(42);
    let mut b = Rng::with_seed(42);
    for _ in 0..16 {
      assert_eq!(a.next_u64(), b.next_u64());
    }
  }

  #[test]
  fn below_stays_in_range() {
    let mut rng = Rng::with_seed(7);
    for _ in 0..1000 {
      assert!(rng.below(10) < 10);
      let draw = rng.one_to(100);
      assert!((1..=100).contains(&draw));
    }
  }

  #[test]
  fn shuffle_is_a_permutation() {
    let mut rng = Rng::with_seed(1234);
    let mut items: Vec<usize> = (0..100).collect();
    rng.shuffle(&mut items);
    let mut sorted = items.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    // A 100-element shuffle that returns identity means the generator is
    // broken, not unlucky.
    assert_ne!(items, (0..100).collect::<Vec<_>>());
  }

  #[test]
  fn entropy_seeds_differ() {
    let mut a = Rng::from_entropy();
    let mut b = Rng::from_entropy();
    let draws_a: Vec<u64> = (0..4).map(|_| a.next_u64()).collect();
    let draws_b: Vec<u64> = (0..4).map(|_| b.next_u64()).collect();
    assert_ne!(draws_a, draws_b);
  }
}
