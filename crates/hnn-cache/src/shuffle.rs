//! In-place permutations of order segments.

use hnn_core::{HnnError, HnnResult};
use rand::Rng;

/// Maximal-length Galois LFSR feedback masks, indexed by register width.
const LFSR_TAPS: [u32; 32] = [
    0x1, 0x1, 0x3, 0x6, 0xc, 0x14, 0x30, 0x60, 0xb8, 0x110, 0x240, 0x500, 0xca0, 0x1b00, 0x3500,
    0x6000, 0xb400, 0x12000, 0x20400, 0x72000, 0x90000, 0x140000, 0x300000, 0x420000, 0xd80000,
    0x1200000, 0x3880000, 0x7200000, 0x9000000, 0x14000000, 0x32800000, 0x48000000,
];

/// Largest segment the LFSR permutation supports.
pub const LFSR_MAX_LEN: usize = (1 << 31) - 1;

/// Exchange shuffle from the back of the slice.
///
/// Element `i` is swapped with a uniform pick from `[0, i]`, or from the
/// whole slice when `fixed_range` is set.
pub fn random_exchange<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R, fixed_range: bool) {
    let n = items.len();
    for i in (1..n).rev() {
        let j = if fixed_range {
            rng.gen_range(0..n)
        } else {
            rng.gen_range(0..=i)
        };
        items.swap(i, j);
    }
}

/// Number of bits needed for values below `v`.
fn log2_ceil(v: u32) -> u32 {
    if v <= 1 { 0 } else { 32 - (v - 1).leading_zeros() }
}

/// Deterministic permutation driven by a linear-feedback shift register.
///
/// The register walks every state in `1..2^k`; states above the slice
/// length are skipped, so the visited sequence is a bijection. The start
/// state depends on `seed` and `epoch` only.
pub fn lfsr_permute<T: Clone>(items: &mut [T], seed: u64, epoch: u32) -> HnnResult<()> {
    let n = items.len();
    if n < 2 {
        return Ok(());
    }
    if n > LFSR_MAX_LEN {
        return Err(HnnError::Config(format!(
            "segment of {n} entries is too long for the LFSR shuffle"
        )));
    }
    let max = n as u32;
    let taps = LFSR_TAPS[log2_ceil(max + 1) as usize];
    let start = (seed as u32).wrapping_add(12345u32.wrapping_mul(epoch));
    let mut next = start % max + 1;

    let source = items.to_vec();
    for slot in items.iter_mut() {
        let current = next;
        loop {
            next = if next & 1 == 1 {
                (next >> 1) ^ taps
            } else {
                next >> 1
            };
            if next <= max {
                break;
            }
        }
        *slot = source[(current - 1) as usize].clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn is_permutation(v: &[usize]) -> bool {
        let mut seen = vec![false; v.len()];
        for &x in v {
            if x >= v.len() || seen[x] {
                return false;
            }
            seen[x] = true;
        }
        true
    }

    #[test]
    fn test_log2_ceil() {
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(4), 2);
        assert_eq!(log2_ceil(5), 3);
        assert_eq!(log2_ceil(1 << 20), 20);
    }

    #[test]
    fn test_lfsr_is_bijection() {
        for n in 0..300 {
            let mut v: Vec<usize> = (0..n).collect();
            lfsr_permute(&mut v, 7, 1).expect("permute");
            assert!(is_permutation(&v), "not a permutation for n={n}: {:?}", v);
        }
    }

    #[test]
    fn test_lfsr_is_deterministic() {
        let mut a: Vec<usize> = (0..97).collect();
        let mut b: Vec<usize> = (0..97).collect();
        lfsr_permute(&mut a, 3, 2).expect("permute");
        lfsr_permute(&mut b, 3, 2).expect("permute");
        assert_eq!(a, b);

        let mut c: Vec<usize> = (0..97).collect();
        lfsr_permute(&mut c, 3, 3).expect("permute");
        assert_ne!(a, c, "a new epoch must change the permutation");
    }

    #[test]
    fn test_random_exchange_is_bijection() {
        let mut rng = StdRng::seed_from_u64(11);
        for n in 0..200 {
            for fixed in [false, true] {
                let mut v: Vec<usize> = (0..n).collect();
                random_exchange(&mut v, &mut rng, fixed);
                assert!(is_permutation(&v));
            }
        }
    }

    #[test]
    fn test_random_exchange_reproducible_with_seed() {
        let mut a: Vec<usize> = (0..50).collect();
        let mut b: Vec<usize> = (0..50).collect();
        random_exchange(&mut a, &mut StdRng::seed_from_u64(5), false);
        random_exchange(&mut b, &mut StdRng::seed_from_u64(5), false);
        assert_eq!(a, b);
        assert_ne!(a, (0..50).collect::<Vec<_>>());
    }

    proptest::proptest! {
        #[test]
        fn prop_lfsr_bijection_for_any_seed(n in 0usize..2000, seed in 0u64..1_000_000, epoch in 0u32..50) {
            let mut v: Vec<usize> = (0..n).collect();
            lfsr_permute(&mut v, seed, epoch).expect("permute");
            proptest::prop_assert!(is_permutation(&v));
        }
    }
}
