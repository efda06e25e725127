//! XOR parity over the data fragments of a block.
//!
//! A block is striped into `frags` data fragments of equal size; the parity
//! fragment is the lane-wise XOR of all data fragments. All routines work on
//! 64-bit lanes. The data buffer is one contiguous slice holding the fragment
//! columns back to back, so lane `i` of fragment `f` lives at
//! `data[f * stride + i]` where `stride` is the fragment size in lanes.

/// Bytes per parity lane.
pub const LANE_BYTES: usize = std::mem::size_of::<u64>();

/// Lanes per fragment of a 4 KiB block split `n` ways.
const fn stride_4k(n: usize) -> usize {
    4096 / (n * LANE_BYTES)
}

/// Compute the parity of `frags` fragment columns in `data` into `parity`.
///
/// `parity.len()` is the fragment stride; `data.len()` must be
/// `frags * parity.len()`.
pub fn compute(data: &[u64], parity: &mut [u64], frags: usize) {
    let stride = parity.len();
    debug_assert!(frags >= 1);
    debug_assert_eq!(data.len(), frags * stride);

    // Unrolled forms for the common 4 KiB block orders.
    if stride * LANE_BYTES * frags == 4096 {
        match frags {
            2 => {
                const S: usize = stride_4k(2);
                let mut i = 0;
                while i < S {
                    parity[i] = data[i] ^ data[i + S];
                    parity[i + 1] = data[i + 1] ^ data[i + 1 + S];
                    parity[i + 2] = data[i + 2] ^ data[i + 2 + S];
                    parity[i + 3] = data[i + 3] ^ data[i + 3 + S];
                    i += 4;
                }
                return;
            }
            4 => {
                const S: usize = stride_4k(4);
                for i in 0..S {
                    parity[i] = data[i] ^ data[i + S] ^ data[i + 2 * S] ^ data[i + 3 * S];
                }
                return;
            }
            8 => {
                const S: usize = stride_4k(8);
                for i in 0..S {
                    parity[i] = data[i]
                        ^ data[i + S]
                        ^ data[i + 2 * S]
                        ^ data[i + 3 * S]
                        ^ data[i + 4 * S]
                        ^ data[i + 5 * S]
                        ^ data[i + 6 * S]
                        ^ data[i + 7 * S];
                }
                return;
            }
            16 => {
                const S: usize = stride_4k(16);
                for i in 0..S {
                    let mut x = data[i];
                    x ^= data[i + S] ^ data[i + 2 * S] ^ data[i + 3 * S];
                    x ^= data[i + 4 * S] ^ data[i + 5 * S] ^ data[i + 6 * S] ^ data[i + 7 * S];
                    x ^= data[i + 8 * S] ^ data[i + 9 * S] ^ data[i + 10 * S] ^ data[i + 11 * S];
                    x ^= data[i + 12 * S]
                        ^ data[i + 13 * S]
                        ^ data[i + 14 * S]
                        ^ data[i + 15 * S];
                    parity[i] = x;
                }
                return;
            }
            _ => {}
        }
    }

    for i in 0..stride {
        let mut x = data[i];
        for f in 1..frags {
            x ^= data[f * stride + i];
        }
        parity[i] = x;
    }
}

/// Like [`compute`], but the fragment column `skip` is treated as all zeroes.
///
/// Used when a data member is dead: the lost column cannot be stored
/// anywhere, so parity is defined as the XOR of the surviving fragments and a
/// later reconstruction of the lost column yields zeroes deterministically.
pub fn compute_skip(data: &[u64], parity: &mut [u64], frags: usize, skip: usize) {
    let stride = parity.len();
    debug_assert_eq!(data.len(), frags * stride);
    debug_assert!(skip < frags);

    for i in 0..stride {
        let mut x = 0;
        for f in 0..frags {
            if f != skip {
                x ^= data[f * stride + i];
            }
        }
        parity[i] = x;
    }
}

/// Check `parity` against the XOR of the fragment columns in `data`.
///
/// Returns the index of the first differing lane, or `None` when the parity
/// matches.
pub fn verify(data: &[u64], parity: &[u64], frags: usize) -> Option<usize> {
    let stride = parity.len();
    debug_assert_eq!(data.len(), frags * stride);

    for i in 0..stride {
        let mut x = data[i];
        for f in 1..frags {
            x ^= data[f * stride + i];
        }
        if x != parity[i] {
            return Some(i);
        }
    }
    None
}

/// Rebuild the fragment column `missing` of `block` from `parity` and the
/// surviving columns.
///
/// The missing fragment equals the XOR of the parity and every other data
/// fragment, so the parity is copied into the missing slot and the survivors
/// are folded over it in place. The previous contents of the missing column
/// are ignored.
pub fn reconstruct(block: &mut [u64], parity: &[u64], missing: usize, frags: usize) {
    let stride = parity.len();
    debug_assert_eq!(block.len(), frags * stride);
    debug_assert!(missing < frags);

    for i in 0..stride {
        let mut x = parity[i];
        for f in 0..frags {
            if f != missing {
                x ^= block[f * stride + i];
            }
        }
        block[missing * stride + i] = x;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_block(rng: &mut impl Rng, lanes: usize) -> Vec<u64> {
        (0..lanes).map(|_| rng.random()).collect()
    }

    /// reconstruct(D with fragment i erased, compute(D), i) yields D, for
    /// every i and for each supported fragment order.
    #[test]
    fn reconstruction_identity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for frags in [1usize, 2, 4, 8, 16] {
            let stride = 4096 / (frags * LANE_BYTES);
            let data = random_block(&mut rng, frags * stride);
            let mut parity = vec![0u64; stride];
            compute(&data, &mut parity, frags);

            for missing in 0..frags {
                let mut damaged = data.clone();
                for lane in &mut damaged[missing * stride..(missing + 1) * stride] {
                    *lane = 0xdead_beef_dead_beef;
                }
                reconstruct(&mut damaged, &parity, missing, frags);
                assert_eq!(damaged, data, "frags={} missing={}", frags, missing);
            }
        }
    }

    /// verify(D, compute(D)) is ok; flipping any fragment makes it mismatch.
    #[test]
    fn verify_is_negation_of_mutation() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for frags in [2usize, 4, 8] {
            let stride = 4096 / (frags * LANE_BYTES);
            let data = random_block(&mut rng, frags * stride);
            let mut parity = vec![0u64; stride];
            compute(&data, &mut parity, frags);
            assert_eq!(verify(&data, &parity, frags), None);

            for f in 0..frags {
                let mut mutated = data.clone();
                mutated[f * stride + 3] ^= 1;
                assert_eq!(verify(&mutated, &parity, frags), Some(3));
            }
        }
    }

    /// The unrolled 4 KiB forms agree with the general strided loop.
    #[test]
    fn specialized_matches_general() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for frags in [2usize, 4, 8, 16] {
            let stride = 4096 / (frags * LANE_BYTES);
            let data = random_block(&mut rng, frags * stride);

            let mut fast = vec![0u64; stride];
            compute(&data, &mut fast, frags);

            let mut slow = vec![0u64; stride];
            for i in 0..stride {
                let mut x = 0;
                for f in 0..frags {
                    x ^= data[f * stride + i];
                }
                slow[i] = x;
            }
            assert_eq!(fast, slow, "frags={}", frags);
        }
    }

    /// Off-4KiB block sizes take the general path and still satisfy the
    /// reconstruction identity.
    #[test]
    fn general_path_odd_block_size() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let frags = 4;
        let stride = 8192 / (frags * LANE_BYTES);
        let data = random_block(&mut rng, frags * stride);
        let mut parity = vec![0u64; stride];
        compute(&data, &mut parity, frags);

        let mut damaged = data.clone();
        damaged[2 * stride..3 * stride].fill(0);
        reconstruct(&mut damaged, &parity, 2, frags);
        assert_eq!(damaged, data);
    }

    /// Zero-filled parity: the skipped column does not contribute, and
    /// reconstructing it afterwards yields zeroes.
    #[test]
    fn skip_column_reconstructs_zeroes() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let frags = 4;
        let stride = 4096 / (frags * LANE_BYTES);
        let data = random_block(&mut rng, frags * stride);
        let mut parity = vec![0u64; stride];
        compute_skip(&data, &mut parity, frags, 1);

        let mut read_back = data.clone();
        // A degraded read never fetches the dead column.
        read_back[stride..2 * stride].fill(0x77);
        reconstruct(&mut read_back, &parity, 1, frags);
        assert!(read_back[stride..2 * stride].iter().all(|&x| x == 0));
        assert_eq!(&read_back[..stride], &data[..stride]);
        assert_eq!(&read_back[2 * stride..], &data[2 * stride..]);
    }

    /// A mirror (one data fragment) has parity equal to the data.
    #[test]
    fn mirror_parity_is_copy() {
        let data: Vec<u64> = (0..512).map(|x| x * 3).collect();
        let mut parity = vec![0u64; 512];
        compute(&data, &mut parity, 1);
        assert_eq!(parity, data);
        assert_eq!(verify(&data, &parity, 1), None);
    }
}
