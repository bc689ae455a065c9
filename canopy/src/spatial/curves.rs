//! Space-filling curves for bulk loading.
//!
//! Points are quantized onto a grid of `2^bits` cells per dimension and
//! mapped to a curve key. Keys are bit strings packed most significant bit
//! first into `u64` words, so comparing the vectors lexicographically
//! compares positions along the curve. Nearby points tend to receive nearby
//! keys, which is what makes sorted runs of keys good leaf pages.

use super::Mbr;

/// Grid resolution per dimension used by the bulk loaders.
pub const CURVE_BITS: u32 = 16;

/// Map a point into grid cells relative to `bounds`.
pub fn quantize(point: &[f64], bounds: &Mbr, bits: u32) -> Vec<u32> {
    debug_assert!(bits > 0 && bits <= 32, "bits must be 1-32");
    let cells = ((1u64 << bits) - 1) as f64;
    point
        .iter()
        .enumerate()
        .map(|(d, v)| {
            let width = bounds.max(d) - bounds.min(d);
            if width > 0.0 {
                (((v - bounds.min(d)) / width).clamp(0.0, 1.0) * cells).round() as u32
            } else {
                0
            }
        })
        .collect()
}

/// Interleave the bits of `cells`, most significant level first, taking
/// dimension 0 first within a level.
fn interleave(cells: &[u32], bits: u32) -> Vec<u64> {
    let total = cells.len() * bits as usize;
    let mut key = vec![0u64; total.div_ceil(64).max(1)];
    let mut pos = 0usize;
    for level in (0..bits).rev() {
        for cell in cells {
            if (cell >> level) & 1 == 1 {
                key[pos / 64] |= 1u64 << (63 - pos % 64);
            }
            pos += 1;
        }
    }
    key
}

/// Z-order (Morton) key of a quantized point.
pub fn z_order_key(cells: &[u32], bits: u32) -> Vec<u64> {
    interleave(cells, bits)
}

/// Hilbert key of a quantized point, for any number of dimensions.
pub fn hilbert_key(cells: &[u32], bits: u32) -> Vec<u64> {
    let mut x = cells.to_vec();
    axes_to_transpose(&mut x, bits);
    interleave(&x, bits)
}

/// Skilling's transform from grid coordinates to the transposed Hilbert
/// index ("Programming the Hilbert curve", 2004).
fn axes_to_transpose(x: &mut [u32], bits: u32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let m = 1u32 << (bits - 1);

    // inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize() {
        let bounds = Mbr::new(vec![0.0, 10.0], vec![1.0, 10.0]);
        assert_eq!(quantize(&[0.0, 10.0], &bounds, 4), vec![0, 0]);
        assert_eq!(quantize(&[1.0, 10.0], &bounds, 4), vec![15, 0]);
        assert_eq!(quantize(&[0.5, 10.0], &bounds, 4), vec![8, 0]);
        // outside the bounds is clamped
        assert_eq!(quantize(&[7.0, 10.0], &bounds, 4), vec![15, 0]);
    }

    #[test]
    fn test_z_order_bits() {
        // x = 01, y = 10 interleaves to 0110
        assert_eq!(z_order_key(&[1, 2], 2), vec![6u64 << 60]);
        let order: Vec<Vec<u64>> = [[0, 0], [0, 1], [1, 0], [1, 1]]
            .iter()
            .map(|c| z_order_key(c, 1))
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_z_order_wide_keys() {
        let cells = vec![u32::from(u16::MAX); 5];
        let key = z_order_key(&cells, 16);
        assert_eq!(key.len(), 2);
        assert_eq!(key[0], u64::MAX);
        assert_eq!(key[1], u64::MAX << 48);
    }

    #[test]
    fn test_hilbert_first_order() {
        let keys: Vec<Vec<u64>> = [[0, 0], [0, 1], [1, 1], [1, 0]]
            .iter()
            .map(|c| hilbert_key(c, 1))
            .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_hilbert_visits_neighbours() {
        for (dims, bits) in [(2usize, 3u32), (3, 2)] {
            let side = 1u32 << bits;
            let total = side.pow(dims as u32);
            let mut cells: Vec<Vec<u32>> = (0..total)
                .map(|mut n| {
                    (0..dims)
                        .map(|_| {
                            let c = n % side;
                            n /= side;
                            c
                        })
                        .collect()
                })
                .collect();
            cells.sort_by_key(|c| hilbert_key(c, bits));

            // consecutive cells along the curve differ by one step on one axis
            for pair in cells.windows(2) {
                let step: u32 = pair[0]
                    .iter()
                    .zip(&pair[1])
                    .map(|(a, b)| a.abs_diff(*b))
                    .sum();
                assert_eq!(step, 1, "{:?} -> {:?}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn test_hilbert_keys_unique() {
        let mut keys: Vec<Vec<u64>> = (0..16u32)
            .map(|i| hilbert_key(&[i % 4, i / 4], 2))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 16);
    }
}
