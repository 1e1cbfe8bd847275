use rand::{Rng, SeedableRng, rngs::StdRng};

const MEAN: f32 = 0.449;
const STD: f32 = 0.226;

/// The per-sample preprocessing of a split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    side: usize,
    flip: bool,
}

impl Transform {
    /// Random horizontal flip followed by normalization.
    pub fn train(side: usize) -> Self {
        Self { side, flip: true }
    }

    /// Normalization only.
    pub fn val(side: usize) -> Self {
        Self { side, flip: false }
    }

    /// Transforms `pixels` in place.
    pub fn apply<R: Rng + ?Sized>(&self, pixels: &mut [f32], rng: &mut R) {
        if self.flip && self.side > 0 && rng.random_bool(0.5) {
            for row in pixels.chunks_exact_mut(self.side) {
                row.reverse();
            }
        }

        for p in pixels.iter_mut() {
            *p = (*p - MEAN) / STD;
        }
    }
}

/// The generator driving the augmentation of the sample at `position` of an epoch's order.
///
/// Repeated copies of a sample sit at different positions and so get independent draws.
pub fn sample_rng(seed: u64, epoch: usize, position: usize) -> StdRng {
    let mixed = seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add((epoch as u64).rotate_left(32))
        ^ position as u64;

    StdRng::seed_from_u64(mixed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn val_only_normalizes() {
        let mut pixels = [MEAN, MEAN + STD, MEAN - 2. * STD, MEAN];
        Transform::val(2).apply(&mut pixels, &mut sample_rng(0, 0, 0));

        for (got, expected) in pixels.iter().zip([0., 1., -2., 0.]) {
            assert!((got - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn train_flips_rows_for_some_positions() {
        let transform = Transform::train(2);
        let original = [MEAN, MEAN + STD, MEAN, MEAN + STD];
        let mut flipped = 0;

        for position in 0..64 {
            let mut pixels = original;
            transform.apply(&mut pixels, &mut sample_rng(0, 0, position));
            if pixels[0] > 0.5 {
                flipped += 1;
                assert!(pixels[1].abs() < 1e-5 && pixels[2] > 0.5);
            }
        }

        assert!(flipped > 0 && flipped < 64);
    }

    #[test]
    fn draws_are_reproducible() {
        let mut a = sample_rng(7, 3, 11);
        let mut b = sample_rng(7, 3, 11);

        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }
}
