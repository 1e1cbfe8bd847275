use machine_learning::arch::{Sequential, activations::ActFn, layers::Dense};
use rand::Rng;

use crate::{Architecture, Result};

/// The width of the hidden layer of the `Mlp` architecture.
pub const HIDDEN: usize = 128;

/// Builds and initializes the classifier for `architecture`.
///
/// # Arguments
/// * `architecture` - The layout of the network.
/// * `input_size` - The side of the square input images.
/// * `num_classes` - The amount of class scores produced.
/// * `rng` - Drives the parameter initialization.
pub fn build<R: Rng + ?Sized>(
    architecture: Architecture,
    input_size: usize,
    num_classes: usize,
    rng: &mut R,
) -> Result<Sequential> {
    let features = input_size * input_size;

    let layers = match architecture {
        Architecture::Linear => vec![Dense::new((features, num_classes), None)],
        Architecture::Mlp => vec![
            Dense::new((features, HIDDEN), Some(ActFn::relu())),
            Dense::new((HIDDEN, num_classes), None),
        ],
    };

    let mut model = Sequential::new(layers);
    model.init(rng)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use machine_learning::arch::Model;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn sizes_follow_the_architecture() {
        let mut rng = StdRng::seed_from_u64(0);

        let linear = build(Architecture::Linear, 4, 3, &mut rng).unwrap();
        assert_eq!(linear.size(), 16 * 3 + 3);

        let mlp = build(Architecture::Mlp, 4, 3, &mut rng).unwrap();
        assert_eq!(mlp.size(), 16 * HIDDEN + HIDDEN + HIDDEN * 3 + 3);
        assert_eq!((mlp.input_size(), mlp.output_size()), (16, 3));
    }

    #[test]
    fn same_seed_same_init() {
        let a = build(Architecture::Mlp, 3, 2, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = build(Architecture::Mlp, 3, 2, &mut StdRng::seed_from_u64(5)).unwrap();

        assert_eq!(a.params(), b.params());
    }
}
