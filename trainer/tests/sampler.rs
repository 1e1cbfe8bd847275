mod common;

use trainer::data::RaSampler;

use common::nz;

fn shards(n: usize, world: usize, repetitions: usize, len_factor: f64) -> Vec<RaSampler> {
    (0..world)
        .map(|rank| {
            RaSampler::new(n, nz(world), rank, nz(4))
                .unwrap()
                .repetitions(nz(repetitions))
                .len_factor(len_factor)
                .seed(42)
        })
        .collect()
}

#[test]
fn shards_partition_the_global_order() {
    for n in [1, 7, 100] {
        for world in [1, 2, 3, 4] {
            for repetitions in [1, 3] {
                for len_factor in [0.5, 1.0, 2.0] {
                    let samplers = shards(n, world, repetitions, len_factor);
                    let global = samplers[0].global_order();
                    let per_rank: Vec<Vec<usize>> =
                        samplers.iter().map(RaSampler::indices).collect();

                    let len = per_rank[0].len();
                    assert!(per_rank.iter().all(|s| s.len() == len));
                    assert_eq!(len, samplers[0].num_samples());

                    let mut rebuilt = Vec::with_capacity(len * world);
                    for i in 0..len {
                        for shard in &per_rank {
                            rebuilt.push(shard[i]);
                        }
                    }

                    assert_eq!(rebuilt[..global.len()], global[..]);
                    assert!(rebuilt.len() - global.len() < world);
                }
            }
        }
    }
}

#[test]
fn every_rank_computes_the_same_global_order() {
    let mut samplers = shards(1000, 4, 3, 2.0);
    for sampler in &mut samplers {
        sampler.set_epoch(7);
    }

    let first = samplers[0].global_order();
    assert_eq!(first.len(), 2000);
    for sampler in &samplers[1..] {
        assert_eq!(sampler.global_order(), first);
    }
}

#[test]
fn documented_example() {
    let samplers = shards(100, 4, 3, 2.0);
    let per_rank: Vec<Vec<usize>> = samplers.iter().map(RaSampler::indices).collect();

    assert_eq!(samplers[0].total_len(), 200);
    assert_eq!(per_rank.iter().map(Vec::len).sum::<usize>(), 200);
    for shard in &per_rank {
        assert_eq!(shard.len(), 50);
    }
}
