use std::{
    fs,
    sync::Arc,
    thread,
    time::Duration,
};

use distributed::{Backend, DistErr, LocalGroup, ProcessGroup, Rendezvous, init_process_group};

const TIMEOUT: Duration = Duration::from_secs(10);

fn spawn_ranks<F, T>(url: &str, world_size: usize, f: F) -> Vec<T>
where
    F: Fn(Box<dyn ProcessGroup>) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let f = Arc::clone(&f);
            let url = url.to_string();
            thread::spawn(move || {
                let group =
                    init_process_group(Backend::Local, &url, world_size, rank, TIMEOUT).unwrap();
                f(group)
            })
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn all_reduce_averages_across_ranks() {
    let results = spawn_ranks("local://all-reduce", 4, |group| {
        let rank = group.rank() as f32;
        let mut buf = vec![rank, 2.0 * rank, 1.0];

        group.all_reduce_mean(&mut buf).unwrap();
        buf
    });

    for buf in results {
        assert_eq!(buf, vec![1.5, 3.0, 1.0]);
    }
}

#[test]
fn all_reduce_is_reusable_across_steps() {
    let results = spawn_ranks("local://many-steps", 3, |group| {
        let mut out = Vec::new();
        for step in 0..20 {
            let mut buf = vec![(group.rank() + step) as f32];
            group.all_reduce_mean(&mut buf).unwrap();
            out.push(buf[0]);
        }
        out
    });

    let expected: Vec<f32> = (0..20).map(|step| (step + 1) as f32).collect();
    for out in results {
        assert_eq!(out, expected);
    }
}

#[test]
fn length_mismatch_fails_on_every_rank() {
    let results = spawn_ranks("local://mismatch", 2, |group| {
        let mut buf = vec![0.0; 2 + group.rank()];
        let failed = matches!(
            group.all_reduce_mean(&mut buf),
            Err(DistErr::BufferLengthMismatch { .. })
        );

        let mut next = vec![group.rank() as f32];
        group.all_reduce_mean(&mut next).unwrap();
        (failed, next[0])
    });

    for (failed, next) in results {
        assert!(failed);
        assert_eq!(next, 0.5);
    }
}

#[test]
fn missing_ranks_time_out() {
    let rendezvous = Rendezvous::parse("local://lonely").unwrap();
    let result = LocalGroup::join(&rendezvous, 2, 0, Duration::from_millis(50));

    assert!(matches!(
        result,
        Err(DistErr::RendezvousTimeout {
            joined: 1,
            world_size: 2,
            ..
        })
    ));
}

#[test]
fn duplicate_rank_is_rejected() {
    let rendezvous = Rendezvous::parse("local://duplicate").unwrap();

    let first = {
        let rendezvous = rendezvous.clone();
        thread::spawn(move || LocalGroup::join(&rendezvous, 2, 0, Duration::from_millis(500)))
    };
    thread::sleep(Duration::from_millis(50));

    let second = LocalGroup::join(&rendezvous, 2, 0, Duration::from_millis(10));
    assert!(matches!(second, Err(DistErr::DuplicateRank { rank: 0 })));
    assert!(first.join().unwrap().is_err());
}

#[test]
fn world_size_mismatch_is_rejected() {
    let rendezvous = Rendezvous::parse("local://world-mismatch").unwrap();

    let first = {
        let rendezvous = rendezvous.clone();
        thread::spawn(move || LocalGroup::join(&rendezvous, 2, 0, Duration::from_millis(500)))
    };
    thread::sleep(Duration::from_millis(50));

    let second = LocalGroup::join(&rendezvous, 3, 1, Duration::from_millis(10));
    assert!(matches!(
        second,
        Err(DistErr::WorldSizeMismatch {
            got: 3,
            expected: 2,
            ..
        })
    ));
    assert!(first.join().unwrap().is_err());
}

#[test]
fn file_rendezvous_registers_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("init");
    let url = format!("file://{}", path.display());

    let ranks = spawn_ranks(&url, 3, |group| {
        group.barrier().unwrap();
        group.rank()
    });
    assert_eq!(ranks, vec![0, 1, 2]);

    let mut lines: Vec<usize> = fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    lines.sort();
    assert_eq!(lines, vec![0, 1, 2]);
}

#[test]
fn url_can_host_a_new_group_once_formed() {
    for _ in 0..3 {
        let ranks = spawn_ranks("local://reused", 2, |group| group.rank());
        assert_eq!(ranks, vec![0, 1]);
    }
}

#[test]
fn leaving_rank_fails_the_pending_collectives() {
    let results = spawn_ranks("local://leaver", 3, |group| {
        if group.rank() == 2 {
            return None;
        }

        let mut buf = vec![1.0];
        Some(group.all_reduce_mean(&mut buf))
    });

    assert!(results[2].is_none());
    for result in &results[..2] {
        assert!(matches!(result, Some(Err(DistErr::PeerLeft { rank: 2 }))));
    }
}

#[test]
fn stalled_collective_times_out() {
    let rendezvous = Rendezvous::parse("local://stalled").unwrap();
    let timeout = Duration::from_millis(300);

    let peer = {
        let rendezvous = rendezvous.clone();
        thread::spawn(move || {
            let group = LocalGroup::join(&rendezvous, 2, 1, timeout).unwrap();
            thread::sleep(Duration::from_millis(1500));
            group.rank()
        })
    };

    let group = LocalGroup::join(&rendezvous, 2, 0, timeout).unwrap();
    assert!(matches!(
        group.barrier(),
        Err(DistErr::CollectiveTimeout {
            arrived: 1,
            world_size: 2,
            ..
        })
    ));
    assert_eq!(peer.join().unwrap(), 1);
}
