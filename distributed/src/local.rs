use std::{
    collections::{HashMap, HashSet},
    fs::OpenOptions,
    io::Write,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::{DistErr, ProcessGroup, Rendezvous, Result};

/// Groups still waiting for ranks to join, by rendezvous key.
static PENDING: LazyLock<Mutex<HashMap<String, Arc<Shared>>>> = LazyLock::new(Default::default);

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    /// The first rank that left the group, if any.
    left: Option<usize>,
}

/// A reusable barrier that elects one leader per phase.
///
/// Once a rank leaves, every pending and future wait fails instead of blocking.
struct PhaseBarrier {
    size: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl PhaseBarrier {
    fn new(size: usize, timeout: Duration) -> Self {
        Self {
            size,
            timeout,
            state: Mutex::default(),
            cvar: Condvar::new(),
        }
    }

    /// Blocks until `size` callers arrived.
    ///
    /// # Returns
    /// `true` for exactly one caller of the phase, or an error if a rank left the group or the
    /// phase did not complete within the timeout.
    fn wait(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if let Some(rank) = state.left {
            return Err(DistErr::PeerLeft { rank });
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(true);
        }

        let deadline = Instant::now() + self.timeout;
        while state.generation == generation {
            if let Some(rank) = state.left {
                return Err(DistErr::PeerLeft { rank });
            }

            if self.cvar.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                return Err(DistErr::CollectiveTimeout {
                    arrived: state.arrived,
                    world_size: self.size,
                    timeout: self.timeout,
                });
            }
        }

        Ok(false)
    }

    /// Marks `rank` as gone and wakes every waiter.
    fn leave(&self, rank: usize) {
        let mut state = self.state.lock();
        if state.left.is_none() {
            state.left = Some(rank);
        }
        self.cvar.notify_all();
    }
}

#[derive(Default)]
struct Reduction {
    acc: Vec<f32>,
    len: Option<usize>,
    mismatch: Option<(usize, usize)>,
}

struct Shared {
    world_size: usize,
    members: Mutex<HashSet<usize>>,
    joined: Condvar,
    barrier: PhaseBarrier,
    reduction: Mutex<Reduction>,
}

impl Shared {
    fn new(world_size: usize, timeout: Duration) -> Self {
        Self {
            world_size,
            members: Mutex::new(HashSet::with_capacity(world_size)),
            joined: Condvar::new(),
            barrier: PhaseBarrier::new(world_size, timeout),
            reduction: Mutex::default(),
        }
    }
}

/// A process group whose ranks are threads of the current process.
///
/// Dropping a rank's group makes the collectives of every other rank fail with
/// [`DistErr::PeerLeft`].
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Joins the group behind `rendezvous`.
    ///
    /// A `file` rendezvous additionally registers the rank as a line of the rendezvous file,
    /// creating it if needed.
    ///
    /// # Arguments
    /// * `rendezvous` - Where the ranks meet.
    /// * `world_size` - The total amount of ranks of the group.
    /// * `rank` - The rank of the caller.
    /// * `timeout` - How long to wait for the rest of the ranks, both here and in every
    ///   collective of the group.
    ///
    /// # Returns
    /// The joined group, or an error if the rank is invalid, already taken, or the rest of the
    /// ranks didn't show up in time.
    pub fn join(
        rendezvous: &Rendezvous,
        world_size: usize,
        rank: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(DistErr::InvalidRank { rank, world_size });
        }

        if let Rendezvous::File(path) = rendezvous {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{rank}")?;
        }

        let key = rendezvous.key();
        let shared = {
            let mut pending = PENDING.lock();
            let shared = pending
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Shared::new(world_size, timeout)));

            if shared.world_size != world_size {
                return Err(DistErr::WorldSizeMismatch {
                    url: key,
                    got: world_size,
                    expected: shared.world_size,
                });
            }

            Arc::clone(shared)
        };

        debug!(rank = rank, url = key.as_str(); "waiting on rendezvous");

        let mut members = shared.members.lock();
        if !members.insert(rank) {
            return Err(DistErr::DuplicateRank { rank });
        }

        if members.len() == world_size {
            shared.joined.notify_all();
            forget(&key, &shared);
        }

        let deadline = Instant::now() + timeout;
        while members.len() < world_size {
            if shared.joined.wait_until(&mut members, deadline).timed_out()
                && members.len() < world_size
            {
                let joined = members.len();
                members.remove(&rank);
                if members.is_empty() {
                    forget(&key, &shared);
                }

                warn!(rank = rank, joined = joined; "rendezvous timed out");
                return Err(DistErr::RendezvousTimeout {
                    joined,
                    world_size,
                    timeout,
                });
            }
        }
        drop(members);

        info!(rank = rank, world_size = world_size; "joined process group");
        Ok(Self {
            rank,
            world_size,
            shared,
        })
    }
}

/// Removes `shared` from the pending groups, so the key can host a new group.
fn forget(key: &str, shared: &Arc<Shared>) {
    let mut pending = PENDING.lock();
    if pending.get(key).is_some_and(|s| Arc::ptr_eq(s, shared)) {
        pending.remove(key);
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait()?;
        Ok(())
    }

    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        {
            let mut guard = self.shared.reduction.lock();
            let reduction = &mut *guard;

            match reduction.len {
                None => {
                    reduction.len = Some(buf.len());
                    reduction.acc.clear();
                    reduction.acc.extend_from_slice(buf);
                }
                Some(len) if len == buf.len() => {
                    for (a, b) in reduction.acc.iter_mut().zip(buf.iter()) {
                        *a += b;
                    }
                }
                Some(len) => reduction.mismatch = Some((buf.len(), len)),
            }
        }

        self.shared.barrier.wait()?;

        let mismatch = {
            let reduction = self.shared.reduction.lock();
            if reduction.mismatch.is_none() {
                let n = self.world_size as f32;
                for (b, a) in buf.iter_mut().zip(&reduction.acc) {
                    *b = a / n;
                }
            }
            reduction.mismatch
        };

        if self.shared.barrier.wait()? {
            let mut reduction = self.shared.reduction.lock();
            reduction.len = None;
            reduction.mismatch = None;
        }
        self.shared.barrier.wait()?;

        match mismatch {
            Some((got, expected)) => Err(DistErr::BufferLengthMismatch { got, expected }),
            None => Ok(()),
        }
    }
}

impl Drop for LocalGroup {
    fn drop(&mut self) {
        debug!(rank = self.rank; "leaving process group");
        self.shared.barrier.leave(self.rank);
    }
}
