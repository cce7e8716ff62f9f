use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Condvar, Mutex, RwLock},
};

use derive_more::Deref;

use super::DispatchState;
use crate::{
    geom::{Extent, Index, TiledExtent, TiledIndex},
    num::Scalar,
};

/// Tile-local scratch memory shared by all threads of one tile,
/// zero-initialized at tile start. Slot accesses are individually atomic;
/// ordering between threads is established only by the tile barrier. Two
/// writes to the same slot with no barrier in between leave an
/// unspecified one of the values.
pub struct TileScratch<S> {
    data: RwLock<Box<[S]>>,
}

impl<S: Scalar> TileScratch<S> {
    fn new(len: usize) -> Self {
        let data = RwLock::new(vec![S::zero(); len].into_boxed_slice());
        Self { data }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.read().expect("failed to lock").len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the scratch slot at `index`.
    #[inline]
    pub fn read(&self, index: usize) -> S {
        self.data.read().expect("failed to lock")[index]
    }

    /// Write the scratch slot at `index`.
    #[inline]
    pub fn write(&self, index: usize, value: S) {
        self.data.write().expect("failed to lock")[index] = value;
    }
}

/// Full-tile rendezvous. A faulting sibling thread poisons the barrier so
/// waiting threads unwind instead of deadlocking.
pub(crate) struct TileBarrier {
    total: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: usize,
    poisoned: bool,
}

impl TileBarrier {
    fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock().expect("failed to lock");
        if state.poisoned {
            drop(state);
            panic!("tile barrier poisoned");
        }
        state.arrived += 1;
        if state.arrived == self.total {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return;
        }
        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            state = self.cvar.wait(state).expect("failed to lock");
        }
        if state.poisoned {
            drop(state);
            panic!("tile barrier poisoned");
        }
    }

    fn poison(&self) {
        let mut state = self.state.lock().expect("failed to lock");
        state.poisoned = true;
        self.cvar.notify_all();
    }

    fn generation(&self) -> usize {
        self.state.lock().expect("failed to lock").generation
    }
}

/// Execution context handed to a tiled kernel: the thread's coordinates
/// (through [`TiledIndex`]), the tile's scratch block and its barrier.
#[derive(Clone, Deref)]
pub struct Tile<S, const R: usize> {
    #[deref]
    index: TiledIndex<R>,
    scratch: Arc<TileScratch<S>>,
    barrier: Arc<TileBarrier>,
}

impl<S: Scalar, const R: usize> Tile<S, R> {
    #[inline]
    pub fn index(&self) -> TiledIndex<R> {
        self.index
    }

    #[inline]
    pub fn scratch(&self) -> &TileScratch<S> {
        &self.scratch
    }

    /// Rendezvous with every thread of the tile: scratch writes made
    /// before the barrier are visible to the whole tile after it.
    ///
    /// # Panics
    /// Panics if a sibling thread of the tile has faulted, surfacing as a
    /// device fault at the next synchronization point.
    #[inline]
    pub fn barrier(&self) {
        self.barrier.wait();
    }
}

/// Run an untiled kernel over every index of the domain.
pub(crate) fn run_simple<const R: usize, F>(domain: Extent<R>, kernel: &F) -> Result<(), String>
where
    F: Fn(Index<R>) + Send + Sync,
{
    log::debug!("dispatch over {domain}: {}", DispatchState::Running);
    let result = catch_unwind(AssertUnwindSafe(|| {
        #[cfg(feature = "rayon")]
        {
            use itertools::Itertools;
            use rayon::prelude::*;
            domain
                .iter()
                .collect_vec()
                .into_par_iter()
                .for_each(|index| kernel(index));
        }
        #[cfg(not(feature = "rayon"))]
        for index in domain.iter() {
            kernel(index);
        }
    }));
    result.map_err(panic_message)
}

/// Run a tiled kernel, one cooperative thread per tile point. Tiles
/// execute independently and in no guaranteed order; threads within a
/// tile run concurrently and rendezvous at the tile barrier.
pub(crate) fn run_tiled<S, const R: usize, F>(
    domain: TiledExtent<R>,
    scratch_len: usize,
    kernel: &F,
) -> Result<(), String>
where
    S: Scalar,
    F: Fn(Tile<S, R>) + Send + Sync,
{
    let tile_extent = domain.tile_extent();
    log::debug!(
        "dispatch over {domain}: {} ({scratch_len} x {})",
        DispatchState::ScratchAllocated,
        S::DATA_TYPE,
    );

    for tile in domain.tiles() {
        let scratch = Arc::new(TileScratch::new(scratch_len));
        let barrier = Arc::new(TileBarrier::new(domain.tile_size()));
        let tile_origin = domain.tile_origin(tile);
        let fault: Mutex<Option<String>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for local in tile_extent.iter() {
                let context = Tile {
                    index: TiledIndex {
                        global: tile_origin + local,
                        local,
                        tile,
                        tile_origin,
                    },
                    scratch: scratch.clone(),
                    barrier: barrier.clone(),
                };
                let barrier = &barrier;
                let fault = &fault;
                scope.spawn(move || {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| kernel(context))) {
                        let mut slot = fault.lock().expect("failed to lock");
                        if slot.is_none() {
                            *slot = Some(panic_message(payload));
                        }
                        drop(slot);
                        barrier.poison();
                    }
                });
            }
        });

        log::trace!("tile {tile}: {} phases", barrier.generation());
        if let Some(message) = fault.into_inner().expect("failed to lock") {
            return Err(message);
        }
    }

    log::debug!("dispatch over {domain}: {}", DispatchState::Retiring);
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(message) => (*message).into(),
        None => match payload.downcast_ref::<String>() {
            Some(message) => message.clone(),
            None => "kernel panicked".into(),
        },
    }
}
