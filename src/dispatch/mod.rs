use derive_more::Display;

use crate::{
    array::check_extent,
    device::{Accelerator, DeviceError, ExecutionQueue, Launch},
    geom::{Extent, Index, TiledExtent},
    num::Scalar,
};

pub use tile::{Tile, TileScratch};

pub mod tile;

/// Lifecycle of one dispatch on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DispatchState {
    #[display("submitted")]
    Submitted,
    #[display("scratch allocated")]
    ScratchAllocated,
    #[display("running")]
    Running,
    #[display("retiring")]
    Retiring,
    #[display("completed")]
    Completed,
    #[display("faulted")]
    Faulted,
}

/// Submit `kernel` over every index of `domain` on the default
/// accelerator's queue.
pub async fn dispatch<const R: usize, F>(domain: Extent<R>, kernel: F) -> Result<(), DeviceError>
where
    F: Fn(Index<R>) + Send + Sync + 'static,
{
    let accelerator = Accelerator::default();
    dispatch_on(accelerator.default_view(), domain, kernel).await
}

/// Submit `kernel` over every index of `domain` on `queue`. The kernel
/// runs once per index; data is reached through the [`DeviceView`]s it
/// captured at submission.
///
/// [`DeviceView`]: crate::view::DeviceView
pub async fn dispatch_on<const R: usize, F>(
    queue: &ExecutionQueue,
    domain: Extent<R>,
    kernel: F,
) -> Result<(), DeviceError>
where
    F: Fn(Index<R>) + Send + Sync + 'static,
{
    check_extent(domain)?;
    let label = "dispatch";
    log::debug!("{label} over {domain}: {}", DispatchState::Submitted);
    let task = Box::new(move || {
        let result = tile::run_simple(domain, &kernel);
        conclude(label, &result);
        result
    });
    queue.submit(Launch { label, task }).await
}

/// Submit a tiled `kernel` over `domain` on the default accelerator's
/// queue.
pub async fn dispatch_tiled<S, const R: usize, F>(
    domain: TiledExtent<R>,
    scratch_len: usize,
    kernel: F,
) -> Result<(), DeviceError>
where
    S: Scalar,
    F: Fn(Tile<S, R>) + Send + Sync + 'static,
{
    let accelerator = Accelerator::default();
    dispatch_tiled_on(accelerator.default_view(), domain, scratch_len, kernel).await
}

/// Submit a tiled `kernel` over `domain` on `queue`. Every tile of the
/// domain executes as a cooperative unit: its threads share a scratch
/// block of `scratch_len` elements of `S` and rendezvous at the tile
/// barrier. Boundary tiles receive global coordinates outside the domain
/// extent; the kernel is responsible for gating loads and stores on the
/// extents of the data it touches.
pub async fn dispatch_tiled_on<S, const R: usize, F>(
    queue: &ExecutionQueue,
    domain: TiledExtent<R>,
    scratch_len: usize,
    kernel: F,
) -> Result<(), DeviceError>
where
    S: Scalar,
    F: Fn(Tile<S, R>) + Send + Sync + 'static,
{
    check_extent(domain.extent())?;
    let label = "dispatch_tiled";
    log::debug!("{label} over {domain}: {}", DispatchState::Submitted);
    let task = Box::new(move || {
        let result = tile::run_tiled(domain, scratch_len, &kernel);
        conclude(label, &result);
        result
    });
    queue.submit(Launch { label, task }).await
}

fn conclude(label: &str, result: &Result<(), String>) {
    match result {
        Ok(()) => log::debug!("{label}: {}", DispatchState::Completed),
        Err(fault) => log::debug!("{label}: {}: {fault}", DispatchState::Faulted),
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Tile, dispatch, dispatch_on, dispatch_tiled_on};
    use crate::{
        array::Array,
        device::{Accelerator, AcceleratorBuilder, DeviceError, QueueMode},
        geom::{Extent, Index},
        transfer,
        view::Access,
    };

    #[tokio::test]
    async fn test_dispatch_saxpy() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let x_data = (0..24).map(|i| i as f32).collect_vec();
        let y_data = (0..24).map(|i| (i * 2) as f32).collect_vec();
        let extent = Extent::from([4, 6]);
        let x = Array::from_slice_on(extent, &x_data, queue)?;
        let y = Array::from_slice_on(extent, &y_data, queue)?;

        let a = 0.5f32;
        let xs = x.bind(Access::ReadOnly);
        let ys = y.bind(Access::ReadWrite);
        dispatch_on(queue, extent, move |index: Index<2>| {
            ys.set(index, a * xs.get(index) + ys.get(index));
        })
        .await?;

        let output = y.back().await?;
        for (i, (&x, &y)) in x_data.iter().zip_eq(output.iter()).enumerate() {
            assert_eq!(y, a * x + (i * 2) as f32);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_default_accelerator() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let array = Array::<u32, 1>::new_on([16].into(), queue)?;
        let out = array.bind(Access::WriteOnly);
        dispatch([16].into(), move |index: Index<1>| {
            out.set(index, index[0] as u32 * 3);
        })
        .await?;

        let output = array.back().await?;
        assert!(output.iter().enumerate().all(|(i, &v)| v == i as u32 * 3));

        Ok(())
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let result = dispatch_on(queue, [0, 4].into(), |_: Index<2>| {}).await;
        assert!(matches!(result, Err(DeviceError::Array(_))));
    }

    #[tokio::test]
    async fn test_barrier_orders_scratch() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.create_view(QueueMode::Immediate);

        const B: usize = 4;
        let array = Array::<i32, 1>::new_on([8].into(), &queue)?;
        let out = array.bind(Access::WriteOnly);

        // every thread publishes its global coordinate, then reads its
        // neighbor's: without the barrier the load could observe zero
        dispatch_tiled_on(&queue, Extent::from([8]).tile::<B>(), B, move |tile: Tile<i32, 1>| {
            let local = tile.local[0] as usize;
            tile.scratch().write(local, tile.global[0] as i32);
            tile.barrier();
            let neighbor = (local + 1) % B;
            out.set(tile.global, tile.scratch().read(neighbor));
        })
        .await?;

        let output = array.back().await?;
        assert_eq!(&output[..], &[1, 2, 3, 0, 5, 6, 7, 4]);

        Ok(())
    }

    #[tokio::test]
    async fn test_tiled_matmul_boundary_tiles() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.create_view(QueueMode::Immediate);

        macro_rules! assert_approx_eq {
            ($i:expr, $a:expr, $b:expr, $eps:expr) => {
                assert!(
                    ($a - $b).abs() < $eps,
                    "assertion failed at {:?}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
                    $i,
                    $a,
                    $b
                );
            };
        }

        fastrand::seed(42);
        const M: usize = 37;
        const K: usize = 29;
        const N: usize = 53;
        const B: usize = 16;

        let a_data = (0..M * K).map(|_| fastrand::f32() - 0.5).collect_vec();
        let b_data = (0..K * N).map(|_| fastrand::f32() - 0.5).collect_vec();
        let a = Array::from_slice_on([M, K].into(), &a_data, &queue)?;
        let b = Array::from_slice_on([K, N].into(), &b_data, &queue)?;
        let c = Array::<f32, 2>::new_on([M, N].into(), &queue)?;

        let lhs = a.bind(Access::ReadOnly);
        let rhs = b.bind(Access::ReadOnly);
        let out = c.bind(Access::WriteOnly);

        // blocked product: two B x B scratch blocks, one K-slab per phase
        let domain = Extent::from([M, N]).tile::<B, B>();
        dispatch_tiled_on(&queue, domain, 2 * B * B, move |tile: Tile<f32, 2>| {
            let [row, col] = tile.global.coords();
            let [y, x] = tile.local.coords();
            let (ly, lx) = (y as usize, x as usize);

            let mut sum = 0.0f32;
            for slab in 0..K.div_ceil(B) {
                let k = (slab * B) as isize;
                let scratch = tile.scratch();
                scratch.write(ly * B + lx, lhs.get_or([row, k + x].into(), 0.0));
                scratch.write(B * B + ly * B + lx, rhs.get_or([k + y, col].into(), 0.0));
                tile.barrier();
                for i in 0..B {
                    sum += scratch.read(ly * B + i) * scratch.read(B * B + i * B + lx);
                }
                tile.barrier();
            }
            if out.extent().contains(tile.global) {
                out.set(tile.global, sum);
            }
        })
        .await?;

        let mut output = vec![0.0f32; M * N];
        transfer::copy_out(&c.view(), &mut output).await?;

        for (row, col) in itertools::iproduct!(0..M, 0..N) {
            let mut sum = 0.0f32;
            for k in 0..K {
                sum += a_data[row * K + k] * b_data[k * N + col];
            }
            assert_approx_eq!((row, col), output[row * N + col], sum, 1e-4);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_fault_surfaces_once_then_lost() -> Result<(), Box<dyn Error>> {
        let accelerator = AcceleratorBuilder::new().build();
        let queue = accelerator.create_view(QueueMode::Deferred);

        let array = Array::<i32, 1>::from_slice_on([4].into(), &[1, 2, 3, 4], &queue)?;

        // a deferred submission never blocks the issuing thread, so the
        // fault only appears at the next synchronization point
        dispatch_on(&queue, [4].into(), |_: Index<1>| panic!("boom")).await?;

        let error = queue.drain().await.unwrap_err();
        assert!(matches!(error, DeviceError::Fault(message) if message.contains("boom")));

        // the queue and everything bound to it are unusable afterwards
        let error = queue.drain().await.unwrap_err();
        assert!(matches!(error, DeviceError::Lost));
        let error = array.back().await.unwrap_err();
        assert!(matches!(error, DeviceError::Lost));
        let error = dispatch_on(&queue, [4].into(), |_: Index<1>| {})
            .await
            .unwrap_err();
        assert!(matches!(error, DeviceError::Lost));

        Ok(())
    }

    #[tokio::test]
    async fn test_tile_fault_poisons_barrier() -> Result<(), Box<dyn Error>> {
        let accelerator = AcceleratorBuilder::new().build();
        let queue = accelerator.create_view(QueueMode::Immediate);

        // one thread of the tile faults before the rendezvous; its
        // siblings must unwind instead of waiting forever
        dispatch_tiled_on::<f32, 1, _>(&queue, Extent::from([4]).tile::<4>(), 4, |tile| {
            if tile.local[0] == 2 {
                panic!("lost thread");
            }
            tile.barrier();
        })
        .await?;

        let error = queue.drain().await.unwrap_err();
        assert!(matches!(error, DeviceError::Fault(message) if message.contains("lost thread")));

        Ok(())
    }

    #[tokio::test]
    async fn test_deferred_preserves_issue_order() -> Result<(), Box<dyn Error>> {
        let accelerator = AcceleratorBuilder::new().build();
        let queue = accelerator.create_view(QueueMode::Deferred);

        let array = Array::<i32, 1>::new_on([64].into(), &queue)?;
        let cell = array.bind(Access::ReadWrite);

        // three dependent submissions; the device must observe them in
        // issue order even though none blocks the host
        for _ in 0..3 {
            let cell = cell.clone();
            dispatch_on(&queue, [64].into(), move |index: Index<1>| {
                cell.set(index, cell.get(index) * 2 + 1);
            })
            .await?;
        }

        let output = array.back().await?;
        assert!(output.iter().all(|&v| v == 7));

        Ok(())
    }
}
