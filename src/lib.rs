//! `tessera` is a host-orchestrated data-parallel execution abstraction for
//! heterogeneous compute devices: multidimensional typed containers with
//! precise ownership and aliasing semantics, device-side tiled kernel
//! dispatch with cooperative per-tile scratch memory and barriers, and
//! explicit host/device memory-consistency management.
//!
//! ## Key Components
//! 1. **Geometry**:
//!    - Static-rank coordinate arithmetic ([`Extent`], [`Index`]); rank
//!      mismatch is a compile error, never a runtime condition.
//!    - Tiling decomposition with ceiling division, so partial tiles cover
//!      any domain ([`TiledExtent`]).
//!
//! 2. **Containers**:
//!    - [`Array`] exclusively owns a device-resident buffer; duplication is
//!      always a deep copy and destructive transfer requires a mutable
//!      binding.
//!    - [`ArrayView`] is a non-owning, host-cached projection supporting
//!      sub-regions and byte-level reinterpretation between element types.
//!
//! 3. **Devices and Queues**:
//!    - [`Accelerator`] answers capability queries and produces
//!      [`ExecutionQueue`]s in immediate or deferred submission mode.
//!    - Operations on one queue are observed by the device in issue order;
//!      cross-queue ordering requires a synchronization point.
//!
//! 4. **Execution Model**:
//!    - [`dispatch()`] runs a kernel over every index of a domain;
//!      [`dispatch_tiled()`] partitions the domain into cooperative tiles
//!      with shared scratch and barriers.
//!    - Kernels capture immutable per-launch frames ([`DeviceView`]) built
//!      by value at submission; no host state is aliased into device
//!      execution.
//!    - [`transfer::copy`] and [`transfer::refresh`] are the only
//!      host/device consistency points; device faults latch and surface
//!      there, once, after which the queue is lost.
//!
//! ## Design Principles
//! - **Determinism**: copy/move contracts and queue ordering are exact;
//!   within a tile only the barrier orders scratch accesses.
//! - **Safety**: bounds and access-mode checks surface as device faults
//!   instead of undefined behavior.
//! - **Extensibility**: kernels are plain closures over typed views; no
//!   registration or reflection.

pub mod array;
pub mod device;
pub mod dispatch;
pub mod geom;
pub mod num;
pub mod transfer;
pub mod view;

pub use array::{Array, ArrayError};
pub use device::{
    Accelerator, AcceleratorBuilder, DeviceBuffer, DeviceError, ExecutionQueue, QueueMode,
};
pub use dispatch::{Tile, TileScratch, dispatch, dispatch_on, dispatch_tiled, dispatch_tiled_on};
pub use geom::{Extent, Index, TiledExtent, TiledIndex};
pub use num::{DataType, Scalar};
pub use view::{Access, ArrayView, DeviceView};
