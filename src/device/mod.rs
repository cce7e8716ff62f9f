use std::{
    fmt,
    sync::{
        Arc, OnceLock, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;

use crate::{array::ArrayError, num::Scalar};

pub use queue::{ExecutionQueue, QueueMode};

pub mod queue;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcceleratorId;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// An unrecoverable device-side failure, surfaced once at the next
    /// synchronization point. The queue is unusable afterwards.
    #[error("device fault: {0}")]
    Fault(String),
    /// The queue already surfaced a fault; no further work is accepted.
    #[error("queue is lost due to a prior device fault")]
    Lost,
    /// The channel to the queue worker is gone.
    #[error("device channel closed")]
    Closed(#[from] flume::RecvError),
    #[error(transparent)]
    Array(#[from] ArrayError),
}

/// A contiguous device-resident allocation, held alive by the [`Array`]
/// that owns it and by any views or launch frames referring to it.
///
/// [`Array`]: crate::array::Array
#[derive(Debug)]
pub struct DeviceBuffer {
    id: uid::Id<BufferId>,
    data: RwLock<Box<[u8]>>,
}

impl DeviceBuffer {
    pub(crate) fn zeroed(size: usize) -> Self {
        let id = uid::Id::new();
        let data = RwLock::new(vec![0u8; size].into_boxed_slice());
        Self { id, data }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        let id = uid::Id::new();
        let data = RwLock::new(bytes.to_vec().into_boxed_slice());
        Self { id, data }
    }

    #[inline]
    pub fn id(&self) -> uid::Id<BufferId> {
        self.id
    }

    /// Size of the allocation in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.read().expect("failed to lock").len()
    }

    /// Snapshot of the current device contents.
    pub fn read_bytes(&self) -> Box<[u8]> {
        self.data.read().expect("failed to lock").clone()
    }

    /// Write `bytes` at `offset`, bypassing any queue ordering and any
    /// tracked-view interface. Views over this storage keep serving their
    /// cached contents until [`refresh`](crate::view::ArrayView::refresh)
    /// is called; omitting the refresh is a correctness bug in the caller,
    /// not a detected error.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.write().expect("failed to lock");
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read the element at `index`, bypassing any queue ordering.
    pub fn read_scalar<T: Scalar>(&self, index: usize) -> T {
        self.load(index * size_of::<T>())
    }

    /// Write the element at `index`, bypassing any queue ordering and any
    /// tracked-view interface. Same hazard as [`write_bytes`].
    ///
    /// [`write_bytes`]: DeviceBuffer::write_bytes
    pub fn write_scalar<T: Scalar>(&self, index: usize, value: T) {
        self.store(index * size_of::<T>(), value);
    }

    #[inline]
    pub(crate) fn load<T: Scalar>(&self, offset: usize) -> T {
        let data = self.data.read().expect("failed to lock");
        bytemuck::pod_read_unaligned(&data[offset..offset + size_of::<T>()])
    }

    #[inline]
    pub(crate) fn store<T: Scalar>(&self, offset: usize, value: T) {
        let mut data = self.data.write().expect("failed to lock");
        data[offset..offset + size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
    }

    pub(crate) fn modify(&self, f: impl FnOnce(&mut [u8])) {
        let mut data = self.data.write().expect("failed to lock");
        f(&mut data);
    }
}

/// A type-erased kernel launch queued for execution.
pub struct Launch {
    pub(crate) label: &'static str,
    pub(crate) task: Box<dyn FnOnce() -> Result<(), String> + Send + 'static>,
}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launch").field("label", &self.label).finish()
    }
}

/// Events served in issue order by a queue's worker.
pub enum DeviceEvent {
    /// Execute a kernel launch. `ack` resolves once the device accepts it.
    Launch {
        launch: Launch,
        ack: Option<flume::Sender<Result<(), DeviceError>>>,
    },
    /// Device-side buffer duplication.
    Copy {
        src: Arc<DeviceBuffer>,
        dst: Arc<DeviceBuffer>,
    },
    /// Host-to-device write of a byte span.
    Write {
        buffer: Arc<DeviceBuffer>,
        offset: usize,
        bytes: Box<[u8]>,
    },
    /// Rendezvous: resolves once all previously queued work has executed,
    /// surfacing a latched fault if one occurred.
    Drain {
        reply: flume::Sender<Result<(), DeviceError>>,
    },
}

/// Identifies a compute device and answers capability queries. Queues are
/// created from an accelerator via [`create_view`](Accelerator::create_view).
#[derive(Debug, Clone)]
pub struct Accelerator {
    id: uid::Id<AcceleratorId>,
    shared_memory: bool,
    host_access: Arc<AtomicBool>,
    default_view: ExecutionQueue,
}

impl Accelerator {
    /// The process-wide default accelerator, resolved lazily once and then
    /// cached for the remaining lifetime of the process.
    pub fn default() -> Self {
        static DEFAULT: OnceLock<Accelerator> = OnceLock::new();
        DEFAULT
            .get_or_init(|| AcceleratorBuilder::new().build())
            .clone()
    }

    #[inline]
    pub fn id(&self) -> uid::Id<AcceleratorId> {
        self.id
    }

    /// Whether host and device share physical memory.
    #[inline]
    pub fn supports_host_shared_memory(&self) -> bool {
        self.shared_memory
    }

    /// Configure the host-access hint. Without shared-memory support this
    /// is a no-op returning `false`, not an error.
    pub fn configure_host_access(&self, enable: bool) -> bool {
        if !self.shared_memory {
            return false;
        }
        self.host_access.store(enable, Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn host_access(&self) -> bool {
        self.host_access.load(Ordering::Relaxed)
    }

    /// Create a submission queue bound to this accelerator.
    pub fn create_view(&self, mode: QueueMode) -> ExecutionQueue {
        ExecutionQueue::create(self.id, mode)
    }

    /// The accelerator's own immediate queue.
    #[inline]
    pub fn default_view(&self) -> &ExecutionQueue {
        &self.default_view
    }
}

#[derive(Debug, Clone)]
pub struct AcceleratorBuilder {
    pub shared_memory: bool,
}

impl Default for AcceleratorBuilder {
    fn default() -> Self {
        Self {
            shared_memory: true,
        }
    }
}

impl AcceleratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_memory(mut self, value: bool) -> Self {
        self.shared_memory = value;
        self
    }

    pub fn build(self) -> Accelerator {
        let id = uid::Id::new();
        let default_view = ExecutionQueue::create(id, QueueMode::Immediate);
        Accelerator {
            id,
            shared_memory: self.shared_memory,
            host_access: Arc::new(AtomicBool::new(false)),
            default_view,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Accelerator, AcceleratorBuilder, QueueMode};

    #[test]
    fn test_default_accelerator_cached() {
        let a = Accelerator::default();
        let b = Accelerator::default();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_host_access_hint() {
        let shared = AcceleratorBuilder::new().build();
        assert!(shared.supports_host_shared_memory());
        assert!(shared.configure_host_access(true));
        assert!(shared.host_access());

        let discrete = AcceleratorBuilder::new().shared_memory(false).build();
        assert!(!discrete.supports_host_shared_memory());
        assert!(!discrete.configure_host_access(true));
        assert!(!discrete.host_access());
    }

    #[test]
    fn test_create_view_modes() {
        let accelerator = AcceleratorBuilder::new().build();
        let immediate = accelerator.create_view(QueueMode::Immediate);
        let deferred = accelerator.create_view(QueueMode::Deferred);
        assert_eq!(immediate.mode(), QueueMode::Immediate);
        assert_eq!(deferred.mode(), QueueMode::Deferred);
        assert_eq!(immediate.accelerator(), accelerator.id());
        assert_eq!(accelerator.default_view().mode(), QueueMode::Immediate);
    }
}
