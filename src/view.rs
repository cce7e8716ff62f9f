use std::{marker::PhantomData, sync::Arc};

use derive_more::{Deref, Display};

use crate::{
    array::{ArrayError, check_extent},
    device::{DeviceBuffer, DeviceError, DeviceEvent, ExecutionQueue},
    geom::{Extent, Index},
    num::Scalar,
};

/// How a kernel may touch the storage behind a [`DeviceView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

fn violation(message: &str) {
    #[cfg(feature = "strict")]
    panic!("{message}");
    #[cfg(not(feature = "strict"))]
    log::error!("{message}");
}

/// Device-side window onto an array's storage, built by value at
/// submission time and captured by the kernel: the launch's parameter
/// frame aliases no host state.
#[derive(Debug, Clone)]
pub struct DeviceView<T: Scalar, const R: usize> {
    buffer: Arc<DeviceBuffer>,
    storage: Extent<R>,
    offset: Index<R>,
    extent: Extent<R>,
    access: Access,
    phantom: PhantomData<T>,
}

impl<T: Scalar, const R: usize> DeviceView<T, R> {
    pub(crate) fn new(
        buffer: Arc<DeviceBuffer>,
        storage: Extent<R>,
        offset: Index<R>,
        extent: Extent<R>,
        access: Access,
    ) -> Self {
        Self {
            buffer,
            storage,
            offset,
            extent,
            access,
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn extent(&self) -> Extent<R> {
        self.extent
    }

    #[inline]
    pub fn access(&self) -> Access {
        self.access
    }

    #[inline]
    fn byte_offset(&self, index: Index<R>) -> usize {
        self.storage.index_of(self.offset + index) * size_of::<T>()
    }

    /// Read the element at `index`.
    ///
    /// # Panics
    /// Panics if `index` lies outside the view extent, surfacing as a
    /// device fault at the next synchronization point.
    pub fn get(&self, index: Index<R>) -> T {
        assert!(
            self.extent.contains(index),
            "read at {index} outside view extent {}",
            self.extent,
        );
        if self.access == Access::WriteOnly {
            violation("read through a write-only view");
        }
        self.buffer.load(self.byte_offset(index))
    }

    /// Read with a fallback: coordinates outside the view extent yield
    /// `value` instead of touching memory. This is the conditional-load
    /// primitive boundary tiles use to substitute a neutral value.
    pub fn get_or(&self, index: Index<R>, value: T) -> T {
        match self.extent.contains(index) {
            true => self.get(index),
            false => value,
        }
    }

    /// Write the element at `index`.
    ///
    /// # Panics
    /// Panics if `index` lies outside the view extent, surfacing as a
    /// device fault at the next synchronization point.
    pub fn set(&self, index: Index<R>, value: T) {
        assert!(
            self.extent.contains(index),
            "write at {index} outside view extent {}",
            self.extent,
        );
        if self.access == Access::ReadOnly {
            violation("write through a read-only view");
            return;
        }
        self.buffer.store(self.byte_offset(index), value);
    }
}

/// Non-owning projection over device storage: an axis-aligned sub-region
/// with a host-visible cache of its contents.
///
/// Multiple views may alias the same storage; none owns it. Reads are
/// served from the cache. Writes update the cache and are queued through
/// to the device in issue order, so they become visible to *other* views
/// over the same storage only after a synchronization point
/// ([`refresh`](ArrayView::refresh) or a copy). Device writes that bypass
/// the tracked interface (a kernel writing through a raw buffer handle)
/// are never pulled automatically: the caller must `refresh` first.
#[derive(Debug, Clone, Deref)]
pub struct ArrayView<T: Scalar, const R: usize> {
    buffer: Arc<DeviceBuffer>,
    queue: ExecutionQueue,
    storage: Extent<R>,
    offset: Index<R>,
    extent: Extent<R>,
    /// Host-visible cache of the view region, row-major.
    #[deref(forward)]
    cache: Box<[T]>,
}

impl<T: Scalar, const R: usize> ArrayView<T, R> {
    pub(crate) fn new(
        buffer: Arc<DeviceBuffer>,
        queue: ExecutionQueue,
        storage: Extent<R>,
        offset: Index<R>,
        extent: Extent<R>,
    ) -> Self {
        let mut view = Self {
            buffer,
            queue,
            storage,
            offset,
            extent,
            cache: Box::new([]),
        };
        view.cache = view.pull();
        view
    }

    /// Create a view over a host range by staging it into a device buffer
    /// on `queue`'s accelerator. The host range is copied by value; no
    /// host memory is aliased. Supplying fewer than `extent.size()`
    /// elements fails instead of reading past the end.
    pub fn from_host(
        extent: Extent<R>,
        contents: &[T],
        queue: &ExecutionQueue,
    ) -> Result<Self, ArrayError> {
        check_extent(extent)?;
        let required = extent.size();
        if contents.len() < required {
            return Err(ArrayError::ShortRange {
                extent: extent.to_string(),
                required,
                found: contents.len(),
            });
        }
        let contents = &contents[..required];
        let buffer = Arc::new(DeviceBuffer::from_bytes(bytemuck::cast_slice(contents)));
        Ok(Self {
            buffer,
            queue: queue.clone(),
            storage: extent,
            offset: Index::default(),
            extent,
            cache: contents.to_vec().into_boxed_slice(),
        })
    }

    #[inline]
    pub fn extent(&self) -> Extent<R> {
        self.extent
    }

    #[inline]
    pub fn offset(&self) -> Index<R> {
        self.offset
    }

    #[inline]
    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    /// Read the element at `index` from the host-visible cache.
    #[inline]
    pub fn get(&self, index: Index<R>) -> T {
        self.cache[self.extent.index_of(index)]
    }

    /// Write the element at `index`: the cache is updated at once, and the
    /// write is queued through to the device in issue order.
    pub fn set(&mut self, index: Index<R>, value: T) {
        self.cache[self.extent.index_of(index)] = value;
        let offset = self.storage.index_of(self.offset + index) * size_of::<T>();
        let event = DeviceEvent::Write {
            buffer: self.buffer.clone(),
            offset,
            bytes: bytemuck::bytes_of(&value).into(),
        };
        self.queue.send(event);
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.cache
    }

    /// Build the immutable per-launch frame through which a kernel
    /// accesses this view's region.
    #[inline]
    pub fn bind(&self, access: Access) -> DeviceView<T, R> {
        DeviceView::new(
            self.buffer.clone(),
            self.storage,
            self.offset,
            self.extent,
            access,
        )
    }

    /// A strict axis-aligned sub-region of this view. `offset` is
    /// relative to this view's origin.
    pub fn section(&self, offset: Index<R>, extent: Extent<R>) -> Result<Self, ArrayError> {
        let fits = extent
            .dims()
            .into_iter()
            .zip(offset.coords())
            .zip(self.extent.dims())
            .all(|((dim, offset), bound)| offset >= 0 && offset as usize + dim <= bound);
        if !fits {
            return Err(ArrayError::Section {
                extent: extent.to_string(),
                offset: offset.to_string(),
                storage: self.extent.to_string(),
            });
        }
        let cache = extent
            .iter()
            .map(|index| self.get(index + offset))
            .collect();
        Ok(Self {
            buffer: self.buffer.clone(),
            queue: self.queue.clone(),
            storage: self.storage,
            offset: self.offset + offset,
            extent,
            cache,
        })
    }

    /// Reinterpret the view's elements as `U`, preserving the underlying
    /// bytes. Legal only when the view covers its storage's innermost axis
    /// and the byte length of that contiguous run divides evenly by
    /// `size_of::<U>()`; the result is a same-rank view whose innermost
    /// size is scaled by the element-size ratio.
    pub fn reinterpret_as<U: Scalar>(&self) -> Result<ArrayView<U, R>, ArrayError> {
        let last = R - 1;
        if self.offset[last] != 0 || self.extent[last] != self.storage[last] {
            return Err(ArrayError::Discontiguous);
        }
        let run = self.extent[last] * size_of::<T>();
        if run % size_of::<U>() != 0 {
            return Err(ArrayError::Reinterpret {
                run,
                size: size_of::<U>(),
                ty: U::DATA_TYPE,
            });
        }

        let scale = |extent: Extent<R>| {
            let mut dims = extent.dims();
            dims[last] = dims[last] * size_of::<T>() / size_of::<U>();
            Extent::from(dims)
        };
        let cache: Vec<U> = bytemuck::pod_collect_to_vec(&self.cache);
        Ok(ArrayView {
            buffer: self.buffer.clone(),
            queue: self.queue.clone(),
            storage: scale(self.storage),
            offset: self.offset,
            extent: scale(self.extent),
            cache: cache.into_boxed_slice(),
        })
    }

    /// Re-pull the current device contents into the host-visible cache,
    /// after all previously queued operations have executed. Required
    /// before reading whenever the storage was written through a pathway
    /// that bypasses the tracked-view interface.
    pub async fn refresh(&mut self) -> Result<(), DeviceError> {
        crate::transfer::refresh(self).await
    }

    /// Gather the view region from the current device contents.
    pub(crate) fn pull(&self) -> Box<[T]> {
        let bytes = self.buffer.read_bytes();
        self.extent
            .iter()
            .map(|index| {
                let offset = self.storage.index_of(self.offset + index) * size_of::<T>();
                bytemuck::pod_read_unaligned(&bytes[offset..offset + size_of::<T>()])
            })
            .collect()
    }

    pub(crate) fn repull(&mut self) {
        self.cache = self.pull();
    }

    /// Scatter `contents` over the view region on the device and mirror
    /// them in the cache. Callers are responsible for draining the queue
    /// first.
    pub(crate) fn push(&mut self, contents: &[T]) {
        assert_eq!(contents.len(), self.extent.size());
        self.buffer.modify(|bytes| {
            for (index, value) in self.extent.iter().zip(contents.iter()) {
                let offset = self.storage.index_of(self.offset + index) * size_of::<T>();
                bytes[offset..offset + size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value));
            }
        });
        self.cache = contents.to_vec().into_boxed_slice();
    }
}
