use std::{marker::PhantomData, sync::Arc};

use thiserror::Error;

use crate::{
    device::{Accelerator, DeviceBuffer, DeviceError, DeviceEvent, ExecutionQueue},
    geom::{Extent, Index},
    num::{DataType, Scalar},
    view::{Access, ArrayView, DeviceView},
};

#[derive(Debug, Error)]
pub enum ArrayError {
    /// A requested extent has a non-positive dimension.
    #[error("invalid domain: extent {0} has a non-positive dimension")]
    EmptyExtent(String),
    /// A supplied host range is shorter than the extent requires.
    #[error("invalid domain: host range holds {found} elements, extent {extent} requires {required}")]
    ShortRange {
        extent: String,
        required: usize,
        found: usize,
    },
    /// A sub-region does not fit within the extent it is taken from.
    #[error("invalid domain: section {extent} at offset {offset} exceeds extent {storage}")]
    Section {
        extent: String,
        offset: String,
        storage: String,
    },
    /// Extents of two views do not match.
    #[error("invalid domain: extent {0} does not match extent {1}")]
    Mismatch(String, String),
    /// Reinterpretation target size does not evenly divide the contiguous
    /// byte run.
    #[error("reinterpret size mismatch: a run of {run} bytes is not a multiple of {size}-byte {ty}")]
    Reinterpret {
        run: usize,
        size: usize,
        ty: DataType,
    },
    /// Reinterpretation of a view that does not cover its storage's
    /// innermost axis.
    #[error("reinterpret requires a view covering its storage's innermost axis")]
    Discontiguous,
}

pub(crate) fn check_extent<const R: usize>(extent: Extent<R>) -> Result<(), ArrayError> {
    match extent.is_empty() {
        true => Err(ArrayError::EmptyExtent(extent.to_string())),
        false => Ok(()),
    }
}

/// Exclusively owns a contiguous device-resident buffer of
/// `extent.size()` elements. The buffer is released when the last owner
/// and all views over it are gone.
///
/// Duplicating an `Array` (via [`Clone`] or `From<&Array>`) always
/// performs a full, independent copy of the device buffer, ordered on the
/// owning queue. Transferring the buffer out requires a mutable binding
/// (see [`take`](Array::take)); an immutable binding can only be copied
/// from, never stolen from.
#[derive(Debug)]
pub struct Array<T: Scalar, const R: usize> {
    extent: Extent<R>,
    buffer: Arc<DeviceBuffer>,
    queue: ExecutionQueue,
    phantom: PhantomData<T>,
}

impl<T: Scalar, const R: usize> Array<T, R> {
    /// Create a zero-initialized array of the given extent on the default
    /// accelerator's queue.
    pub fn new(extent: Extent<R>) -> Result<Self, ArrayError> {
        let accelerator = Accelerator::default();
        Self::new_on(extent, accelerator.default_view())
    }

    /// Create a zero-initialized array of the given extent on `queue`'s
    /// accelerator.
    pub fn new_on(extent: Extent<R>, queue: &ExecutionQueue) -> Result<Self, ArrayError> {
        check_extent(extent)?;
        let buffer = Arc::new(DeviceBuffer::zeroed(extent.size() * size_of::<T>()));
        let queue = queue.clone();
        let phantom = PhantomData;
        Ok(Self {
            extent,
            buffer,
            queue,
            phantom,
        })
    }

    /// Create an array on the default accelerator's queue by copying
    /// `extent.size()` elements in from a host iterator.
    pub fn from_iter<I>(extent: Extent<R>, contents: I) -> Result<Self, ArrayError>
    where
        I: IntoIterator<Item = T>,
    {
        let accelerator = Accelerator::default();
        Self::from_iter_on(extent, contents, accelerator.default_view())
    }

    /// Create an array by copying `extent.size()` elements in from a host
    /// iterator. Supplying fewer elements fails instead of reading past
    /// the end.
    pub fn from_iter_on<I>(
        extent: Extent<R>,
        contents: I,
        queue: &ExecutionQueue,
    ) -> Result<Self, ArrayError>
    where
        I: IntoIterator<Item = T>,
    {
        check_extent(extent)?;
        let required = extent.size();
        let contents: Vec<T> = contents.into_iter().take(required).collect();
        if contents.len() < required {
            return Err(ArrayError::ShortRange {
                extent: extent.to_string(),
                required,
                found: contents.len(),
            });
        }
        let buffer = Arc::new(DeviceBuffer::from_bytes(bytemuck::cast_slice(&contents)));
        let queue = queue.clone();
        let phantom = PhantomData;
        Ok(Self {
            extent,
            buffer,
            queue,
            phantom,
        })
    }

    /// Create an array on the default accelerator's queue by copying
    /// `extent.size()` elements in from a host slice.
    pub fn from_slice(extent: Extent<R>, contents: &[T]) -> Result<Self, ArrayError> {
        Self::from_iter(extent, contents.iter().copied())
    }

    /// Create an array by copying `extent.size()` elements in from a host
    /// slice.
    pub fn from_slice_on(
        extent: Extent<R>,
        contents: &[T],
        queue: &ExecutionQueue,
    ) -> Result<Self, ArrayError> {
        Self::from_iter_on(extent, contents.iter().copied(), queue)
    }

    #[inline]
    pub fn extent(&self) -> Extent<R> {
        self.extent
    }

    #[inline]
    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.extent.size() * size_of::<T>()
    }

    /// The raw device buffer handle. Writes through it bypass queue
    /// ordering and the tracked-view interface: any [`ArrayView`] over
    /// this array keeps serving its cached contents until
    /// [`refresh`](ArrayView::refresh)ed.
    #[inline]
    pub fn buffer(&self) -> Arc<DeviceBuffer> {
        self.buffer.clone()
    }

    /// Build the immutable per-launch frame through which a kernel
    /// accesses this array's storage.
    #[inline]
    pub fn bind(&self, access: Access) -> DeviceView<T, R> {
        DeviceView::new(
            self.buffer.clone(),
            self.extent,
            Index::default(),
            self.extent,
            access,
        )
    }

    /// Create a host-cached view over the whole array.
    #[inline]
    pub fn view(&self) -> ArrayView<T, R> {
        ArrayView::new(
            self.buffer.clone(),
            self.queue.clone(),
            self.extent,
            Index::default(),
            self.extent,
        )
    }

    /// Transfer buffer ownership out, leaving `self` an empty-extent,
    /// buffer-less husk. Requires a mutable binding: an immutable binding
    /// cannot be stolen from, only copied (`Array::from(&array)`).
    pub fn take(&mut self) -> Self {
        let husk = Self {
            extent: Extent::default(),
            buffer: Arc::new(DeviceBuffer::zeroed(0)),
            queue: self.queue.clone(),
            phantom: PhantomData,
        };
        std::mem::replace(self, husk)
    }

    /// Read the full contents back to the host, after all previously
    /// queued operations on the owning queue have executed.
    pub async fn back(&self) -> Result<Box<[T]>, DeviceError> {
        self.queue.drain().await?;
        let bytes = self.buffer.read_bytes();
        Ok(bytemuck::pod_collect_to_vec(&bytes).into_boxed_slice())
    }
}

impl<T: Scalar, const R: usize> Clone for Array<T, R> {
    /// Deep duplication of the device buffer, ordered on the owning queue
    /// after all previously submitted operations.
    fn clone(&self) -> Self {
        let buffer = Arc::new(DeviceBuffer::zeroed(self.buffer.size()));
        let event = DeviceEvent::Copy {
            src: self.buffer.clone(),
            dst: buffer.clone(),
        };
        if !self.queue.send(event) {
            // worker gone: nothing is pending, copy directly
            buffer.write_bytes(0, &self.buffer.read_bytes());
        }
        Self {
            extent: self.extent,
            buffer,
            queue: self.queue.clone(),
            phantom: PhantomData,
        }
    }
}

impl<T: Scalar, const R: usize> From<&Array<T, R>> for Array<T, R> {
    /// The copy path: constructing from a shared reference duplicates the
    /// buffer and leaves the source untouched.
    #[inline]
    fn from(value: &Array<T, R>) -> Self {
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Array, ArrayError};
    use crate::{device::Accelerator, geom::Extent};

    #[tokio::test]
    async fn test_short_host_range() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let data = (0..20).collect_vec();
        let result = Array::<i32, 2>::from_slice_on([4, 6].into(), &data, queue);
        assert!(matches!(result, Err(ArrayError::ShortRange { .. })));

        let result = Array::<i32, 2>::from_iter_on([4, 5].into(), data.clone(), queue);
        assert!(result.is_ok());

        let result = Array::<i32, 1>::new_on([0].into(), queue);
        assert!(matches!(result, Err(ArrayError::EmptyExtent(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_copy_from_immutable_binding() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let extent = Extent::from([3, 3, 3]);
        let data = (0..27).map(|x| x as f32).collect_vec();
        let source = Array::from_slice_on(extent, &data, queue)?;

        // the source binding is immutable, so this resolves to the copy
        // path and must leave the source fully intact
        let copied = Array::from(&source);
        assert_eq!(copied.extent(), extent);
        assert_eq!(source.extent(), extent);
        assert_eq!(&source.back().await?[..], &data[..]);
        assert_eq!(&copied.back().await?[..], &data[..]);

        Ok(())
    }

    #[tokio::test]
    async fn test_take_leaves_husk() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let data = (0..10).collect_vec();
        let mut source = Array::<i32, 1>::from_slice_on([10].into(), &data, queue)?;
        let moved = source.take();

        assert!(source.extent().is_empty());
        assert_eq!(source.data_size(), 0);
        assert_eq!(moved.extent(), [10].into());
        assert_eq!(&moved.back().await?[..], &data[..]);

        Ok(())
    }

    #[tokio::test]
    async fn test_clone_is_independent() -> Result<(), Box<dyn Error>> {
        let accelerator = Accelerator::default();
        let queue = accelerator.default_view();

        let source = Array::<u32, 1>::from_slice_on([4].into(), &[1, 2, 3, 4], queue)?;
        let copied = source.clone();

        // make sure the queued duplication ran before mutating the source
        // through the raw handle, which bypasses queue ordering
        queue.drain().await?;
        source.buffer().write_scalar::<u32>(0, 99);

        assert_eq!(&source.back().await?[..], &[99, 2, 3, 4]);
        assert_eq!(&copied.back().await?[..], &[1, 2, 3, 4]);

        Ok(())
    }
}
