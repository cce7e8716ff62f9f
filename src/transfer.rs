//! Host/device consistency points. [`copy`], [`copy_out`] and [`refresh`]
//! are the only operations that make device-visible effects observable to
//! the host; each drains the owning queue first, so a read never races a
//! pending write on the same queue.

use crate::{array::ArrayError, device::DeviceError, num::Scalar, view::ArrayView};

/// Element-wise transfer between two views of matching extent, regardless
/// of which storage either refers to. Resolves once the transfer is
/// complete; both owning queues are drained first, which is where a
/// latched device fault on either surfaces.
pub async fn copy<T: Scalar, const R: usize>(
    src: &ArrayView<T, R>,
    dst: &mut ArrayView<T, R>,
) -> Result<(), DeviceError> {
    if src.extent() != dst.extent() {
        return Err(ArrayError::Mismatch(src.extent().to_string(), dst.extent().to_string()).into());
    }
    src.queue().drain().await?;
    dst.queue().drain().await?;
    let contents = src.pull();
    dst.push(&contents);
    Ok(())
}

/// Export the view region to a host slice in row-major order. The slice
/// must hold at least `extent.size()` elements.
pub async fn copy_out<T: Scalar, const R: usize>(
    src: &ArrayView<T, R>,
    dst: &mut [T],
) -> Result<(), DeviceError> {
    let required = src.extent().size();
    if dst.len() < required {
        return Err(ArrayError::ShortRange {
            extent: src.extent().to_string(),
            required,
            found: dst.len(),
        }
        .into());
    }
    src.queue().drain().await?;
    let contents = src.pull();
    dst[..required].copy_from_slice(&contents);
    Ok(())
}

/// Re-pull current device contents into the view's host-visible cache.
/// This is the required step after any write that bypassed the
/// tracked-view interface; the core deliberately does not detect a
/// missing refresh.
pub async fn refresh<T: Scalar, const R: usize>(
    view: &mut ArrayView<T, R>,
) -> Result<(), DeviceError> {
    view.queue().drain().await?;
    view.repull();
    Ok(())
}
