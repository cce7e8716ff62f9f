use derive_more::Display;
use itertools::Itertools;

use super::{AcceleratorId, DeviceError, DeviceEvent, Launch};

/// Submission ordering mode of an [`ExecutionQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueMode {
    /// Each submission resolves only once the device has accepted it,
    /// preserving strict program-order visibility to the caller.
    Immediate,
    /// Submissions return at once and may be batched; program order is
    /// preserved as observed by the device.
    Deferred,
}

/// A FIFO submission channel to an accelerator, served by a dedicated
/// worker. Operations issued to the same queue are observed by the device
/// in issue order; operations on different queues have no relative
/// ordering unless a synchronization point is interposed.
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    accelerator: uid::Id<AcceleratorId>,
    mode: QueueMode,
    sender: flume::Sender<DeviceEvent>,
}

impl ExecutionQueue {
    pub(crate) fn create(accelerator: uid::Id<AcceleratorId>, mode: QueueMode) -> Self {
        let (sender, receiver) = flume::unbounded();
        std::thread::Builder::new()
            .name(format!("tessera-queue-{}", accelerator.get()))
            .spawn(move || serve(receiver))
            .expect("failed to spawn queue worker");
        Self {
            accelerator,
            mode,
            sender,
        }
    }

    #[inline]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    #[inline]
    pub fn accelerator(&self) -> uid::Id<AcceleratorId> {
        self.accelerator
    }

    /// Enqueue an event. Returns `false` if the worker is gone.
    pub(crate) fn send(&self, event: DeviceEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Submit a kernel launch. In immediate mode this resolves once the
    /// device has accepted the launch; in deferred mode it returns at once.
    pub(crate) async fn submit(&self, launch: Launch) -> Result<(), DeviceError> {
        match self.mode {
            QueueMode::Immediate => {
                let (ack, receiver) = flume::bounded(0);
                let event = DeviceEvent::Launch {
                    launch,
                    ack: Some(ack),
                };
                self.send(event);
                receiver.recv_async().await?
            }
            QueueMode::Deferred => {
                let event = DeviceEvent::Launch { launch, ack: None };
                self.send(event);
                Ok(())
            }
        }
    }

    /// Wait until all previously queued operations have executed. This is
    /// the point at which a latched device fault is surfaced, once; the
    /// queue is lost afterwards.
    pub async fn drain(&self) -> Result<(), DeviceError> {
        let (reply, receiver) = flume::bounded(0);
        self.send(DeviceEvent::Drain { reply });
        receiver.recv_async().await?
    }
}

/// Per-queue worker loop. Executes events in issue order; a kernel fault
/// is latched and surfaced at the next synchronization point, after which
/// the queue stops accepting work.
fn serve(receiver: flume::Receiver<DeviceEvent>) {
    let mut faults: Vec<String> = Vec::new();
    let mut lost = false;

    while let Ok(event) = receiver.recv() {
        let dead = lost || !faults.is_empty();
        match event {
            DeviceEvent::Launch { launch, ack } => {
                if dead {
                    if let Some(ack) = ack {
                        _ = ack.send(Err(surface(&mut faults, &mut lost)));
                    }
                    continue;
                }
                if let Some(ack) = ack {
                    _ = ack.send(Ok(()));
                }
                let label = launch.label;
                if let Err(fault) = (launch.task)() {
                    log::error!("{label}: device fault: {fault}");
                    faults.push(fault);
                }
            }
            DeviceEvent::Copy { src, dst } => {
                if dead {
                    continue;
                }
                dst.write_bytes(0, &src.read_bytes());
            }
            DeviceEvent::Write {
                buffer,
                offset,
                bytes,
            } => {
                if dead {
                    continue;
                }
                buffer.write_bytes(offset, &bytes);
            }
            DeviceEvent::Drain { reply } => {
                let result = match dead {
                    true => Err(surface(&mut faults, &mut lost)),
                    false => Ok(()),
                };
                _ = reply.send(result);
            }
        }
    }
}

/// Surfaces the latched faults as one aggregate error the first time, and
/// reports the queue as lost from then on.
fn surface(faults: &mut Vec<String>, lost: &mut bool) -> DeviceError {
    match *lost {
        true => DeviceError::Lost,
        false => {
            *lost = true;
            DeviceError::Fault(faults.drain(..).join("; "))
        }
    }
}
