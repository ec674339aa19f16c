use alloc::boxed::Box;
use alloc::sync::Arc;

use log::{trace, warn};
use spin::MutexGuard;

use crate::device::DeviceObject;
use crate::manager::IoManager;
use crate::request::Irp;
use crate::status::DriverStatus;

/// The system-wide cancellation lock, held. Cancel routines receive it and
/// must drop or [`release`](CancelLock::release) it before doing anything
/// that can block.
pub struct CancelLock<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl CancelLock<'_> {
    #[inline]
    pub fn release(self) {}
}

pub type CancelRoutine =
    Box<dyn FnOnce(&Arc<IoManager>, Option<&Arc<DeviceObject>>, &Arc<Irp>, CancelLock<'_>) + Send>;

impl IoManager {
    pub fn acquire_cancel_lock(&self) -> CancelLock<'_> {
        CancelLock {
            _guard: self.cancel_lock.lock(),
        }
    }

    /// Installs `routine` (or clears the slot) and returns what was there.
    /// Clearing it is how a completer claims the IRP against a racing cancel.
    pub fn set_cancel_routine(&self, irp: &Irp, routine: Option<CancelRoutine>) -> Option<CancelRoutine> {
        irp.swap_cancel_routine(routine)
    }

    /// Requests cancellation. `true` when a cancel routine was found and run.
    pub fn cancel_irp(self: &Arc<Self>, irp: &Arc<Irp>) -> bool {
        if irp.is_freed() {
            warn!("cancel of irp {:#x} after it was completed", irp.id());
            irp.note_late_cancel();
            return false;
        }
        let lock = self.acquire_cancel_lock();
        irp.set_cancel_flag();
        match self.set_cancel_routine(irp, None) {
            None => {
                trace!("irp {:#x}: cancel requested, no routine", irp.id());
                drop(lock);
                false
            }
            Some(routine) => {
                trace!("irp {:#x}: running cancel routine", irp.id());
                let device = irp.current_stack_location().and_then(|l| l.device);
                routine(self, device.as_ref(), irp, lock);
                true
            }
        }
    }
}

/// Cancel routine for an IRP whose result reached the channel while the
/// requester's cancel was still in flight.
pub(crate) fn cancel_completed_irp(
    io: &Arc<IoManager>,
    _device: Option<&Arc<DeviceObject>>,
    irp: &Arc<Irp>,
    lock: CancelLock<'_>,
) {
    lock.release();
    irp.set_status(DriverStatus::Cancelled);
    irp.set_information(0);
    io.complete_request(irp, 0);
}
