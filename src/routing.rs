use alloc::sync::Arc;

use log::{error, trace, warn};

use crate::device::DeviceObject;
use crate::io::TraversalPolicy;
use crate::manager::IoManager;
use crate::request::{AllocationFlags, IoStatusBlock, Irp, IrpFlags, IrpId, StackControl};
use crate::status::DriverStatus;

/// Fails an IRP that no layer handles.
pub fn unhandled_irp(io: &Arc<IoManager>, device: &Arc<DeviceObject>, irp: &Arc<Irp>) -> DriverStatus {
    let major = irp.current_stack_location().map(|l| l.major);
    trace!("irp {:#x}: {:?} not handled by device {:#x}", irp.id(), major, device.id);
    irp.set_status(DriverStatus::InvalidDeviceRequest);
    io.complete_request(irp, 0);
    DriverStatus::InvalidDeviceRequest
}

/// Hands an IRP to the device below, reusing the current stack location.
pub fn forward_to_lower(io: &Arc<IoManager>, device: &Arc<DeviceObject>, irp: &Arc<Irp>) -> DriverStatus {
    match device.lower_device() {
        Some(lower) => {
            irp.skip_current_stack_location();
            io.call_driver(&lower, irp)
        }
        None => unhandled_irp(io, device, irp),
    }
}

impl IoManager {
    /// Allocate an IRP for a stack of `stack_size` layers.
    pub fn allocate_irp(&self, stack_size: u8, charge_quota: bool) -> Result<Arc<Irp>, DriverStatus> {
        let capacity = self.config().slot_capacity(stack_size);
        let mut flags = AllocationFlags::empty();
        if stack_size >= 1 && stack_size <= self.config().irp_bucket {
            flags |= AllocationFlags::FIXED_SIZE;
        }
        if charge_quota {
            flags |= AllocationFlags::LOOKASIDE;
        }
        let id = self.next_irp_id();
        let irp = Arc::new(Irp::new(id, capacity, stack_size, flags));
        self.irps.lock().insert(id, irp.clone());
        trace!("allocated irp {:#x} stack {} slots {}", id, stack_size, capacity);
        Ok(irp)
    }

    /// Release an IRP. Only the first call for a given IRP has any effect.
    pub fn free_irp(&self, irp: &Arc<Irp>) {
        if !irp.mark_freed() {
            error!("irp {:#x} freed twice", irp.id());
            return;
        }
        self.irps.lock().remove(&irp.id());
        irp.release_resources();
        trace!("freed irp {:#x}", irp.id());
    }

    /// Reset an IRP to `stack_size` layers inside `capacity` slots and make it
    /// live again, whether or not it was completed and freed before.
    pub fn initialize_irp(&self, irp: &Arc<Irp>, capacity: u8, stack_size: u8) -> Result<(), DriverStatus> {
        irp.initialize(capacity, stack_size)?;
        self.irps.lock().insert(irp.id(), irp.clone());
        trace!("initialized irp {:#x} stack {} slots {}", irp.id(), stack_size, capacity);
        Ok(())
    }

    /// Reset an IRP for another round trip, keeping its size and allocation
    /// flags.
    pub fn reuse_irp(&self, irp: &Arc<Irp>, status: DriverStatus) {
        irp.reuse(status);
        self.irps.lock().insert(irp.id(), irp.clone());
    }

    pub fn lookup_irp(&self, id: IrpId) -> Option<Arc<Irp>> {
        self.irps.lock().get(&id).cloned()
    }

    pub fn live_irps(&self) -> usize {
        self.irps.lock().len()
    }

    /// Send an IRP one layer down the stack to `device`.
    pub fn call_driver(self: &Arc<Self>, device: &Arc<DeviceObject>, irp: &Arc<Irp>) -> DriverStatus {
        let major = match irp.enter_next_location(device) {
            Ok(m) => m,
            Err(e) => {
                error!(
                    "irp {:#x}: no stack location left for device {:#x}",
                    irp.id(),
                    device.id
                );
                return e;
            }
        };
        let driver = match device.driver() {
            Some(d) => d,
            None => {
                warn!("irp {:#x}: device {:#x} has no driver", irp.id(), device.id);
                irp.set_io_status(IoStatusBlock {
                    status: DriverStatus::NoSuchDevice,
                    information: 0,
                });
                self.complete_request(irp, 0);
                return DriverStatus::NoSuchDevice;
            }
        };
        trace!(
            "call_driver {} irp {:#x} -> {} device {:#x}",
            major,
            irp.id(),
            driver.driver_name,
            device.id
        );
        match driver.dispatch_routine(major) {
            Some(routine) => routine(self, device, irp),
            None => match driver.unset_policy() {
                TraversalPolicy::FailIfUnhandled => unhandled_irp(self, device, irp),
                TraversalPolicy::ForwardLower => forward_to_lower(self, device, irp),
            },
        }
    }

    /// Complete an IRP: run completion routines bottom to top, then report
    /// to the originator and free it.
    pub fn complete_request(self: &Arc<Self>, irp: &Arc<Irp>, _priority_boost: i8) {
        if irp.is_freed() {
            error!("completion of freed irp {:#x}", irp.id());
            return;
        }
        trace!("complete irp {:#x} status {}", irp.id(), irp.io_status().status);
        if self.set_cancel_routine(irp, None).is_some() {
            warn!("irp {:#x} completed with a cancel routine still set", irp.id());
        }

        while let Some(step) = irp.completion_step() {
            let invoke = (step.status.is_success() && step.control.contains(StackControl::INVOKE_ON_SUCCESS))
                || (!step.status.is_success() && step.control.contains(StackControl::INVOKE_ON_ERROR))
                || (irp.is_cancelled() && step.control.contains(StackControl::INVOKE_ON_CANCEL));
            match step.routine {
                Some(routine) if invoke => {
                    let r = routine(self, step.device.as_ref(), irp);
                    if r == DriverStatus::MoreProcessingRequired {
                        trace!("irp {:#x}: completion halted", irp.id());
                        return;
                    }
                }
                _ => {
                    if irp.pending_returned() && step.has_upper {
                        irp.mark_pending();
                    }
                }
            }
        }

        self.finish_completion(irp);
    }

    fn finish_completion(&self, irp: &Arc<Irp>) {
        let iosb = irp.io_status();
        let flags = irp.flags();
        if flags.contains(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION) && !iosb.status.is_error() {
            if let (Some(sys), Some(user)) = (irp.system_buffer(), irp.user_buffer()) {
                if !sys.ptr_eq(&user) {
                    let data = sys.read(|s| s[..iosb.information.min(s.len())].to_vec());
                    user.copy_from(0, &data);
                }
            }
        }
        if flags.contains(IrpFlags::DEALLOCATE_BUFFER) {
            irp.set_system_buffer(None);
        }
        if let Some(u) = irp.user_iosb() {
            *u.lock() = iosb;
        }
        if let Some(ev) = irp.user_event() {
            ev.set();
        }
        self.free_irp(irp);
    }
}
