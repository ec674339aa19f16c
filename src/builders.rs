use alloc::sync::Arc;

use log::trace;

use crate::device::{DeviceFlags, DeviceObject};
use crate::event::KEvent;
use crate::io::{MajorFunction, TransferMethod};
use crate::manager::IoManager;
use crate::request::{IoBuffer, IoParameters, Irp, IrpFlags, Mdl, MdlFlags, ProcessorMode, UserIosb};
use crate::status::DriverStatus;

/// Buffers and lengths of a device-control request.
#[derive(Debug, Clone)]
pub struct DeviceControl {
    pub code: u32,
    pub input: Option<IoBuffer>,
    pub input_length: usize,
    pub output: Option<IoBuffer>,
    pub output_length: usize,
    pub internal: bool,
}

impl DeviceControl {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            input: None,
            input_length: 0,
            output: None,
            output_length: 0,
            internal: false,
        }
    }

    pub fn input(mut self, buffer: IoBuffer, length: usize) -> Self {
        self.input = Some(buffer);
        self.input_length = length;
        self
    }

    pub fn output(mut self, buffer: IoBuffer, length: usize) -> Self {
        self.output = Some(buffer);
        self.output_length = length;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    #[inline]
    pub fn method(&self) -> TransferMethod {
        TransferMethod::of(self.code)
    }
}

fn check_capacity(buffer: Option<&IoBuffer>, length: usize) -> Result<(), DriverStatus> {
    match buffer {
        Some(b) if b.len() < length => Err(DriverStatus::BufferTooSmall),
        None if length > 0 => Err(DriverStatus::BufferTooSmall),
        _ => Ok(()),
    }
}

impl IoManager {
    pub fn build_asynchronous_fsd_request(
        self: &Arc<Self>,
        major: MajorFunction,
        device: &Arc<DeviceObject>,
        buffer: Option<IoBuffer>,
        length: usize,
        offset: Option<u64>,
        iosb: Option<UserIosb>,
    ) -> Result<Arc<Irp>, DriverStatus> {
        check_capacity(buffer.as_ref(), length)?;
        let mdl = match &buffer {
            Some(b) if device.flags().contains(DeviceFlags::DIRECT_IO) => {
                let mut m = Mdl::new(b, 0, length)?;
                m.flags |= MdlFlags::MAPPED_TO_SYSTEM_VA;
                Some(m)
            }
            _ => None,
        };
        let thread = self.current_thread()?;

        let irp = self.allocate_irp(device.stack_size(), false)?;
        irp.with_next_stack_location(|loc| {
            loc.major = major;
            let byte_offset = offset.unwrap_or(0);
            loc.parameters = match major {
                MajorFunction::Read => IoParameters::Read {
                    length,
                    key: 0,
                    byte_offset,
                },
                MajorFunction::Write => IoParameters::Write {
                    length,
                    key: 0,
                    byte_offset,
                },
                _ => IoParameters::None,
            };
        });
        irp.set_system_buffer(buffer.clone());
        if let Some(m) = mdl {
            irp.attach_mdl(m, false);
        }
        irp.set_requestor_mode(ProcessorMode::KernelMode);
        irp.set_user_iosb(iosb);
        irp.set_user_buffer(buffer);
        irp.set_thread(Some(thread));
        trace!("built {} irp {:#x} length {}", major, irp.id(), length);
        Ok(irp)
    }

    /// Like [`build_asynchronous_fsd_request`](Self::build_asynchronous_fsd_request),
    /// with `event` signaled once the request completes.
    #[allow(clippy::too_many_arguments)]
    pub fn build_synchronous_fsd_request(
        self: &Arc<Self>,
        major: MajorFunction,
        device: &Arc<DeviceObject>,
        buffer: Option<IoBuffer>,
        length: usize,
        offset: Option<u64>,
        event: Option<Arc<KEvent>>,
        iosb: Option<UserIosb>,
    ) -> Result<Arc<Irp>, DriverStatus> {
        let irp = self.build_asynchronous_fsd_request(major, device, buffer, length, offset, iosb)?;
        irp.set_user_event(event);
        irp.insert_flags(IrpFlags::SYNCHRONOUS_API);
        Ok(irp)
    }

    /// Build an I/O control request. Buffers shorter than their declared
    /// lengths are rejected before anything is allocated.
    pub fn build_device_io_control_request(
        self: &Arc<Self>,
        device: &Arc<DeviceObject>,
        ctl: DeviceControl,
        event: Option<Arc<KEvent>>,
        iosb: Option<UserIosb>,
    ) -> Result<Arc<Irp>, DriverStatus> {
        check_capacity(ctl.input.as_ref(), ctl.input_length)?;
        check_capacity(ctl.output.as_ref(), ctl.output_length)?;
        let method = ctl.method();
        let thread = self.current_thread()?;

        let mut system_buffer = None;
        let mut type3_input = None;
        let mut mdl = None;
        let mut flags = IrpFlags::empty();
        match method {
            TransferMethod::Buffered => {
                let size = ctl.input_length.max(ctl.output_length);
                let sys = match &ctl.input {
                    Some(i) if i.len() >= size => i.clone(),
                    _ if size == 0 => IoBuffer::new(0),
                    input => {
                        let b = IoBuffer::new(size);
                        if let Some(i) = input {
                            i.read(|d| b.copy_from(0, &d[..ctl.input_length]));
                        }
                        b
                    }
                };
                if let Some(out) = &ctl.output {
                    if !out.ptr_eq(&sys) {
                        flags |= IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION;
                    }
                }
                if size > 0 {
                    system_buffer = Some(sys);
                }
            }
            TransferMethod::InDirect | TransferMethod::OutDirect => {
                system_buffer = ctl.input.clone();
                if let Some(out) = &ctl.output {
                    let mut m = Mdl::new(out, 0, ctl.output_length)?;
                    m.flags |= MdlFlags::MAPPED_TO_SYSTEM_VA;
                    mdl = Some(m);
                }
            }
            TransferMethod::Neither => {
                type3_input = ctl.input.clone();
            }
        }

        let irp = self.allocate_irp(device.stack_size(), false)?;
        let major = if ctl.internal {
            MajorFunction::InternalDeviceControl
        } else {
            MajorFunction::DeviceControl
        };
        irp.with_next_stack_location(|loc| {
            loc.major = major;
            loc.parameters = IoParameters::DeviceIoControl {
                output_buffer_length: ctl.output_length,
                input_buffer_length: ctl.input_length,
                io_control_code: ctl.code,
                type3_input_buffer: type3_input,
            };
        });
        irp.insert_flags(flags);
        irp.set_system_buffer(system_buffer);
        if let Some(m) = mdl {
            irp.attach_mdl(m, false);
        }
        irp.set_requestor_mode(ProcessorMode::KernelMode);
        irp.set_user_iosb(iosb);
        irp.set_user_event(event);
        irp.set_user_buffer(ctl.output);
        irp.set_thread(Some(thread));
        trace!(
            "built ioctl {:#x} ({}) irp {:#x} in {} out {}",
            ctl.code,
            method,
            irp.id(),
            ctl.input_length,
            ctl.output_length
        );
        Ok(irp)
    }
}
