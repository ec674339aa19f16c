use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, trace, warn};

use crate::builders::DeviceControl;
use crate::cancel::{cancel_completed_irp, CancelRoutine};
use crate::channel::{IncomingRequest, IrpParams, NextRequest, PreviousRequest};
use crate::device::{DeviceObject, FileObject};
use crate::event::{Apc, Notifier, WaitResult, WaitSet};
use crate::io::{MajorFunction, TransferMethod};
use crate::manager::IoManager;
use crate::object_manager::{ObjectId, ObjectTag, RemoteHandle};
use crate::request::{IoBuffer, IoParameters, Irp, IrpFlags, IrpId, ProcessorMode};
use crate::status::DriverStatus;

/// State carried between iterations of the dispatcher loop.
#[derive(Debug)]
pub struct DispatchContext {
    /// Channel handle of the request being dispatched.
    pub handle: Option<RemoteHandle>,
    /// IRP built for that request, if any.
    pub irp: Option<IrpId>,
    pub params: Option<IrpParams>,
    /// Input buffer. `None` once a request took ownership of it or a regrow was
    /// requested.
    pub in_buff: Option<Vec<u8>>,
    pub in_size: usize,
    pub client_tid: u32,
}

impl DispatchContext {
    fn new(in_size: usize) -> Self {
        Self {
            handle: None,
            irp: None,
            params: None,
            in_buff: None,
            in_size,
            client_tid: 0,
        }
    }

    /// Moves the input bytes out of the context.
    fn take_input(&mut self) -> Vec<u8> {
        let mut v = self.in_buff.take().unwrap_or_default();
        v.resize(self.in_size, 0);
        v
    }
}

/// Control surface for a running [`Dispatcher`], usable from any thread.
#[derive(Clone)]
pub struct DispatcherHandle(Arc<WaitSet>);

impl DispatcherHandle {
    /// Makes the loop exit at its next wait and shut the manager down.
    pub fn stop(&self) {
        self.0.signal_stop();
    }

    /// Runs `f` on the dispatcher thread during its next wait.
    pub fn queue_apc<F: FnOnce() + Send + 'static>(&self, f: F) {
        let apc: Apc = Box::new(f);
        self.0.queue_apc(apc);
    }

    pub fn notify(&self) {
        self.0.notify_activity();
    }
}

/// Pulls requests from the manager's channel and turns them into IRPs.
pub struct Dispatcher {
    io: Arc<IoManager>,
    waits: Arc<WaitSet>,
    current_client: AtomicU32,
}

impl Dispatcher {
    pub fn new(io: Arc<IoManager>) -> Self {
        let waits = Arc::new(WaitSet::new());
        io.channel().bind_notifier(Notifier::new(waits.clone()));
        Self {
            io,
            waits,
            current_client: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle(self.waits.clone())
    }

    #[inline]
    pub fn io(&self) -> &Arc<IoManager> {
        &self.io
    }

    /// Thread id of the client whose request is being dispatched.
    pub fn current_client(&self) -> u32 {
        self.current_client.load(Ordering::Acquire)
    }

    /// Runs until stopped, then shuts the manager down.
    pub fn run(&self) -> DriverStatus {
        if !self.io.is_accepting() {
            return DriverStatus::DeviceNotReady;
        }
        let initial = self.io.config().initial_in_size;
        let mut ctx = DispatchContext::new(initial);
        let mut status = DriverStatus::Success;
        debug!("dispatcher started");

        loop {
            self.current_client.store(0, Ordering::Release);
            let mut buf = ctx
                .in_buff
                .take()
                .unwrap_or_else(|| alloc::vec![0u8; ctx.in_size]);
            let offered = ctx.in_size.min(buf.len());
            let prev = PreviousRequest {
                handle: ctx.handle.take(),
                irp: ctx.irp.take(),
                status,
            };

            let next = {
                let _g = self.io.completion_lock.lock();
                self.io.channel().get_next_request(prev, &mut buf[..offered])
            };

            match next {
                NextRequest::Request(req) => {
                    ctx.in_buff = Some(buf);
                    status = self.dispatch(&mut ctx, req);
                    ctx.in_size = ctx.in_buff.as_ref().map_or(initial, Vec::len);
                }
                NextRequest::BufferOverflow { needed } => {
                    trace!("input buffer too small, regrowing to {}", needed);
                    ctx.in_size = needed;
                    status = DriverStatus::BufferOverflow;
                }
                NextRequest::Pending => {
                    ctx.in_buff = Some(buf);
                    status = DriverStatus::Pending;
                    loop {
                        match self.waits.wait_alertable() {
                            WaitResult::Stop => {
                                debug!("dispatcher stopping");
                                self.io.shutdown();
                                return DriverStatus::Success;
                            }
                            WaitResult::IoCompletion => continue,
                            WaitResult::Activity => break,
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, ctx: &mut DispatchContext, req: IncomingRequest) -> DriverStatus {
        ctx.handle = Some(req.handle);
        ctx.in_size = req.in_size;
        ctx.client_tid = req.client_tid;
        ctx.params = Some(req.params.clone());
        self.current_client.store(req.client_tid, Ordering::Release);
        trace!(
            "{} request {:?} from client {:#x}, {} input bytes",
            req.params.opcode(),
            req.handle,
            req.client_tid,
            req.in_size
        );

        let r = match req.params {
            IrpParams::Create {
                file,
                device,
                access,
                sharing,
                options,
            } => self.dispatch_create(ctx, file, device, access, sharing, options),
            IrpParams::Close { file } => self.dispatch_close(ctx, file),
            IrpParams::Read {
                file,
                key,
                out_size,
                pos,
            } => self.dispatch_read(ctx, file, key, out_size, pos),
            IrpParams::Write { file, key, pos } => self.dispatch_write(ctx, file, key, pos),
            IrpParams::Flush { file } => self.dispatch_flush(ctx, file),
            IrpParams::Ioctl {
                file,
                code,
                out_size,
            } => self.dispatch_ioctl(ctx, file, code, out_size),
            IrpParams::Free { obj } => self.dispatch_free(obj),
            IrpParams::Cancel { irp } => self.dispatch_cancel(irp),
        };
        match r {
            Ok(()) => DriverStatus::Success,
            Err(e) => {
                warn!("{:?}: {}", req.handle, e);
                e
            }
        }
    }

    fn resolve_file(&self, id: ObjectId) -> Result<Arc<FileObject>, DriverStatus> {
        let obj = self.io.objects().get(id, Some(ObjectTag::File))?;
        obj.as_file().cloned().ok_or(DriverStatus::InvalidHandle)
    }

    fn dispatch_create(
        &self,
        ctx: &mut DispatchContext,
        handle: RemoteHandle,
        device: ObjectId,
        access: u32,
        sharing: u32,
        options: u32,
    ) -> Result<(), DriverStatus> {
        let obj = self.io.objects().get(device, Some(ObjectTag::Device))?;
        let device = obj.as_device().cloned().ok_or(DriverStatus::InvalidHandle)?;
        let thread = self.io.current_thread()?;
        let raw = ctx.take_input();
        let name = String::from_utf8_lossy(&raw);
        let file = self.io.create_file_object(handle, &device, name.trim_end_matches('\0'))?;
        trace!("device {:#x} -> file {:#x} {:?}", device.id, file.id, file.file_name());

        let top = IoManager::top_of_stack(&device);
        let irp = self.io.allocate_irp(top.stack_size(), false)?;
        irp.with_next_stack_location(|loc| {
            loc.major = MajorFunction::Create;
            loc.file = Some(file.clone());
            loc.parameters = IoParameters::Create {
                desired_access: access,
                options,
                share_access: sharing,
            };
        });
        irp.set_original_file(Some(file));
        irp.set_thread(Some(thread));
        irp.insert_flags(IrpFlags::CREATE_OPERATION);
        self.dispatch_irp(&top, &irp, ctx)
    }

    fn dispatch_close(&self, ctx: &mut DispatchContext, file: ObjectId) -> Result<(), DriverStatus> {
        let file = self.resolve_file(file)?;
        let thread = self.io.current_thread()?;
        let top = IoManager::top_of_stack(file.device());
        trace!("close file {:#x} on device {:#x}", file.id, top.id);

        let irp = self.io.allocate_irp(top.stack_size(), false)?;
        irp.with_next_stack_location(|loc| {
            loc.major = MajorFunction::Close;
            loc.file = Some(file.clone());
        });
        irp.set_original_file(Some(file));
        irp.set_thread(Some(thread));
        irp.insert_flags(IrpFlags::CLOSE_OPERATION);
        self.dispatch_irp(&top, &irp, ctx)
    }

    fn dispatch_read(
        &self,
        ctx: &mut DispatchContext,
        file: ObjectId,
        key: u32,
        out_size: usize,
        pos: u64,
    ) -> Result<(), DriverStatus> {
        let file = self.resolve_file(file)?;
        let top = IoManager::top_of_stack(file.device());
        trace!("read file {:#x} size {} pos {:#x}", file.id, out_size, pos);

        let out = IoBuffer::new(out_size);
        let irp = self.io.build_synchronous_fsd_request(
            MajorFunction::Read,
            &top,
            Some(out),
            out_size,
            Some(pos),
            None,
            None,
        )?;
        irp.with_next_stack_location(|loc| {
            loc.file = Some(file.clone());
            if let IoParameters::Read { key: k, .. } = &mut loc.parameters {
                *k = key;
            }
        });
        irp.set_original_file(Some(file));
        irp.insert_flags(IrpFlags::READ_OPERATION | IrpFlags::DEALLOCATE_BUFFER);
        self.dispatch_irp(&top, &irp, ctx)
    }

    fn dispatch_write(&self, ctx: &mut DispatchContext, file: ObjectId, key: u32, pos: u64) -> Result<(), DriverStatus> {
        let file = self.resolve_file(file)?;
        let top = IoManager::top_of_stack(file.device());
        trace!("write file {:#x} size {} pos {:#x}", file.id, ctx.in_size, pos);

        let len = ctx.in_size;
        let input = IoBuffer::from_vec(ctx.take_input());
        let irp = self.io.build_synchronous_fsd_request(
            MajorFunction::Write,
            &top,
            Some(input),
            len,
            Some(pos),
            None,
            None,
        )?;
        irp.with_next_stack_location(|loc| {
            loc.file = Some(file.clone());
            if let IoParameters::Write { key: k, .. } = &mut loc.parameters {
                *k = key;
            }
        });
        irp.set_original_file(Some(file));
        irp.insert_flags(IrpFlags::WRITE_OPERATION | IrpFlags::DEALLOCATE_BUFFER);
        self.dispatch_irp(&top, &irp, ctx)
    }

    fn dispatch_flush(&self, ctx: &mut DispatchContext, file: ObjectId) -> Result<(), DriverStatus> {
        let file = self.resolve_file(file)?;
        let top = IoManager::top_of_stack(file.device());
        trace!("flush file {:#x}", file.id);

        let irp =
            self.io
                .build_synchronous_fsd_request(MajorFunction::FlushBuffers, &top, None, 0, None, None, None)?;
        irp.with_next_stack_location(|loc| loc.file = Some(file.clone()));
        irp.set_original_file(Some(file));
        self.dispatch_irp(&top, &irp, ctx)
    }

    /// Buffered requests share one buffer for input and output, grown to the
    /// output size. Other methods carry the output area at the tail of the
    /// input.
    fn dispatch_ioctl(
        &self,
        ctx: &mut DispatchContext,
        file: ObjectId,
        code: u32,
        out_size: usize,
    ) -> Result<(), DriverStatus> {
        let file = self.resolve_file(file)?;
        let top = IoManager::top_of_stack(file.device());
        let method = TransferMethod::of(code);
        trace!(
            "ioctl {:#x} ({}) file {:#x} in {} out {}",
            code,
            method,
            file.id,
            ctx.in_size,
            out_size
        );
        if method != TransferMethod::Buffered && out_size > ctx.in_size {
            return Err(DriverStatus::InvalidDeviceRequest);
        }

        let mut in_size = ctx.in_size;
        let mut input = ctx.take_input();
        let ctl = if method == TransferMethod::Buffered {
            if out_size > in_size {
                input.resize(out_size, 0);
            }
            let shared = IoBuffer::from_vec(input);
            DeviceControl::new(code)
                .input(shared.clone(), in_size)
                .output(shared, out_size)
        } else if out_size > 0 {
            in_size -= out_size;
            let out = input.split_off(in_size);
            DeviceControl::new(code)
                .input(IoBuffer::from_vec(input), in_size)
                .output(IoBuffer::from_vec(out), out_size)
        } else {
            DeviceControl::new(code).input(IoBuffer::from_vec(input), in_size)
        };

        let irp = self.io.build_device_io_control_request(&top, ctl, None, None)?;
        irp.with_next_stack_location(|loc| loc.file = Some(file.clone()));
        irp.set_original_file(Some(file));
        irp.insert_flags(IrpFlags::DEALLOCATE_BUFFER);
        self.dispatch_irp(&top, &irp, ctx)
    }

    fn dispatch_free(&self, obj: ObjectId) -> Result<(), DriverStatus> {
        trace!("freeing object {:#x}", obj);
        if !self.io.objects().free(obj) {
            trace!("object {:#x} kept", obj);
        }
        Ok(())
    }

    fn dispatch_cancel(&self, irp: IrpId) -> Result<(), DriverStatus> {
        let _g = self.io.completion_lock.lock();
        match self.io.lookup_irp(irp) {
            Some(irp) => {
                trace!("cancel irp {:#x}", irp.id());
                self.io.cancel_irp(&irp);
            }
            None => trace!("cancel of irp {:#x} that is already gone", irp),
        }
        Ok(())
    }

    /// Sends a built IRP down the stack. Once it is sent the result reaches
    /// the channel from the completion routine, so only failures to send are
    /// returned.
    fn dispatch_irp(
        &self,
        device: &Arc<DeviceObject>,
        irp: &Arc<Irp>,
        ctx: &mut DispatchContext,
    ) -> Result<(), DriverStatus> {
        if let Ok(t) = self.io.current_thread() {
            irp.set_thread(Some(t));
        }
        irp.set_requestor_mode(ProcessorMode::UserMode);
        let Some(handle) = ctx.handle else {
            error!("irp {:#x} dispatched without a request", irp.id());
            self.io.free_irp(irp);
            return Err(DriverStatus::InvalidParameter);
        };
        if let Err(e) = irp.set_completion_routine(
            Arc::new(move |io, _dev, irp| dispatch_irp_completion(io, irp, handle)),
            true,
            true,
            true,
        ) {
            error!("irp {:#x}: no location for the completion routine", irp.id());
            self.io.free_irp(irp);
            return Err(e);
        }
        ctx.irp = Some(irp.id());
        let status = self.io.call_driver(device, irp);
        trace!("irp {:#x} sent to device {:#x}: {}", irp.id(), device.id, status);
        Ok(())
    }
}

/// Reports the final status of a channel request. Runs as the topmost
/// completion routine of every IRP the dispatcher builds.
fn dispatch_irp_completion(io: &Arc<IoManager>, irp: &Arc<Irp>, handle: RemoteHandle) -> DriverStatus {
    let iosb = irp.io_status();
    let out = if irp.flags().contains(IrpFlags::WRITE_OPERATION) {
        None
    } else {
        irp.user_buffer()
            .map(|b| b.read(|d| d[..iosb.information.min(d.len())].to_vec()))
    };

    let _g = io.completion_lock.lock();
    let mut status = io
        .channel()
        .set_result(handle, iosb.status, iosb.information, out.as_deref());
    trace!(
        "irp {:#x} result {} ({} bytes) -> {:?}",
        irp.id(),
        iosb.status,
        iosb.information,
        handle
    );
    if status == DriverStatus::MoreProcessingRequired {
        if irp.is_cancelled() {
            status = DriverStatus::Success;
        } else {
            let routine: CancelRoutine = Box::new(cancel_completed_irp);
            io.set_cancel_routine(irp, Some(routine));
        }
    }
    if let (Some(user), sys) = (irp.user_buffer(), irp.system_buffer()) {
        if !sys.is_some_and(|s| s.ptr_eq(&user)) {
            irp.set_user_buffer(None);
        }
    }
    status
}
