use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::cancel::CancelRoutine;
use crate::device::{DeviceObject, FileObject};
use crate::event::KEvent;
use crate::io::MajorFunction;
use crate::manager::IoManager;
use crate::process::ThreadObject;
use crate::status::DriverStatus;

pub type IrpId = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrpFlags: u32 {
        const NOCACHE = 0x0000_0001;
        const PAGING_IO = 0x0000_0002;
        const SYNCHRONOUS_API = 0x0000_0004;
        const BUFFERED_IO = 0x0000_0010;
        const DEALLOCATE_BUFFER = 0x0000_0020;
        const INPUT_OPERATION = 0x0000_0040;
        const CREATE_OPERATION = 0x0000_0080;
        const READ_OPERATION = 0x0000_0100;
        const WRITE_OPERATION = 0x0000_0200;
        const CLOSE_OPERATION = 0x0000_0400;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocationFlags: u8 {
        const QUOTA_CHARGED = 0x01;
        const MUST_SUCCEED = 0x02;
        const FIXED_SIZE = 0x04;
        const LOOKASIDE = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StackControl: u8 {
        const PENDING_RETURNED = 0x01;
        const ERROR_RETURNED = 0x02;
        const INVOKE_ON_CANCEL = 0x20;
        const INVOKE_ON_SUCCESS = 0x40;
        const INVOKE_ON_ERROR = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MdlFlags: u16 {
        const MAPPED_TO_SYSTEM_VA = 0x0001;
        const PAGES_LOCKED = 0x0002;
        const SOURCE_IS_NONPAGED_POOL = 0x0004;
        const PARTIAL = 0x0010;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    KernelMode,
    UserMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatusBlock {
    pub status: DriverStatus,
    pub information: usize,
}

impl Default for IoStatusBlock {
    fn default() -> Self {
        Self {
            status: DriverStatus::Success,
            information: 0,
        }
    }
}

/// Caller-owned status block the completion path copies the final status
/// into.
pub type UserIosb = Arc<Mutex<IoStatusBlock>>;

pub type CompletionRoutine =
    Arc<dyn Fn(&Arc<IoManager>, Option<&Arc<DeviceObject>>, &Arc<Irp>) -> DriverStatus + Send + Sync>;

/// Shared byte buffer. Clones alias the same storage.
#[derive(Clone, Default)]
pub struct IoBuffer(Arc<Mutex<Vec<u8>>>);

impl core::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IoBuffer({} bytes)", self.len())
    }
}

impl IoBuffer {
    pub fn new(len: usize) -> Self {
        Self::from_vec(alloc::vec![0; len])
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(v)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0.lock())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub fn resize(&self, len: usize) {
        self.0.lock().resize(len, 0);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Copies as much of `src` as fits at `offset`; returns the byte count.
    pub fn copy_from(&self, offset: usize, src: &[u8]) -> usize {
        let mut b = self.0.lock();
        if offset >= b.len() {
            return 0;
        }
        let n = src.len().min(b.len() - offset);
        b[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }

    #[inline]
    pub fn ptr_eq(&self, other: &IoBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Describes a byte range of a buffer for direct I/O.
#[derive(Debug, Clone)]
pub struct Mdl {
    pub buffer: IoBuffer,
    pub byte_offset: usize,
    pub byte_count: usize,
    pub flags: MdlFlags,
}

impl Mdl {
    pub fn new(buffer: &IoBuffer, byte_offset: usize, byte_count: usize) -> Result<Self, DriverStatus> {
        if byte_offset
            .checked_add(byte_count)
            .map_or(true, |end| end > buffer.len())
        {
            return Err(DriverStatus::BufferTooSmall);
        }
        Ok(Self {
            buffer: buffer.clone(),
            byte_offset,
            byte_count,
            flags: MdlFlags::empty(),
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let (o, n) = (self.byte_offset, self.byte_count);
        self.buffer.read(|b| f(&b[o..o + n]))
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let (o, n) = (self.byte_offset, self.byte_count);
        self.buffer.write(|b| f(&mut b[o..o + n]))
    }
}

/// Builds an MDL over the first `len` bytes of `buffer`. With an IRP the MDL
/// becomes its primary MDL, or is appended to the chain when `secondary`.
pub fn allocate_mdl(
    buffer: &IoBuffer,
    len: usize,
    secondary: bool,
    irp: Option<&Irp>,
) -> Result<Mdl, DriverStatus> {
    let mdl = Mdl::new(buffer, 0, len)?;
    if let Some(irp) = irp {
        irp.attach_mdl(mdl.clone(), secondary);
    }
    Ok(mdl)
}

#[derive(Debug, Clone, Default)]
pub enum IoParameters {
    #[default]
    None,
    Create {
        desired_access: u32,
        options: u32,
        share_access: u32,
    },
    Read {
        length: usize,
        key: u32,
        byte_offset: u64,
    },
    Write {
        length: usize,
        key: u32,
        byte_offset: u64,
    },
    DeviceIoControl {
        output_buffer_length: usize,
        input_buffer_length: usize,
        io_control_code: u32,
        type3_input_buffer: Option<IoBuffer>,
    },
}

#[derive(Clone)]
pub struct IoStackLocation {
    pub major: MajorFunction,
    pub minor: u8,
    pub control: StackControl,
    pub parameters: IoParameters,
    pub device: Option<Arc<DeviceObject>>,
    pub file: Option<Arc<FileObject>>,
    pub completion: Option<CompletionRoutine>,
}

impl Default for IoStackLocation {
    fn default() -> Self {
        Self {
            major: MajorFunction::Create,
            minor: 0,
            control: StackControl::empty(),
            parameters: IoParameters::None,
            device: None,
            file: None,
            completion: None,
        }
    }
}

impl core::fmt::Debug for IoStackLocation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoStackLocation")
            .field("major", &self.major)
            .field("minor", &self.minor)
            .field("control", &self.control)
            .field("parameters", &self.parameters)
            .field("device", &self.device.as_ref().map(|d| d.id))
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Active,
    CancelRequested,
    Completed,
    /// A cancel arrived after the IRP had already been freed.
    CompletedBeforeCancelObserved,
}

pub(crate) struct IrpState {
    pub(crate) capacity: u8,
    pub(crate) stack_count: u8,
    /// 1-based. `stack_count + 1` until the first `call_driver`.
    pub(crate) current_location: u8,
    pub(crate) locations: Vec<IoStackLocation>,
    pub(crate) io_status: IoStatusBlock,
    pub(crate) flags: IrpFlags,
    pub(crate) allocation_flags: AllocationFlags,
    pub(crate) system_buffer: Option<IoBuffer>,
    pub(crate) user_buffer: Option<IoBuffer>,
    pub(crate) mdls: Vec<Mdl>,
    pub(crate) requestor_mode: ProcessorMode,
    pub(crate) thread: Option<Arc<ThreadObject>>,
    pub(crate) user_event: Option<Arc<KEvent>>,
    pub(crate) user_iosb: Option<UserIosb>,
    pub(crate) pending_returned: bool,
    pub(crate) original_file: Option<Arc<FileObject>>,
}

impl IrpState {
    fn new(capacity: u8, stack_size: u8, allocation_flags: AllocationFlags) -> Self {
        Self {
            capacity,
            stack_count: stack_size,
            current_location: stack_size.saturating_add(1),
            locations: alloc::vec![IoStackLocation::default(); capacity as usize],
            io_status: IoStatusBlock::default(),
            flags: IrpFlags::empty(),
            allocation_flags,
            system_buffer: None,
            user_buffer: None,
            mdls: Vec::new(),
            requestor_mode: ProcessorMode::KernelMode,
            thread: None,
            user_event: None,
            user_iosb: None,
            pending_returned: false,
            original_file: None,
        }
    }

    #[inline]
    fn current_index(&self) -> Option<usize> {
        let cur = self.current_location as usize;
        (cur >= 1 && cur <= self.stack_count as usize).then(|| cur - 1)
    }

    #[inline]
    fn next_index(&self) -> Option<usize> {
        let cur = self.current_location as usize;
        (cur >= 2 && cur - 2 < self.locations.len()).then(|| cur - 2)
    }
}

pub(crate) struct CompletionStep {
    pub(crate) routine: Option<CompletionRoutine>,
    pub(crate) control: StackControl,
    pub(crate) status: DriverStatus,
    pub(crate) device: Option<Arc<DeviceObject>>,
    pub(crate) has_upper: bool,
}

/// I/O request packet.
pub struct Irp {
    id: IrpId,
    pub(crate) state: Mutex<IrpState>,
    cancel: AtomicBool,
    cancel_routine: Mutex<Option<CancelRoutine>>,
    freed: AtomicBool,
    late_cancel: AtomicBool,
}

impl core::fmt::Debug for Irp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("stack_count", &st.stack_count)
            .field("current_location", &st.current_location)
            .field("io_status", &st.io_status)
            .field("flags", &st.flags)
            .field("cancel", &self.is_cancelled())
            .finish()
    }
}

impl Irp {
    pub(crate) fn new(id: IrpId, capacity: u8, stack_size: u8, allocation_flags: AllocationFlags) -> Self {
        Self {
            id,
            state: Mutex::new(IrpState::new(capacity, stack_size, allocation_flags)),
            cancel: AtomicBool::new(false),
            cancel_routine: Mutex::new(None),
            freed: AtomicBool::new(false),
            late_cancel: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> IrpId {
        self.id
    }

    /// Structural reset to `stack_size` layers inside `capacity` slots.
    /// Allocation flags are cleared. Go through
    /// [`IoManager::initialize_irp`](crate::IoManager::initialize_irp) so the
    /// IRP is registered again.
    pub(crate) fn initialize(&self, capacity: u8, stack_size: u8) -> Result<(), DriverStatus> {
        if stack_size > capacity {
            return Err(DriverStatus::InvalidParameter);
        }
        *self.state.lock() = IrpState::new(capacity, stack_size, AllocationFlags::empty());
        self.reset_lifecycle();
        Ok(())
    }

    /// Resets for another round trip, keeping size and allocation flags.
    pub(crate) fn reuse(&self, status: DriverStatus) {
        let mut st = self.state.lock();
        let mut fresh = IrpState::new(st.capacity, st.stack_count, st.allocation_flags);
        fresh.io_status.status = status;
        *st = fresh;
        drop(st);
        self.reset_lifecycle();
    }

    fn reset_lifecycle(&self) {
        *self.cancel_routine.lock() = None;
        self.cancel.store(false, Ordering::Release);
        self.late_cancel.store(false, Ordering::Release);
        self.freed.store(false, Ordering::Release);
    }

    pub fn stack_count(&self) -> u8 {
        self.state.lock().stack_count
    }

    pub fn current_location(&self) -> u8 {
        self.state.lock().current_location
    }

    pub fn capacity(&self) -> u8 {
        self.state.lock().capacity
    }

    pub fn allocation_flags(&self) -> AllocationFlags {
        self.state.lock().allocation_flags
    }

    pub fn flags(&self) -> IrpFlags {
        self.state.lock().flags
    }

    pub fn insert_flags(&self, f: IrpFlags) {
        self.state.lock().flags.insert(f);
    }

    pub fn remove_flags(&self, f: IrpFlags) {
        self.state.lock().flags.remove(f);
    }

    pub fn io_status(&self) -> IoStatusBlock {
        self.state.lock().io_status
    }

    pub fn set_io_status(&self, iosb: IoStatusBlock) {
        self.state.lock().io_status = iosb;
    }

    pub fn set_status(&self, status: DriverStatus) {
        self.state.lock().io_status.status = status;
    }

    pub fn set_information(&self, information: usize) {
        self.state.lock().io_status.information = information;
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn set_cancel_flag(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn current_stack_location(&self) -> Option<IoStackLocation> {
        let st = self.state.lock();
        st.current_index().map(|i| st.locations[i].clone())
    }

    pub fn with_current_stack_location<R>(&self, f: impl FnOnce(&mut IoStackLocation) -> R) -> Option<R> {
        let mut st = self.state.lock();
        let i = st.current_index()?;
        Some(f(&mut st.locations[i]))
    }

    pub fn next_stack_location(&self) -> Option<IoStackLocation> {
        let st = self.state.lock();
        st.next_index().map(|i| st.locations[i].clone())
    }

    pub fn with_next_stack_location<R>(&self, f: impl FnOnce(&mut IoStackLocation) -> R) -> Option<R> {
        let mut st = self.state.lock();
        let i = st.next_index()?;
        Some(f(&mut st.locations[i]))
    }

    /// Lets the next `call_driver` reuse the current location.
    pub fn skip_current_stack_location(&self) {
        let mut st = self.state.lock();
        if st.current_location <= st.stack_count {
            st.current_location += 1;
        }
    }

    /// Copies the current location into the next one, minus its completion
    /// routine and control bits.
    pub fn copy_current_stack_location_to_next(&self) -> Result<(), DriverStatus> {
        let mut st = self.state.lock();
        let (cur, next) = match (st.current_index(), st.next_index()) {
            (Some(c), Some(n)) => (c, n),
            _ => return Err(DriverStatus::InvalidParameter),
        };
        let mut copy = st.locations[cur].clone();
        copy.completion = None;
        copy.control = StackControl::empty();
        st.locations[next] = copy;
        Ok(())
    }

    pub fn set_completion_routine(
        &self,
        routine: CompletionRoutine,
        on_success: bool,
        on_error: bool,
        on_cancel: bool,
    ) -> Result<(), DriverStatus> {
        let mut control = StackControl::empty();
        control.set(StackControl::INVOKE_ON_SUCCESS, on_success);
        control.set(StackControl::INVOKE_ON_ERROR, on_error);
        control.set(StackControl::INVOKE_ON_CANCEL, on_cancel);
        self.with_next_stack_location(|loc| {
            loc.completion = Some(routine);
            loc.control = control;
        })
        .ok_or(DriverStatus::InvalidParameter)
    }

    pub fn mark_pending(&self) {
        self.with_current_stack_location(|loc| loc.control.insert(StackControl::PENDING_RETURNED));
    }

    pub fn pending_returned(&self) -> bool {
        self.state.lock().pending_returned
    }

    pub fn system_buffer(&self) -> Option<IoBuffer> {
        self.state.lock().system_buffer.clone()
    }

    pub fn set_system_buffer(&self, b: Option<IoBuffer>) -> Option<IoBuffer> {
        core::mem::replace(&mut self.state.lock().system_buffer, b)
    }

    pub fn user_buffer(&self) -> Option<IoBuffer> {
        self.state.lock().user_buffer.clone()
    }

    pub fn set_user_buffer(&self, b: Option<IoBuffer>) -> Option<IoBuffer> {
        core::mem::replace(&mut self.state.lock().user_buffer, b)
    }

    /// Primary MDL.
    pub fn mdl_address(&self) -> Option<Mdl> {
        self.state.lock().mdls.first().cloned()
    }

    pub fn mdls(&self) -> Vec<Mdl> {
        self.state.lock().mdls.clone()
    }

    pub fn attach_mdl(&self, mdl: Mdl, secondary: bool) {
        let mut st = self.state.lock();
        if secondary || st.mdls.is_empty() {
            st.mdls.push(mdl);
        } else {
            st.mdls[0] = mdl;
        }
    }

    pub fn requestor_mode(&self) -> ProcessorMode {
        self.state.lock().requestor_mode
    }

    pub fn set_requestor_mode(&self, mode: ProcessorMode) {
        self.state.lock().requestor_mode = mode;
    }

    pub fn thread(&self) -> Option<Arc<ThreadObject>> {
        self.state.lock().thread.clone()
    }

    pub fn set_thread(&self, t: Option<Arc<ThreadObject>>) {
        self.state.lock().thread = t;
    }

    pub fn user_event(&self) -> Option<Arc<KEvent>> {
        self.state.lock().user_event.clone()
    }

    pub fn set_user_event(&self, ev: Option<Arc<KEvent>>) {
        self.state.lock().user_event = ev;
    }

    pub fn user_iosb(&self) -> Option<UserIosb> {
        self.state.lock().user_iosb.clone()
    }

    pub fn set_user_iosb(&self, iosb: Option<UserIosb>) {
        self.state.lock().user_iosb = iosb;
    }

    pub fn original_file(&self) -> Option<Arc<FileObject>> {
        self.state.lock().original_file.clone()
    }

    pub fn set_original_file(&self, f: Option<Arc<FileObject>>) {
        self.state.lock().original_file = f;
    }

    pub(crate) fn swap_cancel_routine(&self, routine: Option<CancelRoutine>) -> Option<CancelRoutine> {
        core::mem::replace(&mut *self.cancel_routine.lock(), routine)
    }

    pub fn has_cancel_routine(&self) -> bool {
        self.cancel_routine.lock().is_some()
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// `true` for the one caller that gets to free the IRP.
    pub(crate) fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn note_late_cancel(&self) {
        self.late_cancel.store(true, Ordering::Release);
    }

    pub fn cancel_state(&self) -> CancelState {
        match (self.is_freed(), self.is_cancelled()) {
            (false, false) => CancelState::Active,
            (false, true) => CancelState::CancelRequested,
            (true, _) if self.late_cancel.load(Ordering::Acquire) => {
                CancelState::CompletedBeforeCancelObserved
            }
            (true, _) => CancelState::Completed,
        }
    }

    /// Descends one location for `call_driver` and stamps `device` into it.
    pub(crate) fn enter_next_location(&self, device: &Arc<DeviceObject>) -> Result<MajorFunction, DriverStatus> {
        let mut st = self.state.lock();
        if st.current_location <= 1 {
            return Err(DriverStatus::InvalidParameter);
        }
        st.current_location -= 1;
        let i = st.current_location as usize - 1;
        let loc = st.locations.get_mut(i).ok_or(DriverStatus::InvalidParameter)?;
        loc.device = Some(device.clone());
        Ok(loc.major)
    }

    /// One step of the completion walk: read the current location, advance,
    /// and report the device now current (none past the top).
    pub(crate) fn completion_step(&self) -> Option<CompletionStep> {
        let mut st = self.state.lock();
        let i = st.current_index()?;
        let loc = &st.locations[i];
        let routine = loc.completion.clone();
        let control = loc.control;
        st.pending_returned = control.contains(StackControl::PENDING_RETURNED);
        st.current_location += 1;
        let (device, has_upper) = match st.current_index() {
            Some(j) => (st.locations[j].device.clone(), true),
            None => (None, false),
        };
        Some(CompletionStep {
            routine,
            control,
            status: st.io_status.status,
            device,
            has_upper,
        })
    }

    /// Releases everything the IRP owns once it is freed.
    pub(crate) fn release_resources(&self) {
        let mut st = self.state.lock();
        st.mdls.clear();
        st.system_buffer = None;
        st.user_buffer = None;
        st.user_event = None;
        st.user_iosb = None;
        st.thread = None;
        st.original_file = None;
        for loc in st.locations.iter_mut() {
            *loc = IoStackLocation::default();
        }
        drop(st);
        *self.cancel_routine.lock() = None;
    }
}
