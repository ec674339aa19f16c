use alloc::sync::Arc;
use alloc::vec::Vec;
use strum::{Display, EnumCount, EnumIter, FromRepr};

use crate::device::{DeviceObject, DriverObject};
use crate::manager::IoManager;
use crate::request::Irp;
use crate::status::DriverStatus;

#[repr(u8)]
#[derive(Display, EnumCount, EnumIter, FromRepr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MajorFunction {
    Create = 0x00,
    CreateNamedPipe = 0x01,
    Close = 0x02,
    Read = 0x03,
    Write = 0x04,
    QueryInformation = 0x05,
    SetInformation = 0x06,
    QueryEa = 0x07,
    SetEa = 0x08,
    FlushBuffers = 0x09,
    QueryVolumeInformation = 0x0a,
    SetVolumeInformation = 0x0b,
    DirectoryControl = 0x0c,
    FileSystemControl = 0x0d,
    DeviceControl = 0x0e,
    InternalDeviceControl = 0x0f,
    Shutdown = 0x10,
    LockControl = 0x11,
    Cleanup = 0x12,
    CreateMailslot = 0x13,
    QuerySecurity = 0x14,
    SetSecurity = 0x15,
    Power = 0x16,
    SystemControl = 0x17,
    DeviceChange = 0x18,
    QueryQuota = 0x19,
    SetQuota = 0x1a,
    Pnp = 0x1b,
}

pub const MAJOR_FUNCTION_COUNT: usize = MajorFunction::COUNT;

pub type DispatchRoutine =
    Arc<dyn Fn(&Arc<IoManager>, &Arc<DeviceObject>, &Arc<Irp>) -> DriverStatus + Send + Sync>;

pub type DriverUnload = Arc<dyn Fn(&Arc<IoManager>, &Arc<DriverObject>) -> DriverStatus + Send + Sync>;

/// What an unset dispatch slot does with an IRP.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalPolicy {
    /// Complete with `InvalidDeviceRequest`.
    FailIfUnhandled,
    /// Skip this layer and hand the IRP to the device below.
    ForwardLower,
}

pub struct DispatchTable {
    pub handlers: Vec<Option<DispatchRoutine>>,
    pub unset: TraversalPolicy,
}

impl core::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let set = self.handlers.iter().filter(|h| h.is_some()).count();
        f.debug_struct("DispatchTable")
            .field("set", &set)
            .field("unset", &self.unset)
            .finish()
    }
}

impl DispatchTable {
    #[inline]
    pub fn new() -> Self {
        Self {
            handlers: alloc::vec![None; MAJOR_FUNCTION_COUNT],
            unset: TraversalPolicy::FailIfUnhandled,
        }
    }

    #[inline]
    pub fn set(&mut self, major: MajorFunction, routine: DispatchRoutine) {
        self.handlers[major as usize] = Some(routine);
    }

    #[inline]
    pub fn clear(&mut self, major: MajorFunction) {
        self.handlers[major as usize] = None;
    }

    #[inline]
    pub fn get_for(&self, major: MajorFunction) -> Option<DispatchRoutine> {
        self.handlers.get(major as usize).cloned().flatten()
    }

    #[inline]
    pub fn is_set(&self, major: MajorFunction) -> bool {
        self.handlers[major as usize].is_some()
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer convention encoded in the low two bits of an I/O control code.
#[repr(u32)]
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    Buffered = 0,
    InDirect = 1,
    OutDirect = 2,
    Neither = 3,
}

impl TransferMethod {
    #[inline]
    pub fn of(code: u32) -> Self {
        match code & 3 {
            0 => TransferMethod::Buffered,
            1 => TransferMethod::InDirect,
            2 => TransferMethod::OutDirect,
            _ => TransferMethod::Neither,
        }
    }
}

pub const FILE_ANY_ACCESS: u32 = 0;
pub const FILE_READ_ACCESS: u32 = 1;
pub const FILE_WRITE_ACCESS: u32 = 2;

#[inline]
pub const fn ctl_code(device_type: u32, function: u32, method: TransferMethod, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method as u32
}
