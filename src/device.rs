use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::{type_name, Any};
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::{Mutex, Once, RwLock};

use crate::io::{DispatchRoutine, DispatchTable, DriverUnload, MajorFunction, TraversalPolicy};
use crate::loader::LoadedModule;
use crate::manager::IoManager;
use crate::object_manager::{ObjectId, RemoteHandle};
use crate::request::Irp;
use crate::status::DriverStatus;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u32 {
        const EXCLUSIVE = 0x0000_0008;
        const DIRECT_IO = 0x0000_0010;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const REMOVABLE_MEDIA = 0x0000_0001;
        const READ_ONLY_DEVICE = 0x0000_0002;
        const FLOPPY_DISKETTE = 0x0000_0004;
        const WRITE_ONCE_MEDIA = 0x0000_0008;
        const REMOTE_DEVICE = 0x0000_0010;
        const DEVICE_IS_MOUNTED = 0x0000_0020;
        const VIRTUAL_VOLUME = 0x0000_0040;
        const AUTOGENERATED_NAME = 0x0000_0080;
        const SECURE_OPEN = 0x0000_0100;
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceType(pub u32);

impl DeviceType {
    pub const DISK: DeviceType = DeviceType(0x07);
    pub const FILE_SYSTEM: DeviceType = DeviceType(0x09);
    pub const NETWORK: DeviceType = DeviceType(0x12);
    pub const NULL: DeviceType = DeviceType(0x15);
    pub const UNKNOWN: DeviceType = DeviceType(0x22);
    pub const BUS_EXTENDER: DeviceType = DeviceType(0x2a);
}

#[derive(Debug, PartialEq, Eq)]
pub enum DevExtError {
    NotPresent,
    TypeMismatch { expected: &'static str },
}

/// Typed driver-private context attached once to a device.
struct DeviceContext {
    inner: Once<Box<dyn Any + Send + Sync>>,
}

impl DeviceContext {
    fn new() -> Self {
        Self { inner: Once::new() }
    }

    fn set<T: Any + Send + Sync>(&self, value: T) -> bool {
        let mut stored = false;
        self.inner.call_once(|| {
            stored = true;
            Box::new(value) as Box<dyn Any + Send + Sync>
        });
        stored
    }

    fn get<T: Any>(&self) -> Result<&T, DevExtError> {
        let b = self.inner.get().ok_or(DevExtError::NotPresent)?;
        let a: &dyn Any = &**b;
        a.downcast_ref::<T>().ok_or(DevExtError::TypeMismatch {
            expected: type_name::<T>(),
        })
    }
}

pub struct DeviceObject {
    pub id: ObjectId,
    pub device_type: DeviceType,
    pub characteristics: DeviceCharacteristics,
    name: RwLock<Option<String>>,
    driver: Weak<DriverObject>,
    attached: RwLock<Option<Arc<DeviceObject>>>,
    attached_to: RwLock<Option<Weak<DeviceObject>>>,
    next_device: RwLock<Option<Arc<DeviceObject>>>,
    stack_size: AtomicU8,
    flags: AtomicU32,
    extension: Mutex<Box<[u8]>>,
    context: DeviceContext,
}

impl core::fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceObject")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("stack_size", &self.stack_size())
            .field("flags", &self.flags())
            .finish()
    }
}

impl DeviceObject {
    pub(crate) fn new(
        id: ObjectId,
        driver: &Arc<DriverObject>,
        extension_size: usize,
        device_type: DeviceType,
        characteristics: DeviceCharacteristics,
        exclusive: bool,
    ) -> Self {
        let mut flags = DeviceFlags::empty();
        if exclusive {
            flags |= DeviceFlags::EXCLUSIVE;
        }
        Self {
            id,
            device_type,
            characteristics,
            name: RwLock::new(None),
            driver: Arc::downgrade(driver),
            attached: RwLock::new(None),
            attached_to: RwLock::new(None),
            next_device: RwLock::new(None),
            stack_size: AtomicU8::new(1),
            flags: AtomicU32::new(flags.bits()),
            extension: Mutex::new(alloc::vec![0u8; extension_size].into_boxed_slice()),
            context: DeviceContext::new(),
        }
    }

    #[inline]
    pub fn driver(&self) -> Option<Arc<DriverObject>> {
        self.driver.upgrade()
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: Option<String>) {
        *self.name.write() = name;
    }

    /// Device directly above this one.
    #[inline]
    pub fn attached_device(&self) -> Option<Arc<DeviceObject>> {
        self.attached.read().clone()
    }

    /// Device directly below this one, while attached.
    #[inline]
    pub fn lower_device(&self) -> Option<Arc<DeviceObject>> {
        self.attached_to.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_lower_upper(this: &Arc<Self>, lower: &Arc<DeviceObject>) {
        *lower.attached.write() = Some(this.clone());
        *this.attached_to.write() = Some(Arc::downgrade(lower));
        this.stack_size
            .store(lower.stack_size().saturating_add(1), Ordering::Release);
    }

    /// Drops the link to the upper device. Stack sizes stay as they were.
    pub(crate) fn clear_upper(&self) -> Option<Arc<DeviceObject>> {
        let upper = self.attached.write().take();
        if let Some(u) = &upper {
            *u.attached_to.write() = None;
        }
        upper
    }

    #[inline]
    pub fn next_device(&self) -> Option<Arc<DeviceObject>> {
        self.next_device.read().clone()
    }

    #[inline]
    pub fn stack_size(&self) -> u8 {
        self.stack_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, f: DeviceFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, f: DeviceFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.flags().contains(DeviceFlags::EXCLUSIVE)
    }

    pub fn extension_size(&self) -> usize {
        self.extension.lock().len()
    }

    pub fn with_extension<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.extension.lock())
    }

    /// Stores a typed context. Returns `false` if one was already set.
    pub fn set_context<T: Any + Send + Sync>(&self, value: T) -> bool {
        self.context.set(value)
    }

    pub fn context<T: Any>(&self) -> Result<&T, DevExtError> {
        self.context.get::<T>()
    }
}

pub struct DriverConfig<'a> {
    dispatch: &'a mut DispatchTable,
    unload: &'a mut Option<DriverUnload>,
}

impl DriverConfig<'_> {
    pub fn on<F>(&mut self, major: MajorFunction, f: F) -> &mut Self
    where
        F: Fn(&Arc<IoManager>, &Arc<DeviceObject>, &Arc<Irp>) -> DriverStatus + Send + Sync + 'static,
    {
        self.dispatch.set(major, Arc::new(f));
        self
    }

    pub fn clear(&mut self, major: MajorFunction) -> &mut Self {
        self.dispatch.clear(major);
        self
    }

    pub fn on_unload<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Arc<IoManager>, &Arc<DriverObject>) -> DriverStatus + Send + Sync + 'static,
    {
        *self.unload = Some(Arc::new(f));
        self
    }

    /// Unset slots pass the IRP to the lower device instead of failing it.
    pub fn forward_unhandled(&mut self) -> &mut Self {
        self.dispatch.unset = TraversalPolicy::ForwardLower;
        self
    }
}

pub struct DriverObject {
    pub id: ObjectId,
    pub driver_name: String,
    pub service_name: Option<String>,
    dispatch: RwLock<DispatchTable>,
    unload: RwLock<Option<DriverUnload>>,
    devices: RwLock<Option<Arc<DeviceObject>>>,
    extensions: Mutex<HashMap<usize, Arc<dyn Any + Send + Sync>>>,
    module: Option<LoadedModule>,
}

impl core::fmt::Debug for DriverObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverObject")
            .field("id", &self.id)
            .field("driver_name", &self.driver_name)
            .field("service_name", &self.service_name)
            .field("dispatch", &*self.dispatch.read())
            .finish()
    }
}

impl DriverObject {
    pub(crate) fn new(
        id: ObjectId,
        driver_name: String,
        service_name: Option<String>,
        module: Option<LoadedModule>,
    ) -> Self {
        Self {
            id,
            driver_name,
            service_name,
            dispatch: RwLock::new(DispatchTable::new()),
            unload: RwLock::new(None),
            devices: RwLock::new(None),
            extensions: Mutex::new(HashMap::new()),
            module,
        }
    }

    pub fn configure<F: FnOnce(&mut DriverConfig)>(this: &Arc<Self>, f: F) {
        let mut dispatch = this.dispatch.write();
        let mut unload = this.unload.write();
        let mut cfg = DriverConfig {
            dispatch: &mut dispatch,
            unload: &mut unload,
        };
        f(&mut cfg);
    }

    #[inline]
    pub fn dispatch_routine(&self, major: MajorFunction) -> Option<DispatchRoutine> {
        self.dispatch.read().get_for(major)
    }

    #[inline]
    pub fn unset_policy(&self) -> TraversalPolicy {
        self.dispatch.read().unset
    }

    #[inline]
    pub fn unload_routine(&self) -> Option<DriverUnload> {
        self.unload.read().clone()
    }

    #[inline]
    pub fn module(&self) -> Option<&LoadedModule> {
        self.module.as_ref()
    }

    /// Most recently created device first.
    pub fn devices(&self) -> Vec<Arc<DeviceObject>> {
        let mut out = Vec::new();
        let mut cur = self.devices.read().clone();
        while let Some(d) = cur {
            cur = d.next_device();
            out.push(d);
        }
        out
    }

    pub(crate) fn push_device(&self, device: &Arc<DeviceObject>) {
        let mut head = self.devices.write();
        *device.next_device.write() = head.take();
        *head = Some(device.clone());
    }

    pub(crate) fn unlink_device(&self, device: &Arc<DeviceObject>) -> bool {
        let mut head = self.devices.write();
        let first = match head.clone() {
            Some(d) => d,
            None => return false,
        };
        if Arc::ptr_eq(&first, device) {
            *head = device.next_device.write().take();
            return true;
        }
        let mut prev = first;
        loop {
            let next = match prev.next_device() {
                Some(n) => n,
                None => return false,
            };
            if Arc::ptr_eq(&next, device) {
                *prev.next_device.write() = device.next_device.write().take();
                return true;
            }
            prev = next;
        }
    }

    /// Allocates the per-driver extension for `client_id`.
    pub fn allocate_extension<T: Any + Send + Sync>(
        &self,
        client_id: usize,
        value: T,
    ) -> Result<Arc<T>, DriverStatus> {
        let mut ext = self.extensions.lock();
        if ext.contains_key(&client_id) {
            return Err(DriverStatus::ObjectNameCollision);
        }
        let v = Arc::new(value);
        ext.insert(client_id, v.clone());
        Ok(v)
    }

    pub fn extension<T: Any + Send + Sync>(&self, client_id: usize) -> Option<Arc<T>> {
        let any = self.extensions.lock().get(&client_id).cloned()?;
        any.downcast::<T>().ok()
    }

    pub(crate) fn clear_extensions(&self) {
        self.extensions.lock().clear();
    }
}

pub struct FileObject {
    pub id: ObjectId,
    pub handle: Option<RemoteHandle>,
    file_name: String,
    device: Arc<DeviceObject>,
    fs_context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl core::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileObject")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("file_name", &self.file_name)
            .field("device", &self.device.id)
            .finish()
    }
}

impl FileObject {
    pub(crate) fn new(id: ObjectId, handle: Option<RemoteHandle>, file_name: String, device: Arc<DeviceObject>) -> Self {
        Self {
            id,
            handle,
            file_name,
            device,
            fs_context: Mutex::new(None),
        }
    }

    /// Path below the device the client opened, empty for the device itself.
    #[inline]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Device the file was opened on, not necessarily the top of its stack.
    #[inline]
    pub fn device(&self) -> &Arc<DeviceObject> {
        &self.device
    }

    pub fn set_fs_context<T: Any + Send + Sync>(&self, ctx: T) {
        *self.fs_context.lock() = Some(Arc::new(ctx));
    }

    pub fn fs_context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.fs_context.lock().clone()?.downcast::<T>().ok()
    }
}
