use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use log::{debug, trace, warn};
use parking_lot::ReentrantMutex;
use spin::{Mutex, RwLock};

use crate::channel::RequestChannel;
use crate::config::IoConfig;
use crate::device::{DeviceCharacteristics, DeviceObject, DeviceType, DriverObject, FileObject};
use crate::loader::{DriverLoader, LoadedModule};
use crate::object_manager::{ObRef, ObjectPayload, ObjectTable, ObjectTag, RemoteHandle};
use crate::process::{ProcessObject, ThreadObject};
use crate::request::{Irp, IrpId};
use crate::status::DriverStatus;
use crate::work_item::WorkQueue;

/// System state for one I/O subsystem instance: object table, driver
/// registry, live IRPs and the locks the request paths share.
pub struct IoManager {
    config: IoConfig,
    objects: Arc<ObjectTable>,
    channel: Arc<dyn RequestChannel>,
    loader: RwLock<Option<Arc<dyn DriverLoader>>>,
    drivers: RwLock<BTreeMap<String, Arc<DriverObject>>>,
    pub(crate) irps: Mutex<HashMap<IrpId, Arc<Irp>>>,
    next_irp_id: AtomicU64,
    pub(crate) cancel_lock: Mutex<()>,
    /// Serializes reporting results to the channel against channel-driven
    /// cancellation. Re-entrant because a cancel routine may complete the
    /// IRP on the thread that holds it.
    pub(crate) completion_lock: ReentrantMutex<()>,
    stack_lock: Mutex<()>,
    threads: Mutex<HashMap<ThreadId, Arc<ThreadObject>>>,
    system_process: Arc<ProcessObject>,
    next_auto_name: AtomicU32,
    accepting: AtomicBool,
    work_queue: Arc<WorkQueue>,
}

impl IoManager {
    pub fn new(channel: Arc<dyn RequestChannel>) -> Arc<Self> {
        Self::with_config(channel, IoConfig::default())
    }

    pub fn with_config(channel: Arc<dyn RequestChannel>, config: IoConfig) -> Arc<Self> {
        let objects = ObjectTable::new(channel.clone());
        let system_process =
            objects.insert_local(1, |id| Arc::new(ProcessObject::new(id, None)), ObjectPayload::Process);
        Arc::new(Self {
            config,
            objects,
            channel,
            loader: RwLock::new(None),
            drivers: RwLock::new(BTreeMap::new()),
            irps: Mutex::new(HashMap::new()),
            next_irp_id: AtomicU64::new(1),
            cancel_lock: Mutex::new(()),
            completion_lock: ReentrantMutex::new(()),
            stack_lock: Mutex::new(()),
            threads: Mutex::new(HashMap::new()),
            system_process,
            next_auto_name: AtomicU32::new(0),
            accepting: AtomicBool::new(true),
            work_queue: WorkQueue::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    #[inline]
    pub fn objects(&self) -> &Arc<ObjectTable> {
        &self.objects
    }

    #[inline]
    pub fn channel(&self) -> &Arc<dyn RequestChannel> {
        &self.channel
    }

    pub fn loader(&self) -> Option<Arc<dyn DriverLoader>> {
        self.loader.read().clone()
    }

    pub fn set_loader(&self, loader: Arc<dyn DriverLoader>) {
        *self.loader.write() = Some(loader);
    }

    pub fn system_process(&self) -> &Arc<ProcessObject> {
        &self.system_process
    }

    #[inline]
    pub(crate) fn work_queue(&self) -> &Arc<WorkQueue> {
        &self.work_queue
    }

    #[inline]
    pub(crate) fn next_irp_id(&self) -> IrpId {
        self.next_irp_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Thread object for the calling host thread, created on first use.
    pub fn current_thread(&self) -> Result<Arc<ThreadObject>, DriverStatus> {
        let tid = thread::current().id();
        if let Some(t) = self.threads.lock().get(&tid) {
            return Ok(t.clone());
        }
        let process = self.system_process.clone();
        let payload = self.objects.alloc(ObjectTag::Thread, None, 1, |id| {
            ObjectPayload::Thread(Arc::new(ThreadObject::new(id, None, Some(tid), Some(process))))
        })?;
        let t = payload
            .as_thread()
            .cloned()
            .ok_or(DriverStatus::ObjectTypeMismatch)?;
        self.threads.lock().insert(tid, t.clone());
        Ok(t)
    }

    pub fn driver(&self, name: &str) -> Option<Arc<DriverObject>> {
        self.drivers.read().get(name).cloned()
    }

    pub fn drivers(&self) -> Vec<Arc<DriverObject>> {
        self.drivers.read().values().cloned().collect()
    }

    /// Create a driver object named `name` and run `init` on it. Slots the
    /// initializer leaves empty fail with `InvalidDeviceRequest`.
    pub fn create_driver<F>(self: &Arc<Self>, name: &str, init: F) -> Result<Arc<DriverObject>, DriverStatus>
    where
        F: FnOnce(&Arc<IoManager>, &Arc<DriverObject>, &str) -> DriverStatus,
    {
        self.install_driver(name.to_string(), None, None, name.to_string(), init)
    }

    fn install_driver<F>(
        self: &Arc<Self>,
        driver_name: String,
        service: Option<String>,
        module: Option<LoadedModule>,
        registry_path: String,
        init: F,
    ) -> Result<Arc<DriverObject>, DriverStatus>
    where
        F: FnOnce(&Arc<IoManager>, &Arc<DriverObject>, &str) -> DriverStatus,
    {
        let name = driver_name.clone();
        let payload = self.objects.alloc(ObjectTag::Driver, None, 1, |id| {
            ObjectPayload::Driver(Arc::new(DriverObject::new(id, name, service, module)))
        })?;
        let driver = payload
            .as_driver()
            .cloned()
            .ok_or(DriverStatus::ObjectTypeMismatch)?;
        {
            let mut map = self.drivers.write();
            if map.contains_key(&driver_name) {
                drop(map);
                let _ = self.objects.dereference(driver.id);
                return Err(DriverStatus::ObjectNameCollision);
            }
            map.insert(driver_name.clone(), driver.clone());
        }

        let status = init(self, &driver, &registry_path);
        if status != DriverStatus::Success {
            warn!("{}: initialization failed: {}", driver_name, status);
            self.drivers.write().remove(&driver_name);
            let _ = self.objects.dereference(driver.id);
            return Err(status);
        }
        debug!("driver {} initialized", driver_name);
        Ok(driver)
    }

    /// Remove a driver from the registry and drop its object.
    pub fn delete_driver(&self, driver: &Arc<DriverObject>) {
        {
            let mut map = self.drivers.write();
            if map
                .get(&driver.driver_name)
                .is_some_and(|d| Arc::ptr_eq(d, driver))
            {
                map.remove(&driver.driver_name);
            }
        }
        let _ = self.objects.dereference(driver.id);
        trace!("deleted driver {}", driver.driver_name);
    }

    /// Load and initialize the driver registered for `service`.
    pub fn load_driver(self: &Arc<Self>, service: &str) -> Result<Arc<DriverObject>, DriverStatus> {
        let name = self.config.driver_name(service);
        if self.drivers.read().contains_key(&name) {
            return Err(DriverStatus::ImageAlreadyLoaded);
        }
        let loader = self.loader().ok_or(DriverStatus::DriverUnableToLoad)?;
        let path = loader.resolve_driver_path(service)?;
        let module = loader.load_module(&path)?;
        let entry = match loader.find_entry_point(&module) {
            Ok(e) => e,
            Err(e) => {
                warn!("{}: no entry point in {}", service, path);
                loader.unload_module(&module);
                return Err(e);
            }
        };
        let registry = self.config.registry_path(service);
        debug!("loading {} from {}", service, path);
        self.install_driver(
            name,
            Some(service.to_string()),
            Some(module.clone()),
            registry,
            |io, drv, reg| entry(io, drv, reg),
        )
        .map_err(|e| {
            loader.unload_module(&module);
            e
        })
    }

    /// Run the unload routine of a service driver and tear it down. A
    /// driver without one, or whose routine fails, stays loaded.
    pub fn unload_driver(self: &Arc<Self>, service: &str) -> Result<(), DriverStatus> {
        let name = self.config.driver_name(service);
        let driver = self.driver(&name).ok_or(DriverStatus::ObjectNameNotFound)?;
        let unload = driver
            .unload_routine()
            .ok_or(DriverStatus::InvalidDeviceRequest)?;
        let status = unload(self, &driver);
        if status != DriverStatus::Success {
            warn!("{}: unload failed: {}", name, status);
            return Err(status);
        }
        self.teardown_driver(&driver);
        Ok(())
    }

    fn teardown_driver(&self, driver: &Arc<DriverObject>) {
        for dev in driver.devices() {
            warn!(
                "{} left device {:#x} behind at unload",
                driver.driver_name, dev.id
            );
            if let Err(e) = self.delete_device(&dev) {
                warn!("deleting device {:#x}: {}", dev.id, e);
            }
        }
        self.delete_driver(driver);
        if let (Some(module), Some(loader)) = (driver.module(), self.loader()) {
            loader.unload_module(module);
        }
    }

    pub fn create_device(
        &self,
        driver: &Arc<DriverObject>,
        extension_size: usize,
        name: Option<&str>,
        device_type: DeviceType,
        characteristics: DeviceCharacteristics,
        exclusive: bool,
    ) -> Result<Arc<DeviceObject>, DriverStatus> {
        let payload = self.objects.alloc(ObjectTag::Device, None, 1, |id| {
            ObjectPayload::Device(Arc::new(DeviceObject::new(
                id,
                driver,
                extension_size,
                device_type,
                characteristics,
                exclusive,
            )))
        })?;
        let device = payload
            .as_device()
            .cloned()
            .ok_or(DriverStatus::ObjectTypeMismatch)?;

        let registered = if characteristics.contains(DeviceCharacteristics::AUTOGENERATED_NAME) {
            self.register_autogenerated_name(&device)
        } else {
            self.channel
                .create_named_device(name, device.id)
                .map(|()| name.map(String::from))
        };
        match registered {
            Ok(n) => device.set_name(n),
            Err(e) => {
                self.objects.discard(device.id);
                return Err(e);
            }
        }
        self.objects.mark_external(device.id);
        driver.push_device(&device);
        trace!(
            "created device {:#x} {:?} for {}",
            device.id,
            device.name(),
            driver.driver_name
        );
        Ok(device)
    }

    fn register_autogenerated_name(&self, device: &Arc<DeviceObject>) -> Result<Option<String>, DriverStatus> {
        loop {
            let idx = self.next_auto_name.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}{:08x}", self.config.device_name_prefix, idx);
            match self.channel.create_named_device(Some(&name), device.id) {
                Ok(()) => return Ok(Some(name)),
                Err(DriverStatus::ObjectNameCollision) => {
                    warn!("device name {} taken, retrying", name);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn delete_device(&self, device: &Arc<DeviceObject>) -> Result<(), DriverStatus> {
        self.channel.delete_device(device.id)?;
        if let Some(driver) = device.driver() {
            driver.unlink_device(device);
        }
        self.objects.dereference(device.id)?;
        trace!("deleted device {:#x}", device.id);
        Ok(())
    }

    /// Attach `source` on top of the stack containing `target`. Returns the
    /// device that was on top.
    pub fn attach_to_stack(
        &self,
        source: &Arc<DeviceObject>,
        target: &Arc<DeviceObject>,
    ) -> Result<Arc<DeviceObject>, DriverStatus> {
        let _g = self.stack_lock.lock();
        let top = Self::top_of_stack(target);
        let mut cur = Some(top.clone());
        while let Some(d) = cur {
            if Arc::ptr_eq(&d, source) {
                return Err(DriverStatus::InvalidParameter);
            }
            cur = d.lower_device();
        }
        DeviceObject::set_lower_upper(source, &top);
        trace!(
            "attached {:#x} above {:#x}, stack size {}",
            source.id,
            top.id,
            source.stack_size()
        );
        Ok(top)
    }

    /// Detach whatever is attached above `device`.
    pub fn detach(&self, device: &Arc<DeviceObject>) {
        let _g = self.stack_lock.lock();
        if let Some(upper) = device.clear_upper() {
            trace!("detached {:#x} from {:#x}", upper.id, device.id);
        }
    }

    pub fn top_of_stack(device: &Arc<DeviceObject>) -> Arc<DeviceObject> {
        let mut cur = device.clone();
        while let Some(up) = cur.attached_device() {
            cur = up;
        }
        cur
    }

    pub fn top_of_stack_reference(&self, device: &Arc<DeviceObject>) -> Result<ObRef, DriverStatus> {
        let top = Self::top_of_stack(device);
        self.objects.lookup_by_id(top.id, Some(ObjectTag::Device))
    }

    /// File object for a handle opened on `device`, with no references held.
    pub fn create_file_object(
        &self,
        handle: RemoteHandle,
        device: &Arc<DeviceObject>,
        file_name: &str,
    ) -> Result<Arc<FileObject>, DriverStatus> {
        let dev = device.clone();
        let name = file_name.to_string();
        let payload = self.objects.alloc(ObjectTag::File, Some(handle), 0, |id| {
            ObjectPayload::File(Arc::new(FileObject::new(id, Some(handle), name, dev)))
        })?;
        payload.as_file().cloned().ok_or(DriverStatus::ObjectTypeMismatch)
    }

    /// Stop admitting requests, unload every driver and empty the object
    /// table.
    pub fn shutdown(self: &Arc<Self>) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down I/O manager");
        self.work_queue.shutdown();
        for driver in self.drivers() {
            match driver.unload_routine() {
                Some(unload) => {
                    let status = unload(self, &driver);
                    if status != DriverStatus::Success {
                        warn!("{}: unload failed: {}", driver.driver_name, status);
                    }
                }
                None => trace!("{}: no unload routine", driver.driver_name),
            }
            self.teardown_driver(&driver);
        }
        self.threads.lock().clear();
        let dropped = self.objects.clear();
        debug!("object table cleared, {} objects dropped", dropped);
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.work_queue.shutdown();
    }
}
