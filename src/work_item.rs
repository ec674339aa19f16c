use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_queue::SegQueue;
use log::{debug, error, trace, warn};
use spin::Once;

use crate::device::DeviceObject;
use crate::event::{EventType, KEvent};
use crate::manager::IoManager;
use crate::object_manager::ObjectTag;
use crate::status::DriverStatus;

type Job = Box<dyn FnOnce() + Send>;

/// Delayed work queue served by one host thread, started on first use.
pub(crate) struct WorkQueue {
    jobs: SegQueue<Job>,
    wake: KEvent,
    stop: AtomicBool,
    started: Once<Result<(), DriverStatus>>,
}

impl WorkQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: SegQueue::new(),
            wake: KEvent::new(EventType::Synchronization, false),
            stop: AtomicBool::new(false),
            started: Once::new(),
        })
    }

    fn start(self: &Arc<Self>) -> Result<(), DriverStatus> {
        *self.started.call_once(|| {
            let q = self.clone();
            thread::Builder::new()
                .name("io-work".to_string())
                .spawn(move || q.pump())
                .map(|_| ())
                .map_err(|e| {
                    error!("cannot start the work queue thread: {}", e);
                    DriverStatus::InsufficientResources
                })
        })
    }

    fn pump(&self) {
        debug!("work queue running");
        loop {
            while let Some(job) = self.jobs.pop() {
                job();
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            self.wake.wait();
        }
        debug!("work queue stopped");
    }

    fn submit(self: &Arc<Self>, job: Job) -> Result<(), DriverStatus> {
        if self.stop.load(Ordering::Acquire) {
            return Err(DriverStatus::DeviceNotReady);
        }
        self.start()?;
        self.jobs.push(job);
        self.wake.set();
        Ok(())
    }

    /// Items already queued still run; new ones are refused.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.set();
    }
}

/// Deferred callback bound to a device. One item runs at most one routine
/// at a time and may be queued again once that routine returned.
#[derive(Debug)]
pub struct WorkItem {
    device: Arc<DeviceObject>,
    queued: AtomicBool,
}

impl WorkItem {
    #[inline]
    pub fn device(&self) -> &Arc<DeviceObject> {
        &self.device
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

impl IoManager {
    pub fn allocate_work_item(&self, device: &Arc<DeviceObject>) -> Arc<WorkItem> {
        trace!("work item for device {:#x}", device.id);
        Arc::new(WorkItem {
            device: device.clone(),
            queued: AtomicBool::new(false),
        })
    }

    /// Runs `routine` on the work queue thread. The device stays referenced
    /// until the routine returned.
    pub fn queue_work_item<F>(self: &Arc<Self>, item: &Arc<WorkItem>, routine: F) -> Result<(), DriverStatus>
    where
        F: FnOnce(&Arc<IoManager>, &Arc<DeviceObject>) + Send + 'static,
    {
        if item.queued.swap(true, Ordering::AcqRel) {
            warn!("work item for device {:#x} queued twice", item.device.id);
            return Err(DriverStatus::InvalidDeviceRequest);
        }
        let device_ref = match self.objects().lookup_by_id(item.device.id, Some(ObjectTag::Device)) {
            Ok(r) => r,
            Err(e) => {
                item.queued.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let io = self.clone();
        let job_item = item.clone();
        let job: Job = Box::new(move || {
            trace!("running work item for device {:#x}", job_item.device.id);
            routine(&io, &job_item.device);
            job_item.queued.store(false, Ordering::Release);
            drop(device_ref);
        });
        self.work_queue().submit(job).map_err(|e| {
            item.queued.store(false, Ordering::Release);
            e
        })
    }

    pub fn free_work_item(&self, item: Arc<WorkItem>) {
        if item.is_queued() {
            warn!("freeing work item for device {:#x} while it is queued", item.device.id);
        }
        drop(item);
    }
}
