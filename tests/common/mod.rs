#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kernel_io::{
    DeviceCharacteristics, DeviceObject, DeviceType, DispatcherHandle, DriverConfig, DriverObject, DriverStatus,
    IoConfig, IoManager, IrpParams, LocalChannel, NextRequest, Notifier, ObjectId, PreviousRequest, RemoteHandle,
    RequestChannel, IncomingRequest,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` for up to five seconds.
pub fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn local_manager() -> (Arc<LocalChannel>, Arc<IoManager>) {
    local_manager_with(IoConfig::default())
}

pub fn local_manager_with(config: IoConfig) -> (Arc<LocalChannel>, Arc<IoManager>) {
    init_logging();
    let ch = Arc::new(LocalChannel::new());
    let io = IoManager::with_config(ch.clone(), config);
    (ch, io)
}

/// Creates a driver whose dispatch table is filled by `setup`.
pub fn driver<F>(io: &Arc<IoManager>, name: &str, setup: F) -> Arc<DriverObject>
where
    F: FnOnce(&mut DriverConfig),
{
    io.create_driver(name, |_, drv, _| {
        DriverObject::configure(drv, setup);
        DriverStatus::Success
    })
    .unwrap()
}

pub fn device(io: &Arc<IoManager>, drv: &Arc<DriverObject>) -> Arc<DeviceObject> {
    io.create_device(
        drv,
        0,
        None,
        DeviceType::UNKNOWN,
        DeviceCharacteristics::empty(),
        false,
    )
    .unwrap()
}

pub fn named_device(io: &Arc<IoManager>, drv: &Arc<DriverObject>, name: &str) -> Arc<DeviceObject> {
    io.create_device(
        drv,
        0,
        Some(name),
        DeviceType::UNKNOWN,
        DeviceCharacteristics::empty(),
        false,
    )
    .unwrap()
}

pub enum Step {
    Request { params: IrpParams, input: Vec<u8> },
    /// Reports `Pending` once without consuming anything.
    Idle,
    /// Asks for cancellation of the IRP reported with the previous pull.
    CancelPrevious,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub handle: RemoteHandle,
    pub status: DriverStatus,
    pub information: usize,
    pub output: Vec<u8>,
}

/// Channel that replays a fixed script, records what the dispatcher offers
/// and reports, and stops the dispatcher once the script runs out.
pub struct ScriptedChannel {
    objects: LocalChannel,
    script: Mutex<VecDeque<Step>>,
    next_handle: Mutex<u32>,
    pub offered: Mutex<Vec<usize>>,
    pub previous: Mutex<Vec<PreviousRequest>>,
    pub dispatched: Mutex<Vec<RemoteHandle>>,
    pub results: Mutex<Vec<Recorded>>,
    /// When set, `set_result` answers as if a cancel were already in flight.
    pub cancel_in_flight: AtomicBool,
    stopper: Mutex<Option<DispatcherHandle>>,
}

impl ScriptedChannel {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            objects: LocalChannel::new(),
            script: Mutex::new(steps.into()),
            next_handle: Mutex::new(0x100),
            offered: Mutex::new(Vec::new()),
            previous: Mutex::new(Vec::new()),
            dispatched: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            cancel_in_flight: AtomicBool::new(false),
            stopper: Mutex::new(None),
        }
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn stop_when_done(&self, handle: DispatcherHandle) {
        *self.stopper.lock().unwrap() = Some(handle);
    }

    pub fn create_handle(&self, type_name: &str) -> RemoteHandle {
        self.objects.create_handle(type_name)
    }

    fn issue(&self, params: IrpParams, input: &[u8], in_buff: &mut [u8]) -> NextRequest {
        in_buff[..input.len()].copy_from_slice(input);
        let mut next = self.next_handle.lock().unwrap();
        let handle = RemoteHandle(*next);
        *next += 4;
        self.dispatched.lock().unwrap().push(handle);
        NextRequest::Request(IncomingRequest {
            handle,
            params,
            in_size: input.len(),
            client_tid: 0x42,
        })
    }
}

impl RequestChannel for ScriptedChannel {
    fn get_next_request(&self, prev: PreviousRequest, in_buff: &mut [u8]) -> NextRequest {
        self.offered.lock().unwrap().push(in_buff.len());
        self.previous.lock().unwrap().push(prev);

        let mut script = self.script.lock().unwrap();
        let needed = match script.front() {
            Some(Step::Request { input, .. }) => input.len(),
            _ => 0,
        };
        if needed > in_buff.len() {
            return NextRequest::BufferOverflow { needed };
        }
        match script.pop_front() {
            None => {
                if let Some(h) = self.stopper.lock().unwrap().as_ref() {
                    h.stop();
                }
                NextRequest::Pending
            }
            Some(Step::Idle) => {
                if let Some(h) = self.stopper.lock().unwrap().as_ref() {
                    h.notify();
                }
                NextRequest::Pending
            }
            Some(Step::CancelPrevious) => {
                let irp = prev.irp.expect("previous request built no irp");
                self.issue(IrpParams::Cancel { irp }, &[], in_buff)
            }
            Some(Step::Request { params, input }) => self.issue(params, &input, in_buff),
        }
    }

    fn set_result(
        &self,
        handle: RemoteHandle,
        status: DriverStatus,
        information: usize,
        output: Option<&[u8]>,
    ) -> DriverStatus {
        self.results.lock().unwrap().push(Recorded {
            handle,
            status,
            information,
            output: output.map(<[u8]>::to_vec).unwrap_or_default(),
        });
        if self.cancel_in_flight.load(Ordering::SeqCst) {
            DriverStatus::MoreProcessingRequired
        } else {
            DriverStatus::Success
        }
    }

    fn register_pointer(&self, handle: RemoteHandle, id: ObjectId) -> Result<(), DriverStatus> {
        self.objects.register_pointer(handle, id)
    }

    fn lookup_pointer(&self, handle: RemoteHandle) -> Result<Option<ObjectId>, DriverStatus> {
        self.objects.lookup_pointer(handle)
    }

    fn query_object_type(&self, handle: RemoteHandle) -> Result<String, DriverStatus> {
        self.objects.query_object_type(handle)
    }

    fn release_pointer(&self, _id: ObjectId) -> Result<(), DriverStatus> {
        Ok(())
    }

    fn grab_pointer(&self, id: ObjectId) -> Result<(), DriverStatus> {
        self.objects.grab_pointer(id)
    }

    fn create_named_device(&self, name: Option<&str>, id: ObjectId) -> Result<(), DriverStatus> {
        self.objects.create_named_device(name, id)
    }

    fn delete_device(&self, id: ObjectId) -> Result<(), DriverStatus> {
        self.objects.delete_device(id)
    }

    fn bind_notifier(&self, _notifier: Notifier) {}
}
