use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use crossbeam_queue::SegQueue;
use hashbrown::HashMap;
use log::trace;
use parking_lot::{Condvar, Mutex};
use strum_macros::IntoStaticStr;

use crate::event::Notifier;
use crate::object_manager::{ObjectId, RemoteHandle};
use crate::request::IrpId;
use crate::status::DriverStatus;

/// Parameters of one external request, keyed by opcode.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum IrpParams {
    Create {
        file: RemoteHandle,
        device: ObjectId,
        access: u32,
        sharing: u32,
        options: u32,
    },
    Close {
        file: ObjectId,
    },
    Read {
        file: ObjectId,
        key: u32,
        out_size: usize,
        pos: u64,
    },
    Write {
        file: ObjectId,
        key: u32,
        pos: u64,
    },
    Flush {
        file: ObjectId,
    },
    Ioctl {
        file: ObjectId,
        code: u32,
        out_size: usize,
    },
    Free {
        obj: ObjectId,
    },
    Cancel {
        irp: IrpId,
    },
}

impl IrpParams {
    #[inline]
    pub fn opcode(&self) -> &'static str {
        self.into()
    }
}

/// What the dispatcher reports about the request it handled last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousRequest {
    pub handle: Option<RemoteHandle>,
    /// Set when an IRP was built; its result arrives through `set_result`.
    pub irp: Option<IrpId>,
    /// Final result of the request when no IRP was built.
    pub status: DriverStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub handle: RemoteHandle,
    pub params: IrpParams,
    /// Bytes of input written into the dispatcher's buffer.
    pub in_size: usize,
    pub client_tid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRequest {
    Request(IncomingRequest),
    Pending,
    BufferOverflow { needed: usize },
}

/// Transport between the I/O manager and whoever issues requests.
pub trait RequestChannel: Send + Sync {
    /// Report on the previous request and pull the next one. Input bytes are
    /// written into `in_buff`; if they do not fit nothing is consumed and
    /// `BufferOverflow` names the size needed.
    fn get_next_request(&self, prev: PreviousRequest, in_buff: &mut [u8]) -> NextRequest;

    /// Deliver the final result of an IRP-backed request. Returns
    /// `MoreProcessingRequired` when the requester still has a cancel in
    /// flight for it.
    fn set_result(
        &self,
        handle: RemoteHandle,
        status: DriverStatus,
        information: usize,
        output: Option<&[u8]>,
    ) -> DriverStatus;

    fn register_pointer(&self, handle: RemoteHandle, id: ObjectId) -> Result<(), DriverStatus>;
    fn lookup_pointer(&self, handle: RemoteHandle) -> Result<Option<ObjectId>, DriverStatus>;
    fn query_object_type(&self, handle: RemoteHandle) -> Result<String, DriverStatus>;
    fn release_pointer(&self, id: ObjectId) -> Result<(), DriverStatus>;
    fn grab_pointer(&self, id: ObjectId) -> Result<(), DriverStatus>;

    fn create_named_device(&self, name: Option<&str>, id: ObjectId) -> Result<(), DriverStatus>;
    fn delete_device(&self, id: ObjectId) -> Result<(), DriverStatus>;

    /// Gives the channel a way to wake a dispatcher waiting for requests.
    fn bind_notifier(&self, _notifier: Notifier) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResult {
    pub status: DriverStatus,
    pub information: usize,
    pub output: Vec<u8>,
}

struct QueuedRequest {
    handle: RemoteHandle,
    params: IrpParams,
    input: Vec<u8>,
    client_tid: u32,
}

#[derive(Default)]
struct InFlight {
    irp: Option<IrpId>,
    result_set: bool,
    cancel_requested: bool,
    cancel_queued: bool,
}

#[derive(Default)]
struct ChannelState {
    in_flight: HashMap<RemoteHandle, InFlight>,
    results: HashMap<RemoteHandle, RequestResult>,
    pointers: HashMap<RemoteHandle, ObjectId>,
    object_types: HashMap<RemoteHandle, String>,
    device_names: HashMap<String, ObjectId>,
    devices: HashMap<ObjectId, Option<String>>,
    released: HashMap<ObjectId, usize>,
    grabbed: HashMap<ObjectId, usize>,
}

/// In-process request channel: a queue of submitted requests, a handle
/// table and a log of delivered results.
pub struct LocalChannel {
    queue: SegQueue<QueuedRequest>,
    parked: Mutex<Option<QueuedRequest>>,
    state: Mutex<ChannelState>,
    results_cv: Condvar,
    next_handle: AtomicU32,
    notifier: Mutex<Option<Notifier>>,
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChannel {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            parked: Mutex::new(None),
            state: Mutex::new(ChannelState::default()),
            results_cv: Condvar::new(),
            next_handle: AtomicU32::new(4),
            notifier: Mutex::new(None),
        }
    }

    #[inline]
    fn alloc_handle(&self) -> RemoteHandle {
        RemoteHandle(self.next_handle.fetch_add(4, Ordering::Relaxed))
    }

    fn wake(&self) {
        if let Some(n) = self.notifier.lock().as_ref() {
            n.notify();
        }
    }

    fn enqueue(&self, params: IrpParams, input: Vec<u8>, client_tid: u32) -> RemoteHandle {
        let handle = self.alloc_handle();
        self.state
            .lock()
            .in_flight
            .insert(handle, InFlight::default());
        trace!("queued {} as {:?}", params.opcode(), handle);
        self.queue.push(QueuedRequest {
            handle,
            params,
            input,
            client_tid,
        });
        handle
    }

    /// Creates a handle to a far-side object of type `type_name`.
    pub fn create_handle(&self, type_name: &str) -> RemoteHandle {
        let h = self.alloc_handle();
        self.state
            .lock()
            .object_types
            .insert(h, String::from(type_name));
        h
    }

    /// Queues a request and returns the handle its result will be filed
    /// under.
    pub fn submit(&self, params: IrpParams, input: Vec<u8>) -> RemoteHandle {
        self.submit_from(params, input, 0)
    }

    pub fn submit_from(&self, params: IrpParams, input: Vec<u8>, client_tid: u32) -> RemoteHandle {
        let h = self.enqueue(params, input, client_tid);
        self.wake();
        h
    }

    /// Requests cancellation of an in-flight request. `false` when it has
    /// already finished.
    pub fn cancel(&self, handle: RemoteHandle) -> bool {
        let irp = {
            let mut st = self.state.lock();
            let f = match st.in_flight.get_mut(&handle) {
                Some(f) if !f.result_set => f,
                _ => return false,
            };
            f.cancel_requested = true;
            match f.irp {
                Some(irp) if !f.cancel_queued => {
                    f.cancel_queued = true;
                    irp
                }
                _ => return true,
            }
        };
        self.enqueue(IrpParams::Cancel { irp }, Vec::new(), 0);
        self.wake();
        true
    }

    pub fn result(&self, handle: RemoteHandle) -> Option<RequestResult> {
        self.state.lock().results.get(&handle).cloned()
    }

    pub fn wait_result(&self, handle: RemoteHandle, timeout: Duration) -> Option<RequestResult> {
        let mut st = self.state.lock();
        loop {
            if let Some(r) = st.results.get(&handle) {
                return Some(r.clone());
            }
            if self.results_cv.wait_for(&mut st, timeout).timed_out() {
                return st.results.get(&handle).cloned();
            }
        }
    }

    /// IRP the dispatcher reported for a request still awaiting its result.
    pub fn in_flight_irp(&self, handle: RemoteHandle) -> Option<IrpId> {
        self.state.lock().in_flight.get(&handle).and_then(|f| f.irp)
    }

    pub fn is_in_flight(&self, handle: RemoteHandle) -> bool {
        self.state.lock().in_flight.contains_key(&handle)
    }

    pub fn pending_requests(&self) -> usize {
        self.queue.len() + usize::from(self.parked.lock().is_some())
    }

    /// Reserves a device name so the next registration under it collides.
    pub fn reserve_device_name(&self, name: &str) {
        self.state.lock().device_names.insert(String::from(name), 0);
    }

    pub fn device_name(&self, id: ObjectId) -> Option<String> {
        self.state.lock().devices.get(&id).cloned().flatten()
    }

    pub fn has_device(&self, id: ObjectId) -> bool {
        self.state.lock().devices.contains_key(&id)
    }

    pub fn released_count(&self, id: ObjectId) -> usize {
        self.state.lock().released.get(&id).copied().unwrap_or(0)
    }

    pub fn grabbed_count(&self, id: ObjectId) -> usize {
        self.state.lock().grabbed.get(&id).copied().unwrap_or(0)
    }

    fn settle_previous(&self, prev: PreviousRequest) {
        let Some(handle) = prev.handle else {
            return;
        };
        let mut cancel = None;
        {
            let mut st = self.state.lock();
            let Some(f) = st.in_flight.get_mut(&handle) else {
                return;
            };
            match prev.irp {
                Some(irp) if !f.result_set => {
                    f.irp = Some(irp);
                    if f.cancel_requested && !f.cancel_queued {
                        f.cancel_queued = true;
                        cancel = Some(irp);
                    }
                }
                Some(_) => {
                    st.in_flight.remove(&handle);
                }
                None => {
                    st.in_flight.remove(&handle);
                    st.results.insert(
                        handle,
                        RequestResult {
                            status: prev.status,
                            information: 0,
                            output: Vec::new(),
                        },
                    );
                    self.results_cv.notify_all();
                }
            }
        }
        if let Some(irp) = cancel {
            self.enqueue(IrpParams::Cancel { irp }, Vec::new(), 0);
        }
    }
}

impl RequestChannel for LocalChannel {
    fn get_next_request(&self, prev: PreviousRequest, in_buff: &mut [u8]) -> NextRequest {
        self.settle_previous(prev);

        let next = self.parked.lock().take().or_else(|| self.queue.pop());
        let Some(req) = next else {
            return NextRequest::Pending;
        };
        if req.input.len() > in_buff.len() {
            let needed = req.input.len();
            *self.parked.lock() = Some(req);
            return NextRequest::BufferOverflow { needed };
        }
        if let IrpParams::Free { obj } = req.params {
            let mut st = self.state.lock();
            st.pointers.retain(|_, id| *id != obj);
        }
        in_buff[..req.input.len()].copy_from_slice(&req.input);
        NextRequest::Request(IncomingRequest {
            handle: req.handle,
            params: req.params,
            in_size: req.input.len(),
            client_tid: req.client_tid,
        })
    }

    fn set_result(
        &self,
        handle: RemoteHandle,
        status: DriverStatus,
        information: usize,
        output: Option<&[u8]>,
    ) -> DriverStatus {
        let mut st = self.state.lock();
        let mut ret = DriverStatus::Success;
        let mut done = false;
        if let Some(f) = st.in_flight.get_mut(&handle) {
            f.result_set = true;
            if f.cancel_queued {
                ret = DriverStatus::MoreProcessingRequired;
            }
            done = f.irp.is_some();
        }
        if done {
            st.in_flight.remove(&handle);
        }
        st.results.insert(
            handle,
            RequestResult {
                status,
                information,
                output: output.map(<[u8]>::to_vec).unwrap_or_default(),
            },
        );
        self.results_cv.notify_all();
        ret
    }

    fn register_pointer(&self, handle: RemoteHandle, id: ObjectId) -> Result<(), DriverStatus> {
        let mut st = self.state.lock();
        match st.pointers.get(&handle) {
            Some(existing) if *existing != id => Err(DriverStatus::ObjectNameCollision),
            _ => {
                st.pointers.insert(handle, id);
                Ok(())
            }
        }
    }

    fn lookup_pointer(&self, handle: RemoteHandle) -> Result<Option<ObjectId>, DriverStatus> {
        let st = self.state.lock();
        match st.pointers.get(&handle) {
            Some(id) => Ok(Some(*id)),
            None if st.object_types.contains_key(&handle) => Ok(None),
            None => Err(DriverStatus::InvalidHandle),
        }
    }

    fn query_object_type(&self, handle: RemoteHandle) -> Result<String, DriverStatus> {
        self.state
            .lock()
            .object_types
            .get(&handle)
            .cloned()
            .ok_or(DriverStatus::InvalidHandle)
    }

    fn release_pointer(&self, id: ObjectId) -> Result<(), DriverStatus> {
        *self.state.lock().released.entry(id).or_insert(0) += 1;
        self.enqueue(IrpParams::Free { obj: id }, Vec::new(), 0);
        self.wake();
        Ok(())
    }

    fn grab_pointer(&self, id: ObjectId) -> Result<(), DriverStatus> {
        *self.state.lock().grabbed.entry(id).or_insert(0) += 1;
        Ok(())
    }

    fn create_named_device(&self, name: Option<&str>, id: ObjectId) -> Result<(), DriverStatus> {
        let mut st = self.state.lock();
        if let Some(n) = name {
            if st.device_names.contains_key(n) {
                return Err(DriverStatus::ObjectNameCollision);
            }
            st.device_names.insert(String::from(n), id);
        }
        st.devices.insert(id, name.map(String::from));
        Ok(())
    }

    fn delete_device(&self, id: ObjectId) -> Result<(), DriverStatus> {
        let mut st = self.state.lock();
        let name = st.devices.remove(&id).ok_or(DriverStatus::NoSuchDevice)?;
        if let Some(n) = name {
            st.device_names.remove(&n);
        }
        Ok(())
    }

    fn bind_notifier(&self, notifier: Notifier) {
        *self.notifier.lock() = Some(notifier);
        if !self.queue.is_empty() {
            self.wake();
        }
    }
}
