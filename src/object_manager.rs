use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use log::{error, trace, warn};
use spin::Mutex;
use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::channel::RequestChannel;
use crate::device::{DeviceObject, DriverObject, FileObject};
use crate::process::{ProcessObject, ThreadObject, TokenObject};
use crate::status::DriverStatus;

/// In-process object id. Doubles as the opaque "user pointer" the request
/// channel hands back to identify objects.
pub type ObjectId = u64;

/// Opaque handle owned by the far side of the request channel.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum ObjectTag {
    File,
    Device,
    Driver,
    Process,
    Thread,
    Token,
}

type Constructor = fn(ObjectId, RemoteHandle) -> ObjectPayload;
type ReleaseHook = fn(&ObjectPayload);

fn construct_process(id: ObjectId, handle: RemoteHandle) -> ObjectPayload {
    ObjectPayload::Process(Arc::new(ProcessObject::new(id, Some(handle))))
}

fn construct_thread(id: ObjectId, handle: RemoteHandle) -> ObjectPayload {
    ObjectPayload::Thread(Arc::new(ThreadObject::new(id, Some(handle), None, None)))
}

fn construct_token(id: ObjectId, handle: RemoteHandle) -> ObjectPayload {
    ObjectPayload::Token(Arc::new(TokenObject {
        id,
        handle: Some(handle),
    }))
}

fn release_driver(payload: &ObjectPayload) {
    if let ObjectPayload::Driver(d) = payload {
        trace!("releasing driver object {}", d.driver_name);
        d.clear_extensions();
    }
}

impl ObjectTag {
    #[inline]
    pub fn type_name(self) -> &'static str {
        self.into()
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        ObjectTag::iter().find(|t| t.type_name().eq_ignore_ascii_case(name))
    }

    fn constructor(self) -> Option<Constructor> {
        match self {
            ObjectTag::Process => Some(construct_process),
            ObjectTag::Thread => Some(construct_thread),
            ObjectTag::Token => Some(construct_token),
            _ => None,
        }
    }

    fn release_hook(self) -> Option<ReleaseHook> {
        match self {
            ObjectTag::Driver => Some(release_driver),
            _ => None,
        }
    }

    #[inline]
    pub fn is_constructible(self) -> bool {
        self.constructor().is_some()
    }
}

#[derive(Debug, Clone)]
pub enum ObjectPayload {
    File(Arc<FileObject>),
    Device(Arc<DeviceObject>),
    Driver(Arc<DriverObject>),
    Process(Arc<ProcessObject>),
    Thread(Arc<ThreadObject>),
    Token(Arc<TokenObject>),
}

impl ObjectPayload {
    pub fn tag(&self) -> ObjectTag {
        match self {
            ObjectPayload::File(_) => ObjectTag::File,
            ObjectPayload::Device(_) => ObjectTag::Device,
            ObjectPayload::Driver(_) => ObjectTag::Driver,
            ObjectPayload::Process(_) => ObjectTag::Process,
            ObjectPayload::Thread(_) => ObjectTag::Thread,
            ObjectPayload::Token(_) => ObjectTag::Token,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileObject>> {
        match self {
            ObjectPayload::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<&Arc<DeviceObject>> {
        match self {
            ObjectPayload::Device(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_driver(&self) -> Option<&Arc<DriverObject>> {
        match self {
            ObjectPayload::Driver(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&Arc<ProcessObject>> {
        match self {
            ObjectPayload::Process(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Arc<ThreadObject>> {
        match self {
            ObjectPayload::Thread(t) => Some(t),
            _ => None,
        }
    }
}

struct ObjectEntry {
    tag: ObjectTag,
    payload: ObjectPayload,
    refcount: u32,
    handle: Option<RemoteHandle>,
    /// The channel holds an id mapping for this object and must be told
    /// about 0<->1 transitions.
    external: bool,
}

/// Reference-counted kernel objects keyed by id.
///
/// One lock guards every refcount and both directions of the id/handle
/// mapping, so a successful lookup and its reference increment are a single
/// step. Channel calls made from here run while that lock is held.
pub struct ObjectTable {
    entries: Mutex<HashMap<ObjectId, ObjectEntry>>,
    next_id: AtomicU64,
    channel: Arc<dyn RequestChannel>,
}

impl ObjectTable {
    pub fn new(channel: Arc<dyn RequestChannel>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0x1000),
            channel,
        })
    }

    #[inline]
    fn alloc_id(&self) -> ObjectId {
        self.next_id.fetch_add(0x10, Ordering::Relaxed)
    }

    /// Creates an object with `initial_ref` references. With a handle the
    /// id<->handle mapping is registered with the channel first and its
    /// failure is returned unchanged.
    pub fn alloc<F>(
        &self,
        tag: ObjectTag,
        handle: Option<RemoteHandle>,
        initial_ref: u32,
        build: F,
    ) -> Result<ObjectPayload, DriverStatus>
    where
        F: FnOnce(ObjectId) -> ObjectPayload,
    {
        let id = self.alloc_id();
        let payload = build(id);
        if payload.tag() != tag {
            error!("object {:#x}: built {} for a {} slot", id, payload.tag(), tag);
            return Err(DriverStatus::ObjectTypeMismatch);
        }
        let mut entries = self.entries.lock();
        if let Some(h) = handle {
            self.channel.register_pointer(h, id)?;
        }
        entries.insert(
            id,
            ObjectEntry {
                tag,
                payload: payload.clone(),
                refcount: initial_ref,
                handle,
                external: handle.is_some(),
            },
        );
        trace!("alloc {} {:#x} handle {:?} refs {}", tag, id, handle, initial_ref);
        Ok(payload)
    }

    /// Registers an object the channel never hears about. Cannot fail, so it
    /// backs objects the manager itself depends on.
    pub(crate) fn insert_local<T>(
        &self,
        initial_ref: u32,
        build: impl FnOnce(ObjectId) -> Arc<T>,
        wrap: fn(Arc<T>) -> ObjectPayload,
    ) -> Arc<T> {
        let id = self.alloc_id();
        let obj = build(id);
        let payload = wrap(obj.clone());
        let tag = payload.tag();
        self.entries.lock().insert(
            id,
            ObjectEntry {
                tag,
                payload,
                refcount: initial_ref,
                handle: None,
                external: false,
            },
        );
        trace!("alloc {} {:#x} local refs {}", tag, id, initial_ref);
        obj
    }

    /// Marks an object as known to the channel after it was registered
    /// through some other call, e.g. naming a device.
    pub(crate) fn mark_external(&self, id: ObjectId) -> bool {
        match self.entries.lock().get_mut(&id) {
            Some(e) => {
                e.external = true;
                true
            }
            None => false,
        }
    }

    /// Drops a half-built object without running any release path.
    pub(crate) fn discard(&self, id: ObjectId) {
        self.entries.lock().remove(&id);
    }

    fn grab_locked(
        channel: &dyn RequestChannel,
        id: ObjectId,
        entry: &mut ObjectEntry,
    ) -> Result<(), DriverStatus> {
        entry.refcount += 1;
        if entry.refcount == 1 && entry.external {
            if let Err(e) = channel.grab_pointer(id) {
                entry.refcount -= 1;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn reference(&self, id: ObjectId) -> Result<(), DriverStatus> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(DriverStatus::InvalidHandle)?;
        Self::grab_locked(&*self.channel, id, entry)?;
        trace!("reference {} {:#x} -> {}", entry.tag, id, entry.refcount);
        Ok(())
    }

    /// Returns the remaining count.
    pub fn dereference(&self, id: ObjectId) -> Result<u32, DriverStatus> {
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(&id) {
            Some(e) => e,
            None => {
                error!("dereference of unknown object {:#x}", id);
                return Err(DriverStatus::InvalidHandle);
            }
        };
        if entry.refcount == 0 {
            error!("dereference of released {} {:#x}", entry.tag, id);
            return Err(DriverStatus::InvalidParameter);
        }
        entry.refcount -= 1;
        let (tag, external, left) = (entry.tag, entry.external, entry.refcount);
        trace!("dereference {} {:#x} -> {}", tag, id, left);
        if left > 0 {
            return Ok(left);
        }

        if let Some(hook) = tag.release_hook() {
            if let Some(removed) = entries.remove(&id) {
                drop(entries);
                hook(&removed.payload);
            }
        } else if external {
            if let Err(e) = self.channel.release_pointer(id) {
                warn!("channel refused release of {} {:#x}: {}", tag, id, e);
            }
        } else {
            entries.remove(&id);
        }
        Ok(0)
    }

    pub fn lookup_by_handle(
        self: &Arc<Self>,
        handle: RemoteHandle,
        expected: Option<ObjectTag>,
    ) -> Result<ObRef, DriverStatus> {
        let mut entries = self.entries.lock();
        let id = match self.channel.lookup_pointer(handle)? {
            Some(id) => id,
            None => {
                let name = self.channel.query_object_type(handle)?;
                let tag = ObjectTag::from_type_name(&name).ok_or_else(|| {
                    warn!("handle {:?}: unknown object type {}", handle, name);
                    DriverStatus::InvalidHandle
                })?;
                if expected.is_some_and(|e| e != tag) {
                    return Err(DriverStatus::ObjectTypeMismatch);
                }
                let ctor = tag.constructor().ok_or_else(|| {
                    warn!("handle {:?}: {} objects are not constructed on lookup", handle, tag);
                    DriverStatus::InvalidHandle
                })?;
                let id = self.alloc_id();
                let payload = ctor(id, handle);
                self.channel.register_pointer(handle, id)?;
                entries.insert(
                    id,
                    ObjectEntry {
                        tag,
                        payload,
                        refcount: 0,
                        handle: Some(handle),
                        external: true,
                    },
                );
                trace!("constructed {} {:#x} for handle {:?}", tag, id, handle);
                id
            }
        };
        let entry = entries.get_mut(&id).ok_or(DriverStatus::InvalidHandle)?;
        if expected.is_some_and(|e| e != entry.tag) {
            return Err(DriverStatus::ObjectTypeMismatch);
        }
        Self::grab_locked(&*self.channel, id, entry)?;
        Ok(ObRef::new(self.clone(), id, entry.payload.clone()))
    }

    /// Resolves an id the channel handed back (a "user pointer").
    pub fn lookup_by_id(
        self: &Arc<Self>,
        id: ObjectId,
        expected: Option<ObjectTag>,
    ) -> Result<ObRef, DriverStatus> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(DriverStatus::InvalidHandle)?;
        if expected.is_some_and(|e| e != entry.tag) {
            return Err(DriverStatus::ObjectTypeMismatch);
        }
        Self::grab_locked(&*self.channel, id, entry)?;
        Ok(ObRef::new(self.clone(), id, entry.payload.clone()))
    }

    /// Resolves an id without taking a reference. The caller must already
    /// know the object is alive, e.g. because the channel still maps it.
    pub fn get(&self, id: ObjectId, expected: Option<ObjectTag>) -> Result<ObjectPayload, DriverStatus> {
        let entries = self.entries.lock();
        let entry = entries.get(&id).ok_or(DriverStatus::InvalidHandle)?;
        if expected.is_some_and(|e| e != entry.tag) {
            return Err(DriverStatus::ObjectTypeMismatch);
        }
        Ok(entry.payload.clone())
    }

    /// Final removal once the channel dropped its mapping. Objects that were
    /// re-referenced in the meantime are kept.
    pub fn free(&self, id: ObjectId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            Some(e) if e.refcount != 0 => {
                warn!("not freeing {} {:#x}: {} live references", e.tag, id, e.refcount);
                false
            }
            Some(_) => {
                if let Some(e) = entries.remove(&id) {
                    trace!("free {} {:#x} handle {:?}", e.tag, id, e.handle);
                }
                true
            }
            None => false,
        }
    }

    /// Drops every entry. Variant release hooks still run.
    pub fn clear(&self) -> usize {
        let drained: Vec<ObjectEntry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, e)| e).collect()
        };
        for e in &drained {
            if let Some(hook) = e.tag.release_hook() {
                hook(&e.payload);
            }
        }
        drained.len()
    }

    pub fn refcount(&self, id: ObjectId) -> Option<u32> {
        self.entries.lock().get(&id).map(|e| e.refcount)
    }

    pub fn handle_of(&self, id: ObjectId) -> Option<RemoteHandle> {
        self.entries.lock().get(&id).and_then(|e| e.handle)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One counted reference, dropped with the guard.
pub struct ObRef {
    table: Arc<ObjectTable>,
    id: ObjectId,
    payload: ObjectPayload,
    armed: bool,
}

impl ObRef {
    fn new(table: Arc<ObjectTable>, id: ObjectId, payload: ObjectPayload) -> Self {
        Self {
            table,
            id,
            payload,
            armed: true,
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn payload(&self) -> &ObjectPayload {
        &self.payload
    }

    /// Keeps the reference counted past the guard's lifetime. Balance it
    /// with [`ObjectTable::dereference`].
    pub fn into_raw(mut self) -> ObjectId {
        self.armed = false;
        self.id
    }
}

impl Deref for ObRef {
    type Target = ObjectPayload;
    fn deref(&self) -> &ObjectPayload {
        &self.payload
    }
}

impl core::fmt::Debug for ObRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObRef")
            .field("id", &self.id)
            .field("tag", &self.payload.tag())
            .finish()
    }
}

impl Drop for ObRef {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.table.dereference(self.id);
        }
    }
}
