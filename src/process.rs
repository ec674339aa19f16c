use alloc::sync::Arc;
use std::thread::ThreadId;

use crate::object_manager::{ObjectId, RemoteHandle};

#[derive(Debug)]
pub struct ProcessObject {
    pub id: ObjectId,
    pub handle: Option<RemoteHandle>,
}

impl ProcessObject {
    pub fn new(id: ObjectId, handle: Option<RemoteHandle>) -> Self {
        Self { id, handle }
    }
}

#[derive(Debug)]
pub struct ThreadObject {
    pub id: ObjectId,
    pub handle: Option<RemoteHandle>,
    /// Host thread backing this object, `None` for client threads known only
    /// by handle.
    pub os_thread: Option<ThreadId>,
    pub process: Option<Arc<ProcessObject>>,
}

impl ThreadObject {
    pub fn new(
        id: ObjectId,
        handle: Option<RemoteHandle>,
        os_thread: Option<ThreadId>,
        process: Option<Arc<ProcessObject>>,
    ) -> Self {
        Self {
            id,
            handle,
            os_thread,
            process,
        }
    }
}

#[derive(Debug)]
pub struct TokenObject {
    pub id: ObjectId,
    pub handle: Option<RemoteHandle>,
}
