extern crate alloc;

pub mod builders;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod event;
pub mod io;
pub mod loader;
pub mod manager;
pub mod object_manager;
pub mod process;
pub mod remove_lock;
pub mod request;
pub mod routing;
pub mod status;
pub mod work_item;

pub use builders::DeviceControl;
pub use cancel::{CancelLock, CancelRoutine};
pub use channel::{
    IncomingRequest, IrpParams, LocalChannel, NextRequest, PreviousRequest, RequestChannel, RequestResult,
};
pub use config::IoConfig;
pub use device::{
    DevExtError, DeviceCharacteristics, DeviceFlags, DeviceObject, DeviceType, DriverConfig, DriverObject,
    FileObject,
};
pub use dispatcher::{DispatchContext, Dispatcher, DispatcherHandle};
pub use event::{EventType, KEvent, Notifier, WaitResult, WaitSet};
pub use io::{ctl_code, DispatchRoutine, DispatchTable, DriverUnload, MajorFunction, TransferMethod, TraversalPolicy};
pub use loader::{BuiltinLoader, DriverEntry, DriverLoader, LoadedModule};
pub use manager::IoManager;
pub use object_manager::{ObRef, ObjectId, ObjectPayload, ObjectTable, ObjectTag, RemoteHandle};
pub use remove_lock::RemoveLock;
pub use request::{
    allocate_mdl, AllocationFlags, CancelState, CompletionRoutine, IoBuffer, IoParameters, IoStackLocation,
    IoStatusBlock, Irp, IrpFlags, IrpId, Mdl, MdlFlags, ProcessorMode, StackControl, UserIosb,
};
pub use routing::{forward_to_lower, unhandled_irp};
pub use status::DriverStatus;
pub use work_item::WorkItem;
