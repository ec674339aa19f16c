mod common;

use std::sync::Arc;
use std::thread;

use common::{device, driver, local_manager};
use kernel_io::process::ProcessObject;
use kernel_io::{
    DriverStatus, IoManager, NextRequest, ObjectPayload, ObjectTag, PreviousRequest, RequestChannel,
};

fn no_previous() -> PreviousRequest {
    PreviousRequest {
        handle: None,
        irp: None,
        status: DriverStatus::Success,
    }
}

#[test]
fn refcount_never_drops_to_zero_while_a_reference_is_held() {
    let (ch, io) = local_manager();
    let table = io.objects().clone();
    let h = ch.create_handle("Process");

    let held = table.lookup_by_handle(h, Some(ObjectTag::Process)).unwrap();
    let id = held.id();
    assert_eq!(table.refcount(id), Some(1));
    assert_eq!(ch.grabbed_count(id), 1);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let table = table.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let r = table.lookup_by_handle(h, None).unwrap();
                    assert!(r.as_process().is_some());
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(table.refcount(id), Some(1));
    assert_eq!(ch.grabbed_count(id), 1);
    assert_eq!(ch.released_count(id), 0);

    drop(held);
    assert_eq!(table.refcount(id), Some(0));
    assert_eq!(ch.released_count(id), 1);
    // Still in the table until the channel confirms with a free request.
    assert!(table.contains(id));
}

#[test]
fn released_objects_are_freed_once_the_channel_drops_them() {
    let (ch, io) = local_manager();
    let table = io.objects().clone();
    let h = ch.create_handle("Process");
    let first = table.lookup_by_handle(h, None).unwrap().id();

    let mut buf = [0u8; 16];
    match ch.get_next_request(no_previous(), &mut buf) {
        NextRequest::Request(r) => assert_eq!(r.params, kernel_io::IrpParams::Free { obj: first }),
        other => panic!("expected a free request, got {:?}", other),
    }
    assert!(table.free(first));
    assert!(!table.contains(first));

    // The handle resolves to a fresh object afterwards.
    let again = table.lookup_by_handle(h, None).unwrap();
    assert_ne!(again.id(), first);
    assert_eq!(ch.grabbed_count(again.id()), 1);
}

#[test]
fn free_keeps_an_object_referenced_again_in_between() {
    let (ch, io) = local_manager();
    let table = io.objects().clone();
    let h = ch.create_handle("Thread");
    let id = table.lookup_by_handle(h, None).unwrap().id();
    assert_eq!(ch.released_count(id), 1);

    let again = table.lookup_by_handle(h, Some(ObjectTag::Thread)).unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(ch.grabbed_count(id), 2);
    assert!(!table.free(id));
    assert!(table.contains(id));
}

#[test]
fn lookups_check_handles_and_types() {
    let (ch, io) = local_manager();
    let table = io.objects().clone();
    let process = ch.create_handle("Process");
    let file = ch.create_handle("File");
    let before = table.len();

    assert_eq!(
        table.lookup_by_handle(process, Some(ObjectTag::Thread)).err(),
        Some(DriverStatus::ObjectTypeMismatch)
    );
    assert_eq!(
        table.lookup_by_handle(file, None).err(),
        Some(DriverStatus::InvalidHandle)
    );
    assert_eq!(
        table
            .lookup_by_handle(kernel_io::RemoteHandle(0xfff0), None)
            .err(),
        Some(DriverStatus::InvalidHandle)
    );
    assert_eq!(table.lookup_by_id(0xdead, None).err(), Some(DriverStatus::InvalidHandle));

    // A refused typed lookup builds nothing; the handle keeps its own type.
    assert_eq!(table.len(), before);
    assert_eq!(ch.lookup_pointer(process), Ok(None));
    let r = table.lookup_by_handle(process, None).unwrap();
    assert_eq!(r.tag(), ObjectTag::Process);
    assert_eq!(
        table.lookup_by_handle(process, Some(ObjectTag::Thread)).err(),
        Some(DriverStatus::ObjectTypeMismatch)
    );
}

#[test]
fn objects_unknown_to_the_channel_go_away_on_the_last_dereference() {
    let (ch, io) = local_manager();
    let table = io.objects().clone();
    let payload = table
        .alloc(ObjectTag::Process, None, 1, |id| {
            ObjectPayload::Process(Arc::new(ProcessObject::new(id, None)))
        })
        .unwrap();
    let id = payload.as_process().unwrap().id;

    let raw = table.lookup_by_id(id, Some(ObjectTag::Process)).unwrap().into_raw();
    assert_eq!(table.refcount(raw), Some(2));
    table.reference(id).unwrap();
    assert_eq!(table.dereference(raw), Ok(2));
    assert_eq!(table.dereference(raw), Ok(1));
    assert_eq!(table.dereference(id), Ok(0));
    assert!(!table.contains(id));
    assert_eq!(ch.released_count(id), 0);
    assert_eq!(table.dereference(id), Err(DriverStatus::InvalidHandle));
}

#[test]
fn driver_objects_drop_their_extensions_with_the_last_reference() {
    let (_ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\ext", |_| {});
    drv.allocate_extension(7, 42u32).unwrap();
    assert_eq!(drv.allocate_extension(7, 1u32).err(), Some(DriverStatus::ObjectNameCollision));
    assert_eq!(drv.extension::<u32>(7).as_deref(), Some(&42));

    io.delete_driver(&drv);
    assert!(io.driver("\\Driver\\ext").is_none());
    assert!(!io.objects().contains(drv.id));
    assert!(drv.extension::<u32>(7).is_none());
}

#[test]
fn stack_sizes_grow_with_each_attached_layer() {
    let (_ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\layers", |_| {});
    let devs: Vec<_> = (0..6).map(|_| device(&io, &drv)).collect();

    for i in 1..devs.len() {
        let prev_top = io.attach_to_stack(&devs[i], &devs[0]).unwrap();
        assert!(Arc::ptr_eq(&prev_top, &devs[i - 1]));
    }
    for (i, d) in devs.iter().enumerate() {
        assert_eq!(d.stack_size() as usize, i + 1);
        if i > 0 {
            assert!(d.stack_size() > devs[i - 1].stack_size());
        }
    }
    assert!(Arc::ptr_eq(&IoManager::top_of_stack(&devs[0]), &devs[5]));
    assert_eq!(
        io.attach_to_stack(&devs[0], &devs[3]).err(),
        Some(DriverStatus::InvalidParameter)
    );

    io.detach(&devs[4]);
    assert!(devs[5].lower_device().is_none());
    assert!(Arc::ptr_eq(&IoManager::top_of_stack(&devs[0]), &devs[4]));
    assert_eq!(devs[5].stack_size(), 6);
}

#[test]
fn top_of_stack_reference_counts_the_top_device() {
    let (_ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\layers", |_| {});
    let bottom = device(&io, &drv);
    let top = device(&io, &drv);
    io.attach_to_stack(&top, &bottom).unwrap();

    let before = io.objects().refcount(top.id).unwrap();
    let r = io.top_of_stack_reference(&bottom).unwrap();
    assert_eq!(r.id(), top.id);
    assert_eq!(io.objects().refcount(top.id), Some(before + 1));
    drop(r);
    assert_eq!(io.objects().refcount(top.id), Some(before));
}

#[test]
fn system_process_lives_in_the_table() {
    let (ch, io) = local_manager();
    let id = io.system_process().id;
    let r = io.objects().lookup_by_id(id, Some(ObjectTag::Process)).unwrap();
    assert!(Arc::ptr_eq(r.as_process().unwrap(), io.system_process()));
    assert_eq!(io.objects().refcount(id), Some(2));
    drop(r);
    assert_eq!(io.objects().refcount(id), Some(1));
    assert_eq!(ch.grabbed_count(id), 0);
    let thread = io.current_thread().unwrap();
    assert!(Arc::ptr_eq(thread.process.as_ref().unwrap(), io.system_process()));
}
