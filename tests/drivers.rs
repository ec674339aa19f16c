mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{device, driver, local_manager, named_device};
use kernel_io::{
    BuiltinLoader, DevExtError, DeviceCharacteristics, DeviceType, DriverObject, DriverStatus, IoManager,
};

const NULL_SYS: &str = "C:\\windows\\system32\\drivers\\null.sys";

fn null_device(io: &Arc<IoManager>, drv: &Arc<DriverObject>) -> DriverStatus {
    DriverStatus::from(io.create_device(
        drv,
        0,
        Some("\\Device\\Null"),
        DeviceType::NULL,
        DeviceCharacteristics::empty(),
        false,
    ))
}

fn loader_with_null(registry: Arc<Mutex<Option<String>>>) -> Arc<BuiltinLoader> {
    let loader = Arc::new(BuiltinLoader::new());
    loader.register("null", NULL_SYS, move |io, drv, reg| {
        *registry.lock().unwrap() = Some(reg.to_string());
        DriverObject::configure(drv, |cfg| {
            cfg.on_unload(|io, drv| {
                for d in drv.devices() {
                    if let Err(e) = io.delete_device(&d) {
                        return e;
                    }
                }
                DriverStatus::Success
            });
        });
        null_device(io, drv)
    });
    loader
}

#[test]
fn service_drivers_load_and_unload_through_the_loader() {
    let (ch, io) = local_manager();
    let registry = Arc::new(Mutex::new(None));
    let loader = loader_with_null(registry.clone());
    io.set_loader(loader.clone());

    let drv = io.load_driver("null").unwrap();
    assert_eq!(drv.driver_name, "\\Driver\\null");
    assert_eq!(drv.service_name.as_deref(), Some("null"));
    assert_eq!(drv.module().map(|m| m.path.as_str()), Some(NULL_SYS));
    assert_eq!(
        registry.lock().unwrap().as_deref(),
        Some("\\Registry\\Machine\\System\\CurrentControlSet\\Services\\null")
    );
    assert_eq!(loader.load_count(NULL_SYS), 1);
    let dev = drv.devices().pop().unwrap();
    assert_eq!(ch.device_name(dev.id).as_deref(), Some("\\Device\\Null"));

    assert_eq!(io.load_driver("null").err(), Some(DriverStatus::ImageAlreadyLoaded));
    assert_eq!(loader.load_count(NULL_SYS), 1);

    io.unload_driver("null").unwrap();
    assert!(io.driver("\\Driver\\null").is_none());
    assert!(!ch.has_device(dev.id));
    assert_eq!(loader.load_count(NULL_SYS), 0);
    assert_eq!(io.unload_driver("null"), Err(DriverStatus::ObjectNameNotFound));

    // The service can be loaded again once it is gone.
    io.load_driver("null").unwrap();
    assert_eq!(loader.load_count(NULL_SYS), 1);
}

#[test]
fn load_failures_leave_nothing_behind() {
    let (_ch, io) = local_manager();
    assert_eq!(io.load_driver("null").err(), Some(DriverStatus::DriverUnableToLoad));

    let loader = Arc::new(BuiltinLoader::new());
    loader.register_image("bare.sys", None);
    loader.bind_service("bare", "bare.sys");
    loader.bind_service("ghost", "ghost.sys");
    loader.register("broken", "broken.sys", |_, _, _| DriverStatus::InsufficientResources);
    io.set_loader(loader.clone());

    assert_eq!(io.load_driver("missing").err(), Some(DriverStatus::ObjectNameNotFound));
    assert_eq!(io.load_driver("ghost").err(), Some(DriverStatus::NoSuchFile));
    assert_eq!(io.load_driver("bare").err(), Some(DriverStatus::DriverUnableToLoad));
    assert_eq!(loader.load_count("bare.sys"), 0);
    assert_eq!(io.load_driver("broken").err(), Some(DriverStatus::InsufficientResources));
    assert_eq!(loader.load_count("broken.sys"), 0);
    assert!(io.drivers().is_empty());
}

#[test]
fn unload_needs_a_routine_that_succeeds() {
    let (_ch, io) = local_manager();
    let loader = Arc::new(BuiltinLoader::new());
    loader.register("plain", "plain.sys", |_, _, _| DriverStatus::Success);
    loader.register("stubborn", "stubborn.sys", |_, drv, _| {
        DriverObject::configure(drv, |cfg| {
            cfg.on_unload(|_, _| DriverStatus::Unsuccessful);
        });
        DriverStatus::Success
    });
    io.set_loader(loader.clone());
    io.load_driver("plain").unwrap();
    io.load_driver("stubborn").unwrap();

    assert_eq!(io.unload_driver("plain"), Err(DriverStatus::InvalidDeviceRequest));
    assert!(io.driver("\\Driver\\plain").is_some());
    assert_eq!(io.unload_driver("stubborn"), Err(DriverStatus::Unsuccessful));
    assert!(io.driver("\\Driver\\stubborn").is_some());
    assert_eq!(loader.load_count("stubborn.sys"), 1);
}

#[test]
fn duplicate_driver_names_collide() {
    let (_ch, io) = local_manager();
    driver(&io, "\\Driver\\dup", |_| {});
    let before = io.objects().len();
    assert_eq!(
        io.create_driver("\\Driver\\dup", |_, _, _| DriverStatus::Success)
            .err(),
        Some(DriverStatus::ObjectNameCollision)
    );
    assert_eq!(io.objects().len(), before);
}

#[test]
fn autogenerated_names_skip_taken_ones() {
    let (ch, io) = local_manager();
    ch.reserve_device_name("\\Device\\00000000");
    let drv = driver(&io, "\\Driver\\auto", |_| {});
    let names: Vec<_> = (0..2)
        .map(|_| {
            io.create_device(
                &drv,
                0,
                None,
                DeviceType::UNKNOWN,
                DeviceCharacteristics::AUTOGENERATED_NAME,
                false,
            )
            .unwrap()
            .name()
        })
        .collect();
    assert_eq!(
        names,
        vec![
            Some("\\Device\\00000001".to_string()),
            Some("\\Device\\00000002".to_string()),
        ]
    );
}

#[test]
fn named_devices_collide_and_release_their_slot() {
    let (ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\named", |_| {});
    let first = named_device(&io, &drv, "\\Device\\Beep");
    let before = io.objects().len();
    assert_eq!(
        io.create_device(
            &drv,
            0,
            Some("\\Device\\Beep"),
            DeviceType::UNKNOWN,
            DeviceCharacteristics::empty(),
            false,
        )
        .err(),
        Some(DriverStatus::ObjectNameCollision)
    );
    assert_eq!(io.objects().len(), before);
    assert_eq!(drv.devices().len(), 1);

    io.delete_device(&first).unwrap();
    assert!(!ch.has_device(first.id));
    assert_eq!(ch.released_count(first.id), 1);
    named_device(&io, &drv, "\\Device\\Beep");
}

#[test]
fn device_list_is_newest_first() {
    let (_ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\list", |_| {});
    let devs: Vec<_> = (0..3).map(|_| device(&io, &drv)).collect();
    let ids = |d: &Arc<DriverObject>| d.devices().iter().map(|x| x.id).collect::<Vec<_>>();

    assert_eq!(ids(&drv), vec![devs[2].id, devs[1].id, devs[0].id]);
    io.delete_device(&devs[1]).unwrap();
    assert_eq!(ids(&drv), vec![devs[2].id, devs[0].id]);
    assert!(Arc::ptr_eq(&devs[0].driver().unwrap(), &drv));
}

#[test]
fn device_extensions_and_contexts() {
    let (_ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\ext", |_| {});
    let dev = io
        .create_device(
            &drv,
            16,
            None,
            DeviceType::DISK,
            DeviceCharacteristics::REMOVABLE_MEDIA,
            true,
        )
        .unwrap();
    assert_eq!(dev.extension_size(), 16);
    dev.with_extension(|e| e[..4].copy_from_slice(&[1, 2, 3, 4]));
    assert_eq!(dev.with_extension(|e| e[3]), 4);
    assert!(dev.is_exclusive());
    dev.clear_flags(kernel_io::DeviceFlags::EXCLUSIVE);
    assert!(!dev.is_exclusive());

    assert_eq!(dev.context::<u64>().err(), Some(DevExtError::NotPresent));
    assert!(dev.set_context(7u64));
    assert!(!dev.set_context(8u64));
    assert_eq!(dev.context::<u64>(), Ok(&7));
    assert!(matches!(
        dev.context::<u32>(),
        Err(DevExtError::TypeMismatch { .. })
    ));
}

#[test]
fn shutdown_unloads_everything_once() {
    let (ch, io) = local_manager();
    let unloads = Arc::new(AtomicUsize::new(0));
    let u = unloads.clone();
    let failing = driver(&io, "\\Driver\\failing", move |cfg| {
        cfg.on_unload(move |_, _| {
            u.fetch_add(1, Ordering::SeqCst);
            DriverStatus::Unsuccessful
        });
    });
    let quiet = driver(&io, "\\Driver\\quiet", |_| {});
    let a = named_device(&io, &failing, "\\Device\\A");
    let b = device(&io, &quiet);
    io.attach_to_stack(&b, &a).unwrap();

    io.shutdown();
    assert!(!io.is_accepting());
    assert!(io.drivers().is_empty());
    assert!(io.objects().is_empty());
    assert!(!ch.has_device(a.id));
    assert!(!ch.has_device(b.id));
    assert_eq!(unloads.load(Ordering::SeqCst), 1);

    io.shutdown();
    assert_eq!(unloads.load(Ordering::SeqCst), 1);
}
