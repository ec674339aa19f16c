mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use common::{device, driver, local_manager, wait_until};
use kernel_io::{DriverStatus, IoBuffer, IoStatusBlock, KEvent, MajorFunction, RemoveLock, WorkItem};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn release_and_wait_blocks_until_the_last_holder_leaves() {
    let lock = Arc::new(RemoveLock::new());
    lock.acquire().unwrap();
    lock.acquire().unwrap();

    let ready = KEvent::notification();
    let remover = {
        let (lock, ready) = (lock.clone(), ready.clone());
        thread::spawn(move || {
            lock.acquire().unwrap();
            ready.set();
            lock.release_and_wait();
        })
    };
    assert!(ready.wait_timeout(WAIT));
    assert!(wait_until(|| lock.is_removed()));
    thread::sleep(Duration::from_millis(50));
    assert!(!remover.is_finished());

    assert_eq!(lock.acquire(), Err(DriverStatus::DeletePending));
    lock.release();
    thread::sleep(Duration::from_millis(20));
    assert!(!remover.is_finished());

    lock.release();
    remover.join().unwrap();
    assert_eq!(lock.io_count(), 0);
    assert_eq!(lock.acquire(), Err(DriverStatus::DeletePending));
}

#[test]
fn pended_read_is_finished_from_a_work_item() {
    let (_ch, io) = local_manager();
    let slot: Arc<OnceLock<Arc<WorkItem>>> = Arc::new(OnceLock::new());
    let s = slot.clone();
    let drv = driver(&io, "\\Driver\\deferred", move |cfg| {
        cfg.on(MajorFunction::Read, move |io, _, irp| {
            let Some(item) = s.get() else {
                return DriverStatus::DeviceNotReady;
            };
            irp.mark_pending();
            let irp = irp.clone();
            let queued = io.queue_work_item(item, move |io, _dev| {
                let n = irp.system_buffer().map_or(0, |b| b.copy_from(0, b"later"));
                irp.set_io_status(IoStatusBlock {
                    status: DriverStatus::Success,
                    information: n,
                });
                io.complete_request(&irp, 0);
            });
            match queued {
                Ok(()) => DriverStatus::Pending,
                Err(e) => e,
            }
        });
    });
    let dev = device(&io, &drv);
    let item = io.allocate_work_item(&dev);
    assert!(Arc::ptr_eq(item.device(), &dev));
    slot.set(item.clone()).unwrap();

    for _ in 0..2 {
        let buf = IoBuffer::new(16);
        let ev = KEvent::notification();
        let iosb = Arc::new(spin::Mutex::new(IoStatusBlock::default()));
        let irp = io
            .build_synchronous_fsd_request(
                MajorFunction::Read,
                &dev,
                Some(buf.clone()),
                16,
                Some(0),
                Some(ev.clone()),
                Some(iosb.clone()),
            )
            .unwrap();
        assert_eq!(io.call_driver(&dev, &irp), DriverStatus::Pending);
        assert!(ev.wait_timeout(WAIT));
        assert_eq!(iosb.lock().information, 5);
        assert_eq!(&buf.to_vec()[..5], b"later");
        // The same item serves the next request once its routine returned.
        assert!(wait_until(|| !item.is_queued()));
    }
    assert!(wait_until(|| io.live_irps() == 0));
    io.free_work_item(item);
}

#[test]
fn queued_item_holds_its_device_until_it_ran() {
    let (_ch, io) = local_manager();
    let drv = driver(&io, "\\Driver\\held", |_| {});
    let dev = device(&io, &drv);
    let item = io.allocate_work_item(&dev);
    let before = io.objects().refcount(dev.id).unwrap();

    let gate = KEvent::notification();
    let ran = Arc::new(AtomicUsize::new(0));
    let (g, r) = (gate.clone(), ran.clone());
    io.queue_work_item(&item, move |_, _| {
        g.wait();
        r.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert!(item.is_queued());
    assert_eq!(io.objects().refcount(dev.id), Some(before + 1));
    assert_eq!(
        io.queue_work_item(&item, |_, _| {}).err(),
        Some(DriverStatus::InvalidDeviceRequest)
    );

    gate.set();
    assert!(wait_until(|| io.objects().refcount(dev.id) == Some(before)));
    assert!(!item.is_queued());
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    io.shutdown();
    let late = io.allocate_work_item(&dev);
    assert!(io.queue_work_item(&late, |_, _| {}).is_err());
    assert!(!late.is_queued());
}
