//! The paging-device completion path: transfers flagged for the paging
//! device complete through the dedicated queue whose worker runs on the
//! private paging work queue.

mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use usb_core::error::TransferError;
use usb_core::transfer::{transfer_flags, TransferState, UsbTransfer};
use usb_core::types::TransferDirection;

#[test]
fn paging_transfers_complete_through_private_queue() {
    let rig = util::rig(2);
    rig.state.auto_complete.store(false, Ordering::SeqCst);
    let device = rig.plain_device();
    let buffer = rig.controller.pool().alloc(64).unwrap();

    let transfer =
        UsbTransfer::allocate(&device, 0x81, 64, transfer_flags::PAGING_DEVICE).unwrap();
    transfer.set_buffer(buffer.region(0, 64).unwrap(), 8);
    transfer.set_direction(TransferDirection::In);
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        transfer.set_callback(Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
    }

    transfer.submit().unwrap();
    rig.state.complete_next(TransferError::None, 8);
    rig.kernel.wait_idle();

    assert_eq!(rig.kernel.paging_items.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(transfer.state(), TransferState::Inactive);

    // The singleton queue serves subsequent completions too.
    transfer.submit().unwrap();
    rig.state.complete_next(TransferError::None, 8);
    rig.kernel.wait_idle();
    assert_eq!(rig.kernel.paging_items.load(Ordering::SeqCst), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn ordinary_transfers_do_not_touch_the_paging_queue() {
    let rig = util::rig(2);
    rig.state.auto_complete.store(false, Ordering::SeqCst);
    let device = rig.plain_device();
    let buffer = rig.controller.pool().alloc(64).unwrap();

    let transfer = UsbTransfer::allocate(&device, 0x81, 64, transfer_flags::NONE).unwrap();
    transfer.set_buffer(buffer.region(0, 64).unwrap(), 8);
    transfer.set_direction(TransferDirection::In);
    transfer.set_callback(Arc::new(|_| {}));

    transfer.submit().unwrap();
    rig.state.complete_next(TransferError::None, 8);
    rig.kernel.wait_idle();

    assert_eq!(rig.kernel.paging_items.load(Ordering::SeqCst), 0);
    assert_eq!(transfer.state(), TransferState::Inactive);
}
