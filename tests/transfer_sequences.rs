//! Property test: arbitrary submit/complete/cancel sequences preserve
//! the lifecycle invariants — the callback fires exactly once per
//! submission that reached `Active`, and the state settles to
//! `Inactive` unless a submission is outstanding.

mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use usb_core::error::{TransferError, UsbError};
use usb_core::transfer::{transfer_flags, TransferState, UsbTransfer};
use usb_core::types::TransferDirection;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn submit_complete_cancel_sequences(ops in proptest::collection::vec(0u8..3, 1..12)) {
        let rig = util::rig(1);
        rig.state.auto_complete.store(false, Ordering::SeqCst);
        let device = rig.plain_device();
        let buffer = rig.controller.pool().alloc(64).unwrap();

        let transfer =
            UsbTransfer::allocate(&device, 0x81, 64, transfer_flags::NONE).unwrap();
        transfer.set_buffer(buffer.region(0, 64).unwrap(), 8);
        transfer.set_direction(TransferDirection::In);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            transfer.set_callback(Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let mut expected_callbacks = 0usize;
        let mut active = false;

        for op in ops {
            match op {
                // Submit.
                0 => {
                    let result = transfer.submit();
                    if active {
                        prop_assert_eq!(
                            result.unwrap_err(),
                            UsbError::Transfer(TransferError::DoubleSubmitted)
                        );
                    } else {
                        prop_assert!(result.is_ok());
                        active = true;
                    }
                }
                // Complete from "hardware".
                1 => {
                    if rig.state.pending_count() > 0 {
                        rig.state.complete_next(TransferError::None, 8);
                        rig.kernel.wait_idle();
                        expected_callbacks += 1;
                        active = false;
                    }
                }
                // Cancel.
                _ => {
                    let result = transfer.cancel(true);
                    if active {
                        prop_assert!(result.is_ok());
                        expected_callbacks += 1;
                        active = false;
                    } else {
                        prop_assert_eq!(result.unwrap_err(), UsbError::TooEarly);
                    }
                }
            }
        }

        while rig.state.pending_count() > 0 {
            rig.state.complete_next(TransferError::None, 8);
            expected_callbacks += 1;
            active = false;
        }
        rig.kernel.wait_idle();

        prop_assert_eq!(calls.load(Ordering::SeqCst), expected_callbacks);
        let settled = transfer.state();
        if active {
            prop_assert_eq!(settled, TransferState::Active);
        } else {
            prop_assert_eq!(settled, TransferState::Inactive);
        }
    }
}
