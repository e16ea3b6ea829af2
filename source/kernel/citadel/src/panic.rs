// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Panic handler for freestanding kernel images.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log_error!(target: "panic", "{}", info);
    loop {
        core::hint::spin_loop();
    }
}
