// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Once;
use std::time::Duration;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Receives with a generous deadline so a hung loop fails the test instead
/// of wedging the run.
pub fn recv_within<T>(rx: &Receiver<T>, timeout: Duration) -> T {
    rx.recv_timeout(timeout).expect("timed out waiting for event")
}
