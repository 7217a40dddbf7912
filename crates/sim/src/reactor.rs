//! Manual-clock reactor for deterministic tests.

use std::cell::RefCell;
use std::os::unix::io::RawFd;

use mcu_io::{FdCallback, FdHandle, Reactor};

struct FdEntry {
    handle: usize,
    #[allow(dead_code)]
    fd: RawFd,
    callback: FdCallback,
}

/// A reactor whose clock only moves when `pause` (or `advance`) is called.
/// File descriptors are never polled; tests fire their callbacks by hand
/// with [`SimReactor::dispatch_fd`].
pub struct SimReactor {
    now: RefCell<f64>,
    fds: RefCell<Vec<FdEntry>>,
    next_handle: RefCell<usize>,
}

impl SimReactor {
    pub fn new() -> SimReactor {
        SimReactor {
            now: RefCell::new(0.),
            fds: RefCell::new(Vec::new()),
            next_handle: RefCell::new(0),
        }
    }

    /// Move the clock forward by `dt` seconds.
    pub fn advance(&self, dt: f64) {
        *self.now.borrow_mut() += dt;
    }

    /// Invoke the callback registered under `handle` at the current
    /// eventtime, tolerating re-entrant reactor calls from inside it.
    pub fn dispatch_fd(&self, handle: FdHandle) {
        let callback = {
            let fds = self.fds.borrow();
            fds.iter()
                .find(|e| e.handle == handle.0)
                .map(|e| e.callback.clone())
        };
        if let Some(cb) = callback {
            cb(self.monotonic());
        }
    }
}

impl Default for SimReactor {
    fn default() -> Self {
        SimReactor::new()
    }
}

impl Reactor for SimReactor {
    fn register_fd(&self, fd: RawFd, callback: FdCallback) -> FdHandle {
        let mut next = self.next_handle.borrow_mut();
        let handle = *next;
        *next += 1;
        self.fds.borrow_mut().push(FdEntry {
            handle,
            fd,
            callback,
        });
        FdHandle(handle)
    }

    fn unregister_fd(&self, handle: FdHandle) {
        self.fds.borrow_mut().retain(|e| e.handle != handle.0);
    }

    fn monotonic(&self) -> f64 {
        *self.now.borrow()
    }

    fn pause(&self, waketime: f64) -> f64 {
        let mut now = self.now.borrow_mut();
        if waketime > *now {
            *now = waketime;
        }
        *now
    }
}
