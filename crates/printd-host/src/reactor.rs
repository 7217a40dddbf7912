//! poll(2)-based implementation of the cooperative reactor, plus thin
//! raw-fd read/write helpers shared with the G-code parser.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use tracing::warn;

use mcu_io::{FdCallback, FdHandle, Reactor};

/// Read from a raw descriptor, retrying on EINTR. Returns 0 on EOF or on
/// a hard error (which is logged).
pub(crate) fn fd_read(fd: RawFd, buf: &mut [u8]) -> usize {
    loop {
        let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if r >= 0 {
            return r as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            warn!(fd, error = %err, "read failed");
            return 0;
        }
    }
}

/// Write the whole buffer to a raw descriptor, retrying on EINTR.
pub(crate) fn fd_write(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        let r = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if r >= 0 {
            buf = &buf[r as usize..];
            continue;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            warn!(fd, error = %err, "write failed");
            return;
        }
    }
}

struct FdEntry {
    handle: usize,
    fd: RawFd,
    callback: FdCallback,
}

/// Single-threaded reactor driven by `poll(2)`. `pause` is the only
/// blocking point; fd callbacks are dispatched from inside it.
pub struct PollReactor {
    start: Instant,
    fds: RefCell<Vec<FdEntry>>,
    next_handle: Cell<usize>,
}

impl PollReactor {
    pub fn new() -> PollReactor {
        PollReactor {
            start: Instant::now(),
            fds: RefCell::new(Vec::new()),
            next_handle: Cell::new(0),
        }
    }

    fn dispatch(&self, handle: usize, eventtime: f64) {
        // Clone out of the registry so the callback may itself register,
        // unregister, or pause (and be dispatched again) re-entrantly.
        let callback = {
            let fds = self.fds.borrow();
            fds.iter()
                .find(|e| e.handle == handle)
                .map(|e| e.callback.clone())
        };
        if let Some(cb) = callback {
            cb(eventtime);
        }
    }
}

impl Default for PollReactor {
    fn default() -> Self {
        PollReactor::new()
    }
}

impl Reactor for PollReactor {
    fn register_fd(&self, fd: RawFd, callback: FdCallback) -> FdHandle {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
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
        self.start.elapsed().as_secs_f64()
    }

    fn pause(&self, waketime: f64) -> f64 {
        loop {
            let now = self.monotonic();
            if now >= waketime {
                return now;
            }
            let timeout_ms = (((waketime - now) * 1000.).ceil() as i64).clamp(1, 60_000) as i32;
            let polled: Vec<(usize, RawFd)> = self
                .fds
                .borrow()
                .iter()
                .map(|e| (e.handle, e.fd))
                .collect();
            let mut pollfds: Vec<libc::pollfd> = polled
                .iter()
                .map(|&(_, fd)| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            let r = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "poll failed");
                return self.monotonic();
            }
            if r == 0 {
                continue;
            }
            let eventtime = self.monotonic();
            for (i, &(handle, _)) in polled.iter().enumerate() {
                if pollfds[i].revents != 0 {
                    self.dispatch(handle, eventtime);
                }
            }
        }
    }
}
