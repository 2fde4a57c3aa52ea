//! Readiness-driven event dispatcher.
//!
//! One dedicated thread calls [`Reactor::run`]; it is the only thread that
//! waits on the kernel readiness handle. Callbacks registered for a
//! descriptor fire on that thread and may re-enter the reactor to register
//! or unregister descriptors.

use crate::error::{ServerError, ServerResult};
use crate::syscalls::{Poller, ReadyEvent, INTEREST_READ, INTEREST_WRITE};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Which readiness class fired for a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

pub type EventCallback = Arc<dyn Fn(RawFd, EventKind) + Send + Sync>;

/// Events drained per wait. Delivery order within one wake is whatever the
/// kernel reports; every reported event is dispatched before waiting again.
const MAX_EVENTS: usize = 64;

/// How long one kernel wait may block before the running flag is re-checked.
const WAIT_TIMEOUT_MS: i32 = 500;

#[derive(Default)]
struct CallbackTable {
    read: HashMap<RawFd, EventCallback>,
    write: HashMap<RawFd, EventCallback>,
}

impl CallbackTable {
    fn interests(&self, fd: RawFd) -> u32 {
        let mut interests = 0;
        if self.read.contains_key(&fd) {
            interests |= INTEREST_READ;
        }
        if self.write.contains_key(&fd) {
            interests |= INTEREST_WRITE;
        }
        interests
    }
}

pub struct Reactor {
    poller: Poller,
    running: AtomicBool,
    callbacks: Mutex<CallbackTable>,
}

impl Reactor {
    pub fn new() -> ServerResult<Self> {
        Ok(Self {
            poller: Poller::new().map_err(ServerError::Reactor)?,
            running: AtomicBool::new(false),
            callbacks: Mutex::new(CallbackTable::default()),
        })
    }

    /// Install `callback` for read readiness on `fd`. Re-registering the
    /// same descriptor overwrites the previous callback.
    pub fn register_read(&self, fd: RawFd, callback: EventCallback) -> ServerResult<()> {
        self.register(fd, callback, EventKind::Read)
    }

    /// Install `callback` for write readiness on `fd`.
    pub fn register_write(&self, fd: RawFd, callback: EventCallback) -> ServerResult<()> {
        self.register(fd, callback, EventKind::Write)
    }

    fn register(&self, fd: RawFd, callback: EventCallback, kind: EventKind) -> ServerResult<()> {
        let mut table = self.callbacks.lock().unwrap();
        let known = table.interests(fd) != 0;
        let wanted = table.interests(fd)
            | match kind {
                EventKind::Read => INTEREST_READ,
                EventKind::Write => INTEREST_WRITE,
            };

        let result = if known {
            self.poller.modify(fd, wanted)
        } else {
            self.poller.add(fd, wanted)
        };
        result.map_err(ServerError::Reactor)?;

        match kind {
            EventKind::Read => table.read.insert(fd, callback),
            EventKind::Write => table.write.insert(fd, callback),
        };
        Ok(())
    }

    /// Remove both read and write registrations for `fd`. Idempotent; a
    /// descriptor that was never registered is not an error.
    pub fn unregister(&self, fd: RawFd) {
        let mut table = self.callbacks.lock().unwrap();
        table.read.remove(&fd);
        table.write.remove(&fd);
        drop(table);

        if let Err(e) = self.poller.delete(fd) {
            tracing::debug!(fd, error = %e, "poller delete failed");
        }
    }

    /// Drain readiness events until [`stop`](Self::stop) is called. Blocks
    /// the calling thread.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        let mut events = [ReadyEvent::default(); MAX_EVENTS];

        while self.running.load(Ordering::Acquire) {
            let n = match self.poller.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "readiness wait failed");
                    break;
                }
            };

            for event in &events[..n] {
                if event.readable() {
                    self.dispatch(event.fd, EventKind::Read);
                }
                if event.writable() {
                    self.dispatch(event.fd, EventKind::Write);
                }
                if event.eof() {
                    self.unregister(event.fd);
                }
            }
        }
    }

    /// Signal the loop to exit before its next wait returns.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn dispatch(&self, fd: RawFd, kind: EventKind) {
        let callback = {
            let table = self.callbacks.lock().unwrap();
            match kind {
                EventKind::Read => table.read.get(&fd).cloned(),
                EventKind::Write => table.write.get(&fd).cloned(),
            }
        };

        if let Some(cb) = callback {
            // A failing callback must not take the loop down.
            if catch_unwind(AssertUnwindSafe(|| cb(fd, kind))).is_err() {
                tracing::error!(fd, ?kind, "event callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn dispatches_read_readiness() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let reactor = Arc::new(Reactor::new().unwrap());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        reactor
            .register_read(
                listener.as_raw_fd(),
                Arc::new(move |_fd, kind| {
                    assert_eq!(kind, EventKind::Read);
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let reactor_clone = reactor.clone();
        let handle = std::thread::spawn(move || reactor_clone.run());

        // A connect attempt makes the listener readable.
        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        reactor.stop();
        handle.join().unwrap();
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        reactor.unregister(9999);
        reactor.unregister(9999);
    }

    #[test]
    fn callback_panic_does_not_kill_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let reactor = Arc::new(Reactor::new().unwrap());
        reactor
            .register_read(
                listener.as_raw_fd(),
                Arc::new(move |_fd, _kind| panic!("handler bug")),
            )
            .unwrap();

        let reactor_clone = reactor.clone();
        let handle = std::thread::spawn(move || reactor_clone.run());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(300));

        assert!(reactor.is_running());
        reactor.stop();
        handle.join().unwrap();
    }
}
