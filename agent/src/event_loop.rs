//! Single-threaded readable-FD demultiplexer (§4.1).
//!
//! Grounded on `original_source/core/cms/common/impl/CPoll.cpp`'s `Poll`:
//! an APR pollset keyed by an odd-incrementing `uintptr_t`, looped in
//! `doRun()` with a configurable microsecond timeout, `POLLHUP` triggering
//! removal, spurious/timeout/EINTR results silently looped. `mio::Poll`
//! plays the pollset's role here; the `uintptr_t` key becomes a `Token`
//! handed back from `register`, and handler dispatch replaces the
//! `m_sockObjectMap` lookup with a `HashMap<Token, Box<dyn Handler>>`.

use mio::{Events, Interest, Poll as MioPoll, Token};
use shared::error::MonitoringError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Invoked when a registered source becomes readable. `key` lets a handler
/// that covers multiple registrations (rare) tell which one fired.
pub trait Handler: Send {
    fn on_readable(&mut self, key: Token);

    /// Called when the peer half-closes (HUP); default does nothing beyond
    /// the loop's own unregistration.
    fn on_hang_up(&mut self, _key: Token) {}
}

struct Registration {
    source: Box<dyn mio::event::Source + Send>,
    handler: Box<dyn Handler>,
}

pub struct EventLoop {
    poll: MioPoll,
    registry_copy: mio::Registry,
    registrations: HashMap<Token, Registration>,
    next_token: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
    long_handler_warning: Duration,
}

impl EventLoop {
    /// Fatal-only if demultiplexer creation fails (§4.1 Failure policy).
    pub fn new(poll_timeout: Duration, long_handler_warning: Duration) -> Result<Self, MonitoringError> {
        let poll = MioPoll::new()
            .map_err(|e| MonitoringError::EFatal(format!("creating event demultiplexer: {e}")))?;
        let registry_copy = poll
            .registry()
            .try_clone()
            .map_err(|e| MonitoringError::EFatal(format!("cloning poll registry: {e}")))?;
        Ok(Self {
            poll,
            registry_copy,
            registrations: HashMap::new(),
            next_token: AtomicUsize::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            poll_timeout,
            long_handler_warning,
        })
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Idempotent for distinct sources; each call allocates a fresh token.
    pub fn register(
        &mut self,
        mut source: Box<dyn mio::event::Source + Send>,
        handler: Box<dyn Handler>,
    ) -> Result<Token, MonitoringError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.registry_copy
            .register(source.as_mut(), token, Interest::READABLE)
            .map_err(|e| MonitoringError::EIO(format!("registering fd: {e}")))?;
        self.registrations
            .insert(token, Registration { source, handler });
        Ok(token)
    }

    /// Idempotent: unregistering an unknown token is a no-op.
    pub fn unregister(&mut self, key: Token) {
        if let Some(mut reg) = self.registrations.remove(&key) {
            if let Err(e) = self.registry_copy.deregister(reg.source.as_mut()) {
                warn!(token = ?key, error = %e, "deregistering fd failed");
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Blocks until `request_shutdown` is observed. Spurious wakeups,
    /// interrupted waits, and bare timeouts are silently looped (§4.1).
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(self.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "poll error");
                    continue;
                }
            }

            let mut hung_up = Vec::new();
            for event in events.iter() {
                let token = event.token();
                let is_hup = event.is_read_closed() || event.is_error();

                if let Some(reg) = self.registrations.get_mut(&token) {
                    let started = Instant::now();
                    if event.is_readable() {
                        reg.handler.on_readable(token);
                    }
                    if is_hup {
                        reg.handler.on_hang_up(token);
                    }
                    let elapsed = started.elapsed();
                    if elapsed >= self.long_handler_warning {
                        warn!(token = ?token, elapsed_ms = elapsed.as_millis(), "long event handler");
                    }
                } else {
                    debug!(token = ?token, "event for unknown token, ignoring");
                }

                if is_hup {
                    hung_up.push(token);
                }
            }

            for token in hung_up {
                self.unregister(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct RecordingHandler {
        tx: mpsc::Sender<Token>,
    }

    impl Handler for RecordingHandler {
        fn on_readable(&mut self, key: Token) {
            let _ = self.tx.send(key);
        }
    }

    #[test]
    fn register_and_unregister_are_idempotent_on_unknown_token() {
        let mut loop_ = EventLoop::new(Duration::from_millis(10), Duration::from_millis(50)).unwrap();
        loop_.unregister(Token(999));
        loop_.unregister(Token(999));
    }

    #[test]
    fn readable_stream_dispatches_to_handler() {
        use mio::net::UnixStream as MioUnixStream;
        use std::os::unix::net::UnixStream as StdUnixStream;

        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let mio_b = MioUnixStream::from_std(b);

        let mut loop_ = EventLoop::new(Duration::from_millis(10), Duration::from_millis(50)).unwrap();
        let (tx, rx) = mpsc::channel();
        let token = loop_
            .register(Box::new(mio_b), Box::new(RecordingHandler { tx }))
            .unwrap();

        use std::io::Write;
        let mut a = a;
        a.write_all(b"x").unwrap();

        let shutdown = loop_.shutdown_handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            shutdown.store(true, Ordering::SeqCst);
        });
        loop_.run();

        assert_eq!(rx.try_recv().unwrap(), token);
    }
}
