//! The interface manager: one bound TCP listener per distinct
//! `(adrfam, traddr)` pair, each driven by its own accept thread.
//! Grounded on `interface.c`'s `interface_create`/`interface_delete`
//! (duplicate-bind EBUSY check, pending-subsys_port check before
//! teardown), translated from its global `interface_list` + mutex into
//! an owned registry.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::poll::{poll, PollFd, PollFlags};
use snafu::{ResultExt, Snafu};

use crate::config::Protocol;

#[derive(Debug, Snafu)]
pub enum IfaceError {
    #[snafu(display("listener for {} already bound (EBUSY)", key))]
    AlreadyBound { key: String },
    #[snafu(display("failed to bind {}: {}", addr, source))]
    Bind { addr: String, source: std::io::Error },
}

/// A single bound port's accept loop, joined on `shutdown`.
struct Listener {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// Callback invoked with each accepted socket, its portid and the
/// process-wide stop flag; supplied by the caller so the interface
/// manager stays decoupled from the endpoint/session machinery it feeds.
pub type AcceptFn = dyn Fn(TcpStream, i64, Arc<AtomicBool>) + Send + Sync;

pub struct InterfaceManager {
    listeners: Mutex<HashMap<String, Listener>>,
    stop: Arc<AtomicBool>,
    on_accept: Arc<AcceptFn>,
}

impl InterfaceManager {
    pub fn new(stop: Arc<AtomicBool>, on_accept: Arc<AcceptFn>) -> InterfaceManager {
        InterfaceManager {
            listeners: Mutex::new(HashMap::new()),
            stop,
            on_accept,
        }
    }

    fn key(adrfam: &str, traddr: &str) -> String {
        format!("{}/{}", adrfam, traddr)
    }

    pub fn bind(&self, adrfam: &str, traddr: &str, port: u16, portid: i64) -> Result<(), IfaceError> {
        let key = Self::key(adrfam, traddr);
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(&key) {
            return AlreadyBound { key }.fail();
        }

        let addr = format!("{}:{}", traddr, port);
        let listener = TcpListener::bind(&addr).context(Bind { addr: addr.clone() })?;
        listener.set_nonblocking(true).ok();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let global_stop = self.stop.clone();
        let on_accept = self.on_accept.clone();
        let portid_copy = portid;

        let handle = std::thread::Builder::new()
            .name(format!("nvmetd-listen-{}", key))
            .spawn(move || accept_loop(listener, thread_stop, global_stop, on_accept, portid_copy))
            .expect("spawn listener thread");

        listeners.insert(
            key,
            Listener {
                handle: Some(handle),
                stop,
            },
        );
        Ok(())
    }

    pub fn unbind(&self, adrfam: &str, traddr: &str) {
        let key = Self::key(adrfam, traddr);
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(mut l) = listeners.remove(&key) {
            l.stop.store(true, Ordering::Relaxed);
            if let Some(h) = l.handle.take() {
                let _ = h.join();
            }
        }
    }

    pub fn shutdown(&self) {
        let mut listeners = self.listeners.lock().unwrap();
        for (_, mut l) in listeners.drain() {
            l.stop.store(true, Ordering::Relaxed);
            if let Some(h) = l.handle.take() {
                let _ = h.join();
            }
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    local_stop: Arc<AtomicBool>,
    global_stop: Arc<AtomicBool>,
    on_accept: Arc<AcceptFn>,
    portid: i64,
) {
    let fd = listener.as_raw_fd();
    while !local_stop.load(Ordering::Relaxed) && !global_stop.load(Ordering::Relaxed) {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, Protocol::KATO_INTERVAL_MS as i32) {
            Ok(n) if n > 0 => match listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nonblocking(false);
                    on_accept(stream, portid, global_stop.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
            _ => continue,
        }
    }
}
