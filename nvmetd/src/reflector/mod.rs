//! The configfs reflector: walks and watches the kernel NVMe target
//! configfs tree and projects every create/delete/modify event onto the
//! discovery store. Grounded on `inotify.c`'s `process_inotify_event`
//! state machine and its `watch_hosts_dir` / `watch_subsys_dir` /
//! `watch_ports_dir` startup ordering (hosts and subsystems must exist
//! before the port/subsys and subsys/host symlinks that reference them
//! are resolved).

pub mod error;
pub mod watcher;

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent};
use snafu::{IntoError, ResultExt};

use crate::config::Protocol;
use crate::store::Store;

pub use error::ReflectorError;
use self::error as rerror;
use watcher::{Watcher, WatcherSet};

const DIR_MASK: AddWatchFlags = AddWatchFlags::from_bits_truncate(
    AddWatchFlags::IN_CREATE.bits() | AddWatchFlags::IN_DELETE.bits(),
);
const LEAF_MASK: AddWatchFlags = AddWatchFlags::from_bits_truncate(
    AddWatchFlags::IN_MODIFY.bits() | AddWatchFlags::IN_DELETE_SELF.bits(),
);

pub struct Reflector {
    root: PathBuf,
    store: Arc<Store>,
    inotify: Inotify,
    watchers: WatcherSet,
    stop: Arc<AtomicBool>,
}

impl Reflector {
    pub fn new(root: PathBuf, store: Arc<Store>, stop: Arc<AtomicBool>) -> Result<Reflector, ReflectorError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK).context(rerror::Inotify)?;
        let mut reflector = Reflector {
            root,
            store,
            inotify,
            watchers: WatcherSet::new(),
            stop,
        };
        reflector.rescan()?;
        Ok(reflector)
    }

    fn add_watch(&mut self, path: &Path, mask: AddWatchFlags, watcher: Watcher) -> Result<(), ReflectorError> {
        if self.watchers.contains(path) {
            return Ok(());
        }
        let wd = self.inotify.add_watch(path, mask).context(rerror::Inotify)?;
        self.watchers.insert(path.to_path_buf(), wd, watcher);
        Ok(())
    }

    /// Tears down every watch and re-walks the whole tree. Used both for
    /// startup and to recover from an `IN_Q_OVERFLOW`.
    pub fn rescan(&mut self) -> Result<(), ReflectorError> {
        self.watchers.clear();
        self.watch_hosts_dir()?;
        self.watch_subsys_dir()?;
        self.watch_ports_dir()?;
        Ok(())
    }

    fn watch_hosts_dir(&mut self) -> Result<(), ReflectorError> {
        let dir = self.root.join("hosts");
        self.add_watch(&dir, DIR_MASK, Watcher::HostsDir)?;
        for entry in read_dir_names(&dir)? {
            self.watch_host(&entry)?;
        }
        Ok(())
    }

    fn watch_host(&mut self, nqn: &str) -> Result<(), ReflectorError> {
        let path = self.root.join("hosts").join(nqn);
        match self.store.add_host(nqn) {
            Ok(()) | Err(crate::store::StoreError::Duplicate { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.add_watch(
            &path,
            LEAF_MASK,
            Watcher::Host {
                nqn: nqn.to_string(),
            },
        )
    }

    fn watch_subsys_dir(&mut self) -> Result<(), ReflectorError> {
        let dir = self.root.join("subsystems");
        self.add_watch(&dir, DIR_MASK, Watcher::SubsysDir)?;
        for entry in read_dir_names(&dir)? {
            self.watch_subsys(&entry)?;
        }
        Ok(())
    }

    fn watch_subsys(&mut self, nqn: &str) -> Result<(), ReflectorError> {
        let dir = self.root.join("subsystems").join(nqn);
        let allow_any = read_bool_attr(&dir, "attr_allow_any_host").unwrap_or(false);
        match self.store.add_subsys(nqn, allow_any) {
            Ok(()) | Err(crate::store::StoreError::Duplicate { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.add_watch(
            &dir.join("attr_allow_any_host"),
            LEAF_MASK,
            Watcher::SubsysAttr {
                nqn: nqn.to_string(),
            },
        )?;
        self.add_watch(
            &dir,
            AddWatchFlags::IN_DELETE_SELF,
            Watcher::Subsys {
                nqn: nqn.to_string(),
            },
        )?;

        let hosts_dir = dir.join("allowed_hosts");
        self.add_watch(
            &hosts_dir,
            DIR_MASK,
            Watcher::SubsysHostsDir {
                nqn: nqn.to_string(),
            },
        )?;
        for host_nqn in read_dir_names(&hosts_dir)? {
            self.link_subsys_host(nqn, &host_nqn)?;
        }
        Ok(())
    }

    fn link_subsys_host(&mut self, subsys_nqn: &str, host_nqn: &str) -> Result<(), ReflectorError> {
        match self.store.add_host_subsys(host_nqn, subsys_nqn) {
            Ok(()) | Err(crate::store::StoreError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn watch_ports_dir(&mut self) -> Result<(), ReflectorError> {
        let dir = self.root.join("ports");
        self.add_watch(&dir, DIR_MASK, Watcher::PortsDir)?;
        for entry in read_dir_names(&dir)? {
            let portid: i64 = entry.parse().unwrap_or(0);
            self.watch_port(portid)?;
        }
        Ok(())
    }

    fn watch_port(&mut self, portid: i64) -> Result<(), ReflectorError> {
        let dir = self.root.join("ports").join(portid.to_string());
        let trtype = read_str_attr(&dir, "addr_trtype").unwrap_or_else(|| "tcp".into());
        let adrfam = read_str_attr(&dir, "addr_adrfam").unwrap_or_else(|| "ipv4".into());
        let traddr = read_str_attr(&dir, "addr_traddr").unwrap_or_default();
        let trsvcid = read_str_attr(&dir, "addr_trsvcid").unwrap_or_default();
        let treq = read_str_attr(&dir, "addr_treq").unwrap_or_else(|| "not specified".into());

        match self
            .store
            .add_port(portid, &trtype, &adrfam, &traddr, &trsvcid, &treq, 0)
        {
            Ok(()) | Err(crate::store::StoreError::Duplicate { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.add_watch(&dir, AddWatchFlags::IN_DELETE_SELF, Watcher::Port { portid })?;
        for attr in ["addr_trtype", "addr_adrfam", "addr_traddr", "addr_trsvcid", "addr_treq"] {
            self.add_watch(&dir.join(attr), LEAF_MASK, Watcher::PortAttr { portid })?;
        }

        let subsys_dir = dir.join("subsystems");
        self.add_watch(&subsys_dir, DIR_MASK, Watcher::PortSubsysDir { portid })?;
        for nqn in read_dir_names(&subsys_dir)? {
            self.link_port_subsys(portid, &nqn)?;
        }
        Ok(())
    }

    fn link_port_subsys(&mut self, portid: i64, subsys_nqn: &str) -> Result<(), ReflectorError> {
        match self.store.add_subsys_port(subsys_nqn, portid) {
            Ok(()) | Err(crate::store::StoreError::Duplicate { .. }) => Ok(()),
            // subsystem not yet known: the kernel never creates this
            // symlink before the target exists, but a racing rescan might
            // observe it that way transiently. Drop it; a later MODIFY
            // triggered by the real CREATE order will retry.
            Err(crate::store::StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until an inotify event is available or `KATO_INTERVAL_MS`
    /// elapses, so the caller can observe the stop flag without a
    /// dedicated cancellation channel.
    fn wait_for_events(&self) -> Result<Vec<InotifyEvent>, ReflectorError> {
        let fd = self.inotify.as_raw_fd();
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = poll(&mut fds, Protocol::KATO_INTERVAL_MS as i32).context(rerror::Inotify)?;
        if ready <= 0 {
            return Ok(vec![]);
        }
        match self.inotify.read_events() {
            Ok(events) => Ok(events),
            Err(nix::errno::Errno::EAGAIN) => Ok(vec![]),
            Err(source) => Err(rerror::Inotify.into_error(source)),
        }
    }

    /// Runs the reflector loop until `stop` is set. Call from a dedicated
    /// thread, matching the one-thread-per-subsystem model in §5.
    pub fn run(&mut self) -> Result<(), ReflectorError> {
        while !self.stop.load(Ordering::Relaxed) {
            let events = self.wait_for_events()?;
            for ev in events {
                if ev.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    tracing::warn!("inotify queue overflow, rescanning");
                    self.rescan()?;
                    break;
                }
                if let Err(e) = self.dispatch(&ev) {
                    tracing::warn!(error = %e, "dropping malformed configfs event");
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, ev: &InotifyEvent) -> Result<(), ReflectorError> {
        let (path, watcher) = match self.watchers.find_by_wd(&ev.wd) {
            Some((p, e)) => (p.clone(), &e.watcher),
            None => return Ok(()),
        };
        let name = ev.name.as_ref().map(|n| n.to_string_lossy().to_string());

        match watcher {
            Watcher::HostsDir => {
                if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                    if let Some(nqn) = name {
                        self.watch_host(&nqn)?;
                    }
                } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
                    if let Some(nqn) = name {
                        self.watchers.remove(&path.join(&nqn));
                        let _ = self.store.del_host(&nqn);
                    }
                }
            }
            Watcher::SubsysDir => {
                if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                    if let Some(nqn) = name {
                        self.watch_subsys(&nqn)?;
                    }
                } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
                    if let Some(nqn) = name {
                        self.watchers.remove(&path.join(&nqn));
                        let _ = self.store.del_subsys(&nqn);
                    }
                }
            }
            Watcher::PortsDir => {
                if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                    if let Some(id) = name.and_then(|n| n.parse().ok()) {
                        self.watch_port(id)?;
                    }
                }
                // port deletion is observed via DELETE_SELF on the Port
                // watcher itself, matching inotify.c's dispatch split.
            }
            Watcher::Port { portid } => {
                if ev.mask.contains(AddWatchFlags::IN_DELETE_SELF) {
                    let portid = *portid;
                    self.watchers.remove(&path);
                    let _ = self.store.del_port(portid);
                }
            }
            Watcher::PortAttr { portid } => {
                if ev.mask.contains(AddWatchFlags::IN_MODIFY) {
                    let portid = *portid;
                    let attr = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("")
                        .trim_start_matches("addr_")
                        .to_string();
                    if let Some(value) = fs::read_to_string(&path).ok().map(|s| s.trim().to_string()) {
                        self.store.update_port_attr(portid, &attr, &value)?;
                    }
                }
            }
            Watcher::PortSubsysDir { portid } => {
                let portid = *portid;
                if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                    if let Some(nqn) = name {
                        self.link_port_subsys(portid, &nqn)?;
                    }
                } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
                    if let Some(nqn) = name {
                        let _ = self.store.del_subsys_port(&nqn, portid);
                    }
                }
            }
            Watcher::Subsys { nqn } => {
                if ev.mask.contains(AddWatchFlags::IN_DELETE_SELF) {
                    let nqn = nqn.clone();
                    self.watchers.remove(&path);
                    let _ = self.store.del_subsys(&nqn);
                }
            }
            Watcher::SubsysAttr { nqn } => {
                if ev.mask.contains(AddWatchFlags::IN_MODIFY) {
                    let nqn = nqn.clone();
                    let allow_any = read_bool_attr(path.parent().unwrap(), "attr_allow_any_host")
                        .unwrap_or(false);
                    self.store.set_subsys_allow_any(&nqn, allow_any)?;
                }
            }
            Watcher::SubsysHostsDir { nqn } => {
                let nqn = nqn.clone();
                if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                    if let Some(host_nqn) = name {
                        self.link_subsys_host(&nqn, &host_nqn)?;
                    }
                } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
                    if let Some(host_nqn) = name {
                        let _ = self.store.del_host_subsys(&host_nqn, &nqn);
                    }
                }
            }
            Watcher::Host { .. } | Watcher::PortSubsys { .. } | Watcher::SubsysHost { .. } => {}
        }
        Ok(())
    }
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>, ReflectorError> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(source) => {
            return Err(rerror::Io {
                path: dir.display().to_string(),
            }
            .into_error(source))
        }
    };
    let mut names = Vec::new();
    for entry in rd {
        let entry = entry.context(rerror::Io {
            path: dir.display().to_string(),
        })?;
        if let Some(n) = entry.file_name().to_str() {
            names.push(n.to_string());
        }
    }
    Ok(names)
}

fn read_str_attr(dir: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(dir.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_bool_attr(dir: &Path, attr: &str) -> Option<bool> {
    read_str_attr(dir, attr).map(|s| s == "1")
}
