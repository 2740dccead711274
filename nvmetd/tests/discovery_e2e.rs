//! End-to-end scenarios driving the reflector against a real (but
//! temporary) directory tree standing in for kernel configfs, and the
//! dispatcher/session stack directly for the connection-level scenarios
//! that don't need a filesystem. Placed in `tests/` per the crate's
//! integration-test convention, mirroring `nvmeadm/tests/discovery_test.rs`.

use std::convert::TryInto;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use nvmetd::config::{Config, Protocol, DEFAULT_DISCOVERY_NQN};
use nvmetd::dispatcher::{Dispatcher, EndpointCtx};
use nvmetd::iface::InterfaceManager;
use nvmetd::reflector::Reflector;
use nvmetd::session::SessionTable;
use nvmetd::store::Store;
use nvmetd::wire::nvme::{self, Sqe, StatusCode};

fn write_attr(dir: &Path, name: &str, value: &str) {
    fs::write(dir.join(name), value).unwrap();
}

/// Lays out the three top-level directories a configfs root always has,
/// even before any host/subsystem/port has been created under them.
fn fake_configfs_root() -> tempfile::TempDir {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("hosts")).unwrap();
    fs::create_dir(root.path().join("subsystems")).unwrap();
    fs::create_dir(root.path().join("ports")).unwrap();
    root
}

fn make_host(root: &Path, nqn: &str) {
    fs::create_dir(root.join("hosts").join(nqn)).unwrap();
}

/// A subsystem always carries its full default attribute set and an
/// (initially empty) `allowed_hosts` directory, matching what the kernel
/// populates on `mkdir subsystems/<nqn>`.
fn make_subsys(root: &Path, nqn: &str, allow_any_host: bool) {
    let dir = root.join("subsystems").join(nqn);
    fs::create_dir(&dir).unwrap();
    write_attr(&dir, "attr_allow_any_host", if allow_any_host { "1" } else { "0" });
    fs::create_dir(dir.join("allowed_hosts")).unwrap();
}

fn make_port(root: &Path, portid: i64, traddr: &str) {
    let dir = root.join("ports").join(portid.to_string());
    fs::create_dir(&dir).unwrap();
    write_attr(&dir, "addr_trtype", "tcp");
    write_attr(&dir, "addr_adrfam", "ipv4");
    write_attr(&dir, "addr_traddr", traddr);
    write_attr(&dir, "addr_trsvcid", "4420");
    write_attr(&dir, "addr_treq", "not required");
    fs::create_dir(dir.join("subsystems")).unwrap();
}

fn link_port_subsys(root: &Path, portid: i64, subsys_nqn: &str) {
    fs::create_dir(root.join("ports").join(portid.to_string()).join("subsystems").join(subsys_nqn)).unwrap();
}

fn link_subsys_host(root: &Path, subsys_nqn: &str, host_nqn: &str) {
    fs::create_dir(
        root.join("subsystems")
            .join(subsys_nqn)
            .join("allowed_hosts")
            .join(host_nqn),
    )
    .unwrap();
}

fn disc_numrec(store: &Store, host_nqn: &str) -> u64 {
    let page = store.host_disc_entries(host_nqn, 0, 65536).unwrap();
    u64::from_le_bytes(page[8..16].try_into().unwrap())
}

/// Polls `f` until it returns `true` or five seconds elapse, to absorb the
/// (small, real) scheduling latency between a filesystem mutation and the
/// reflector thread observing its inotify event.
fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

/// S1: a host with no linked subsystems sees an empty discovery log.
#[test]
fn s1_empty_discovery_for_unlinked_host() {
    let root = fake_configfs_root();
    make_host(root.path(), "nqn.example:host:A");

    let store = Arc::new(Store::open_in_memory().unwrap());
    let stop = Arc::new(AtomicBool::new(false));
    Reflector::new(root.path().to_path_buf(), store.clone(), stop).unwrap();

    assert_eq!(disc_numrec(&store, "nqn.example:host:A"), 0);
}

/// S2: a target becomes visible once the kernel creates the
/// `allowed_hosts` link for that host, observed live via inotify.
#[test]
fn s2_target_becomes_visible_after_host_link_created() {
    let root = fake_configfs_root();
    make_host(root.path(), "nqn.example:host:A");
    make_subsys(root.path(), "nqn.tgt:s1", false);
    make_port(root.path(), 1, "192.0.2.10");
    link_port_subsys(root.path(), 1, "nqn.tgt:s1");

    let store = Arc::new(Store::open_in_memory().unwrap());
    let stop = Arc::new(AtomicBool::new(false));
    let mut reflector = Reflector::new(root.path().to_path_buf(), store.clone(), stop.clone()).unwrap();

    assert_eq!(disc_numrec(&store, "nqn.example:host:A"), 0);

    let handle = thread::spawn(move || {
        let _ = reflector.run();
    });

    link_subsys_host(root.path(), "nqn.tgt:s1", "nqn.example:host:A");
    assert!(wait_until(|| disc_numrec(&store, "nqn.example:host:A") == 1));

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// S3: flipping `attr_allow_any_host` to 1 makes a subsystem visible to
/// every host without any per-host link, observed live via inotify MODIFY.
#[test]
fn s3_allow_any_host_toggle_makes_subsys_visible() {
    let root = fake_configfs_root();
    make_host(root.path(), "nqn.example:host:B");
    make_subsys(root.path(), "nqn.tgt:sAny", false);
    make_port(root.path(), 2, "192.0.2.11");
    link_port_subsys(root.path(), 2, "nqn.tgt:sAny");

    let store = Arc::new(Store::open_in_memory().unwrap());
    let stop = Arc::new(AtomicBool::new(false));
    let mut reflector = Reflector::new(root.path().to_path_buf(), store.clone(), stop.clone()).unwrap();

    assert_eq!(disc_numrec(&store, "nqn.example:host:B"), 0);

    let handle = thread::spawn(move || {
        let _ = reflector.run();
    });

    write_attr(
        &root.path().join("subsystems").join("nqn.tgt:sAny"),
        "attr_allow_any_host",
        "1",
    );
    assert!(wait_until(|| disc_numrec(&store, "nqn.example:host:B") == 1));

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

fn fixture_dispatcher() -> (Dispatcher, Arc<SessionTable>) {
    let config = Arc::new(Config {
        configfs_root: "/tmp".into(),
        listen_port: 8009,
        discovery_nqn: DEFAULT_DISCOVERY_NQN.into(),
        db_path: "/tmp/nvmetd-e2e-test.sqlite".into(),
        tls: false,
        verbosity: 0,
    });
    let store = Arc::new(Store::open_in_memory().unwrap());
    let sessions = Arc::new(SessionTable::new());
    (Dispatcher::new(config, store, sessions.clone()), sessions)
}

fn connect_sqe(qid: u16, sqsize: u16) -> Sqe {
    Sqe {
        opcode: nvme::OPC_FABRICS,
        fctype: nvme::FCTYPE_CONNECT,
        command_id: 1,
        nsid: 0,
        cdw: [(qid as u32) << 16, sqsize as u32, 0, 0, 0, 0],
    }
}

fn connect_icd(hostnqn: &str, cntlid: u16) -> Vec<u8> {
    let mut icd = vec![0u8; 1024];
    icd[16..18].copy_from_slice(&cntlid.to_le_bytes());
    let bytes = hostnqn.as_bytes();
    icd[512..512 + bytes.len()].copy_from_slice(bytes);
    icd
}

/// S4: a session whose keep-alive countdown reaches zero is surfaced by
/// `tick_keepalive` for the daemon's watchdog thread to detach.
#[test]
fn s4_keep_alive_timeout_expires_session() {
    let (d, sessions) = fixture_dispatcher();
    let mut ep = EndpointCtx {
        qid: 0,
        qsize: 4,
        hostnqn: None,
        cntlid: None,
    };
    let icd = connect_icd("nqn.example:host:kato", 0xFFFF);
    let resp = d.dispatch(&mut ep, &connect_sqe(0, 0), &icd);
    assert_eq!(resp.cqe.status, StatusCode::Success);

    let mut set_kato = connect_sqe(0, 0);
    set_kato.opcode = nvme::OPC_SET_FEATURES;
    set_kato.fctype = 0;
    set_kato.cdw = [
        nvme::FID_KATO as u32,
        2 * Protocol::KATO_INTERVAL_MS as u32,
        0,
        0,
        0,
        0,
    ];
    let resp = d.dispatch(&mut ep, &set_kato, &icd);
    assert_eq!(resp.cqe.status, StatusCode::Success);

    // One tick down from the 2-tick KATO; a Keep Alive here must reset the
    // countdown rather than leaving it decremented.
    assert!(sessions.tick_keepalive().is_empty());
    let mut keep_alive = connect_sqe(0, 0);
    keep_alive.opcode = nvme::OPC_KEEP_ALIVE;
    keep_alive.fctype = 0;
    let resp = d.dispatch(&mut ep, &keep_alive, &icd);
    assert_eq!(resp.cqe.status, StatusCode::Success);

    // Back at 2 ticks post-reset: one more tick must not expire the session.
    assert!(sessions.tick_keepalive().is_empty());

    let expired = sessions.tick_keepalive();
    assert_eq!(expired, vec![("nqn.example:host:kato".to_string(), ep.cntlid.unwrap())]);
}

/// S5: binding the same `(adrfam, traddr)` pair twice is rejected (EBUSY),
/// matching `interface.c`'s duplicate-bind check.
#[test]
fn s5_duplicate_bind_is_rejected() {
    let stop = Arc::new(AtomicBool::new(false));
    let on_accept = Arc::new(|_s: std::net::TcpStream, _portid: i64, _stop: Arc<AtomicBool>| {});
    let iface = InterfaceManager::new(stop, on_accept);

    iface.bind("ipv4", "127.0.0.1", 0, 1).unwrap();
    let err = iface.bind("ipv4", "127.0.0.1", 0, 1);
    assert!(err.is_err());
    iface.shutdown();
}

/// S6: a Connect on a non-admin queue must reference an already-live
/// controller id; `0xFFFF` is not a wildcard off the admin queue.
#[test]
fn s6_connect_qidn_rejects_unknown_and_wildcard_cntlid() {
    let (d, _sessions) = fixture_dispatcher();

    let mut ep = EndpointCtx {
        qid: 1,
        qsize: 32,
        hostnqn: None,
        cntlid: None,
    };
    let wildcard_icd = connect_icd("nqn.example:host:C", 0xFFFF);
    let resp = d.dispatch(&mut ep, &connect_sqe(1, 31), &wildcard_icd);
    assert_eq!(resp.cqe.status, StatusCode::ConnectInvalidParam);

    let unknown_icd = connect_icd("nqn.example:host:C", 42);
    let resp = d.dispatch(&mut ep, &connect_sqe(1, 31), &unknown_icd);
    assert_eq!(resp.cqe.status, StatusCode::ConnectInvalidParam);
}
