//! Daemon entry point: parses CLI arguments, opens the discovery store,
//! brings up the configfs reflector and one TCP listener per advertised
//! port, then blocks until a termination signal arrives. Grounded on
//! `daemon.c`'s startup/shutdown sequence (config parse, db open, signal
//! mask install, interface bring-up, main loop, clean db teardown).

use std::net::TcpStream;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use snafu::ResultExt;
use structopt::StructOpt;

use nvmetd::cli::NvmetdCliArgs;
use nvmetd::config::{Config, Protocol};
use nvmetd::dispatcher::Dispatcher;
use nvmetd::endpoint;
use nvmetd::error::InitError;
use nvmetd::iface::InterfaceManager;
use nvmetd::reflector::Reflector;
use nvmetd::session::SessionTable;
use nvmetd::store::Store;

fn main() -> ExitCode {
    let args = NvmetdCliArgs::from_args();
    let config = Config::from(args);
    nvmetd::logger::init(config.tracing_filter());

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "nvmetd failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), InitError> {
    if !config.configfs_root.is_dir() {
        return nvmetd::error::BadConfigfsRoot {
            path: config.configfs_root.display().to_string(),
        }
        .fail();
    }

    let config = Arc::new(config);
    let stop = Arc::new(AtomicBool::new(false));

    install_signal_handlers(&stop)?;

    let store = Arc::new(Store::open(&config.db_path).context(nvmetd::error::OpenStore {
        path: config.db_path.display().to_string(),
    })?);
    // This controller's own discovery NQN is always present as a host row
    // so allow_any_host subsystems resolve against it without a configfs
    // entry having to exist for it.
    let _ = store.add_host(&config.discovery_nqn);

    let mut reflector = Reflector::new(config.configfs_root.clone(), store.clone(), stop.clone())
        .context(nvmetd::error::Inotify)?;

    let sessions = Arc::new(SessionTable::new());
    let dispatcher = Arc::new(Dispatcher::new(config.clone(), store.clone(), sessions.clone()));

    let on_accept = {
        let dispatcher = dispatcher.clone();
        Arc::new(move |stream: TcpStream, _portid: i64, stop: Arc<AtomicBool>| {
            let dispatcher = dispatcher.clone();
            thread::Builder::new()
                .name("nvmetd-endpoint".into())
                .spawn(move || endpoint::run(stream, dispatcher, stop))
                .expect("spawn endpoint thread");
        })
    };
    let iface = Arc::new(InterfaceManager::new(stop.clone(), on_accept));

    // `trsvcid` is only the port this endpoint is advertised under in the
    // discovery log; the port actually bound always comes from this
    // process's own configuration, which may differ.
    for (portid, adrfam, traddr, trsvcid) in store.list_tcp_ports().unwrap_or_default() {
        let port = config.listen_port;
        if let Err(e) = iface.bind(&adrfam, &traddr, port, portid) {
            tracing::warn!(error = %e, portid, traddr, trsvcid, port, "failed to bind configfs port, skipping");
        }
    }

    let reflector_handle = {
        let stop = stop.clone();
        thread::Builder::new()
            .name("nvmetd-reflector".into())
            .spawn(move || {
                if let Err(e) = reflector.run() {
                    tracing::error!(error = %e, "reflector loop exited with error");
                    stop.store(true, Ordering::Relaxed);
                }
            })
            .expect("spawn reflector thread")
    };

    let keepalive_handle = {
        let sessions = sessions.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("nvmetd-keepalive".into())
            .spawn(move || keepalive_watchdog(sessions, stop))
            .expect("spawn keep-alive thread")
    };

    tracing::info!(configfs = %config.configfs_root.display(), port = config.listen_port, "nvmetd started");

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(Protocol::KATO_INTERVAL_MS));
    }

    iface.shutdown();
    let _ = reflector_handle.join();
    let _ = keepalive_handle.join();

    // Clean shutdown removes the discovery database, matching daemon.c's
    // unlink of the db file on SIGTERM rather than leaving stale state for
    // the next run to reconcile against.
    let _ = std::fs::remove_file(&config.db_path);

    tracing::info!("nvmetd stopped");
    Ok(())
}

fn install_signal_handlers(stop: &Arc<AtomicBool>) -> Result<(), InitError> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone())
        .context(nvmetd::error::SignalHandler)?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())
        .context(nvmetd::error::SignalHandler)?;
    Ok(())
}

/// Ticks every live session's keep-alive countdown once per
/// `KATO_INTERVAL_MS` and tears down sessions whose host went silent,
/// mirroring `cmds.c`'s keep-alive timer thread.
fn keepalive_watchdog(sessions: Arc<SessionTable>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(Protocol::KATO_INTERVAL_MS));
        for (hostnqn, cntlid) in sessions.tick_keepalive() {
            tracing::info!(hostnqn = %hostnqn, cntlid, "keep-alive timeout, detaching session");
            sessions.detach(&hostnqn, cntlid);
        }
    }
}
