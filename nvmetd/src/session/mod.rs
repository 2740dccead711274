//! Controller session registry, keyed by `(hostnqn, cntlid)`. Grounded on
//! `cmds.c`'s `ctrl_list`/`ctrl_mutex` pair, reworked from a global
//! mutable list under a coarse mutex into an owned `HashMap` behind one
//! `Mutex`, per SPEC_FULL.md §9.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

/// Controller Configuration / Status per NVMe §3.1.5's state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerState {
    pub cc: u32,
    pub csts: u32,
}

impl ControllerState {
    /// Derives `CSTS` from a freshly written `CC`, matching the
    /// transitions `cmds.c`'s `handle_property_set` implements: `EN=1`
    /// enters ready, `SHN!=0` or `EN=0` completes shutdown.
    pub fn write_cc(&mut self, cc: u32) {
        self.cc = cc;
        let en = cc & 0x1 != 0;
        let shn = (cc >> 14) & 0x3;
        self.csts = if !en {
            0x2 // SHST = complete
        } else if shn != 0 {
            0x2 | 0x1 // RDY | SHST complete
        } else {
            0x1 // RDY
        };
    }
}

#[derive(Debug)]
pub struct Session {
    pub hostnqn: String,
    pub cntlid: u16,
    pub state: ControllerState,
    pub kato_ticks: u32,
    /// Full keep-alive interval in ticks, set by Set Features FID 0Fh;
    /// Keep Alive resets `kato_ticks` back to this rather than leaving
    /// the countdown running.
    pub kato_base: u32,
    pub aen_mask: u32,
    pub max_endpoints: u16,
    /// Command id of a parked Asynchronous Event Request, waiting for an
    /// event to complete against. `None` when the host has no outstanding
    /// AER.
    pub pending_aer: Option<u16>,
    /// Event bits queued by `aen::post` until a parked AER can carry them.
    pub pending_events: u32,
    refcount: u32,
}

impl Session {
    pub fn attach(&mut self) {
        self.refcount += 1;
    }

    /// Returns true once the last endpoint detaches, signalling the
    /// caller to reap this session from the registry.
    pub fn detach(&mut self) -> bool {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }
}

pub struct SessionTable {
    sessions: Mutex<HashMap<(String, u16), Session>>,
    next_cntlid: AtomicU16,
}

impl Default for SessionTable {
    fn default() -> SessionTable {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            next_cntlid: AtomicU16::new(1),
        }
    }
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    /// Connect with `qid=0`: always allocates a fresh session and
    /// assigns the next `cntlid`.
    pub fn create(&self, hostnqn: &str, max_endpoints: u16) -> u16 {
        let cntlid = self.next_cntlid.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            (hostnqn.to_string(), cntlid),
            Session {
                hostnqn: hostnqn.to_string(),
                cntlid,
                state: ControllerState::default(),
                kato_ticks: 0,
                kato_base: 0,
                aen_mask: 0,
                max_endpoints,
                pending_aer: None,
                pending_events: 0,
                refcount: 1,
            },
        );
        cntlid
    }

    /// Connect with `qid>0`: attaches to an existing session, bumping
    /// its reference count. Returns `false` if no such session exists.
    pub fn attach(&self, hostnqn: &str, cntlid: u16) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&(hostnqn.to_string(), cntlid)) {
            Some(s) => {
                s.attach();
                true
            }
            None => false,
        }
    }

    /// Detaches an endpoint from its session; reaps the session if this
    /// was the last reference.
    pub fn detach(&self, hostnqn: &str, cntlid: u16) {
        let mut sessions = self.sessions.lock().unwrap();
        let key = (hostnqn.to_string(), cntlid);
        let reap = match sessions.get_mut(&key) {
            Some(s) => s.detach(),
            None => return,
        };
        if reap {
            sessions.remove(&key);
        }
    }

    pub fn with_session<F, R>(&self, hostnqn: &str, cntlid: u16, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.get_mut(&(hostnqn.to_string(), cntlid)).map(f)
    }

    /// Decrements every live session's KATO countdown by one tick;
    /// returns the `(hostnqn, cntlid)` of sessions that expired so the
    /// caller can tear down their endpoints.
    pub fn tick_keepalive(&self) -> Vec<(String, u16)> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut expired = Vec::new();
        for (key, session) in sessions.iter_mut() {
            if session.kato_ticks == 0 {
                continue;
            }
            session.kato_ticks -= 1;
            if session.kato_ticks == 0 {
                expired.push(key.clone());
            }
        }
        expired
    }

    /// All sessions belonging to `hostnqn` with the discovery-log-change
    /// AEN bit set, for posting an AEN after a topology change.
    pub fn aen_eligible(&self, hostnqn: &str, aen_bit: u32) -> Vec<u16> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|s| s.hostnqn == hostnqn && s.aen_mask & aen_bit != 0)
            .map(|s| s.cntlid)
            .collect()
    }

    /// Queues `aen_bit` against every eligible session for `hostnqn`; a
    /// parked Asynchronous Event Request is picked up on the owning
    /// endpoint's next idle poll via `take_ready_aen`.
    pub fn queue_event(&self, hostnqn: &str, aen_bit: u32) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            if session.hostnqn == hostnqn && session.aen_mask & aen_bit != 0 {
                session.pending_events |= aen_bit;
            }
        }
    }

    /// Parks an Asynchronous Event Request; returns any already-queued
    /// events so the caller can complete immediately rather than park.
    pub fn park_aer(&self, hostnqn: &str, cntlid: u16, command_id: u16) -> Option<u32> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&(hostnqn.to_string(), cntlid))?;
        if session.pending_events != 0 {
            let events = session.pending_events;
            session.pending_events = 0;
            Some(events)
        } else {
            session.pending_aer = Some(command_id);
            None
        }
    }

    /// Called from the owning endpoint's idle loop: if this session has
    /// both a parked AER and queued events, consumes and returns
    /// `(command_id, events)` to complete with.
    pub fn take_ready_aen(&self, hostnqn: &str, cntlid: u16) -> Option<(u16, u32)> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&(hostnqn.to_string(), cntlid))?;
        if session.pending_events != 0 && session.pending_aer.is_some() {
            let events = session.pending_events;
            session.pending_events = 0;
            let cmd = session.pending_aer.take().unwrap();
            Some((cmd, events))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qid0_creates_qidn_attaches() {
        let table = SessionTable::new();
        let cntlid = table.create("nqn.example:host:A", 4);
        assert!(table.attach("nqn.example:host:A", cntlid));
        assert!(!table.attach("nqn.example:host:A", cntlid + 1));
    }

    #[test]
    fn last_detach_reaps_session() {
        let table = SessionTable::new();
        let cntlid = table.create("nqn.example:host:A", 4);
        table.attach("nqn.example:host:A", cntlid);
        table.detach("nqn.example:host:A", cntlid);
        assert!(table.with_session("nqn.example:host:A", cntlid, |_| ()).is_some());
        table.detach("nqn.example:host:A", cntlid);
        assert!(table.with_session("nqn.example:host:A", cntlid, |_| ()).is_none());
    }

    #[test]
    fn cc_en_drives_csts_rdy() {
        let mut state = ControllerState::default();
        state.write_cc(0x1);
        assert_eq!(state.csts & 0x1, 0x1);
    }
}
