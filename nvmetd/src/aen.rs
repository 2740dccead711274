//! Asynchronous Event Notification. The reflector calls `notify_discovery_change`
//! whenever a configfs mutation changes a host's visible topology; this
//! queues the "Discovery Log Page Changed" event against every session
//! for that host with the bit enabled in its AEN mask (`cmds.c`'s
//! `handle_set_features` FID `0x0b`). Delivery itself happens on the
//! owning endpoint's next idle poll, since only that thread may write to
//! its socket (§5's single-writer-per-endpoint discipline).

use crate::dispatcher::AEN_BIT_DISC_CHANGE;
use crate::session::SessionTable;

pub fn notify_discovery_change(sessions: &SessionTable, hostnqn: &str) {
    sessions.queue_event(hostnqn, AEN_BIT_DISC_CHANGE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_event_delivered_to_parked_aer() {
        let sessions = SessionTable::new();
        let cntlid = sessions.create("nqn.example:host:A", 4);
        sessions.with_session("nqn.example:host:A", cntlid, |s| {
            s.aen_mask = AEN_BIT_DISC_CHANGE
        });
        assert!(sessions.park_aer("nqn.example:host:A", cntlid, 42).is_none());
        notify_discovery_change(&sessions, "nqn.example:host:A");
        let ready = sessions.take_ready_aen("nqn.example:host:A", cntlid);
        assert_eq!(ready, Some((42, AEN_BIT_DISC_CHANGE)));
    }
}
