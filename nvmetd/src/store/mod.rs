//! The relational discovery store: hosts, subsystems, ports and their two
//! many-to-many relations, plus the per-host `genctr`. Grounded on
//! `discdb.c`/`discdb.h`, reworked per SPEC_FULL.md §4.A and §9: every
//! statement is parameterized (the original built SQL with `asprintf`,
//! flagged as injection-shaped) and every `genctr` bump lives inside the
//! mutating method that causes it, rather than a second step the caller
//! must remember to take.

pub mod error;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

pub use error::StoreError;

use crate::wire::disc_log::{AddrFam, DiscEntry, TrType, TrsReq};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS host (
    nqn    TEXT PRIMARY KEY,
    genctr INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS subsys (
    nqn            TEXT PRIMARY KEY,
    allow_any_host INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS port (
    portid  INTEGER PRIMARY KEY,
    trtype  TEXT NOT NULL,
    adrfam  TEXT NOT NULL,
    traddr  TEXT NOT NULL,
    trsvcid TEXT NOT NULL,
    treq    TEXT NOT NULL,
    sectype INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS host_subsys (
    host_nqn   TEXT NOT NULL REFERENCES host(nqn),
    subsys_nqn TEXT NOT NULL REFERENCES subsys(nqn),
    PRIMARY KEY (host_nqn, subsys_nqn)
);
CREATE TABLE IF NOT EXISTS subsys_port (
    subsys_nqn TEXT NOT NULL REFERENCES subsys(nqn),
    portid     INTEGER NOT NULL REFERENCES port(portid),
    PRIMARY KEY (subsys_nqn, portid)
);
"#;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Store, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn bump_host(conn: &Connection, nqn: &str) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE host SET genctr = genctr + 1 WHERE nqn = ?1",
            params![nqn],
        )?;
        Ok(())
    }

    /// Bumps every host currently able to see `subsys_nqn`: every host
    /// with an explicit `host_subsys` row, plus every host at all when the
    /// subsystem is `allow_any_host`.
    fn bump_hosts_for_subsys(conn: &Connection, subsys_nqn: &str) -> Result<(), StoreError> {
        let allow_any: bool = conn
            .query_row(
                "SELECT allow_any_host FROM subsys WHERE nqn = ?1",
                params![subsys_nqn],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v != 0)
            .unwrap_or(false);

        if allow_any {
            conn.execute("UPDATE host SET genctr = genctr + 1", [])?;
        } else {
            conn.execute(
                "UPDATE host SET genctr = genctr + 1 WHERE nqn IN \
                 (SELECT host_nqn FROM host_subsys WHERE subsys_nqn = ?1)",
                params![subsys_nqn],
            )?;
        }
        Ok(())
    }

    pub fn add_host(&self, nqn: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO host (nqn, genctr) VALUES (?1, 0)",
            params![nqn],
        )?;
        Ok(())
    }

    pub fn del_host(&self, nqn: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM host WHERE nqn = ?1", params![nqn])?;
        if n == 0 {
            return error::NotFound {
                kind: "host",
                id: nqn.to_string(),
            }
            .fail();
        }
        Ok(())
    }

    pub fn add_subsys(&self, nqn: &str, allow_any_host: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subsys (nqn, allow_any_host) VALUES (?1, ?2)",
            params![nqn, allow_any_host as i64],
        )?;
        if allow_any_host {
            conn.execute("UPDATE host SET genctr = genctr + 1", [])?;
        }
        Ok(())
    }

    pub fn del_subsys(&self, nqn: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::bump_hosts_for_subsys(&conn, nqn)?;
        let n = conn.execute("DELETE FROM subsys WHERE nqn = ?1", params![nqn])?;
        if n == 0 {
            return error::NotFound {
                kind: "subsys",
                id: nqn.to_string(),
            }
            .fail();
        }
        Ok(())
    }

    /// Toggles `allow_any_host`; bumps every host's counter either way
    /// since the set of visible hosts for every linked port changes.
    pub fn set_subsys_allow_any(&self, nqn: &str, allow_any_host: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE subsys SET allow_any_host = ?2 WHERE nqn = ?1",
            params![nqn, allow_any_host as i64],
        )?;
        if n == 0 {
            return error::NotFound {
                kind: "subsys",
                id: nqn.to_string(),
            }
            .fail();
        }
        conn.execute("UPDATE host SET genctr = genctr + 1", [])?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_port(
        &self,
        portid: i64,
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: &str,
        treq: &str,
        sectype: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO port (portid, trtype, adrfam, traddr, trsvcid, treq, sectype) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![portid, trtype, adrfam, traddr, trsvcid, treq, sectype],
        )?;
        Ok(())
    }

    pub fn update_port_attr(&self, portid: i64, attr: &str, value: &str) -> Result<(), StoreError> {
        let column = match attr {
            "trtype" | "adrfam" | "traddr" | "trsvcid" | "treq" => attr,
            other => {
                return error::NotFound {
                    kind: "port attribute",
                    id: other.to_string(),
                }
                .fail()
            }
        };
        let conn = self.conn.lock().unwrap();
        let sql = format!("UPDATE port SET {} = ?2 WHERE portid = ?1", column);
        let n = conn.execute(&sql, params![portid, value])?;
        if n == 0 {
            return error::NotFound {
                kind: "port",
                id: portid.to_string(),
            }
            .fail();
        }
        // every subsystem advertised on this port changes for its hosts
        let subs: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT subsys_nqn FROM subsys_port WHERE portid = ?1")?;
            let rows = stmt.query_map(params![portid], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for s in subs {
            Self::bump_hosts_for_subsys(&conn, &s)?;
        }
        Ok(())
    }

    /// Number of subsystems still advertised on `portid`; the interface
    /// manager checks this is zero before tearing a listener down.
    pub fn count_subsys_port(&self, portid: i64) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subsys_port WHERE portid = ?1",
            params![portid],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn del_port(&self, portid: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM port WHERE portid = ?1", params![portid])?;
        if n == 0 {
            return error::NotFound {
                kind: "port",
                id: portid.to_string(),
            }
            .fail();
        }
        Ok(())
    }

    pub fn add_host_subsys(&self, host_nqn: &str, subsys_nqn: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO host_subsys (host_nqn, subsys_nqn) VALUES (?1, ?2)",
            params![host_nqn, subsys_nqn],
        )?;
        Self::bump_host(&conn, host_nqn)?;
        Ok(())
    }

    pub fn del_host_subsys(&self, host_nqn: &str, subsys_nqn: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM host_subsys WHERE host_nqn = ?1 AND subsys_nqn = ?2",
            params![host_nqn, subsys_nqn],
        )?;
        if n == 0 {
            return error::NotFound {
                kind: "host_subsys",
                id: format!("{}/{}", host_nqn, subsys_nqn),
            }
            .fail();
        }
        Self::bump_host(&conn, host_nqn)?;
        Ok(())
    }

    pub fn add_subsys_port(&self, subsys_nqn: &str, portid: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subsys_port (subsys_nqn, portid) VALUES (?1, ?2)",
            params![subsys_nqn, portid],
        )?;
        Self::bump_hosts_for_subsys(&conn, subsys_nqn)?;
        Ok(())
    }

    pub fn del_subsys_port(&self, subsys_nqn: &str, portid: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM subsys_port WHERE subsys_nqn = ?1 AND portid = ?2",
            params![subsys_nqn, portid],
        )?;
        if n == 0 {
            return error::NotFound {
                kind: "subsys_port",
                id: format!("{}/{}", subsys_nqn, portid),
            }
            .fail();
        }
        Self::bump_hosts_for_subsys(&conn, subsys_nqn)?;
        Ok(())
    }

    /// All `trtype=tcp` ports, for binding a listener to each at startup.
    pub fn list_tcp_ports(&self) -> Result<Vec<(i64, String, String, String)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT portid, adrfam, traddr, trsvcid FROM port WHERE trtype = 'tcp'")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn host_genctr(&self, host_nqn: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let genctr: i64 = conn
            .query_row(
                "SELECT genctr FROM host WHERE nqn = ?1",
                params![host_nqn],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                error::NotFound {
                    kind: "host",
                    id: host_nqn.to_string(),
                }
                .build()
            })?;
        Ok(genctr as u64)
    }

    /// Joins `host_subsys ∪ (allow_any_host subsystems)` against
    /// `subsys_port` for `host_nqn`, then hands the resulting entries to
    /// `disc_log::build_page` for byte assembly and offset/length
    /// windowing (see §4.A).
    pub fn host_disc_entries(
        &self,
        host_nqn: &str,
        offset: usize,
        max_len: usize,
    ) -> Result<Vec<u8>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let genctr = conn
            .query_row(
                "SELECT genctr FROM host WHERE nqn = ?1",
                params![host_nqn],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or_else(|| {
                error::NotFound {
                    kind: "host",
                    id: host_nqn.to_string(),
                }
                .build()
            })? as u64;

        let mut stmt = conn.prepare(
            "SELECT DISTINCT p.trtype, p.adrfam, p.treq, p.portid, p.trsvcid, \
                    sp.subsys_nqn, p.traddr, p.sectype \
             FROM subsys_port sp \
             JOIN port p ON p.portid = sp.portid \
             JOIN subsys s ON s.nqn = sp.subsys_nqn \
             WHERE s.allow_any_host = 1 \
                OR EXISTS (SELECT 1 FROM host_subsys hs \
                           WHERE hs.subsys_nqn = sp.subsys_nqn AND hs.host_nqn = ?1)",
        )?;
        let rows = stmt.query_map(params![host_nqn], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (trtype, adrfam, treq, portid, trsvcid, subnqn, traddr, sectype) = row?;
            entries.push(DiscEntry {
                trtype: parse_trtype(&trtype),
                adrfam: parse_adrfam(&adrfam),
                treq: parse_treq(&treq),
                portid: portid as u16,
                trsvcid,
                subnqn,
                traddr,
                sectype: sectype as u8,
            });
        }
        Ok(crate::wire::disc_log::build_page(
            genctr, &entries, offset, max_len,
        ))
    }
}

fn parse_trtype(s: &str) -> TrType {
    match s {
        "rdma" => TrType::Rdma,
        "fc" => TrType::Fc,
        "loop" => TrType::Loop,
        _ => TrType::Tcp,
    }
}

fn parse_adrfam(s: &str) -> AddrFam {
    match s {
        "ipv6" => AddrFam::Ipv6,
        "ib" => AddrFam::Ib,
        "fc" => AddrFam::Fc,
        "loop" => AddrFam::Loop,
        _ => AddrFam::Ipv4,
    }
}

fn parse_treq(s: &str) -> TrsReq {
    match s {
        "required" => TrsReq::Required,
        "not required" => TrsReq::NotRequired,
        _ => TrsReq::NotSpecified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    fn fixture() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn genctr_monotonic_on_link_add_remove() {
        let store = fixture();
        store.add_host("nqn.example:host:A").unwrap();
        store.add_subsys("nqn.tgt:sN", false).unwrap();
        let g0 = store.host_genctr("nqn.example:host:A").unwrap();
        store
            .add_host_subsys("nqn.example:host:A", "nqn.tgt:sN")
            .unwrap();
        let g1 = store.host_genctr("nqn.example:host:A").unwrap();
        assert!(g1 > g0);
        store
            .del_host_subsys("nqn.example:host:A", "nqn.tgt:sN")
            .unwrap();
        let g2 = store.host_genctr("nqn.example:host:A").unwrap();
        assert!(g2 > g1);
    }

    #[test]
    fn allow_any_host_visible_without_explicit_link() {
        let store = fixture();
        store.add_host("nqn.example:host:B").unwrap();
        store.add_subsys("nqn.tgt:sAny", true).unwrap();
        store
            .add_port(1, "tcp", "ipv4", "192.0.2.10", "4420", "not required", 0)
            .unwrap();
        store.add_subsys_port("nqn.tgt:sAny", 1).unwrap();

        let page = store
            .host_disc_entries("nqn.example:host:B", 0, 4096)
            .unwrap();
        let numrec = u64::from_le_bytes(page[8..16].try_into().unwrap());
        assert_eq!(numrec, 1);
    }

    #[test]
    fn duplicate_host_insert_is_reported_not_panicking() {
        let store = fixture();
        store.add_host("nqn.example:host:A").unwrap();
        let err = store.add_host("nqn.example:host:A").unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[test]
    fn count_subsys_port_reflects_pending_links() {
        let store = fixture();
        store.add_subsys("nqn.tgt:sN", false).unwrap();
        store
            .add_port(2, "tcp", "ipv4", "192.0.2.11", "4420", "not required", 0)
            .unwrap();
        assert_eq!(store.count_subsys_port(2).unwrap(), 0);
        store.add_subsys_port("nqn.tgt:sN", 2).unwrap();
        assert_eq!(store.count_subsys_port(2).unwrap(), 1);
    }
}
