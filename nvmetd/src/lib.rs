//! Decentralized NVMe-oF discovery controller. Each host's view of the
//! discovery database is rebuilt from a configfs tree watched via
//! inotify (`reflector`), served over NVMe/TCP (`iface`, `endpoint`,
//! `wire`) against per-host generation counters kept in a SQLite-backed
//! relational store (`store`).

pub mod aen;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod iface;
pub mod logger;
pub mod reflector;
pub mod session;
pub mod store;
pub mod wire;
