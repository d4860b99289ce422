//! Automatic File Distribution engine core library.
//!
//! This library provides the shared-status store, the transfer-rate-limit
//! engine, the protocol adapters and the transfer worker lifecycle behind
//! the `afd-sf`/`afd-gf`/`afd-demcd`/`afd-reinit`/`afd-dcc` binaries.
//!
//! # Architecture
//!
//! - [`db`] - connection pool and migration runner for the shared SQLite
//!   status store
//! - [`config`] - layered runtime configuration (`$AFD_WORK_DIR` layout)
//! - [`status`] - FSA (hosts), FRA (directories) and MDB (message cache)
//! - [`position`] - generic position-attach protocol shared by FSA/FRA
//! - [`lsdata`] - per-host retrieve-list store
//! - [`trl`] - transfer-rate-limit group parsing and distribution
//! - [`protocol`] - per-protocol connection adapters (HTTP, FTP, SFTP,
//!   SMTP, POP3, WMO, local, exec)
//! - [`worker`] - `sf_xxx`/`gf_xxx` argument decode and work loop
//! - [`correlator`] - DE-Mail confirmation correlator
//! - [`reinit`] - staged status-area teardown
//! - [`error`] - crate-wide error taxonomy and worker exit codes

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod correlator;
pub mod db;
pub mod error;
pub mod lsdata;
pub mod position;
pub mod protocol;
pub mod reinit;
pub mod status;
pub mod trl;
pub mod worker;

pub use config::AfdConfig;
pub use correlator::{Correlator, CorrelatorError};
pub use db::{AfdDb, DbError};
pub use error::{AfdError, ExitCode};
pub use lsdata::{LsDataError, LsDataHandle};
pub use position::PositionAttacher;
pub use status::{FraStore, FsaStore, MdbStore, StatusError};
pub use trl::{TrlConfig, TrlError};
pub use worker::{WorkerArgs, WorkerContext, WorkerKind};
