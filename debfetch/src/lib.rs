//! debfetch - the acquire subsystem of a Debian-style package manager
//!
//! Fetches repository metadata and package archives through pluggable
//! transport methods, verifies them against signed release files, keeps
//! package indexes current with incremental diffs, and moves only verified
//! files into place.
//!
//! ```text
//!   ReleaseSource ──► Acquire::add_release ──► InRelease / Release + Release.gpg
//!                                                   │ verified
//!                                                   ▼
//!                                   indexes (compressed / pdiff / by-hash)
//!   PackageVersion ─► Acquire::add_archive ──► .deb into archives/
//!   FileRequest ────► Acquire::add_file ─────► any file, hash checked
//! ```
//!
//! Transfers run in method workers (`http`, `file`, `copy`, `gzip`, `rred`,
//! `gpgv`, or external binaries) that speak a line-based message protocol.

pub mod acquire;
pub mod config;
pub mod error;
pub mod gpgv;
pub mod hashes;
pub mod interrupt;
pub mod item;
pub mod message;
pub mod mirror;
pub mod pdiff;
pub mod release;
pub mod sources;
pub mod tagfile;
pub mod uri;

pub use acquire::{Acquire, AcquireStatus, DefaultTransports, ProgressSnapshot, RunResult, RunSummary};
pub use config::{AcquireConfig, ConfigFile};
pub use error::{AcquireError, AcquireResult};
pub use hashes::{HashString, HashType, Hashes};
pub use item::{Item, ItemId, ItemStatus};
pub use sources::{FileRequest, IndexTarget, PackageVersion, ReleaseSource};

/// Library version, sent by the built-in methods in their capabilities.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
