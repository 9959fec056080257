//! This library keeps a persistent index in sync with a set of watched
//! filesystem trees.
//!
//! Every file under a registered root is recorded with its mtime and,
//! eventually, a pair of content fingerprints (a CRC32 and the ed2k MD4
//! hash), computed lazily by a background worker and stored deduplicated.
//!
//! The moving parts: an inotify demultiplexer (see [`InotifyWatcher`]) turns
//! kernel events into a normalized stream, a [`Scanner`] reconciles whole
//! subtrees against the index, and the [`Mirror`] coordinator serializes the
//! two so that the index converges on the live filesystem state even while
//! it keeps changing. The [`Hasher`] trails behind, fingerprinting whatever
//! rows have none yet.

mod db;
mod error;
mod fingerprint;
mod hasher;
mod mirror;
mod scanner;
mod scheduler;
mod watch;

pub use db::Database;
pub use error::{Error, Result};
pub use fingerprint::{crc_and_ed2k, ED2K_BLOCK};
pub use hasher::Hasher;
pub use mirror::{Mirror, DEFAULT_MOVE_WINDOW};
pub use scanner::Scanner;
pub use scheduler::Scheduler;
pub use watch::{DieReason, FsEvent, InotifyWatcher};
