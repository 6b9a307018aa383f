//! Core mail-processing engine: a pool of queue runners driven by on-disk
//! spool directories that pass each message through an ordered chain of
//! handlers, plus the subsystems the hard behaviour depends on — digest
//! accumulation and assembly, the email command processor, the bounce
//! classifier and scorer, and the MTA alias writer.
//!
//! The engine is deliberately synchronous: one OS process per runner,
//! concurrency mediated entirely through the filesystem and cross-process
//! locks. Mutable per-list state is only touched while holding the list
//! lock; the alias map only under the MTA lock (always ordered MTA before
//! list).

pub mod bounce;
pub mod command;
pub mod digest;
pub mod handlers;
pub mod i18n;
pub mod incoming;
pub mod inject;
pub mod list;
pub mod mta;
pub mod notify;
pub mod pipeline;
pub mod runner;
pub mod site;
pub mod transport;

pub use site::Site;
