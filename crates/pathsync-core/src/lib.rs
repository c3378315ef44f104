//! Core engine for pathsync: matching local files to their counterparts on a
//! remote host and keeping the resulting pairings in a file map.

pub mod config;
pub mod index;
pub mod logs;
pub mod matcher;
pub mod persist;
pub mod reconcile;
pub mod remote;
pub mod resolve;
pub mod store;
