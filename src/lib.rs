// src/lib.rs

//! `brokerd`: the CUBRID-style broker/CAS dispatch and worker-pool front
//! end. See `src/core/mod.rs` for the subsystem map and `src/server/mod.rs`
//! for how one broker process is assembled from it.

pub mod config;
pub mod core;
pub mod logging;
pub mod server;
