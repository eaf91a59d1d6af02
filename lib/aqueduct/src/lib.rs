//! The `aqueduct` runtime executes a service described as a directed acyclic
//! graph of servlets connected by typed pipes. Transport modules supply the
//! byte-moving mechanics behind the pipes; the dispatcher turns external
//! connection events into per-request task sets; the egress loop turns
//! non-blocking socket writes into backpressure-aware transmission.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod support;
pub mod pool;
pub mod module;
pub mod pipe;
pub mod servlet;
pub mod graph;
pub mod egress;
pub mod dispatch;
pub mod modules;
pub mod prelude;
