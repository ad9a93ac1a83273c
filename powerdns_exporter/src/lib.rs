//! A Prometheus exporter for PowerDNS.
//!
//! This library supports the `powerdns_exporter` binary found elsewhere in
//! this project. It scrapes the statistics endpoint of a PowerDNS recursor or
//! authoritative server's HTTP API and exposes them, renamed and typed, in the
//! Prometheus text format.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod collector;
pub mod config;
pub mod fetch;
pub mod histogram;
pub mod httpd;
pub mod registry;
pub mod telemetry;
