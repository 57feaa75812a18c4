//! Library to backup the VMs and databases of a small virtualization cluster
//! and to keep the VMs running.
//!
//! A backup pass produces artifacts with one of the [`producers`], applies the
//! [retention policy](util::retention) locally, copies the artifacts to the
//! replica nodes using the [`replication`] module and prunes them there too.
//! Outcomes are reported through the [`report`] sinks.
//!
//! Passes are driven by the [`scheduler`], which never runs two passes of
//! the same job at once.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod cli;
pub mod job;
pub mod monitor;
pub mod producers;
pub mod replication;
pub mod report;
pub mod scheduler;
pub mod settings;
pub mod util;
