#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
//! # sketch-supervisor: a host-side container supervisor for agentic coding sessions
//!
//! This crate drives one side of a developer's machine: given a source-control
//! checkout, it builds (or reuses) a derived container image pre-warmed with
//! that checkout's dependency manifests, starts a container from it, and wires
//! up everything an in-container coding agent needs to reach back out to the
//! host — a loopback HTTP bridge onto the checkout's source control, SSH
//! certificates trusting the container, and a retrying control-plane
//! handshake — then attaches to the container and tears all of that down
//! again on exit.
//!
//! None of this talks to a container daemon's HTTP API directly; every
//! external effect (the container runtime, the source-control binary, `ssh`)
//! is shelled out to as a subprocess via [`process`], in keeping with this
//! supervisor's "the host owns no daemon connection" design.
//!
//! ## Module map
//!
//! - [`cli`] / [`config`] — flag parsing and the three-tier configuration loader.
//! - [`logging`] — the ambient `log`/`env_logger` initialization.
//! - [`process`] / [`tokenizer`] / [`redact`] — the subprocess runner and its
//!   supporting argument tokenizer and credential redaction.
//! - [`scm`] — source-control probing and module-manifest extraction.
//! - [`image`] — the content-addressed image cache and layered image builder.
//! - [`seccomp`] — the seccomp profile cache.
//! - [`bridge`] — the authenticated source-control HTTP bridge.
//! - [`ssh`] — identity, certificate authority, and client-config management.
//! - [`container`] — container create/start/attach/cleanup.
//! - [`init`] — the control-plane handshake with the in-container agent.
//! - [`tunnel`] — the port tunnel manager.
//! - [`orchestrator`] — ties all of the above together in startup order.
//! - [`error`] — the crate-wide error type every subsystem composes into.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod redact;
pub mod scm;
pub mod seccomp;
pub mod ssh;
pub mod tokenizer;
pub mod tunnel;

pub use error::{Result, SupervisorError};
