//! Prompt-routing shim over the Claude CLI with a GLM backend.
//!
//! The router accepts a text prompt, spawns the `claude` CLI with GLM
//! credentials injected into its environment, and returns the captured
//! result together with any filesystem side effects the child produced.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, timeout
//!   resolution, sanitization). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting subsystems (process orchestration,
//!   filesystem snapshots, the logging pipeline, configuration).
//!
//! Orchestration modules ([`route`], [`serve`]) coordinate core logic with
//! I/O to implement the request flow.

pub mod core;
pub mod io;
pub mod logging;
pub mod route;
pub mod serve;
