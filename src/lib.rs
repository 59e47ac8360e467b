//! Purpose: Library crate behind the `cplrun` CLI and its integration tests.
//! Exports: `api` (public surface), `core` (CPL binding and execution), `esorex`, `search`.
//! Role: Host CPL recipe modules and run them in isolated worker processes.
//! Invariants: Everything that touches raw CPL pointers lives under `core`.
//! Invariants: Hosts go through `api`; the other modules are shared plumbing for the CLI.
pub mod api;
pub mod core;
pub mod esorex;
pub mod search;
