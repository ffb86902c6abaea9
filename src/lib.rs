//! Purpose: Library crate behind the `calltrace-service` binary and its clients.
//! Exports: `api` (public surface), `config`, `core` (sessions, pools, writer, trace files), `rpc`.
//! Role: Hosts the service core plus the socket protocol that reaches it.
//! Invariants: Service state lives in an explicitly constructed `Service`; there are no globals.
//! Invariants: Linux only: shared memory is memfd-backed and descriptors move over SCM_RIGHTS.
pub mod api;
pub mod config;
pub mod core;
pub mod rpc;
