// Core modules: trace wire format, shared-memory pools, sessions, the writer and the service.
pub mod buffer_pool;
pub mod error;
pub mod process_info;
pub mod segment;
pub mod service;
pub mod session;
pub mod trace_file;
pub mod writer;
