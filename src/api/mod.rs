//! Purpose: Define the public Rust API boundary for the call-trace service.
//! Exports: Service owner and entry points, client, wire descriptors, trace-file reader, errors.
//! Role: Public, additive-only surface used by the binary, clients and integration tests.
//! Invariants: Internal helpers (writer jobs, fd passing) stay out of this module.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::config::{
    DEFAULT_FLAGS, ServiceConfig, TRACE_FLAG_BATCH_ENTER, TRACE_FLAG_ENTER, TRACE_FLAG_EXIT,
    TRACE_FLAG_LOAD_EVENTS, TRACE_FLAG_STACK_TRACES, TRACE_FLAG_THREAD_EVENTS,
};
pub use crate::core::buffer_pool::BufferState;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::process_info::ProcessInfo;
pub use crate::core::segment::{RecordType, SegmentWriter, records};
pub use crate::core::service::{BufferGrant, Service, ServiceCore, SessionGrant};
pub use crate::core::session::{BufferCounts, BufferDescriptor, SessionId};
pub use crate::core::trace_file::{SegmentRecord, TraceFileHeader, TraceFileReader};
pub use crate::core::writer::WriterStats;
pub use crate::rpc::client::{ClientSession, TraceClient, request_shutdown_at};
