//! Purpose: The single writer worker that drains committed buffers to trace files.
//! Exports: `WriterStats`; crate-internal `PendingWrite`, `WriteJob`, `spawn`, `run`.
//! Role: Consumer side of the pending-write queue owned by `ServiceCore`.
//! Invariants: Disk writes happen outside the service lock; recycling happens under it.
//! Invariants: `PendingWrite::Shutdown` is the last item ever queued; seeing it ends the loop.
//! Invariants: Every dequeued buffer is recycled, whether it was written, dropped or failed.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::core::buffer_pool::SharedRegion;
use crate::core::error::{Error, ErrorKind};
use crate::core::segment::{self, SEGMENT_PREAMBLE_LEN};
use crate::core::service::ServiceCore;
use crate::core::session::BufferId;
use crate::core::trace_file::TraceFileWriter;

/// Byte pattern left in recycled buffer bodies by debug builds.
pub const DEBUG_FILL_BYTE: u8 = 0xDD;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PendingWrite {
    Buffer(BufferId),
    Shutdown,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriterStats {
    pub segments_written: u64,
    pub segments_dropped: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
}

/// Everything the writer needs to flush one buffer without holding the lock.
#[derive(Debug)]
pub(crate) struct WriteJob {
    pub(crate) buffer: BufferId,
    pub(crate) region: Arc<SharedRegion>,
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) trace_file: Arc<TraceFileWriter>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    Written(usize),
    Dropped,
    Failed,
}

impl WriterStats {
    pub(crate) fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Written(len) => {
                self.segments_written += 1;
                self.bytes_written += len as u64;
            }
            Outcome::Dropped => self.segments_dropped += 1,
            Outcome::Failed => self.write_errors += 1,
        }
    }
}

pub(crate) enum Drained {
    Job(WriteJob),
    Shutdown,
}

pub(crate) fn spawn(core: Arc<ServiceCore>) -> Result<JoinHandle<()>, Error> {
    thread::Builder::new()
        .name("calltrace-writer".to_string())
        .spawn(move || run(&core))
        .map_err(|err| {
            Error::new(ErrorKind::Resource)
                .with_message("failed to start writer thread")
                .with_source(err)
        })
}

/// Drains the queue until the shutdown marker shows up.
pub(crate) fn run(core: &ServiceCore) {
    debug!("writer running");
    loop {
        for item in core.take_pending() {
            match item {
                Drained::Job(job) => {
                    let buffer = job.buffer;
                    let outcome = flush(&job);
                    scrub(&job);
                    drop(job);
                    core.finish_write(buffer, outcome);
                }
                Drained::Shutdown => {
                    info!("writer stopped");
                    return;
                }
            }
        }
    }
}

/// Validates the segment in a committed buffer and appends it to the trace file.
pub(crate) fn flush(job: &WriteJob) -> Outcome {
    let session = job.buffer.session.0;
    let bytes = match job.region.bytes(job.offset, job.size) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(session, error = %err, "dropping buffer outside its region");
            return Outcome::Dropped;
        }
    };
    // The client may still be touching the header; whatever is read here is authoritative.
    let header = match segment::parse_segment(bytes) {
        Ok(header) => header,
        Err(err) => {
            warn!(
                session,
                pool = job.buffer.pool.0,
                offset = job.offset,
                error = %err,
                "dropping invalid segment"
            );
            return Outcome::Dropped;
        }
    };
    let len = match segment::segment_write_len(&header, job.trace_file.block_size(), job.size) {
        Ok(len) => len,
        Err(err) => {
            warn!(
                session,
                pool = job.buffer.pool.0,
                offset = job.offset,
                segment_length = header.segment_length,
                error = %err,
                "dropping oversized segment"
            );
            return Outcome::Dropped;
        }
    };
    match job.trace_file.write(&bytes[..len]) {
        Ok(()) => {
            debug!(
                session,
                thread_id = header.thread_id,
                bytes = len,
                "segment written"
            );
            Outcome::Written(len)
        }
        Err(err) => {
            error!(session, error = %err, "segment write failed");
            Outcome::Failed
        }
    }
}

/// Clears the segment preamble so the next user starts clean.
pub(crate) fn scrub(job: &WriteJob) {
    let header_len = SEGMENT_PREAMBLE_LEN.min(job.size);
    if let Err(err) = job.region.fill(job.offset, header_len, 0) {
        warn!(error = %err, "failed to clear segment header");
        return;
    }
    if cfg!(debug_assertions) {
        if let Err(err) = job.region.fill(
            job.offset + header_len,
            job.size - header_len,
            DEBUG_FILL_BYTE,
        ) {
            warn!(error = %err, "failed to fill recycled buffer");
        }
    }
}
