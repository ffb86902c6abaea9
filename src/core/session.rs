//! Purpose: Per-client state: owned buffer pools, custody of every buffer, and the trace file.
//! Exports: `Session`, `SessionId`, `BufferId`, `BufferDescriptor`, `BufferCounts`, `SessionOptions`.
//! Role: Mutated only under the service lock; the writer receives `WriteJob`s it can run unlocked.
//! Invariants: Every buffer is in exactly one of Free, ClientHeld or PendingWrite.
//! Invariants: The free queue holds exactly the Free buffers of an open session.
//! Invariants: A session is destroyable only once closing with nothing held or pending.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::buffer_pool::{BufferPool, BufferState, PoolGrant, PoolId};
use crate::core::error::{Error, ErrorKind};
use crate::core::process_info::ProcessInfo;
use crate::core::trace_file::{self, TraceFileWriter};
use crate::core::writer::WriteJob;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BufferId {
    pub session: SessionId,
    pub pool: PoolId,
    pub index: u32,
}

/// What a client sees of a buffer. The service-local mapping never crosses the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub pool_id: u32,
    pub mapping_size: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub buffer_size: usize,
    pub growth_increment: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferCounts {
    pub pools: usize,
    pub free: usize,
    pub client_held: usize,
    pub pending_write: usize,
}

impl BufferCounts {
    pub fn total(&self) -> usize {
        self.free + self.client_held + self.pending_write
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client_pid: u32,
    options: SessionOptions,
    trace_file: Arc<TraceFileWriter>,
    pools: Vec<BufferPool>,
    free: VecDeque<(PoolId, u32)>,
    client_held: usize,
    pending_write: usize,
    closing: bool,
}

impl Session {
    /// Snapshots the client and opens a fresh trace file under `trace_dir`.
    pub fn init(
        id: SessionId,
        client_pid: u32,
        trace_dir: &Path,
        command_line: &str,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let mut process = ProcessInfo::capture(client_pid).map_err(|err| err.with_session(id.0))?;
        if !command_line.is_empty() {
            process.command_line = command_line.to_string();
        }
        let block_size = trace_file::block_size_for(trace_dir)?;
        let writer = TraceFileWriter::open(trace_dir, &process, block_size)
            .map_err(|err| err.with_session(id.0).with_pid(client_pid))?;
        info!(
            session = id.0,
            pid = client_pid,
            path = %writer.path().display(),
            "session opened"
        );
        Ok(Self::with_trace_file(id, client_pid, writer, options))
    }

    pub fn with_trace_file(
        id: SessionId,
        client_pid: u32,
        trace_file: TraceFileWriter,
        options: SessionOptions,
    ) -> Self {
        Self {
            id,
            client_pid,
            options,
            trace_file: Arc::new(trace_file),
            pools: Vec::new(),
            free: VecDeque::new(),
            client_held: 0,
            pending_write: 0,
            closing: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_pid(&self) -> u32 {
        self.client_pid
    }

    pub fn trace_path(&self) -> &Path {
        self.trace_file.path()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn allocate_buffers(&mut self, count: usize, size: usize) -> Result<PoolGrant, Error> {
        let pool_id = PoolId(self.pools.len() as u32);
        let (pool, grant) = BufferPool::init(pool_id, self.client_pid, count, size)
            .map_err(|err| err.with_session(self.id.0))?;
        self.free
            .extend(pool.buffers().iter().map(|buffer| (pool_id, buffer.index())));
        debug!(
            session = self.id.0,
            pool = pool_id.0,
            count,
            size,
            "allocated buffer pool"
        );
        self.pools.push(pool);
        Ok(grant)
    }

    pub fn has_available_buffers(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn get_next_buffer(&mut self) -> Option<BufferId> {
        let (pool, index) = self.free.pop_front()?;
        if let Some(buffer) = self.pool_mut(pool).and_then(|p| p.buffer_mut(index)) {
            buffer.set_state(BufferState::ClientHeld);
        }
        self.client_held += 1;
        Some(BufferId {
            session: self.id,
            pool,
            index,
        })
    }

    /// Hands out a free buffer, growing by one pool first when none is left.
    ///
    /// Any pool created on the way is returned so its handle can reach the client.
    pub fn acquire_buffer(&mut self) -> Result<(BufferId, Option<PoolGrant>), Error> {
        if self.closing {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("session is closing")
                .with_session(self.id.0));
        }
        let grant = if self.has_available_buffers() {
            None
        } else {
            Some(self.allocate_buffers(self.options.growth_increment, self.options.buffer_size)?)
        };
        let id = self.get_next_buffer().ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message("free queue empty after growth")
                .with_session(self.id.0)
        })?;
        Ok((id, grant))
    }

    pub fn find_buffer(&self, descriptor: &BufferDescriptor) -> Option<BufferId> {
        let pool = self.pool(PoolId(descriptor.pool_id))?;
        let index = pool.locate(descriptor.offset)?;
        let buffer = pool.buffer(index)?;
        if buffer.size() != descriptor.size || buffer.mapping_size() != descriptor.mapping_size {
            return None;
        }
        Some(BufferId {
            session: self.id,
            pool: pool.id(),
            index,
        })
    }

    pub fn descriptor(&self, id: BufferId) -> Option<BufferDescriptor> {
        let buffer = self.pool(id.pool)?.buffer(id.index)?;
        Some(BufferDescriptor {
            pool_id: id.pool.0,
            mapping_size: buffer.mapping_size(),
            offset: buffer.offset(),
            size: buffer.size(),
        })
    }

    pub fn buffer_state(&self, id: BufferId) -> Option<BufferState> {
        Some(self.pool(id.pool)?.buffer(id.index)?.state())
    }

    /// Moves a client-held buffer into write-pending custody.
    pub fn mark_write_pending(&mut self, id: BufferId) -> Result<(), Error> {
        let session = self.id.0;
        let buffer = self
            .pool_mut(id.pool)
            .and_then(|pool| pool.buffer_mut(id.index))
            .ok_or_else(|| {
                Error::new(ErrorKind::Protocol)
                    .with_message("unknown buffer")
                    .with_session(session)
            })?;
        match buffer.state() {
            BufferState::ClientHeld => {}
            BufferState::PendingWrite => {
                return Err(Error::new(ErrorKind::Protocol)
                    .with_message("buffer already committed")
                    .with_session(session));
            }
            BufferState::Free => {
                return Err(Error::new(ErrorKind::Protocol)
                    .with_message("buffer is not held by the client")
                    .with_session(session));
            }
        }
        buffer.set_state(BufferState::PendingWrite);
        self.client_held -= 1;
        self.pending_write += 1;
        Ok(())
    }

    pub(crate) fn write_job(&self, id: BufferId) -> Option<WriteJob> {
        let pool = self.pool(id.pool)?;
        let buffer = pool.buffer(id.index)?;
        Some(WriteJob {
            buffer: id,
            region: Arc::clone(pool.region()),
            offset: buffer.offset() as usize,
            size: buffer.size() as usize,
            trace_file: Arc::clone(&self.trace_file),
        })
    }

    /// Returns a flushed buffer to the free queue. True when the session became destroyable.
    pub fn recycle_buffer(&mut self, id: BufferId) -> bool {
        if self.buffer_state(id) != Some(BufferState::PendingWrite) {
            warn!(
                session = self.id.0,
                pool = id.pool.0,
                index = id.index,
                "recycling buffer that was not pending"
            );
            return self.can_destroy();
        }
        if let Some(buffer) = self.pool_mut(id.pool).and_then(|pool| pool.buffer_mut(id.index)) {
            buffer.set_state(BufferState::Free);
        }
        self.pending_write -= 1;
        if !self.closing {
            self.free.push_back((id.pool, id.index));
        }
        self.can_destroy()
    }

    /// Marks the session closing and discards buffers the client still holds.
    ///
    /// Pending writes stay queued. Returns true when the session can be destroyed now.
    pub fn close(&mut self) -> bool {
        if !self.closing {
            self.closing = true;
            let mut discarded = 0usize;
            for pool in &mut self.pools {
                for index in 0..pool.buffers().len() as u32 {
                    let Some(buffer) = pool.buffer_mut(index) else {
                        continue;
                    };
                    if buffer.state() == BufferState::ClientHeld {
                        buffer.set_state(BufferState::Free);
                        discarded += 1;
                    }
                }
            }
            self.client_held = 0;
            self.free.clear();
            info!(
                session = self.id.0,
                pid = self.client_pid,
                discarded,
                pending = self.pending_write,
                "session closing"
            );
        }
        self.can_destroy()
    }

    pub fn can_destroy(&self) -> bool {
        self.closing && self.client_held == 0 && self.pending_write == 0
    }

    pub fn counts(&self) -> BufferCounts {
        let mut counts = BufferCounts {
            pools: self.pools.len(),
            ..BufferCounts::default()
        };
        for buffer in self.pools.iter().flat_map(|pool| pool.buffers()) {
            match buffer.state() {
                BufferState::Free => counts.free += 1,
                BufferState::ClientHeld => counts.client_held += 1,
                BufferState::PendingWrite => counts.pending_write += 1,
            }
        }
        counts
    }

    /// Releases the pools and closes the trace file. Call without the service lock.
    pub fn destroy(self) {
        let Session {
            id,
            client_pid,
            trace_file,
            pools,
            ..
        } = self;
        drop(pools);
        match Arc::try_unwrap(trace_file) {
            Ok(writer) => writer.close_logged(),
            Err(shared) => warn!(
                session = id.0,
                path = %shared.path().display(),
                "trace file still referenced at destroy"
            ),
        }
        info!(session = id.0, pid = client_pid, "session destroyed");
    }

    fn pool(&self, id: PoolId) -> Option<&BufferPool> {
        self.pools.get(id.0 as usize)
    }

    fn pool_mut(&mut self, id: PoolId) -> Option<&mut BufferPool> {
        self.pools.get_mut(id.0 as usize)
    }
}
