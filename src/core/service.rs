//! Purpose: Compose sessions, the pending-write queue and the writer into a running service.
//! Exports: `ServiceCore` (entry points), `Service` (owner: start/stop), grant types.
//! Role: The only place the service lock lives; RPC handlers and the writer share one `ServiceCore`.
//! Invariants: One mutex guards sessions, free lists, buffer custody and the queue.
//! Invariants: No disk write and no trace-file close happens while the lock is held.
//! Invariants: After `Service::stop` returns the session map is empty and no helper thread runs.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::core::buffer_pool::{BufferState, PoolGrant};
use crate::core::error::{Error, ErrorKind};
use crate::core::session::{BufferCounts, BufferDescriptor, BufferId, Session, SessionId};
use crate::core::writer::{self, Drained, Outcome, PendingWrite, WriterStats};
use crate::rpc::server::RpcServer;

/// Result of `CreateSession`: the handle, the first buffer and the pool backing it.
#[derive(Debug)]
pub struct SessionGrant {
    pub session: SessionId,
    pub buffer: BufferDescriptor,
    pub flags: u32,
    pub pools: Vec<PoolGrant>,
}

/// A buffer handed to the client plus any pool created to satisfy the request.
#[derive(Debug)]
pub struct BufferGrant {
    pub buffer: BufferDescriptor,
    pub pools: Vec<PoolGrant>,
}

struct ServiceState {
    sessions: BTreeMap<SessionId, Session>,
    queue: VecDeque<PendingWrite>,
    next_session: u64,
    stats: WriterStats,
    sealed: bool,
    shutdown_requested: bool,
}

pub struct ServiceCore {
    config: ServiceConfig,
    state: Mutex<ServiceState>,
    work_ready: Condvar,
    shutdown: Condvar,
}

impl ServiceCore {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServiceState {
                sessions: BTreeMap::new(),
                queue: VecDeque::new(),
                next_session: 1,
                stats: WriterStats::default(),
                sealed: false,
                shutdown_requested: false,
            }),
            work_ready: Condvar::new(),
            shutdown: Condvar::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_session(&self, pid: u32, command_line: &str) -> Result<SessionGrant, Error> {
        let id = {
            let mut state = self.lock();
            if state.sealed {
                return Err(stopping());
            }
            let id = SessionId(state.next_session);
            state.next_session += 1;
            id
        };

        // The session is private until inserted, so its setup runs unlocked.
        let mut session = Session::init(
            id,
            pid,
            self.config.trace_dir(),
            command_line,
            self.config.session_options(),
        )
        .inspect_err(|err| warn!(pid, error = %err, "session creation failed"))?;
        let (buffer, pool) = match session.acquire_buffer() {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(session = id.0, pid, error = %err, "initial buffer allocation failed");
                session.destroy();
                return Err(err);
            }
        };
        let Some(descriptor) = session.descriptor(buffer) else {
            session.destroy();
            return Err(Error::new(ErrorKind::Internal)
                .with_message("initial buffer vanished")
                .with_session(id.0));
        };

        let rejected = {
            let mut state = self.lock();
            if state.sealed {
                Some(session)
            } else {
                state.sessions.insert(id, session);
                None
            }
        };
        if let Some(session) = rejected {
            session.destroy();
            return Err(stopping());
        }
        Ok(SessionGrant {
            session: id,
            buffer: descriptor,
            flags: self.config.flags(),
            pools: pool.into_iter().collect(),
        })
    }

    pub fn allocate_buffer(&self, session: SessionId) -> Result<BufferGrant, Error> {
        let mut state = self.lock();
        let session = open_session(&mut state, session)?;
        acquire(session)
    }

    /// Queues a client buffer for writing and optionally hands back a fresh one.
    ///
    /// A failure to produce the replacement is reported, but the commit stands.
    pub fn commit_and_exchange(
        &self,
        session: SessionId,
        descriptor: &BufferDescriptor,
        exchange: bool,
    ) -> Result<Option<BufferGrant>, Error> {
        let mut state = self.lock();
        let open = open_session(&mut state, session)?;
        let id = open.find_buffer(descriptor).ok_or_else(|| {
            Error::new(ErrorKind::Protocol)
                .with_message("buffer not owned by session")
                .with_session(session.0)
        })?;
        open.mark_write_pending(id)?;
        let replacement = if exchange { Some(acquire(open)) } else { None };
        state.queue.push_back(PendingWrite::Buffer(id));
        self.work_ready.notify_one();
        debug!(
            session = session.0,
            pool = descriptor.pool_id,
            offset = descriptor.offset,
            "buffer committed"
        );
        replacement.transpose()
    }

    pub fn return_buffer(
        &self,
        session: SessionId,
        descriptor: &BufferDescriptor,
    ) -> Result<(), Error> {
        self.commit_and_exchange(session, descriptor, false)
            .map(|_| ())
    }

    pub fn close_session(&self, session: SessionId) -> Result<(), Error> {
        let destroyed = {
            let mut state = self.lock();
            let open = open_session(&mut state, session)?;
            if open.close() {
                state.sessions.remove(&session)
            } else {
                None
            }
        };
        if let Some(session) = destroyed {
            session.destroy();
        }
        Ok(())
    }

    /// Flags the service for shutdown; the owner finishes the job in `Service::stop`.
    pub fn request_shutdown(&self) {
        let mut state = self.lock();
        if !state.shutdown_requested {
            info!("shutdown requested");
        }
        state.shutdown_requested = true;
        self.shutdown.notify_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.lock().shutdown_requested
    }

    pub fn wait_for_shutdown(&self) {
        let mut state = self.lock();
        while !state.shutdown_requested {
            state = self
                .shutdown
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock().sessions.keys().copied().collect()
    }

    pub fn buffer_counts(&self, session: SessionId) -> Option<BufferCounts> {
        self.lock().sessions.get(&session).map(Session::counts)
    }

    pub fn buffer_state(
        &self,
        session: SessionId,
        descriptor: &BufferDescriptor,
    ) -> Option<BufferState> {
        let state = self.lock();
        let session = state.sessions.get(&session)?;
        session.buffer_state(session.find_buffer(descriptor)?)
    }

    pub fn trace_path(&self, session: SessionId) -> Option<PathBuf> {
        self.lock()
            .sessions
            .get(&session)
            .map(|session| session.trace_path().to_path_buf())
    }

    pub fn pending_writes(&self) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|item| matches!(item, PendingWrite::Buffer(_)))
            .count()
    }

    pub fn stats(&self) -> WriterStats {
        self.lock().stats
    }

    /// Blocks until work is queued, then takes the whole queue.
    pub(crate) fn take_pending(&self) -> Vec<Drained> {
        let mut state = self.lock();
        while state.queue.is_empty() {
            state = self
                .work_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let queue = std::mem::take(&mut state.queue);
        let mut drained = Vec::with_capacity(queue.len());
        for item in queue {
            match item {
                PendingWrite::Buffer(id) => {
                    match state.sessions.get(&id.session).and_then(|s| s.write_job(id)) {
                        Some(job) => drained.push(Drained::Job(job)),
                        None => warn!(session = id.session.0, "queued buffer has no session"),
                    }
                }
                PendingWrite::Shutdown => drained.push(Drained::Shutdown),
            }
        }
        drained
    }

    pub(crate) fn finish_write(&self, buffer: BufferId, outcome: Outcome) {
        let destroyed = {
            let mut state = self.lock();
            state.stats.record(outcome);
            let destroyable = state
                .sessions
                .get_mut(&buffer.session)
                .map(|session| session.recycle_buffer(buffer))
                .unwrap_or(false);
            if destroyable {
                state.sessions.remove(&buffer.session)
            } else {
                None
            }
        };
        if let Some(session) = destroyed {
            session.destroy();
        }
    }

    /// Closes every session and queues the shutdown marker. Returns false if already sealed.
    fn seal(&self) -> bool {
        let destroyed: Vec<Session> = {
            let mut state = self.lock();
            if state.sealed {
                return false;
            }
            state.sealed = true;
            let quiescent: Vec<SessionId> = state
                .sessions
                .iter_mut()
                .filter_map(|(id, session)| session.close().then_some(*id))
                .collect();
            let destroyed = quiescent
                .iter()
                .filter_map(|id| state.sessions.remove(id))
                .collect();
            state.queue.push_back(PendingWrite::Shutdown);
            self.work_ready.notify_all();
            destroyed
        };
        for session in destroyed {
            session.destroy();
        }
        true
    }
}

fn stopping() -> Error {
    Error::new(ErrorKind::Busy).with_message("service is stopping")
}

fn open_session(state: &mut ServiceState, id: SessionId) -> Result<&mut Session, Error> {
    match state.sessions.get_mut(&id) {
        Some(session) if !session.is_closing() => Ok(session),
        _ => Err(Error::new(ErrorKind::NotFound)
            .with_message("unknown session")
            .with_session(id.0)),
    }
}

fn acquire(session: &mut Session) -> Result<BufferGrant, Error> {
    let (id, pool) = session.acquire_buffer()?;
    let buffer = session.descriptor(id).ok_or_else(|| {
        Error::new(ErrorKind::Internal)
            .with_message("acquired buffer vanished")
            .with_session(id.session.0)
    })?;
    Ok(BufferGrant {
        buffer,
        pools: pool.into_iter().collect(),
    })
}

/// Owns a `ServiceCore` together with its writer thread and RPC server.
pub struct Service {
    core: Arc<ServiceCore>,
    server: Option<RpcServer>,
    writer: Option<JoinHandle<()>>,
    running: bool,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            core: Arc::new(ServiceCore::new(config)),
            server: None,
            writer: None,
            running: false,
        }
    }

    pub fn core(&self) -> &Arc<ServiceCore> {
        &self.core
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the writer and the RPC listener.
    ///
    /// With `non_blocking` false this only returns once a shutdown was requested and
    /// the service has been stopped.
    pub fn start(&mut self, non_blocking: bool) -> Result<(), Error> {
        if !self.running {
            if self.core.lock().sealed {
                return Err(Error::new(ErrorKind::Usage).with_message("service already stopped"));
            }
            self.writer = Some(writer::spawn(Arc::clone(&self.core))?);
            match RpcServer::bind(Arc::clone(&self.core)) {
                Ok(server) => self.server = Some(server),
                Err(err) => {
                    self.stop()?;
                    return Err(err);
                }
            }
            self.running = true;
            info!(
                endpoint = %self.core.config().endpoint().display(),
                trace_dir = %self.core.config().trace_dir().display(),
                "service started"
            );
        }
        if !non_blocking {
            self.core.wait_for_shutdown();
            self.stop()?;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), Error> {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if !self.core.seal() {
            return Ok(());
        }
        match self.writer.take() {
            Some(handle) => handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("writer thread panicked")
            })?,
            None => writer::run(&self.core),
        }
        self.running = false;
        let remaining = self.core.session_count();
        if remaining != 0 {
            warn!(remaining, "sessions left after stop");
        }
        info!("service stopped");
        Ok(())
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if !self.running {
            return;
        }
        if let Err(err) = self.stop() {
            warn!(error = %err, "stop during drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segment::{SEGMENT_PREAMBLE_LEN, SegmentWriter, align_up};
    use crate::core::trace_file::TraceFileReader;
    use memmap2::{MmapMut, MmapOptions};
    use std::collections::HashMap;
    use std::fs::File;

    /// Maps granted pools the way a client would.
    #[derive(Default)]
    struct ClientMaps {
        pools: HashMap<u32, MmapMut>,
    }

    impl ClientMaps {
        fn adopt(&mut self, pools: Vec<PoolGrant>) {
            for grant in pools {
                let file = File::from(grant.handle);
                let map = unsafe {
                    MmapOptions::new()
                        .len(grant.mapping_size as usize)
                        .map_mut(&file)
                        .expect("map")
                };
                self.pools.insert(grant.pool.0, map);
            }
        }

        fn buffer(&mut self, desc: &BufferDescriptor) -> &mut [u8] {
            let map = self.pools.get_mut(&desc.pool_id).expect("pool mapped");
            &mut map[desc.offset as usize..(desc.offset + desc.size) as usize]
        }

        fn fill(&mut self, desc: &BufferDescriptor, thread_id: u32, payload: &[u8]) {
            let mut writer = SegmentWriter::begin(self.buffer(desc), thread_id).expect("begin");
            writer.append_raw(payload).expect("append");
        }
    }

    fn config(dir: &std::path::Path) -> ServiceConfig {
        ServiceConfig::new()
            .with_trace_dir(dir)
            .with_buffer_size(1024 * 1024)
            .with_growth_increment(16)
            .with_endpoint(dir.join("svc.sock"))
    }

    fn file_len(path: &std::path::Path) -> u64 {
        std::fs::metadata(path).expect("metadata").len()
    }

    #[test]
    fn double_commit_is_rejected_without_requeue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = Service::new(config(dir.path()));
        let core = Arc::clone(service.core());
        let mut client = ClientMaps::default();

        let grant = core
            .create_session(std::process::id(), "")
            .expect("session");
        client.adopt(grant.pools);
        client.fill(&grant.buffer, 1, b"first");

        core.commit_and_exchange(grant.session, &grant.buffer, false)
            .expect("commit");
        let err = core
            .commit_and_exchange(grant.session, &grant.buffer, true)
            .expect_err("double commit");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(core.pending_writes(), 1);
        assert_eq!(
            core.buffer_state(grant.session, &grant.buffer),
            Some(BufferState::PendingWrite)
        );

        let path = core.trace_path(grant.session).expect("path");
        service.stop().expect("stop");
        assert_eq!(core.session_count(), 0);
        let segments = TraceFileReader::open(&path)
            .expect("open")
            .segments()
            .expect("segments");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].payload, b"first");
    }

    #[test]
    fn stop_flushes_pending_buffers_of_every_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = Service::new(config(dir.path()));
        let core = Arc::clone(service.core());
        let mut clients = [ClientMaps::default(), ClientMaps::default()];
        let mut paths = Vec::new();

        for (index, client) in clients.iter_mut().enumerate() {
            let grant = core
                .create_session(std::process::id(), &format!("client-{index}"))
                .expect("session");
            client.adopt(grant.pools);
            client.fill(&grant.buffer, index as u32, &[index as u8; 1000]);
            core.return_buffer(grant.session, &grant.buffer)
                .expect("commit");
            paths.push(core.trace_path(grant.session).expect("path"));
        }
        assert_eq!(core.pending_writes(), 2);

        service.stop().expect("stop");
        assert_eq!(core.session_count(), 0);
        assert_eq!(core.stats().segments_written, 2);
        for (index, path) in paths.iter().enumerate() {
            let reader = TraceFileReader::open(path).expect("open");
            assert_eq!(
                reader.header().process.command_line,
                format!("client-{index}")
            );
            let segments = reader.segments().expect("segments");
            assert_eq!(segments.len(), 1);
            assert_eq!(segments[0].payload, vec![index as u8; 1000]);
        }
    }

    #[test]
    fn file_grows_by_aligned_segment_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = Service::new(config(dir.path()));
        let core = Arc::clone(service.core());
        let mut client = ClientMaps::default();

        let grant = core
            .create_session(std::process::id(), "")
            .expect("session");
        client.adopt(grant.pools);
        client.fill(&grant.buffer, 7, &[3u8; 1000]);
        let path = core.trace_path(grant.session).expect("path");
        let before = file_len(&path);
        let block = TraceFileReader::open(&path)
            .expect("open")
            .header()
            .block_size as usize;

        let next = core
            .commit_and_exchange(grant.session, &grant.buffer, true)
            .expect("commit")
            .expect("exchange");
        assert_ne!(next.buffer, grant.buffer);
        assert!(next.pools.is_empty());
        core.close_session(grant.session).expect("close");
        service.stop().expect("stop");

        let expected = align_up(SEGMENT_PREAMBLE_LEN + 1000, block).expect("align");
        assert_eq!(file_len(&path) - before, expected as u64);
    }

    #[test]
    fn close_is_rejected_the_second_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = Service::new(config(dir.path()));
        let core = Arc::clone(service.core());

        let grant = core
            .create_session(std::process::id(), "")
            .expect("session");
        core.close_session(grant.session).expect("close");
        assert_eq!(core.session_count(), 0);
        let err = core.close_session(grant.session).expect_err("second close");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = core
            .allocate_buffer(grant.session)
            .expect_err("closed session");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        service.stop().expect("stop");
    }

    #[test]
    fn closing_session_waits_for_pending_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = Service::new(config(dir.path()));
        let core = Arc::clone(service.core());
        let mut client = ClientMaps::default();

        let grant = core
            .create_session(std::process::id(), "")
            .expect("session");
        client.adopt(grant.pools);
        client.fill(&grant.buffer, 1, b"tail");
        core.return_buffer(grant.session, &grant.buffer)
            .expect("commit");
        core.close_session(grant.session).expect("close");
        // Still in the map until the writer recycles the pending buffer.
        assert_eq!(core.session_count(), 1);
        assert!(core.allocate_buffer(grant.session).is_err());

        service.stop().expect("stop");
        assert_eq!(core.session_count(), 0);
        assert_eq!(core.stats().segments_written, 1);
    }

    #[test]
    fn sealed_service_refuses_new_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut service = Service::new(config(dir.path()));
        let core = Arc::clone(service.core());
        service.stop().expect("stop");
        service.stop().expect("second stop");
        let err = core
            .create_session(std::process::id(), "")
            .expect_err("sealed");
        assert_eq!(err.kind(), ErrorKind::Busy);
        let err = service.start(true).expect_err("restart");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn shutdown_request_releases_waiter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = Arc::new(ServiceCore::new(config(dir.path())));
        let waiter = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || core.wait_for_shutdown())
        };
        core.request_shutdown();
        waiter.join().expect("join");
        assert!(core.shutdown_requested());
    }
}
