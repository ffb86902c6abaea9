//! Purpose: Serve the six service entry points over a Unix domain socket.
//! Exports: `RpcServer`.
//! Role: Accepts connections, runs one handler thread per client and performs rundown on disconnect.
//! Invariants: At most one server owns an endpoint, enforced by an exclusive lock file.
//! Invariants: A session handle is honoured only on the connection that created it.
//! Invariants: Every session a connection still owns is closed when the connection ends.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read};
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config;
use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::service::ServiceCore;
use crate::core::session::SessionId;
use crate::rpc::fdpass;
use crate::rpc::protocol::{self, MAX_LINE_BYTES, Request, Response, split_pools};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(20);

struct Connection {
    stream: UnixStream,
    handle: Option<JoinHandle<()>>,
}

struct ServerShared {
    core: Arc<ServiceCore>,
    endpoint: PathBuf,
    stopping: AtomicBool,
    next_connection: AtomicU64,
    connections: Mutex<HashMap<u64, Connection>>,
}

impl ServerShared {
    /// Stops accepting; wakes a blocked `accept` with a throwaway connection.
    fn stop_listening(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint.display(), "stop listening");
            let _ = UnixStream::connect(&self.endpoint);
        }
    }
}

pub struct RpcServer {
    shared: Arc<ServerShared>,
    accept_thread: Option<JoinHandle<()>>,
    lock_file: File,
}

impl RpcServer {
    /// Claims the endpoint and starts accepting clients on a background thread.
    pub fn bind(core: Arc<ServiceCore>) -> Result<Self, Error> {
        let endpoint = core.config().endpoint().to_path_buf();
        let lock_file = claim_endpoint(&endpoint)?;
        if endpoint.exists() {
            fs::remove_file(&endpoint).map_err(|err| {
                Error::new(io_error_kind(&err))
                    .with_message("failed to remove stale socket")
                    .with_path(&endpoint)
                    .with_source(err)
            })?;
        }
        let listener = UnixListener::bind(&endpoint).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to listen on endpoint")
                .with_path(&endpoint)
                .with_source(err)
        })?;

        let shared = Arc::new(ServerShared {
            core,
            endpoint: endpoint.clone(),
            stopping: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });
        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name("calltrace-accept".to_string())
            .spawn(move || accept_loop(&accept_shared, listener))
            .map_err(|err| {
                let _ = fs::remove_file(&endpoint);
                Error::new(ErrorKind::Resource)
                    .with_message("failed to start accept thread")
                    .with_source(err)
            })?;
        info!(endpoint = %endpoint.display(), "listening");

        Ok(Self {
            shared,
            accept_thread: Some(accept_thread),
            lock_file,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.shared.endpoint
    }

    /// Stops listening, disconnects every client and waits for their rundown.
    pub fn shutdown(mut self) {
        self.shared.stop_listening();
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                warn!("accept thread panicked");
            }
        }

        let connections: Vec<Connection> = {
            let mut map = self
                .shared
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, connection)| connection).collect()
        };
        for connection in &connections {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }
        for mut connection in connections {
            let Some(handle) = connection.handle.take() else {
                continue;
            };
            if handle.join().is_err() {
                warn!("connection handler panicked");
            }
        }

        let _ = fs::remove_file(&self.shared.endpoint);
        let _ = FileExt::unlock(&self.lock_file);
        info!(endpoint = %self.shared.endpoint.display(), "endpoint released");
    }
}

fn claim_endpoint(endpoint: &Path) -> Result<File, Error> {
    let lock_path = config::lock_path(endpoint);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to open endpoint lock")
                .with_path(&lock_path)
                .with_source(err)
        })?;
    file.try_lock_exclusive().map_err(|err| {
        Error::new(ErrorKind::Busy)
            .with_message("endpoint already in use")
            .with_path(endpoint)
            .with_hint("Another calltrace-service owns this endpoint; stop it or pick another instance id.")
            .with_source(err)
    })?;
    Ok(file)
}

fn accept_loop(shared: &Arc<ServerShared>, listener: UnixListener) {
    loop {
        let accepted = listener.accept();
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_RETRY_DELAY);
                continue;
            }
        };
        if let Err(err) = register(shared, stream) {
            warn!(error = %err, "dropping connection");
        }
    }
    debug!("accept loop finished");
}

fn register(shared: &Arc<ServerShared>, stream: UnixStream) -> Result<(), Error> {
    let control = stream.try_clone().map_err(|err| {
        Error::new(ErrorKind::Resource)
            .with_message("failed to clone client stream")
            .with_source(err)
    })?;
    let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
    let mut map = shared
        .connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    // Reap handlers whose clients already left.
    map.retain(|_, connection| {
        connection
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    });

    let handler_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("calltrace-conn-{id}"))
        .spawn(move || serve_connection(&handler_shared, stream))
        .map_err(|err| {
            Error::new(ErrorKind::Resource)
                .with_message("failed to start connection handler")
                .with_source(err)
        })?;
    map.insert(
        id,
        Connection {
            stream: control,
            handle: Some(handle),
        },
    );
    Ok(())
}

fn serve_connection(shared: &ServerShared, stream: UnixStream) {
    let pid = match fdpass::peer_pid(&stream) {
        Ok(pid) => pid,
        Err(err) => {
            warn!(error = %err, "cannot identify client");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };
    debug!(pid, "client connected");
    let mut owned = BTreeSet::new();
    if let Err(err) = serve_requests(shared, pid, &stream, &mut owned) {
        debug!(pid, error = %err, "connection ended");
    }
    // The server keeps a clone of this stream; the peer only sees EOF after a shutdown.
    let _ = stream.shutdown(Shutdown::Both);
    rundown(shared, pid, owned);
}

/// Answers requests until the client hangs up; returns the reason it stopped otherwise.
fn serve_requests(
    shared: &ServerShared,
    pid: u32,
    stream: &UnixStream,
    owned: &mut BTreeSet<SessionId>,
) -> Result<(), Error> {
    let reader_stream = stream.try_clone().map_err(|err| {
        Error::new(ErrorKind::Resource)
            .with_message("cannot read from client")
            .with_source(err)
    })?;
    let mut reader = BufReader::new(reader_stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("client read failed")
                    .with_source(err)
            })?;
        if read == 0 {
            return Ok(());
        }

        let (response, fds) = if line.last() == Some(&b'\n') {
            line.pop();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match protocol::decode_line::<Request>(&line) {
                Ok(request) => dispatch(shared, pid, owned, request),
                Err(err) => {
                    warn!(pid, error = %err, "rejected request");
                    (Response::from_error(&err), Vec::new())
                }
            }
        } else if line.len() > MAX_LINE_BYTES {
            let skipped = reader.skip_until(b'\n').map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("client read failed")
                    .with_source(err)
            })?;
            let err = Error::new(ErrorKind::Protocol).with_message(format!(
                "request exceeds {MAX_LINE_BYTES} bytes"
            ));
            warn!(pid, bytes = line.len() + skipped, "rejected oversized request");
            (Response::from_error(&err), Vec::new())
        } else {
            return Err(Error::new(ErrorKind::Protocol).with_message("truncated request"));
        };
        protocol::send_message(stream, &response, fds)?;
    }
}

fn dispatch(
    shared: &ServerShared,
    pid: u32,
    owned: &mut BTreeSet<SessionId>,
    request: Request,
) -> (Response, Vec<OwnedFd>) {
    let op = request.name();
    match handle_request(shared, pid, owned, request) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(pid, op, error = %err, "rejected request");
            (Response::from_error(&err), Vec::new())
        }
    }
}

fn handle_request(
    shared: &ServerShared,
    pid: u32,
    owned: &mut BTreeSet<SessionId>,
    request: Request,
) -> Result<(Response, Vec<OwnedFd>), Error> {
    let core = &shared.core;
    match request {
        Request::CreateSession { command_line } => {
            let grant = core.create_session(pid, &command_line)?;
            owned.insert(grant.session);
            let (pools, fds) = split_pools(grant.pools);
            Ok((
                Response::Session {
                    session: grant.session,
                    buffer: grant.buffer,
                    flags: grant.flags,
                    pools,
                },
                fds,
            ))
        }
        Request::AllocateBuffer { session } => {
            check_owner(owned, session)?;
            let grant = core.allocate_buffer(session)?;
            let (pools, fds) = split_pools(grant.pools);
            Ok((
                Response::Buffer {
                    buffer: Some(grant.buffer),
                    pools,
                },
                fds,
            ))
        }
        Request::CommitAndExchangeBuffer {
            session,
            buffer,
            exchange,
        } => {
            check_owner(owned, session)?;
            match core.commit_and_exchange(session, &buffer, exchange)? {
                Some(grant) => {
                    let (pools, fds) = split_pools(grant.pools);
                    Ok((
                        Response::Buffer {
                            buffer: Some(grant.buffer),
                            pools,
                        },
                        fds,
                    ))
                }
                None => Ok((
                    Response::Buffer {
                        buffer: None,
                        pools: Vec::new(),
                    },
                    Vec::new(),
                )),
            }
        }
        Request::ReturnBuffer { session, buffer } => {
            check_owner(owned, session)?;
            core.return_buffer(session, &buffer)?;
            Ok((Response::Ack, Vec::new()))
        }
        Request::CloseSession { session } => {
            check_owner(owned, session)?;
            owned.remove(&session);
            core.close_session(session)?;
            Ok((Response::Ack, Vec::new()))
        }
        Request::RequestShutdown => {
            core.request_shutdown();
            shared.stop_listening();
            Ok((Response::Ack, Vec::new()))
        }
    }
}

fn check_owner(owned: &BTreeSet<SessionId>, session: SessionId) -> Result<(), Error> {
    if owned.contains(&session) {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::NotFound)
            .with_message("unknown session")
            .with_session(session.0))
    }
}

/// Closes whatever the departed client left open.
fn rundown(shared: &ServerShared, pid: u32, owned: BTreeSet<SessionId>) {
    if owned.is_empty() {
        debug!(pid, "client disconnected");
        return;
    }
    info!(pid, sessions = owned.len(), "client rundown");
    for session in owned {
        if let Err(err) = shared.core.close_session(session) {
            debug!(pid, session = session.0, error = %err, "rundown close skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn core(dir: &Path) -> Arc<ServiceCore> {
        Arc::new(ServiceCore::new(
            ServiceConfig::new()
                .with_trace_dir(dir)
                .with_endpoint(dir.join("svc.sock")),
        ))
    }

    #[test]
    fn second_server_on_endpoint_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = RpcServer::bind(core(dir.path())).expect("first");
        let err = match RpcServer::bind(core(dir.path())) {
            Ok(_) => panic!("second bind should fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Busy);
        first.shutdown();
        assert!(!dir.path().join("svc.sock").exists());

        let again = RpcServer::bind(core(dir.path())).expect("rebind");
        again.shutdown();
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("svc.sock"), b"stale").expect("stale file");
        let server = RpcServer::bind(core(dir.path())).expect("bind");
        assert!(UnixStream::connect(server.endpoint()).is_ok());
        server.shutdown();
    }

    #[test]
    fn foreign_session_handles_are_rejected() {
        let owned = BTreeSet::from([SessionId(1)]);
        assert!(check_owner(&owned, SessionId(1)).is_ok());
        let err = check_owner(&owned, SessionId(2)).expect_err("foreign");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
