//! Purpose: Client side of the service protocol for instrumented processes and tests.
//! Exports: `TraceClient`, `ClientSession`.
//! Role: Issues the six entry points and maps every pool the service grants.
//! Invariants: Pools are keyed by (session, pool id); a descriptor only resolves inside its session.
//! Invariants: Dropping the client without closing its sessions leaves them to service rundown.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::session::{BufferDescriptor, SessionId};
use crate::rpc::protocol::{self, LineReader, PoolAnnouncement, Request, Response};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientSession {
    pub session: SessionId,
    pub buffer: BufferDescriptor,
    pub flags: u32,
}

pub struct TraceClient {
    stream: UnixStream,
    reader: LineReader,
    pools: HashMap<(SessionId, u32), MmapMut>,
}

impl TraceClient {
    pub fn connect(endpoint: impl AsRef<Path>) -> Result<Self, Error> {
        let endpoint = endpoint.as_ref();
        let stream = UnixStream::connect(endpoint).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to connect to service")
                .with_path(endpoint)
                .with_hint("Is calltrace-service running on this endpoint?")
                .with_source(err)
        })?;
        Ok(Self {
            stream,
            reader: LineReader::new(),
            pools: HashMap::new(),
        })
    }

    pub fn create_session(&mut self, command_line: &str) -> Result<ClientSession, Error> {
        let request = Request::CreateSession {
            command_line: command_line.to_string(),
        };
        match self.call(&request)? {
            (
                Response::Session {
                    session,
                    buffer,
                    flags,
                    pools,
                },
                fds,
            ) => {
                self.adopt(session, pools, fds)?;
                Ok(ClientSession {
                    session,
                    buffer,
                    flags,
                })
            }
            (other, _) => Err(unexpected(&request, &other)),
        }
    }

    pub fn allocate_buffer(&mut self, session: SessionId) -> Result<BufferDescriptor, Error> {
        let request = Request::AllocateBuffer { session };
        self.buffer_call(session, &request)?
            .ok_or_else(|| unexpected_missing(&request))
    }

    pub fn commit_and_exchange(
        &mut self,
        session: SessionId,
        buffer: &BufferDescriptor,
        exchange: bool,
    ) -> Result<Option<BufferDescriptor>, Error> {
        let request = Request::CommitAndExchangeBuffer {
            session,
            buffer: *buffer,
            exchange,
        };
        self.buffer_call(session, &request)
    }

    pub fn return_buffer(
        &mut self,
        session: SessionId,
        buffer: &BufferDescriptor,
    ) -> Result<(), Error> {
        self.ack_call(&Request::ReturnBuffer {
            session,
            buffer: *buffer,
        })
    }

    pub fn close_session(&mut self, session: SessionId) -> Result<(), Error> {
        self.ack_call(&Request::CloseSession { session })?;
        self.pools.retain(|(owner, _), _| *owner != session);
        Ok(())
    }

    pub fn request_shutdown(&mut self) -> Result<(), Error> {
        self.ack_call(&Request::RequestShutdown)
    }

    /// Writable view of a buffer the service handed to this client.
    pub fn buffer_mut(
        &mut self,
        session: SessionId,
        buffer: &BufferDescriptor,
    ) -> Result<&mut [u8], Error> {
        let map = self
            .pools
            .get_mut(&(session, buffer.pool_id))
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("pool not mapped")
                    .with_session(session.0)
            })?;
        let start = buffer.offset as usize;
        let end = start
            .checked_add(buffer.size as usize)
            .filter(|end| *end <= map.len())
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("descriptor outside mapped pool")
                    .with_session(session.0)
            })?;
        Ok(&mut map[start..end])
    }

    pub fn mapped_pools(&self, session: SessionId) -> usize {
        self.pools.keys().filter(|(owner, _)| *owner == session).count()
    }

    fn call(&mut self, request: &Request) -> Result<(Response, Vec<OwnedFd>), Error> {
        protocol::send_message(&self.stream, request, Vec::new())?;
        let (line, fds) = self.reader.read_line(&self.stream)?;
        let response = protocol::decode_line::<Response>(&line)?.into_result()?;
        Ok((response, fds))
    }

    fn buffer_call(
        &mut self,
        session: SessionId,
        request: &Request,
    ) -> Result<Option<BufferDescriptor>, Error> {
        match self.call(request)? {
            (Response::Buffer { buffer, pools }, fds) => {
                self.adopt(session, pools, fds)?;
                Ok(buffer)
            }
            (other, _) => Err(unexpected(request, &other)),
        }
    }

    fn ack_call(&mut self, request: &Request) -> Result<(), Error> {
        match self.call(request)? {
            (Response::Ack, _) => Ok(()),
            (other, _) => Err(unexpected(request, &other)),
        }
    }

    fn adopt(
        &mut self,
        session: SessionId,
        pools: Vec<PoolAnnouncement>,
        fds: Vec<OwnedFd>,
    ) -> Result<(), Error> {
        if pools.len() != fds.len() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message(format!(
                    "{} pools announced with {} descriptors",
                    pools.len(),
                    fds.len()
                ))
                .with_session(session.0));
        }
        for (pool, fd) in pools.into_iter().zip(fds) {
            let file = File::from(fd);
            // SAFETY: the service only reads buffers this client has committed; the client
            // only touches buffers the service handed to it.
            let map = unsafe {
                MmapOptions::new()
                    .len(pool.mapping_size as usize)
                    .map_mut(&file)
            }
            .map_err(|err| {
                Error::new(ErrorKind::Resource)
                    .with_message("failed to map granted pool")
                    .with_session(session.0)
                    .with_source(err)
            })?;
            debug!(
                session = session.0,
                pool = pool.pool_id,
                size = pool.mapping_size,
                "mapped pool"
            );
            self.pools.insert((session, pool.pool_id), map);
        }
        Ok(())
    }
}

/// Connects to `endpoint` and asks the service there to shut down.
pub fn request_shutdown_at(endpoint: impl AsRef<Path>) -> Result<(), Error> {
    TraceClient::connect(endpoint)?.request_shutdown()
}

fn unexpected(request: &Request, response: &Response) -> Error {
    Error::new(ErrorKind::Protocol).with_message(format!(
        "unexpected response to {}: {response:?}",
        request.name()
    ))
}

fn unexpected_missing(request: &Request) -> Error {
    Error::new(ErrorKind::Protocol)
        .with_message(format!("{} returned no buffer", request.name()))
}
