// Newline-delimited JSON messages exchanged between trace clients and the service.
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use serde::{Deserialize, Serialize};

use crate::core::buffer_pool::PoolGrant;
use crate::core::error::{Error, ErrorKind, to_exit_code};
use crate::core::session::{BufferDescriptor, SessionId};
use crate::rpc::fdpass;

/// Upper bound on one encoded message; anything longer is rejected with a protocol error.
/// Leaves room for a full Linux argument list in `create_session`.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        #[serde(default)]
        command_line: String,
    },
    AllocateBuffer {
        session: SessionId,
    },
    CommitAndExchangeBuffer {
        session: SessionId,
        buffer: BufferDescriptor,
        exchange: bool,
    },
    ReturnBuffer {
        session: SessionId,
        buffer: BufferDescriptor,
    },
    CloseSession {
        session: SessionId,
    },
    RequestShutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateSession { .. } => "create_session",
            Request::AllocateBuffer { .. } => "allocate_buffer",
            Request::CommitAndExchangeBuffer { .. } => "commit_and_exchange_buffer",
            Request::ReturnBuffer { .. } => "return_buffer",
            Request::CloseSession { .. } => "close_session",
            Request::RequestShutdown => "request_shutdown",
        }
    }
}

/// A pool whose descriptor travels alongside the message, in list order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PoolAnnouncement {
    pub pool_id: u32,
    pub mapping_size: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Session {
        session: SessionId,
        buffer: BufferDescriptor,
        flags: u32,
        #[serde(default)]
        pools: Vec<PoolAnnouncement>,
    },
    Buffer {
        buffer: Option<BufferDescriptor>,
        #[serde(default)]
        pools: Vec<PoolAnnouncement>,
    },
    Ack,
    Error {
        kind: ErrorKind,
        code: i32,
        message: String,
    },
}

impl Response {
    pub fn from_error(err: &Error) -> Self {
        Response::Error {
            kind: err.kind(),
            code: -to_exit_code(err.kind()),
            message: err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", err.kind())),
        }
    }

    /// Converts an error response back into an `Error`; other variants pass through.
    pub fn into_result(self) -> Result<Self, Error> {
        match self {
            Response::Error { kind, message, .. } => Err(Error::new(kind).with_message(message)),
            other => Ok(other),
        }
    }
}

/// Splits pool grants into their wire announcements and the descriptors to attach.
pub fn split_pools(pools: Vec<PoolGrant>) -> (Vec<PoolAnnouncement>, Vec<OwnedFd>) {
    pools
        .into_iter()
        .map(|grant| {
            (
                PoolAnnouncement {
                    pool_id: grant.pool.0,
                    mapping_size: grant.mapping_size,
                },
                grant.handle,
            )
        })
        .unzip()
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, Error> {
    let mut line = serde_json::to_vec(message).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode message")
            .with_source(err)
    })?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(line).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_message(format!("malformed message: {err}"))
            .with_source(err)
    })
}

/// Writes one message with its descriptors; the caller's copies are closed on return.
pub fn send_message<T: Serialize>(
    stream: &UnixStream,
    message: &T,
    fds: Vec<OwnedFd>,
) -> Result<(), Error> {
    let line = encode_line(message)?;
    let sent = if fds.is_empty() {
        (&*stream).write_all(&line)
    } else {
        fdpass::send_with_fds(stream, &line, &fds)
    };
    sent.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to send message")
            .with_source(err)
    })
}

/// Accumulates bytes and descriptors until a full line is available.
#[derive(Debug, Default)]
pub struct LineReader {
    pending: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next line (without its newline) and every descriptor received with it.
    pub fn read_line(&mut self, stream: &UnixStream) -> Result<(Vec<u8>, Vec<OwnedFd>), Error> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return Ok((line, std::mem::take(&mut self.fds)));
            }
            if self.pending.len() > MAX_LINE_BYTES {
                return Err(Error::new(ErrorKind::Protocol).with_message("message too long"));
            }
            let (read, fds) = fdpass::recv_with_fds(stream, &mut chunk).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to receive message")
                    .with_source(err)
            })?;
            self.fds.extend(fds);
            if read == 0 {
                return Err(Error::new(ErrorKind::Io).with_message("connection closed"));
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> BufferDescriptor {
        BufferDescriptor {
            pool_id: 1,
            mapping_size: 16 << 20,
            offset: 1 << 20,
            size: 1 << 20,
        }
    }

    #[test]
    fn requests_use_snake_case_ops() {
        let request = Request::CommitAndExchangeBuffer {
            session: SessionId(4),
            buffer: descriptor(),
            exchange: true,
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["op"], "commit_and_exchange_buffer");
        assert_eq!(value["session"], 4);
        assert_eq!(value["buffer"]["pool_id"], 1);

        let shutdown: Request = decode_line(br#"{"op":"request_shutdown"}"#).expect("decode");
        assert_eq!(shutdown, Request::RequestShutdown);
        let create: Request = decode_line(br#"{"op":"create_session"}"#).expect("decode");
        assert_eq!(
            create,
            Request::CreateSession {
                command_line: String::new()
            }
        );
    }

    #[test]
    fn unknown_op_is_a_protocol_error() {
        let err = decode_line::<Request>(br#"{"op":"format_disk"}"#).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn error_responses_carry_negative_codes() {
        let err = Error::new(ErrorKind::NotFound).with_message("unknown session");
        let response = Response::from_error(&err);
        let value = serde_json::to_value(&response).expect("encode");
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], -3);
        assert_eq!(value["kind"], "NotFound");

        let back = response.into_result().expect_err("error");
        assert_eq!(back.kind(), ErrorKind::NotFound);
        assert_eq!(back.message(), Some("unknown session"));
    }

    #[test]
    fn line_reader_splits_on_newline() {
        let (left, right) = UnixStream::pair().expect("pair");
        send_message(&left, &Response::Ack, Vec::new()).expect("send ack");
        let response = Response::Buffer {
            buffer: Some(descriptor()),
            pools: Vec::new(),
        };
        send_message(&left, &response, Vec::new()).expect("send buffer");

        let mut reader = LineReader::new();
        let (first, _) = reader.read_line(&right).expect("first");
        assert_eq!(decode_line::<Response>(&first).expect("ack"), Response::Ack);
        let (second, fds) = reader.read_line(&right).expect("second");
        assert_eq!(decode_line::<Response>(&second).expect("buffer"), response);
        assert!(fds.is_empty());

        drop(left);
        let err = reader.read_line(&right).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
