//! Purpose: Move file descriptors across a Unix stream socket and identify the peer process.
//! Exports: `send_with_fds`, `recv_with_fds`, `peer_pid`, `MAX_FDS_PER_MESSAGE`.
//! Role: Thin libc layer under the RPC server and client; no framing knowledge.
//! Invariants: Descriptors ride on the first byte of a send; the rest is written plainly.
//! Invariants: Received descriptors are owned immediately, so an error path closes them.

use std::io::{self, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

pub const MAX_FDS_PER_MESSAGE: usize = 8;

fn control_space(fd_count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<RawFd>()) as u32) as usize }
}

/// Sends `data`, attaching `fds` as SCM_RIGHTS to the first chunk.
pub fn send_with_fds(stream: &UnixStream, data: &[u8], fds: &[OwnedFd]) -> io::Result<()> {
    if data.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot send descriptors without payload",
        ));
    }
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many descriptors for one message",
        ));
    }

    // u64 storage keeps the control buffer aligned for cmsghdr.
    let space = control_space(fds.len());
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;
        // SAFETY: the control buffer holds CMSG_SPACE bytes for exactly `fds.len()` descriptors.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (index, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(data_ptr.add(index), fd.as_raw_fd());
            }
        }
    }

    let sent = loop {
        let rc = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    if sent == 0 {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "sendmsg wrote 0 bytes"));
    }
    if sent < data.len() {
        (&*stream).write_all(&data[sent..])?;
    }
    Ok(())
}

/// Receives into `buf`, returning the byte count and any descriptors that arrived with it.
pub fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let space = control_space(MAX_FDS_PER_MESSAGE);
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

    let received = loop {
        let rc = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fds = Vec::new();
    // SAFETY: the kernel filled `control` and set `msg_controllen`; CMSG_* walk within it.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data_ptr = libc::CMSG_DATA(cmsg) as *const RawFd;
                for index in 0..payload / mem::size_of::<RawFd>() {
                    let fd = ptr::read_unaligned(data_ptr.add(index));
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    Ok((received, fds))
}

/// Process id of the peer, as recorded by the kernel at connect time.
pub fn peer_pid(stream: &UnixStream) -> io::Result<u32> {
    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if cred.pid <= 0 {
        return Err(io::Error::new(io::ErrorKind::NotFound, "peer has no process id"));
    }
    Ok(cred.pid as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn descriptors_travel_with_payload() {
        let (left, right) = UnixStream::pair().expect("pair");
        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"shared").expect("write");

        send_with_fds(&left, b"hello\n", &[OwnedFd::from(file)]).expect("send");
        let mut buf = [0u8; 64];
        let (len, mut fds) = recv_with_fds(&right, &mut buf).expect("recv");
        assert_eq!(&buf[..len], b"hello\n");
        assert_eq!(fds.len(), 1);

        let mut received = File::from(fds.remove(0));
        received.seek(SeekFrom::Start(0)).expect("seek");
        let mut text = String::new();
        received.read_to_string(&mut text).expect("read");
        assert_eq!(text, "shared");
    }

    #[test]
    fn plain_payload_has_no_descriptors() {
        let (left, right) = UnixStream::pair().expect("pair");
        send_with_fds(&left, b"ack\n", &[]).expect("send");
        let mut buf = [0u8; 16];
        let (len, fds) = recv_with_fds(&right, &mut buf).expect("recv");
        assert_eq!(&buf[..len], b"ack\n");
        assert!(fds.is_empty());
    }

    #[test]
    fn peer_pid_is_this_process_for_a_pair() {
        let (left, _right) = UnixStream::pair().expect("pair");
        assert_eq!(peer_pid(&left).expect("peer"), std::process::id());
    }

    #[test]
    fn empty_payload_is_refused() {
        let (left, _right) = UnixStream::pair().expect("pair");
        let err = send_with_fds(&left, b"", &[]).expect_err("empty");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
