//! Purpose: Carve one anonymous shared-memory region into fixed-size trace buffers.
//! Exports: `BufferPool`, `Buffer`, `BufferState`, `PoolId`, `PoolGrant`, `SharedRegion`.
//! Role: Zero-copy transport between one client process and the writer thread.
//! Invariants: Construction is all-or-nothing; a failed init leaves no mapping or descriptor behind.
//! Invariants: `offset + size <= mapping_size` for every buffer; sizes never change.
//! Invariants: Dropping a pool unmaps only the service view; the client's descriptor is its own.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};

use crate::core::error::{Error, ErrorKind, io_error_kind};

/// Identity tag of a pool inside its session; clients echo it back in descriptors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PoolId(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferState {
    Free,
    ClientHeld,
    PendingWrite,
}

#[derive(Debug)]
pub struct Buffer {
    pool: PoolId,
    index: u32,
    mapping_size: u64,
    offset: u64,
    size: u64,
    state: BufferState,
}

impl Buffer {
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mapping_size(&self) -> u64 {
        self.mapping_size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn write_pending(&self) -> bool {
        self.state == BufferState::PendingWrite
    }

    pub(crate) fn set_state(&mut self, state: BufferState) {
        self.state = state;
    }
}

/// The service's view of a shared region.
#[derive(Debug)]
pub struct SharedRegion {
    map: MmapRaw,
    _memfd: File,
}

impl SharedRegion {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// The client process maps the same pages. Callers only read a range after
    /// the client has handed that buffer back through a commit.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], Error> {
        self.check_range(offset, len)?;
        // SAFETY: the range lies inside the live mapping, which outlives `&self`.
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), len) })
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<(), Error> {
        self.check_range(offset, len)?;
        // SAFETY: bounds checked above; the buffer is owned by the caller until recycled.
        unsafe { std::ptr::write_bytes(self.map.as_mut_ptr().add(offset), byte, len) };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len() => Ok(()),
            _ => Err(Error::new(ErrorKind::Internal).with_message("range outside shared region")),
        }
    }
}

/// A duplicate of the pool's descriptor destined for the client process.
#[derive(Debug)]
pub struct PoolGrant {
    pub pool: PoolId,
    pub mapping_size: u64,
    pub handle: OwnedFd,
}

#[derive(Debug)]
pub struct BufferPool {
    id: PoolId,
    region: Arc<SharedRegion>,
    buffers: Vec<Buffer>,
}

impl BufferPool {
    pub fn init(
        id: PoolId,
        client_pid: u32,
        buffer_count: usize,
        buffer_size: usize,
    ) -> Result<(Self, PoolGrant), Error> {
        if buffer_count == 0 || buffer_size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("buffer count and size must be non-zero"));
        }
        let total = buffer_count
            .checked_mul(buffer_size)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("pool size overflow"))?;

        let memfd = create_memfd(&format!("calltrace-{client_pid}-{}", id.0))?;
        memfd.set_len(total as u64).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to size shared memory")
                .with_pid(client_pid)
                .with_source(err)
        })?;
        let map = MmapOptions::new().len(total).map_raw(&memfd).map_err(|err| {
            Error::new(ErrorKind::Resource)
                .with_message("failed to map shared memory")
                .with_pid(client_pid)
                .with_source(err)
        })?;
        // Dropping `map` and `memfd` on this error path unmaps and closes everything.
        let client_copy = memfd.try_clone().map_err(|err| {
            Error::new(ErrorKind::Resource)
                .with_message("failed to duplicate shared memory handle")
                .with_pid(client_pid)
                .with_source(err)
        })?;

        let buffers = (0..buffer_count)
            .map(|index| Buffer {
                pool: id,
                index: index as u32,
                mapping_size: total as u64,
                offset: (index * buffer_size) as u64,
                size: buffer_size as u64,
                state: BufferState::Free,
            })
            .collect();

        let pool = Self {
            id,
            region: Arc::new(SharedRegion { map, _memfd: memfd }),
            buffers,
        };
        let grant = PoolGrant {
            pool: id,
            mapping_size: total as u64,
            handle: OwnedFd::from(client_copy),
        };
        Ok((pool, grant))
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn mapping_size(&self) -> u64 {
        self.region.len() as u64
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer(&self, index: u32) -> Option<&Buffer> {
        self.buffers.get(index as usize)
    }

    pub fn buffer_mut(&mut self, index: u32) -> Option<&mut Buffer> {
        self.buffers.get_mut(index as usize)
    }

    /// Index of the buffer starting exactly at `offset`.
    pub fn locate(&self, offset: u64) -> Option<u32> {
        let size = self.buffers.first()?.size;
        if offset % size != 0 {
            return None;
        }
        let index = offset / size;
        (index < self.buffers.len() as u64).then_some(index as u32)
    }
}

fn create_memfd(name: &str) -> Result<File, Error> {
    let c_name = CString::new(name)
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("invalid region name"))?;
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::new(io_error_kind(&err))
            .with_message("failed to create shared memory")
            .with_source(err));
    }
    // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapMut;

    #[test]
    fn init_slices_region_into_buffers() {
        let (pool, grant) = BufferPool::init(PoolId(3), 1, 4, 8192).expect("init");
        assert_eq!(pool.id(), PoolId(3));
        assert_eq!(pool.mapping_size(), 4 * 8192);
        assert_eq!(grant.pool, PoolId(3));
        assert_eq!(grant.mapping_size, 4 * 8192);
        for (index, buffer) in pool.buffers().iter().enumerate() {
            assert_eq!(buffer.offset(), (index * 8192) as u64);
            assert_eq!(buffer.size(), 8192);
            assert!(buffer.offset() + buffer.size() <= buffer.mapping_size());
            assert_eq!(buffer.state(), BufferState::Free);
            assert!(!buffer.write_pending());
        }
    }

    #[test]
    fn client_handle_shares_pages_with_service_view() {
        let (pool, grant) = BufferPool::init(PoolId(0), 1, 2, 4096).expect("init");
        let client_file = File::from(grant.handle);
        let mut client_view = unsafe { MmapMut::map_mut(&client_file).expect("map") };
        client_view[4096..4101].copy_from_slice(b"hello");

        let seen = pool.region().bytes(4096, 5).expect("bytes");
        assert_eq!(seen, b"hello");

        pool.region().fill(4096, 5, 0).expect("fill");
        assert_eq!(&client_view[4096..4101], &[0u8; 5]);
    }

    #[test]
    fn client_view_survives_pool_drop() {
        let (pool, grant) = BufferPool::init(PoolId(0), 1, 1, 4096).expect("init");
        let client_file = File::from(grant.handle);
        let mut client_view = unsafe { MmapMut::map_mut(&client_file).expect("map") };
        drop(pool);
        client_view[0] = 7;
        assert_eq!(client_view[0], 7);
    }

    #[test]
    fn locate_requires_buffer_boundaries() {
        let (pool, _grant) = BufferPool::init(PoolId(0), 1, 4, 4096).expect("init");
        assert_eq!(pool.locate(0), Some(0));
        assert_eq!(pool.locate(3 * 4096), Some(3));
        assert_eq!(pool.locate(100), None);
        assert_eq!(pool.locate(4 * 4096), None);
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = BufferPool::init(PoolId(0), 1, 0, 4096).expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let (pool, _grant) = BufferPool::init(PoolId(0), 1, 1, 4096).expect("init");
        assert!(pool.region().bytes(4000, 200).is_err());
        assert!(pool.region().fill(usize::MAX, 2, 0).is_err());
    }
}
