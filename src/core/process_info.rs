//! Purpose: Snapshot a client process for embedding in its trace file header.
//! Exports: `ProcessInfo`.
//! Role: Read-only view of `/proc/<pid>`; collected once when a session opens.
//! Invariants: A failed capture never yields a partially populated record.
//! Invariants: The environment block always ends with two NUL bytes.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind, io_error_kind};

const MAX_ENVIRONMENT_BYTES: u64 = 1024 * 1024;
const IMAGE_HEADER_BYTES: usize = 4096;
const ELF_MAGIC: [u8; 4] = *b"\x7fELF";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessInfo {
    pub process_id: u32,
    pub executable_path: PathBuf,
    pub command_line: String,
    /// NUL-separated `KEY=VALUE` entries terminated by an empty entry.
    pub environment: Vec<u8>,
    pub exe_base_address: u64,
    pub exe_image_size: u64,
    pub exe_checksum: u32,
    pub exe_time_date_stamp: u32,
}

impl ProcessInfo {
    pub fn capture(pid: u32) -> Result<Self, Error> {
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));
        let fail = |message: &str, err: std::io::Error| {
            Error::new(io_error_kind(&err))
                .with_message(message.to_string())
                .with_pid(pid)
                .with_source(err)
        };

        let executable_path = fs::read_link(proc_dir.join("exe"))
            .map_err(|err| fail("failed to resolve executable path", err))?;
        let raw_cmdline = fs::read(proc_dir.join("cmdline"))
            .map_err(|err| fail("failed to read command line", err))?;
        let environment = read_environment(&proc_dir.join("environ"))
            .map_err(|err| err.with_pid(pid))?;
        let maps = fs::read_to_string(proc_dir.join("maps"))
            .map_err(|err| fail("failed to read memory map", err))?;
        let (exe_base_address, exe_image_size) = module_extent(&maps, &executable_path)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("main image not found in memory map")
                    .with_path(&executable_path)
                    .with_pid(pid)
            })?;
        let (exe_checksum, exe_time_date_stamp) =
            image_signature(&proc_dir.join("exe")).map_err(|err| err.with_pid(pid))?;

        Ok(Self {
            process_id: pid,
            executable_path,
            command_line: join_command_line(&raw_cmdline),
            environment,
            exe_base_address,
            exe_image_size,
            exe_checksum,
            exe_time_date_stamp,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// File stem of the executable, used when naming trace files.
    pub fn executable_name(&self) -> String {
        self.executable_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn join_command_line(raw: &[u8]) -> String {
    raw.split(|byte| *byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_environment(path: &Path) -> Result<Vec<u8>, Error> {
    let file = File::open(path).map_err(|err| {
        Error::new(io_error_kind(&err))
            .with_message("failed to open environment")
            .with_source(err)
    })?;
    let mut raw = Vec::new();
    let read = file
        .take(MAX_ENVIRONMENT_BYTES)
        .read_to_end(&mut raw)
        .map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to read environment")
                .with_source(err)
        })?;
    if read == 0 {
        return Err(Error::new(ErrorKind::Io).with_message("environment read returned no data"));
    }
    Ok(normalize_environment(raw))
}

/// Cuts a possibly truncated block back to its last complete entry and double-NUL terminates it.
fn normalize_environment(mut raw: Vec<u8>) -> Vec<u8> {
    match raw.iter().rposition(|byte| *byte == 0) {
        Some(last_nul) => raw.truncate(last_nul + 1),
        None => raw.clear(),
    }
    while raw.ends_with(&[0, 0]) {
        raw.pop();
    }
    if raw.is_empty() {
        raw.push(0);
    }
    raw.push(0);
    raw
}

/// Base address and span of every mapping backed by `exe`.
fn module_extent(maps: &str, exe: &Path) -> Option<(u64, u64)> {
    let exe = exe.to_string_lossy();
    let mut low = u64::MAX;
    let mut high = 0u64;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else {
            continue;
        };
        // perms, offset, dev, inode, then the pathname (which may contain spaces).
        let pathname = fields.skip(4).collect::<Vec<_>>().join(" ");
        let pathname = pathname.trim_end_matches(" (deleted)");
        if pathname != exe.trim_end_matches(" (deleted)") {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        low = low.min(start);
        high = high.max(end);
    }
    (high > low).then(|| (low, high - low))
}

fn image_signature(exe: &Path) -> Result<(u32, u32), Error> {
    let fail = |message: &str, err: std::io::Error| {
        Error::new(io_error_kind(&err))
            .with_message(message.to_string())
            .with_path(exe)
            .with_source(err)
    };
    let mut file = File::open(exe).map_err(|err| fail("failed to open executable", err))?;
    let mut header = Vec::with_capacity(IMAGE_HEADER_BYTES);
    (&mut file)
        .take(IMAGE_HEADER_BYTES as u64)
        .read_to_end(&mut header)
        .map_err(|err| fail("failed to read image header", err))?;
    if header.len() < ELF_MAGIC.len() || header[..ELF_MAGIC.len()] != ELF_MAGIC {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("executable is not an ELF image")
            .with_path(exe));
    }

    let digest = Sha256::digest(&header);
    let checksum = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

    let modified = file
        .metadata()
        .and_then(|meta| meta.modified())
        .map_err(|err| fail("failed to read image timestamp", err))?;
    let stamp = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default();
    Ok((checksum, stamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_self_fills_every_field() {
        let pid = std::process::id();
        let info = ProcessInfo::capture(pid).expect("capture");
        assert_eq!(info.process_id, pid);
        let current = std::env::current_exe().expect("current exe");
        assert_eq!(
            info.executable_path.canonicalize().expect("canonical"),
            current.canonicalize().expect("canonical")
        );
        assert!(!info.command_line.is_empty());
        assert!(info.environment.ends_with(&[0, 0]));
        assert_ne!(info.exe_base_address, 0);
        assert!(info.exe_image_size > 0);
    }

    #[test]
    fn capture_of_missing_process_fails() {
        let err = ProcessInfo::capture(u32::MAX - 1).expect_err("no such pid");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn reset_clears_record() {
        let mut info = ProcessInfo {
            process_id: 9,
            command_line: "app --flag".to_string(),
            ..ProcessInfo::default()
        };
        info.reset();
        assert_eq!(info, ProcessInfo::default());
    }

    #[test]
    fn environment_is_double_nul_terminated() {
        assert_eq!(normalize_environment(b"A=1\0B=2\0".to_vec()), b"A=1\0B=2\0\0");
        assert_eq!(normalize_environment(b"A=1\0B=2\0\0\0".to_vec()), b"A=1\0B=2\0\0");
        // A read cut off mid-entry keeps only the complete entries.
        assert_eq!(normalize_environment(b"A=1\0B=tru".to_vec()), b"A=1\0\0");
        assert_eq!(normalize_environment(b"A=1".to_vec()), b"\0\0");
    }

    #[test]
    fn command_line_joins_arguments() {
        assert_eq!(join_command_line(b"app\0--depth\x003\0"), "app --depth 3");
    }

    #[test]
    fn module_extent_spans_all_image_mappings() {
        let maps = "\
55d0a0000000-55d0a0002000 r--p 00000000 08:01 131 /usr/bin/app
55d0a0002000-55d0a0008000 r-xp 00002000 08:01 131 /usr/bin/app
55d0a0008000-55d0a000a000 rw-p 00008000 08:01 131 /usr/bin/app
7f0000000000-7f0000021000 rw-p 00000000 00:00 0
7f1000000000-7f1000100000 r-xp 00000000 08:01 200 /usr/lib/libc.so.6
";
        let (base, size) = module_extent(maps, Path::new("/usr/bin/app")).expect("extent");
        assert_eq!(base, 0x55d0a0000000);
        assert_eq!(size, 0xa000);
        assert!(module_extent(maps, Path::new("/usr/bin/other")).is_none());
    }
}
