//! Purpose: Service configuration with defaults, minimum clamps and endpoint naming.
//! Exports: `ServiceConfig`, capability flag constants.
//! Role: Built by the binary from CLI flags and by tests directly; read-only once a service starts.
//! Invariants: `buffer_size >= MIN_BUFFER_SIZE` and `growth_increment >= MIN_GROWTH_INCREMENT`.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::session::SessionOptions;

pub const TRACE_FLAG_ENTER: u32 = 0x1;
pub const TRACE_FLAG_EXIT: u32 = 0x2;
pub const TRACE_FLAG_STACK_TRACES: u32 = 0x4;
pub const TRACE_FLAG_LOAD_EVENTS: u32 = 0x8;
pub const TRACE_FLAG_THREAD_EVENTS: u32 = 0x10;
pub const TRACE_FLAG_BATCH_ENTER: u32 = 0x20;
pub const DEFAULT_FLAGS: u32 = TRACE_FLAG_ENTER | TRACE_FLAG_BATCH_ENTER;

pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;
pub const MIN_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_GROWTH_INCREMENT: usize = 16;
pub const MIN_GROWTH_INCREMENT: usize = 16;

const ENDPOINT_STEM: &str = "calltrace-service";

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    trace_dir: PathBuf,
    buffer_size: usize,
    growth_increment: usize,
    flags: u32,
    endpoint: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from("."),
            buffer_size: DEFAULT_BUFFER_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
            flags: DEFAULT_FLAGS,
            endpoint: default_endpoint(None),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = dir.into();
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        if size < MIN_BUFFER_SIZE {
            warn!(
                requested = size,
                minimum = MIN_BUFFER_SIZE,
                "buffer size below minimum, clamping"
            );
        }
        self.buffer_size = size.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn with_growth_increment(mut self, count: usize) -> Self {
        if count < MIN_GROWTH_INCREMENT {
            warn!(
                requested = count,
                minimum = MIN_GROWTH_INCREMENT,
                "growth increment below minimum, clamping"
            );
        }
        self.growth_increment = count.max(MIN_GROWTH_INCREMENT);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<PathBuf>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Uses the per-instance endpoint under the temp directory.
    pub fn with_instance_id(mut self, instance: &str) -> Self {
        self.endpoint = default_endpoint(Some(instance));
        self
    }

    pub fn trace_dir(&self) -> &Path {
        &self.trace_dir
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn growth_increment(&self) -> usize {
        self.growth_increment
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            buffer_size: self.buffer_size,
            growth_increment: self.growth_increment,
        }
    }
}

pub fn default_endpoint(instance: Option<&str>) -> PathBuf {
    let name = match instance {
        Some(id) if !id.is_empty() => format!("{ENDPOINT_STEM}-{id}.sock"),
        _ => format!("{ENDPOINT_STEM}.sock"),
    };
    std::env::temp_dir().join(name)
}

/// Path of the single-instance lock file that sits next to `endpoint`.
pub fn lock_path(endpoint: &Path) -> PathBuf {
    let mut name = endpoint.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.buffer_size(), 2 * 1024 * 1024);
        assert_eq!(config.growth_increment(), 16);
        assert_eq!(config.flags(), TRACE_FLAG_ENTER | TRACE_FLAG_BATCH_ENTER);
        assert_eq!(
            config.endpoint().file_name().and_then(|n| n.to_str()),
            Some("calltrace-service.sock")
        );
    }

    #[test]
    fn small_values_are_clamped_up() {
        let config = ServiceConfig::new()
            .with_buffer_size(4096)
            .with_growth_increment(2);
        assert_eq!(config.buffer_size(), MIN_BUFFER_SIZE);
        assert_eq!(config.growth_increment(), MIN_GROWTH_INCREMENT);

        let config = ServiceConfig::new()
            .with_buffer_size(8 * 1024 * 1024)
            .with_growth_increment(64);
        assert_eq!(config.buffer_size(), 8 * 1024 * 1024);
        assert_eq!(config.growth_increment(), 64);
    }

    #[test]
    fn instance_id_changes_endpoint_name() {
        let config = ServiceConfig::new().with_instance_id("alpha");
        assert_eq!(
            config.endpoint().file_name().and_then(|n| n.to_str()),
            Some("calltrace-service-alpha.sock")
        );
        assert_eq!(default_endpoint(Some("")), default_endpoint(None));
    }

    #[test]
    fn lock_file_sits_next_to_endpoint() {
        assert_eq!(
            lock_path(Path::new("/tmp/svc.sock")),
            PathBuf::from("/tmp/svc.sock.lock")
        );
    }
}
