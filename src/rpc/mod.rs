// Local RPC transport: JSON lines over a Unix socket, pool descriptors via SCM_RIGHTS.
pub mod client;
pub mod fdpass;
pub mod protocol;
pub mod server;
