//! Protocol Constants

// pkt-line framing
pub const PKT_HEADER_LEN: usize = 4;
pub const PKT_MAX_LEN: usize = 0xffff;
pub const PKT_MAX_PAYLOAD: usize = PKT_MAX_LEN - PKT_HEADER_LEN;
pub const PKT_FLUSH: &[u8; 4] = b"0000";

// SSH channel request types
pub const REQUEST_EXEC: &str = "exec";
pub const REQUEST_ENV: &str = "env";
pub const REQUEST_SHELL: &str = "shell";
pub const REQUEST_SUBSYSTEM: &str = "subsystem";

// Length prefix of an SSH `string` field
pub const SSH_STRING_PREFIX_LEN: usize = 4;

// The only command the proxy forwards
pub const UPLOAD_PACK_COMMAND: &str = "git-upload-pack";
