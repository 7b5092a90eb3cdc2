pub mod allowlist;
pub mod redaction;

pub use allowlist::{Allowlist, AllowlistMode};
pub use redaction::{RedactingWriter, redact_secrets};
