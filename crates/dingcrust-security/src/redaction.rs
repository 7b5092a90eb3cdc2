use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// A writer that redacts sensitive tokens (app secrets, access tokens, API keys) from log output.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&original);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: std::io::stderr(),
        }
    }
}

// Bare secrets: replaced entirely.
static TOKEN_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
          sk-ant-api\S{10,}    # Anthropic API keys
        | sk-\S{20,}           # OpenAI-style keys
        ",
    )
    .expect("redaction regex should compile")
});

// Labelled secrets: the label survives, the value does not.
static LABELLED_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?xi)
          (?P<json>"(?:appSecret|clientSecret|accessToken|ticket)"\s*:\s*")[^"]+
        | (?P<header>x-acs-dingtalk-access-token\s*[:=]\s*)[^\s,;"]+
        | (?P<param>[?&]ticket=)[^&\s"]+
        "#,
    )
    .expect("redaction regex should compile")
});

/// Replace known secret patterns with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    let labelled = LABELLED_PATTERNS.replace_all(input, |caps: &regex::Captures<'_>| {
        let label = caps
            .name("json")
            .or_else(|| caps.name("header"))
            .or_else(|| caps.name("param"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        format!("{label}[REDACTED]")
    });
    TOKEN_PATTERNS
        .replace_all(&labelled, "[REDACTED]")
        .into_owned()
}
