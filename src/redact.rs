//! Output redactor (C4): scrubs registered secret values from streamed
//! output before it reaches a caller-provided writer.

use std::io;
use std::io::Write;
use std::sync::RwLock;

/// Secrets shorter than this are not registered — redacting e.g. a
/// 2-character value would scrub common substrings of unrelated output.
const MIN_SECRET_LEN: usize = 4;

/// A registry of secret strings to scrub from text. Cheap to clone-share
/// via `Arc`; reads (redact) don't block each other, only registration
/// takes the write lock.
#[derive(Default)]
pub struct Redactor {
    secrets: RwLock<Vec<String>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(Vec::new()),
        }
    }

    /// Registers `value` for redaction, unless it's too short to avoid
    /// false positives.
    pub fn register(&self, value: impl Into<String>) {
        let value = value.into();
        if value.chars().count() <= MIN_SECRET_LEN {
            return;
        }
        self.secrets
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(value);
    }

    /// Replaces every occurrence of every registered secret in `s` with
    /// `[REDACTED]`, one left-to-right pass per secret.
    pub fn redact(&self, s: &str) -> String {
        let secrets = self.secrets.read().unwrap_or_else(|p| p.into_inner());
        let mut out = s.to_string();
        for secret in secrets.iter() {
            if secret.is_empty() {
                continue;
            }
            out = out.replace(secret.as_str(), "[REDACTED]");
        }
        out
    }

    /// Wraps `inner` so everything written through it is redacted first.
    ///
    /// Redaction is chunk-local: a secret split across two `write` calls
    /// is not caught. Callers that need cross-chunk detection must buffer
    /// upstream of this writer themselves.
    pub fn wrap<W: Write>(self: &std::sync::Arc<Self>, inner: W) -> RedactingWriter<W> {
        RedactingWriter {
            redactor: std::sync::Arc::clone(self),
            inner,
        }
    }
}

/// A `Write` adapter that redacts bytes before forwarding them, but always
/// reports the caller's original length — redaction may shrink or grow the
/// byte count on the wire, and callers must not see that as a short write.
pub struct RedactingWriter<W: Write> {
    redactor: std::sync::Arc<Redactor>,
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(p);
        let redacted = self.redactor.redact(&text);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(p.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn redacts_registered_secret() {
        let redactor = Redactor::new();
        redactor.register("sk-zzzzzzzz");
        assert_eq!(redactor.redact("key is sk-zzzzzzzz here"), "key is [REDACTED] here");
    }

    #[test]
    fn short_secrets_are_not_registered() {
        let redactor = Redactor::new();
        redactor.register("abcd");
        assert_eq!(redactor.redact("abcd"), "abcd");
    }

    #[test]
    fn redacts_all_occurrences() {
        let redactor = Redactor::new();
        redactor.register("sk-zzzzzzzz");
        assert_eq!(
            redactor.redact("sk-zzzzzzzz and again sk-zzzzzzzz"),
            "[REDACTED] and again [REDACTED]"
        );
    }

    // (P7)
    #[test]
    fn writer_reports_original_length_regardless_of_redaction() {
        let redactor = Arc::new(Redactor::new());
        redactor.register("sk-zzzzzzzz");
        let mut buf = Vec::new();
        let mut writer = redactor.wrap(&mut buf);
        let p = b"key is sk-zzzzzzzz here";
        let n = writer.write(p).unwrap();
        assert_eq!(n, p.len());
        assert_eq!(String::from_utf8(buf).unwrap(), "key is [REDACTED] here");
    }

    #[test]
    fn cross_chunk_secret_is_not_caught() {
        let redactor = Arc::new(Redactor::new());
        redactor.register("sk-zzzzzzzz");
        let mut buf = Vec::new();
        let mut writer = redactor.wrap(&mut buf);
        writer.write_all(b"sk-zzzz").unwrap();
        writer.write_all(b"zzzz").unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "sk-zzzzzzzz");
    }
}
