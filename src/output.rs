//! Status output and captured server stream handling.
//!
//! This module provides the `Reporter` that prints launcher status lines, and the
//! bounded buffer (`StderrTail`) used to keep a server's most recent stderr output for
//! diagnostics when it fails to become ready.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum number of stderr bytes kept per server.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Lines recorded by a capturing reporter instead of being printed.
pub type CapturedLines = Rc<RefCell<Vec<String>>>;

/// Prints launcher status lines to stderr.
#[derive(Debug, Clone)]
pub struct Reporter {
    use_symbols: bool,
    quiet: bool,
    captured: Option<CapturedLines>,
}

impl Reporter {
    pub fn new(use_symbols: bool, quiet: bool) -> Self {
        Self {
            use_symbols,
            quiet,
            captured: None,
        }
    }

    /// A reporter that records every line it would print.
    #[cfg(test)]
    pub fn capturing() -> (Self, CapturedLines) {
        let lines = CapturedLines::default();
        let reporter = Self {
            use_symbols: false,
            quiet: false,
            captured: Some(lines.clone()),
        };
        (reporter, lines)
    }

    /// Prints a lifecycle status line unless running quietly.
    pub fn status(&self, text: impl AsRef<str>) {
        if self.quiet {
            return;
        }
        self.emit(format_tool_message(text.as_ref(), self.use_symbols));
    }

    /// Prints a problem that should be visible even in quiet mode.
    pub fn warn(&self, text: impl AsRef<str>) {
        self.emit(format_tool_message(text.as_ref(), self.use_symbols));
    }

    /// Dumps a failed server's captured stderr, if there is any.
    pub fn server_stderr(&self, bytes: &[u8]) {
        let text = decode_lossy(bytes);
        if text.trim().is_empty() {
            return;
        }
        self.warn("server stderr:");
        self.emit(text.trim_end().to_string());
    }

    fn emit(&self, line: String) {
        match &self.captured {
            Some(lines) => lines.borrow_mut().push(line),
            None => eprintln!("{}", line),
        }
    }
}

fn format_tool_message(text: &str, use_symbols: bool) -> String {
    if use_symbols {
        format!("◆ portgate: {}", text)
    } else {
        format!("[portgate] {}", text)
    }
}

/// Decodes captured output, replacing invalid UTF-8 sequences.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// A fixed-capacity buffer that keeps the most recent bytes written to it.
#[derive(Debug, Clone)]
pub struct StderrTail {
    max_bytes: usize,
    bytes: VecDeque<u8>,
}

impl StderrTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            bytes: VecDeque::with_capacity(max_bytes.min(4096)),
        }
    }

    /// Appends bytes, dropping the oldest ones past capacity.
    ///
    /// Returns `true` if anything was dropped.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        self.bytes.extend(chunk);
        let overflow = self.bytes.len().saturating_sub(self.max_bytes);
        self.bytes.drain(..overflow);
        overflow > 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into()
    }
}

/// Reads a stream to its end, keeping only the tail.
pub async fn capture_tail<R>(mut reader: R, max_bytes: usize) -> StderrTail
where
    R: AsyncRead + Unpin,
{
    let mut tail = StderrTail::new(max_bytes);
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.push(&buffer[..n]);
            }
        }
    }
    tail
}

/// Reads a stream to its end and throws the data away.
pub async fn discard<R>(mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
}
