use std::io::Write;
use std::sync::{Arc, Mutex};

/// A shared, append-only log of diagnostic lines.
///
/// Every pass holds a clone and appends one line per discovery, rewrite
/// or warning. The trace is informational only; pass outcomes are carried
/// through the pipeline driver, not through the trace.
pub struct Trace {
    lines: Arc<Mutex<Vec<String>>>,

    /// Partially written bytes that haven't seen a newline yet.
    /// Only used by the [Write] impl.
    pending: Arc<Mutex<Vec<u8>>>
}

impl Trace {
    /// Constructs a new, empty [Trace].
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(Vec::new()))
        }
    }

    /// Appends a single line.
    pub fn log(&self, line: impl Into<String>) {
        let mut lock = self.lines.lock().unwrap();
        lock.push(line.into());
    }

    /// Returns a copy of all lines logged so far.
    pub fn lines(&self) -> Vec<String> {
        let lock = self.lines.lock().unwrap();
        lock.clone()
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Trace {
    fn clone(&self) -> Self {
        Self {
            lines: Arc::clone(&self.lines),
            pending: Arc::clone(&self.pending)
        }
    }
}

// The error Handler wants a Write sink. Buffer bytes until a newline and
// log complete lines.
impl Write for Trace {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut pending = self.pending.lock().unwrap();
        pending.extend_from_slice(buf);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !line.is_empty() {
                self.log(line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_and_read_back() {
        let trace = Trace::new();
        let clone = trace.clone();
        trace.log("first");
        clone.log("second");
        assert_eq!(trace.lines(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn write_splits_lines() {
        let mut trace = Trace::new();
        trace.write_all(b"part").unwrap();
        assert!(trace.lines().is_empty());
        trace.write_all(b"ial\nnext\n").unwrap();
        assert_eq!(trace.lines(), vec!["partial".to_string(), "next".to_string()]);
    }
}
