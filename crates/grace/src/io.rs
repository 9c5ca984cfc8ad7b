//! Output abstraction for the `print` family of opcodes.
//!
//! The VM never writes to the process streams directly; everything funnels
//! through a [`PrintWriter`] so embedders and tests can capture or discard
//! program output.

use std::io::{self, Write as _};

/// Sink for program output.
///
/// `print`/`println` go to the stdout channel, `eprint`/`eprintln` and the
/// runtime error trace to the stderr channel. Implementations must not add
/// separators or terminators of their own; the VM emits newlines and tabs
/// explicitly.
pub trait PrintWriter {
    fn stdout_write(&mut self, output: &str);
    fn stderr_write(&mut self, output: &str);
}

/// Default writer targeting the real process streams.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(output.as_bytes());
    }

    fn stderr_write(&mut self, output: &str) {
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_all(output.as_bytes());
        let _ = stderr.flush();
    }
}

/// Writer that collects both streams into strings.
///
/// The backbone of the integration tests: compile a program, run it with a
/// `CollectPrint`, assert on [`CollectPrint::stdout`].
#[derive(Debug, Default)]
pub struct CollectPrint {
    stdout: String,
    stderr: String,
}

impl CollectPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

impl PrintWriter for CollectPrint {
    fn stdout_write(&mut self, output: &str) {
        self.stdout.push_str(output);
    }

    fn stderr_write(&mut self, output: &str) {
        self.stderr.push_str(output);
    }
}

/// Writer that drops all output. Useful for benchmarks.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) {}

    fn stderr_write(&mut self, _output: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_print_keeps_streams_separate() {
        let mut writer = CollectPrint::new();
        writer.stdout_write("out");
        writer.stderr_write("err");
        writer.stdout_write("put");
        assert_eq!(writer.stdout(), "output");
        assert_eq!(writer.stderr(), "err");
    }
}
