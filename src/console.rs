//! Console output for the coordination layer
//!
//! Library code logs through the `log` facade. This module provides the
//! backend: a console behind a spin lock that formats each record as
//! `[LEVEL target] message` and hands the line to a pluggable sink (a UART
//! on bare metal, stderr on a host).

use alloc::boxed::Box;
use core::fmt::{self, Write};
use spin::Mutex;

use crate::error::{IpcError, IpcResult};

/// Destination for console text
pub trait ConsoleSink: Send {
    fn write_str(&mut self, s: &str);
}

/// Console writer interface
pub struct Console {
    sink: Option<Box<dyn ConsoleSink>>,
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    /// Create a console with no sink attached
    pub const fn new() -> Self {
        Console {
            sink: None,
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        #[cfg(test)]
        {
            // Capture what fits; the buffer is only inspected by tests.
            let _ = self.buffer.push_str(s);
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.write_str(s);
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

fn write_record(w: &mut impl Write, record: &log::Record) -> fmt::Result {
    writeln!(w, "[{} {}] {}", record.level(), record.target(), record.args())
}

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _ = write_record(&mut *CONSOLE.lock(), record);
        }
    }

    fn flush(&self) {}
}

/// Install the console as the global logger
///
/// Fails `AlreadyInitialized` if any logger is already installed; the
/// current sink is left untouched in that case.
pub fn init(sink: Box<dyn ConsoleSink>, level: log::LevelFilter) -> IpcResult<()> {
    log::set_logger(&LOGGER).map_err(|_| IpcError::AlreadyInitialized)?;
    CONSOLE.lock().sink = Some(sink);
    log::set_max_level(level);
    Ok(())
}

/// Sink writing to the host's standard error
#[cfg(feature = "std")]
#[derive(Debug, Default)]
pub struct StderrSink;

#[cfg(feature = "std")]
impl ConsoleSink for StderrSink {
    fn write_str(&mut self, s: &str) {
        use std::io::Write as _;
        let _ = std::io::stderr().write_all(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::string::String;

    struct Shared(Arc<spin::Mutex<String>>);

    impl ConsoleSink for Shared {
        fn write_str(&mut self, s: &str) {
            self.0.lock().push_str(s);
        }
    }

    #[test]
    fn test_console_write() {
        let mut console = Console::new();
        console.write_str("region 0 registered");
        assert!(console.buffer.contains("region 0 registered"));
    }

    #[test]
    fn test_record_format() {
        let mut console = Console::new();
        write_record(
            &mut console,
            &log::Record::builder()
                .args(format_args!("delete refused"))
                .level(log::Level::Warn)
                .target("mp_ipc::gate")
                .build(),
        )
        .unwrap();
        assert_eq!(console.buffer.as_str(), "[WARN mp_ipc::gate] delete refused\n");
    }

    #[test]
    fn test_sink_receives_text() {
        let text = Arc::new(spin::Mutex::new(String::new()));
        let mut console = Console::new();
        console.sink = Some(Box::new(Shared(text.clone())));
        write!(&mut console, "handle {}", 7).unwrap();
        assert_eq!(text.lock().as_str(), "handle 7");
    }

    #[test]
    fn test_init_only_once() {
        let text = Arc::new(spin::Mutex::new(String::new()));
        // No other test installs a logger.
        init(Box::new(Shared(text.clone())), log::LevelFilter::Info).unwrap();
        assert_eq!(
            init(Box::new(Shared(text.clone())), log::LevelFilter::Info),
            Err(IpcError::AlreadyInitialized)
        );

        log::info!(target: "console_test", "attached");
        assert!(text.lock().contains("[INFO console_test] attached"));
    }
}
