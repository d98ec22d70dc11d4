//! Default-mode output: stream probe events to the operator.

use crate::events::TraceEvent;
use std::io::{self, BufRead, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to read trace events: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write event output: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to write event capture: {0}")]
    Capture(#[source] io::Error),

    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Prints every event line as it arrives, optionally also writing each
/// parsed event as a JSON line to a capture file.
pub struct EventSink<W: Write> {
    out: W,
    capture: Option<Box<dyn Write>>,
    events: u64,
}

impl<W: Write> EventSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            capture: None,
            events: 0,
        }
    }

    /// Also record events as JSON lines into `capture`.
    pub fn with_capture(mut self, capture: Box<dyn Write>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Events handled so far.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Handle one event.
    pub fn emit(&mut self, event: &TraceEvent) -> Result<(), SinkError> {
        writeln!(self.out, "{event}").map_err(SinkError::Write)?;
        self.out.flush().map_err(SinkError::Write)?;
        if let Some(capture) = self.capture.as_mut() {
            serde_json::to_writer(&mut *capture, event).map_err(SinkError::Encode)?;
            capture.write_all(b"\n").map_err(SinkError::Capture)?;
        }
        self.events += 1;
        Ok(())
    }

    /// Consume `reader` until end of stream.  Blocks on reads; for the
    /// kernel trace pipe that means until the process is terminated.
    ///
    /// Returns the number of events handled by this call.
    pub fn drain<R: BufRead>(&mut self, mut reader: R) -> Result<u64, SinkError> {
        let start = self.events;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = match reader.read_until(b'\n', &mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SinkError::Read(e)),
            };
            if n == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            self.emit(&TraceEvent::parse(&line))?;
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.flush().map_err(SinkError::Capture)?;
        }
        Ok(self.events - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    const PIPE: &str = "\
 boosterd-10 [001] d..31 1.000000: bpf_trace_printk: Probe DcaGetPohFail: Matched path, injecting fault.
 boosterd-10 [001] d..31 1.000100: bpf_trace_printk: Probe DcaGetPohFail: read=5, wrote=-1, verified=-1

CPU:1 [LOST 3 EVENTS]
";

    /// Write handle whose bytes stay readable after the sink owns it.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_are_printed_as_received() {
        let mut out = Vec::new();
        let n = EventSink::new(&mut out).drain(Cursor::new(PIPE)).unwrap();
        assert_eq!(n, 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("Matched path, injecting fault."));
        assert_eq!(lines[2], "CPU:1 [LOST 3 EVENTS]");
    }

    #[test]
    fn capture_gets_json_lines() {
        let capture = Shared::default();
        let mut sink = EventSink::new(io::sink()).with_capture(Box::new(capture.clone()));
        sink.drain(Cursor::new(PIPE)).unwrap();

        let bytes = capture.0.lock().unwrap().clone();
        let events: Vec<TraceEvent> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].pid, Some(10));
        assert_eq!(events[1].message, "Probe DcaGetPohFail: read=5, wrote=-1, verified=-1");
        assert!(!events[2].is_parsed());
    }

    #[test]
    fn empty_stream_ends_immediately() {
        let mut sink = EventSink::new(io::sink());
        assert_eq!(sink.drain(Cursor::new("")).unwrap(), 0);
        assert_eq!(sink.events(), 0);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut out = Vec::new();
        EventSink::new(&mut out)
            .drain(Cursor::new(b"a-1 [000] 1.0: 0: \xff\n".to_vec()))
            .unwrap();
        assert!(String::from_utf8(out).unwrap().contains('\u{fffd}'));
    }
}
