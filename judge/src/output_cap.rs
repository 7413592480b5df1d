//! Bounded capture of untrusted program output
//!
//! A submission (or a hostile compiler invocation) may emit megabytes of
//! stderr. `OutputCap` keeps only a fixed-size prefix in memory and marks the
//! capture as truncated, so diagnostics stay useful without unbounded growth.

use std::io::{self, Write};

/// Bytes reserved at the tail of the capacity for the truncation marker.
const TAIL_RESERVE: usize = 20;

/// Suffix appended to a snapshot when input bytes were discarded.
const STRIP_MARKER: &[u8] = b" ... stripped";

/// Byte sink that retains the first `capacity - 20` bytes written to it.
///
/// Writes always report the full input length as accepted, so a stream pump
/// feeding the cap never stalls; the cap silently drops what it cannot hold
/// and latches an overflow flag instead.
#[derive(Debug)]
pub struct OutputCap {
    capacity: usize,
    data: Vec<u8>,
    overflow: bool,
}

impl OutputCap {
    /// Capacity must be greater than 20; smaller caps fail every write.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: Vec::new(),
            overflow: false,
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    /// Retained prefix, with the ` ... stripped` marker appended when any
    /// input bytes were discarded.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        if self.overflow {
            out.extend_from_slice(STRIP_MARKER);
        }
        out
    }
}

impl Write for OutputCap {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.capacity <= TAIL_RESERVE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "output cap capacity is too small",
            ));
        }
        let room = (self.capacity - TAIL_RESERVE).saturating_sub(self.data.len());
        let take = buf.len().min(room);
        if take < buf.len() {
            self.overflow = true;
        }
        self.data.extend_from_slice(&buf[..take]);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer that duplicates every write to an ordered list of downstream sinks.
///
/// Used to fan a child's stderr out to the in-memory cap and, when requested,
/// to the operator's own stderr. Sinks are written in order; the first sink
/// error aborts the write.
pub struct TeeWriter {
    sinks: Vec<Box<dyn Write + Send>>,
}

impl TeeWriter {
    pub fn new(sinks: Vec<Box<dyn Write + Send>>) -> Self {
        Self { sinks }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in &mut self.sinks {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_input_kept_verbatim() {
        let mut cap = OutputCap::new(64);
        assert_eq!(cap.write(b"hello").unwrap(), 5);
        assert!(!cap.overflowed());
        assert_eq!(cap.snapshot(), b"hello");
    }

    #[test]
    fn test_overflow_appends_marker() {
        let mut cap = OutputCap::new(30);
        // room is 30 - 20 = 10 bytes
        assert_eq!(cap.write(b"0123456789abcdef").unwrap(), 16);
        assert!(cap.overflowed());
        let snap = cap.snapshot();
        assert_eq!(snap, b"0123456789 ... stripped");
        assert!(snap.len() <= 30);
    }

    #[test]
    fn test_marker_only_when_bytes_dropped() {
        let mut cap = OutputCap::new(30);
        cap.write_all(b"0123456789").unwrap();
        assert!(!cap.overflowed());
        assert_eq!(cap.snapshot(), b"0123456789");
        cap.write_all(b"x").unwrap();
        assert!(cap.overflowed());
        assert!(cap.snapshot().ends_with(STRIP_MARKER));
    }

    #[test]
    fn test_accepts_across_many_writes() {
        let mut cap = OutputCap::new(100);
        for _ in 0..1000 {
            assert_eq!(cap.write(b"chunk").unwrap(), 5);
        }
        let snap = cap.snapshot();
        assert!(snap.len() <= 100);
        assert!(cap.overflowed());
    }

    #[test]
    fn test_capacity_too_small_fails_writes() {
        let mut cap = OutputCap::new(20);
        assert!(cap.write(b"x").is_err());
        let mut cap = OutputCap::new(0);
        assert!(cap.write(b"x").is_err());
    }

    #[test]
    fn test_tee_duplicates_in_order() {
        let cap_a = std::sync::Arc::new(std::sync::Mutex::new(OutputCap::new(64)));
        let cap_b = std::sync::Arc::new(std::sync::Mutex::new(OutputCap::new(64)));

        struct Shared(std::sync::Arc<std::sync::Mutex<OutputCap>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut tee = TeeWriter::new(vec![
            Box::new(Shared(cap_a.clone())),
            Box::new(Shared(cap_b.clone())),
        ]);
        tee.write_all(b"both").unwrap();
        assert_eq!(cap_a.lock().unwrap().snapshot(), b"both");
        assert_eq!(cap_b.lock().unwrap().snapshot(), b"both");
    }
}
