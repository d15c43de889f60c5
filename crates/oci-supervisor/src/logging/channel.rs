//! Framing of [`LogEntry`] records on a byte stream.
//!
//! Each record is `[i32 errno][i32 severity][u32 len][len bytes of message]`,
//! all integers little-endian. There is no other framing: the reader treats the
//! first failed or short read as the end of the stream.

use std::io::{self, Read, Write};

use super::{LogEntry, LogHandler, Severity};

const HEADER_LEN: usize = 12;

/// Records announcing a longer message are treated as a corrupt stream.
pub const MAX_MESSAGE_LEN: u32 = 16 << 20;

/// Encodes one record into a contiguous buffer.
pub fn encode(entry: &LogEntry) -> Vec<u8> {
    let msg = entry.message.as_bytes();
    let len = msg.len().min(MAX_MESSAGE_LEN as usize);

    let mut buf = Vec::with_capacity(HEADER_LEN + len);
    buf.extend_from_slice(&entry.errno.to_le_bytes());
    buf.extend_from_slice(&entry.severity.as_raw().to_le_bytes());
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    buf.extend_from_slice(&msg[..len]);
    buf
}

/// Writes one record with a single `write_all`, so records up to `PIPE_BUF`
/// bytes are never interleaved with other writers of the same pipe.
pub fn write_entry(mut w: impl Write, entry: &LogEntry) -> io::Result<()> {
    w.write_all(&encode(entry))
}

/// Reads the next record. Returns `None` once the stream is closed, truncated
/// or unreadable.
pub fn read_entry(mut r: impl Read) -> Option<LogEntry> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).ok()?;

    let errno = i32::from_le_bytes(header[0..4].try_into().ok()?);
    let severity = i32::from_le_bytes(header[4..8].try_into().ok()?);
    let len = u32::from_le_bytes(header[8..12].try_into().ok()?);
    if len > MAX_MESSAGE_LEN {
        log::warn!("dropping log stream: record announces {len} bytes");
        return None;
    }

    let mut message = vec![0u8; len as usize];
    r.read_exact(&mut message).ok()?;

    Some(LogEntry {
        errno,
        message: String::from_utf8_lossy(&message).into_owned(),
        severity: Severity::from_raw(severity),
    })
}

/// Iterates over the records of a stream until it closes.
pub struct LogReader<R> {
    inner: R,
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Delivers every record to `handler`, in order, one at a time.
    /// Returns the number of records delivered once the stream closes.
    pub fn forward_to(self, handler: &LogHandler) -> usize {
        let mut delivered = 0;
        for entry in self {
            handler.handle(entry);
            delivered += 1;
        }
        delivered
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        read_entry(&mut self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::mpsc::channel;

    use super::*;

    fn entries() -> Vec<LogEntry> {
        vec![
            LogEntry::new(Severity::Error, libc::ENOENT, "cannot open `rootfs`"),
            LogEntry::new(Severity::Warning, 0, ""),
            LogEntry::new(Severity::Debug, 0, "unicode ✓ message"),
            LogEntry::new(Severity::Error, 0, "x".repeat(70_000)),
        ]
    }

    #[test]
    fn test_wire_layout() {
        let bytes = encode(&LogEntry::new(Severity::Warning, 13, "hi"));
        assert_eq!(
            bytes,
            vec![13, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn test_stream_preserves_sequence() {
        let mut buf = vec![];
        for e in entries() {
            write_entry(&mut buf, &e).unwrap();
        }

        let decoded: Vec<_> = LogReader::new(Cursor::new(buf)).collect();
        assert_eq!(decoded, entries());
    }

    #[test]
    fn test_empty_message() {
        let bytes = encode(&LogEntry::new(Severity::Debug, 0, ""));
        assert_eq!(bytes.len(), HEADER_LEN);

        let entry = read_entry(Cursor::new(bytes)).unwrap();
        assert_eq!(entry, LogEntry::new(Severity::Debug, 0, ""));
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = encode(&LogEntry::new(Severity::Error, 0, "complete"));
        let partial = encode(&LogEntry::new(Severity::Error, 0, "partial"));
        buf.extend_from_slice(&partial[..partial.len() - 3]);

        let decoded: Vec<_> = LogReader::new(Cursor::new(buf)).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message, "complete");
    }

    #[test]
    fn test_short_header() {
        assert!(read_entry(Cursor::new(vec![1, 0, 0])).is_none());
        assert!(read_entry(Cursor::new(vec![])).is_none());
    }

    #[test]
    fn test_oversized_record() {
        let mut buf = vec![0u8; 8];
        buf.extend_from_slice(&(MAX_MESSAGE_LEN + 1).to_le_bytes());
        assert!(read_entry(Cursor::new(buf)).is_none());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut buf = vec![0u8; 8];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xff, b'a']);
        let entry = read_entry(Cursor::new(buf)).unwrap();
        assert_eq!(entry.message, "\u{fffd}a");
    }

    #[test]
    fn test_forward_to_handler() {
        let mut buf = vec![];
        for e in entries() {
            write_entry(&mut buf, &e).unwrap();
        }

        let (tx, rx) = channel();
        let handler = LogHandler::new(move |e| tx.send(e).unwrap());
        let delivered = LogReader::new(Cursor::new(buf)).forward_to(&handler);

        assert_eq!(delivered, 4);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), entries());
    }

    #[test]
    fn test_over_a_pipe() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let writer = std::thread::spawn(move || {
            let mut w = std::fs::File::from(w);
            for e in entries() {
                write_entry(&mut w, &e).unwrap();
            }
        });

        let decoded: Vec<_> = LogReader::new(std::fs::File::from(r)).collect();
        writer.join().unwrap();
        assert_eq!(decoded, entries());
    }
}
