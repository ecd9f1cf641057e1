//! Textual command framing shared by the writer, the serializer, and the
//! loader.
//!
//! Commands are encoded as an array header `*<argc>\r\n` followed by one
//! bulk string `$<len>\r\n<bytes>\r\n` per argument. Annotation lines start
//! with `#` and run to the next newline; the only annotation currently
//! emitted is the timestamp marker `#TS:<epoch>\r\n`.

use std::io::{self, BufRead, Read, Write};

/// Upper bound on a single bulk argument (512 MiB).
pub const MAX_BULK_LEN: u64 = 512 * 1024 * 1024;

/// Upper bound on the argument count of a single command.
pub const MAX_COMMAND_ARGS: u64 = 1024 * 1024;

/// Annotation lines longer than this are rejected.
pub const ANNOTATION_LINE_MAX_LEN: usize = 1024;

/// Appends the framed form of `argv` to `out`.
pub fn encode_command<A: AsRef<[u8]>>(out: &mut Vec<u8>, argv: &[A]) {
    out.extend_from_slice(format!("*{}\r\n", argv.len()).as_bytes());
    for arg in argv {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Appends a `SELECT <db>` command to `out`.
pub fn encode_select(out: &mut Vec<u8>, db: u32) {
    encode_command(out, &[b"SELECT".to_vec(), db.to_string().into_bytes()]);
}

/// Appends a `#TS:<epoch>` annotation line to `out`.
pub fn encode_timestamp_annotation(out: &mut Vec<u8>, unix_sec: u64) {
    out.extend_from_slice(format!("#TS:{unix_sec}\r\n").as_bytes());
}

/// Writes the framed form of `argv` directly to `w`.
pub fn write_command<W: Write, A: AsRef<[u8]>>(w: &mut W, argv: &[A]) -> io::Result<()> {
    write!(w, "*{}\r\n", argv.len())?;
    for arg in argv {
        let arg = arg.as_ref();
        write!(w, "${}\r\n", arg.len())?;
        w.write_all(arg)?;
        w.write_all(b"\r\n")?;
    }
    Ok(())
}

/// How reading a frame failed.
#[derive(Debug)]
pub enum FrameError {
    /// Clean prefix followed by an unexpected end of file: the command under
    /// construction is incomplete. Recoverable by truncating to the last
    /// command boundary.
    Truncated,
    /// Bytes that cannot be a frame at all.
    Malformed(String),
    /// Underlying read failure.
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

impl From<FrameError> for crate::error::AofError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Truncated => crate::error::AofError::segment("unexpected end of stream"),
            FrameError::Malformed(reason) => crate::error::AofError::segment(reason),
            FrameError::Io(err) => crate::error::AofError::Io(err),
        }
    }
}

/// Pull parser yielding one command at a time from a framed byte stream.
///
/// Annotation lines are skipped transparently. The reader tracks the number
/// of bytes consumed so the loader can record the offset of the last
/// well-formed command boundary.
pub struct CommandReader<R: BufRead> {
    inner: R,
    offset: u64,
}

enum Line {
    /// A line plus whether its newline terminator was present. A partial
    /// line at end of file parses like a normal line, but its parse
    /// failures mean the stream ended early rather than that the bytes are
    /// garbage.
    Data(Vec<u8>, bool),
    Eof,
}

impl<R: BufRead> CommandReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_offset(inner, 0)
    }

    /// Starts counting from `offset`, for streams whose prefix was consumed
    /// by another decoder (snapshot preamble).
    pub fn with_offset(inner: R, offset: u64) -> Self {
        Self { inner, offset }
    }

    /// Bytes consumed from the underlying stream so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next command, skipping annotations. Returns `Ok(None)` on a
    /// clean end of file at a command boundary.
    pub fn next_command(&mut self) -> Result<Option<Vec<Vec<u8>>>, FrameError> {
        let (header, terminated) = loop {
            match self.read_line()? {
                Line::Eof => return Ok(None),
                Line::Data(line, terminated) => {
                    if line.first() == Some(&b'#') {
                        continue;
                    }
                    break (line, terminated);
                }
            }
        };

        if header.first() != Some(&b'*') {
            return Err(header_error(terminated, "expected '*' array header"));
        }
        let argc = parse_count(&header[1..], MAX_COMMAND_ARGS)
            .ok_or_else(|| header_error(terminated, "bad argument count"))?;
        if argc == 0 {
            return Err(header_error(terminated, "empty command"));
        }

        let mut argv = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let (line, terminated) = match self.read_line()? {
                Line::Eof => return Err(FrameError::Truncated),
                Line::Data(line, terminated) => (line, terminated),
            };
            if line.first() != Some(&b'$') {
                return Err(header_error(terminated, "expected '$' bulk header"));
            }
            let len = parse_count(&line[1..], MAX_BULK_LEN)
                .ok_or_else(|| header_error(terminated, "bad bulk length"))?;

            let mut payload = vec![0u8; len as usize];
            self.read_exact_or_truncated(&mut payload)?;
            let mut crlf = [0u8; 2];
            self.read_exact_or_truncated(&mut crlf)?;
            if crlf != *b"\r\n" {
                return Err(FrameError::Malformed(
                    "bulk payload not terminated by CRLF".to_string(),
                ));
            }
            argv.push(payload);
        }
        Ok(Some(argv))
    }

    /// Reads bytes up to and including the next newline, enforcing the
    /// annotation line cap. A partial line at end of file is returned as
    /// data, matching the record-by-record loader contract: the following
    /// read decides whether the stream merely ended early.
    fn read_line(&mut self) -> Result<Line, FrameError> {
        let mut buf = Vec::new();
        let limit = (ANNOTATION_LINE_MAX_LEN + 1) as u64;
        let n = (&mut self.inner).take(limit).read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(Line::Eof);
        }
        self.offset += n as u64;
        if buf.last() != Some(&b'\n') {
            if buf.len() > ANNOTATION_LINE_MAX_LEN {
                return Err(FrameError::Malformed("line is too long".to_string()));
            }
            // Partial line at EOF; hand it to the caller as-is.
            return Ok(Line::Data(buf, false));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Line::Data(buf, true))
    }

    fn read_exact_or_truncated(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.inner.read(&mut buf[read..])?;
            if n == 0 {
                self.offset += read as u64;
                return Err(FrameError::Truncated);
            }
            read += n;
        }
        self.offset += read as u64;
        Ok(())
    }
}

/// A header that failed to parse is garbage on a terminated line, but just
/// an early end of stream on a partial one.
fn header_error(terminated: bool, reason: &str) -> FrameError {
    if terminated {
        FrameError::Malformed(reason.to_string())
    } else {
        FrameError::Truncated
    }
}

/// Parses a decimal count from a header line remainder, bounded by `max`.
fn parse_count(digits: &[u8], max: u64) -> Option<u64> {
    if digits.is_empty() || digits.len() > 20 {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    let value: u64 = text.parse().ok()?;
    (value <= max).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(bytes: &[u8]) -> Result<Vec<Vec<Vec<u8>>>, FrameError> {
        let mut reader = CommandReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(argv) = reader.next_command()? {
            out.push(argv);
        }
        Ok(out)
    }

    #[test]
    fn encodes_the_documented_framing() {
        let mut buf = Vec::new();
        encode_command(&mut buf, &[b"HMSET".as_slice(), b"h", b"f", b"v"]);
        assert_eq!(
            buf,
            b"*4\r\n$5\r\nHMSET\r\n$1\r\nh\r\n$1\r\nf\r\n$1\r\nv\r\n"
        );

        let mut buf = Vec::new();
        encode_select(&mut buf, 0);
        assert_eq!(buf, b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n");

        let mut buf = Vec::new();
        encode_timestamp_annotation(&mut buf, 1700000000);
        assert_eq!(buf, b"#TS:1700000000\r\n");
    }

    #[test]
    fn decodes_what_it_encodes() {
        let mut buf = Vec::new();
        encode_command(&mut buf, &[b"SET".as_slice(), b"k", b"v"]);
        encode_timestamp_annotation(&mut buf, 42);
        encode_command(&mut buf, &[b"SET".as_slice(), b"k", b"v2"]);

        let commands = read_all(&buf).expect("well-formed stream");
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert_eq!(commands[1][2], b"v2".to_vec());
    }

    #[test]
    fn binary_payloads_survive() {
        let mut buf = Vec::new();
        let payload = vec![0u8, 13, 10, 255, 42];
        encode_command(&mut buf, &[b"SET".to_vec(), b"bin".to_vec(), payload.clone()]);
        let commands = read_all(&buf).expect("binary safe");
        assert_eq!(commands[0][2], payload);
    }

    #[test]
    fn eof_mid_command_is_truncation() {
        let mut buf = Vec::new();
        encode_command(&mut buf, &[b"SET".as_slice(), b"k", b"v"]);
        let full = buf.len();
        encode_command(&mut buf, &[b"SET".as_slice(), b"k", b"v2"]);

        for cut in full + 1..buf.len() {
            let mut reader = CommandReader::new(Cursor::new(&buf[..cut]));
            assert!(reader.next_command().expect("first intact").is_some());
            assert_eq!(reader.offset(), full as u64);
            match reader.next_command() {
                Err(FrameError::Truncated) => {}
                other => panic!("cut at {cut}: expected truncation, got {other:?}"),
            }
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let mut reader = CommandReader::new(Cursor::new(b"hello world\r\n".as_slice()));
        assert!(matches!(
            reader.next_command(),
            Err(FrameError::Malformed(_))
        ));

        let mut reader = CommandReader::new(Cursor::new(b"*0\r\n".as_slice()));
        assert!(matches!(
            reader.next_command(),
            Err(FrameError::Malformed(_))
        ));

        let mut reader = CommandReader::new(Cursor::new(b"*1\r\n$3\r\nabcXX".as_slice()));
        assert!(matches!(
            reader.next_command(),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn offset_stops_at_last_complete_command() {
        let mut buf = Vec::new();
        encode_command(&mut buf, &[b"SET".as_slice(), b"k", b"v"]);
        let boundary = buf.len() as u64;
        buf.extend_from_slice(b"*2\r\n$3\r\nGET");

        let mut reader = CommandReader::new(Cursor::new(&buf));
        assert!(reader.next_command().expect("first").is_some());
        assert_eq!(reader.offset(), boundary);
        assert!(matches!(reader.next_command(), Err(FrameError::Truncated)));
    }
}
