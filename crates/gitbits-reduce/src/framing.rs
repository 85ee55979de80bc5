//! Key-stream framing: a list of keys wrapped in fixed-width header/footer sentinels
//!
//! ```text
//! HEADER0000000000000000000000000000000000000000000000000000000000
//! <64 hex chars>
//! <64 hex chars>
//! FOOTER0000000000000000000000000000000000000000000000000000000000
//! ```
//!
//! Sentinels have the exact width of a key line, so a framed stream is always a
//! multiple of [`KEY_LINE_WIDTH`] bytes long. Readers toggle a recording state on
//! the sentinels: the header turns recording on, the footer turns it off, and
//! only lines seen while recording are keys. Anything else is ignored.

use crate::error::{ReduceError, ReduceResult};
use crate::key::{Key, KEY_LINE_WIDTH};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};

/// Header sentinel line
pub const HEADER: &[u8; KEY_LINE_WIDTH] =
    b"HEADER0000000000000000000000000000000000000000000000000000000000\n";

/// Footer sentinel line
pub const FOOTER: &[u8; KEY_LINE_WIDTH] =
    b"FOOTER0000000000000000000000000000000000000000000000000000000000\n";

/// A line buffer that never holds more than `limit` bytes.
///
/// Longer lines are consumed to their newline but only their prefix is kept, and
/// the line is flagged as overlong. This keeps memory bounded when the input is an
/// arbitrary binary blob rather than a key stream.
#[derive(Debug, Clone)]
pub struct BoundedLine {
    buf: Vec<u8>,
    limit: usize,
    overlong: bool,
}

impl BoundedLine {
    /// Buffer for lines of at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit),
            limit,
            overlong: false,
        }
    }

    /// Buffer sized for key lines
    pub fn for_keys() -> Self {
        Self::new(KEY_LINE_WIDTH)
    }

    /// Forget the current line
    pub fn clear(&mut self) {
        self.buf.clear();
        self.overlong = false;
    }

    /// Feed bytes from a reader's buffer. Returns how many bytes were consumed and
    /// whether the line terminator was reached.
    pub fn feed(&mut self, available: &[u8]) -> (usize, bool) {
        match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.push(&available[..i]);
                (i + 1, true)
            }
            None => {
                self.push(available);
                (available.len(), false)
            }
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.limit - self.buf.len();
        if bytes.len() > room {
            self.overlong = true;
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Line content without its terminator (a trailing `\r` is dropped too)
    pub fn bytes(&self) -> &[u8] {
        match self.buf.last() {
            Some(b'\r') if !self.overlong => &self.buf[..self.buf.len() - 1],
            _ => &self.buf,
        }
    }

    /// True if the line was longer than the limit and got truncated
    pub fn is_overlong(&self) -> bool {
        self.overlong
    }
}

/// Read the next line into `line`. Returns false at end of input.
pub fn read_line<R: BufRead + ?Sized>(
    reader: &mut R,
    line: &mut BoundedLine,
) -> std::io::Result<bool> {
    line.clear();
    let mut any = false;
    loop {
        let available = match reader.fill_buf() {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok(any);
        }
        let (used, done) = line.feed(available);
        reader.consume(used);
        any = true;
        if done {
            return Ok(true);
        }
    }
}

/// The pair of sentinel lines used to frame key streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    header: Vec<u8>,
    footer: Vec<u8>,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            header: HEADER.to_vec(),
            footer: FOOTER.to_vec(),
        }
    }
}

impl Sentinels {
    /// Build sentinels from newline-terminated lines. Both must be exactly one key
    /// line wide, otherwise the size heuristic used when scanning history breaks.
    pub fn new(header: &[u8], footer: &[u8]) -> ReduceResult<Self> {
        let well_formed = |s: &[u8]| {
            s.len() == KEY_LINE_WIDTH
                && s.ends_with(b"\n")
                && Key::from_hex_line(&s[..s.len() - 1]).is_err()
        };
        if !well_formed(header) || !well_formed(footer) || header == footer {
            return Err(ReduceError::InvalidSentinels {
                expected: KEY_LINE_WIDTH,
                header: header.len(),
                footer: footer.len(),
            });
        }
        Ok(Self {
            header: header.to_vec(),
            footer: footer.to_vec(),
        })
    }

    /// Header line including its newline
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Footer line including its newline
    pub fn footer(&self) -> &[u8] {
        &self.footer
    }

    fn is_header(&self, line: &[u8]) -> bool {
        line == &self.header[..self.header.len() - 1]
    }

    fn is_footer(&self, line: &[u8]) -> bool {
        line == &self.footer[..self.footer.len() - 1]
    }

    /// Start a recorder over a stream of lines
    pub fn recorder(&self) -> KeyRecorder<'_> {
        KeyRecorder {
            sentinels: self,
            recording: false,
            windows: 0,
            keys: 0,
        }
    }

    /// Write header, one key per line, footer
    pub fn frame<W: Write + ?Sized>(&self, keys: &[Key], out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.header)?;
        for key in keys {
            writeln!(out, "{key}")?;
        }
        out.write_all(&self.footer)
    }

    /// Frame keys into a new buffer
    pub fn frame_to_vec(&self, keys: &[Key]) -> Vec<u8> {
        let mut out = Vec::with_capacity((keys.len() + 2) * KEY_LINE_WIDTH);
        // writing to a Vec cannot fail
        let _ = self.frame(keys, &mut out);
        out
    }

    /// Recover the keys recorded between header/footer pairs, in order.
    /// Lines outside a window are discarded.
    pub fn unframe<R: Read>(&self, input: R) -> ReduceResult<Vec<Key>> {
        let mut reader = BufReader::new(input);
        let mut line = BoundedLine::for_keys();
        let mut recorder = self.recorder();
        let mut keys = Vec::new();
        while read_line(&mut reader, &mut line).map_err(ReduceError::Input)? {
            if let Some(key) = recorder.observe(&line)? {
                keys.push(key);
            }
        }
        recorder.finish()?;
        Ok(keys)
    }
}

/// Header/footer toggle state applied line by line
#[derive(Debug)]
pub struct KeyRecorder<'a> {
    sentinels: &'a Sentinels,
    recording: bool,
    windows: usize,
    keys: usize,
}

impl KeyRecorder<'_> {
    /// Feed one line. Returns the decoded key when the line was recorded.
    ///
    /// A recorded line that is not a valid key is fatal: it means the key stream
    /// itself is corrupt.
    pub fn observe(&mut self, line: &BoundedLine) -> ReduceResult<Option<Key>> {
        let bytes = line.bytes();
        if !line.is_overlong() {
            if self.sentinels.is_header(bytes) {
                self.recording = true;
                self.windows += 1;
                return Ok(None);
            }
            if self.sentinels.is_footer(bytes) {
                self.recording = false;
                return Ok(None);
            }
        }
        if !self.recording {
            return Ok(None);
        }
        if line.is_overlong() {
            return Err(ReduceError::KeyDecode {
                line: String::from_utf8_lossy(bytes).into_owned(),
                reason: "line is longer than a key line".into(),
            });
        }
        let key = Key::from_hex_line(bytes)?;
        self.keys += 1;
        Ok(Some(key))
    }

    /// True while between a header and a footer
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Number of headers seen
    pub fn windows(&self) -> usize {
        self.windows
    }

    /// Number of keys recorded
    pub fn keys(&self) -> usize {
        self.keys
    }

    /// Fail if the input ended inside an open window
    pub fn finish(&self) -> ReduceResult<()> {
        if self.recording {
            return Err(ReduceError::UnterminatedKeyStream { keys: self.keys });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(n: usize) -> Vec<Key> {
        (0..n).map(|i| Key::digest(format!("chunk {i}").as_bytes())).collect()
    }

    #[test]
    fn sentinels_have_key_line_width() {
        assert_eq!(HEADER.len(), KEY_LINE_WIDTH);
        assert_eq!(FOOTER.len(), KEY_LINE_WIDTH);
        assert!(Sentinels::new(HEADER, FOOTER).is_ok());
    }

    #[test]
    fn sentinels_of_wrong_width_rejected() {
        let short = b"HEADER000\n";
        assert!(matches!(
            Sentinels::new(short, FOOTER),
            Err(ReduceError::InvalidSentinels { expected: 65, header: 10, footer: 65 })
        ));
    }

    #[test]
    fn sentinels_must_not_be_keys() {
        let hexline = format!("{}\n", Key::digest(b"k"));
        assert!(Sentinels::new(hexline.as_bytes(), FOOTER).is_err());
        assert!(Sentinels::new(HEADER, HEADER).is_err());
    }

    #[test]
    fn frame_layout() {
        let s = Sentinels::default();
        let ks = keys(3);
        let framed = s.frame_to_vec(&ks);
        assert_eq!(framed.len(), 5 * KEY_LINE_WIDTH);
        assert!(framed.starts_with(HEADER));
        assert!(framed.ends_with(FOOTER));
        let second = &framed[KEY_LINE_WIDTH..2 * KEY_LINE_WIDTH];
        assert_eq!(second, format!("{}\n", ks[0]).as_bytes());
    }

    #[test]
    fn unframe_empty_frame() {
        let s = Sentinels::default();
        assert!(s.unframe(&s.frame_to_vec(&[])[..]).unwrap().is_empty());
    }

    #[test]
    fn unframe_ignores_surrounding_lines() {
        let s = Sentinels::default();
        let ks = keys(4);
        let mut input = b"some preamble\nnot a key either\n".to_vec();
        input.extend(s.frame_to_vec(&ks[..2]));
        input.extend_from_slice(b"between windows\n");
        input.extend(s.frame_to_vec(&ks[2..]));
        input.extend_from_slice(b"trailer without newline");
        assert_eq!(s.unframe(&input[..]).unwrap(), ks);
    }

    #[test]
    fn unframe_ignores_overlong_lines_outside_window() {
        let s = Sentinels::default();
        let ks = keys(2);
        let mut input = vec![b'x'; 10_000];
        input.push(b'\n');
        input.extend(s.frame_to_vec(&ks));
        assert_eq!(s.unframe(&input[..]).unwrap(), ks);
    }

    #[test]
    fn overlong_line_inside_window_is_fatal() {
        let s = Sentinels::default();
        let mut input = HEADER.to_vec();
        input.extend(vec![b'a'; 500]);
        input.push(b'\n');
        input.extend_from_slice(FOOTER);
        assert!(matches!(
            s.unframe(&input[..]),
            Err(ReduceError::KeyDecode { .. })
        ));
    }

    #[test]
    fn bad_hex_inside_window_is_fatal() {
        let s = Sentinels::default();
        let mut input = HEADER.to_vec();
        input.extend_from_slice(b"not-hex\n");
        input.extend_from_slice(FOOTER);
        let err = s.unframe(&input[..]).unwrap_err();
        assert!(err.to_string().contains("not-hex"));
    }

    #[test]
    fn short_key_inside_window_is_fatal() {
        let s = Sentinels::default();
        let mut input = HEADER.to_vec();
        input.extend_from_slice(b"abcdef\n");
        input.extend_from_slice(FOOTER);
        assert!(matches!(
            s.unframe(&input[..]),
            Err(ReduceError::KeyLength { actual: 3, .. })
        ));
    }

    #[test]
    fn missing_footer_is_unterminated() {
        let s = Sentinels::default();
        let framed = s.frame_to_vec(&keys(2));
        let partial = &framed[..framed.len() - KEY_LINE_WIDTH];
        assert!(matches!(
            s.unframe(partial),
            Err(ReduceError::UnterminatedKeyStream { keys: 2 })
        ));
    }

    #[test]
    fn crlf_lines_accepted() {
        let s = Sentinels::default();
        let ks = keys(1);
        let text = String::from_utf8(s.frame_to_vec(&ks)).unwrap().replace('\n', "\r\n");
        assert_eq!(s.unframe(text.as_bytes()).unwrap(), ks);
    }

    #[test]
    fn recorder_counts_windows() {
        let s = Sentinels::default();
        let mut input = s.frame_to_vec(&keys(1));
        input.extend(s.frame_to_vec(&keys(2)));
        let mut reader = &input[..];
        let mut line = BoundedLine::for_keys();
        let mut recorder = s.recorder();
        while read_line(&mut reader, &mut line).unwrap() {
            recorder.observe(&line).unwrap();
        }
        assert_eq!(recorder.windows(), 2);
        assert_eq!(recorder.keys(), 3);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn bounded_line_truncates() {
        let mut line = BoundedLine::new(4);
        let (used, done) = line.feed(b"abcdefgh\nrest");
        assert_eq!(used, 9);
        assert!(done);
        assert_eq!(line.bytes(), b"abcd");
        assert!(line.is_overlong());
        line.clear();
        assert!(!line.is_overlong());
        assert!(line.bytes().is_empty());
    }

    #[test]
    fn read_line_across_small_buffers() {
        let data = b"first line\nsecond\n\nlast";
        let mut reader = BufReader::with_capacity(3, &data[..]);
        let mut line = BoundedLine::new(64);
        let mut lines = Vec::new();
        while read_line(&mut reader, &mut line).unwrap() {
            lines.push(line.bytes().to_vec());
        }
        assert_eq!(
            lines,
            vec![b"first line".to_vec(), b"second".to_vec(), Vec::new(), b"last".to_vec()]
        );
    }

    proptest! {
        #[test]
        fn prop_frame_unframe_preserves_order(n in 0usize..200) {
            let s = Sentinels::default();
            let ks = keys(n);
            let framed = s.frame_to_vec(&ks);
            prop_assert_eq!(framed.len(), (n + 2) * KEY_LINE_WIDTH);
            prop_assert_eq!(s.unframe(&framed[..]).unwrap(), ks);
        }

        #[test]
        fn prop_noise_outside_window_ignored(
            before in "[g-z ]{0,100}",
            after in "[g-z ]{0,100}",
            n in 0usize..20,
        ) {
            let s = Sentinels::default();
            let ks = keys(n);
            let mut input = format!("{before}\n").into_bytes();
            input.extend(s.frame_to_vec(&ks));
            input.extend(format!("{after}\n").into_bytes());
            prop_assert_eq!(s.unframe(&input[..]).unwrap(), ks);
        }
    }
}
