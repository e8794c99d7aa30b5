// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Two cooperating machines. [`parse_line`] carves CRLF-terminated lines out
//! of a growing byte buffer and remembers how far it has scanned, so each
//! byte is examined once no matter how the stream was fragmented.
//! [`transition`] is a pure function from the current [`ParseState`] and one
//! complete line to the next state and a [`Progress`] verdict.
//!
//! Parsed fields are [`Span`]s into the read buffer, never borrowed slices,
//! so a request head can be copied out and outlive any single scan.

use memchr::memchr2;
use tracing::debug;

/// The only methods the server answers. Anything else never gets past the
/// request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    /// Whether a request with this method can carry a body at all.
    pub fn allows_body(self) -> bool {
        !matches!(self, Method::Head)
    }
}

/// An `(offset, length)` window into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    #[inline(always)]
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[inline(always)]
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.start + self.len]
    }
}

/// Result of one [`parse_line`] scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ends just before `checked - 2`.
    Complete,
    /// A stray CR or LF; the request cannot be salvaged.
    Malformed,
    /// No terminator yet, wait for more bytes.
    Incomplete,
}

/// Scan `buf` (the received bytes) from `*checked` for the next line end.
///
/// On `Complete`, `*checked` sits just past the LF and the line's terminator
/// starts at `*checked - 2`. On `Incomplete`, `*checked` never moves past a
/// trailing CR, so the next call resumes exactly where this one stopped.
pub fn parse_line(buf: &[u8], checked: &mut usize) -> LineStatus {
    while *checked < buf.len() {
        let Some(found) = memchr2(b'\r', b'\n', &buf[*checked..]) else {
            *checked = buf.len();
            return LineStatus::Incomplete;
        };

        let idx = *checked + found;
        *checked = idx;

        if buf[idx] == b'\r' {
            if idx + 1 == buf.len() {
                return LineStatus::Incomplete;
            }
            if buf[idx + 1] == b'\n' {
                *checked = idx + 2;
                return LineStatus::Complete;
            }
            return LineStatus::Malformed;
        }

        // Bare LF: only acceptable straight after a CR.
        if idx > 1 && buf[idx - 1] == b'\r' {
            *checked = idx + 1;
            return LineStatus::Complete;
        }
        return LineStatus::Malformed;
    }

    LineStatus::Incomplete
}

/// One complete line, terminator stripped, with its position in the buffer.
#[derive(Debug, Clone, Copy)]
pub struct Line<'a> {
    pub offset: usize,
    pub bytes: &'a [u8],
}

impl<'a> Line<'a> {
    pub fn new(offset: usize, bytes: &'a [u8]) -> Self {
        Self { offset, bytes }
    }

    fn span_of(&self, part: &[u8]) -> Span {
        let start = part.as_ptr() as usize - self.bytes.as_ptr() as usize;
        Span::new(self.offset + start, part.len())
    }
}

/// Request fields collected so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub url: Span,
    pub version: Span,
    pub host: Option<Span>,
    pub content_length: usize,
    pub keep_alive: bool,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            method: Method::Get,
            url: Span::default(),
            version: Span::default(),
            host: None,
            content_length: 0,
            keep_alive: false,
        }
    }
}

/// The main request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers(RequestHead),
    /// Headers done; waiting for `content_length` body bytes.
    Body(RequestHead),
}

impl ParseState {
    pub fn head(&self) -> Option<&RequestHead> {
        match self {
            ParseState::RequestLine => None,
            ParseState::Headers(head) | ParseState::Body(head) => Some(head),
        }
    }
}

/// What a transition concluded about the request as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Complete(RequestHead),
    Malformed,
}

/// Feed one complete line to the state machine.
///
/// `Body` does not consume lines; handing it one leaves it unchanged.
pub fn transition(state: ParseState, line: Line<'_>) -> (ParseState, Progress) {
    match state {
        ParseState::RequestLine => match parse_request_line(line) {
            Some(head) => (ParseState::Headers(head), Progress::NeedMore),
            None => (state, Progress::Malformed),
        },
        ParseState::Headers(mut head) => {
            if line.bytes.is_empty() {
                if !head.method.allows_body() || head.content_length == 0 {
                    return (ParseState::Headers(head), Progress::Complete(head));
                }
                return (ParseState::Body(head), Progress::NeedMore);
            }
            apply_header(&mut head, line);
            (ParseState::Headers(head), Progress::NeedMore)
        }
        ParseState::Body(_) => (state, Progress::NeedMore),
    }
}

/// Whether the whole body has arrived. `body_start` is the offset just past
/// the blank line that ended the headers.
#[inline(always)]
pub fn body_complete(read_index: usize, body_start: usize, content_length: usize) -> bool {
    read_index >= body_start.saturating_add(content_length)
}

#[inline(always)]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Split at the first space/tab, dropping the whole whitespace run.
fn split_blank(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|&b| is_blank(b))?;
    let rest = &bytes[pos..];
    let skip = rest.iter().take_while(|&&b| is_blank(b)).count();
    Some((&bytes[..pos], &rest[skip..]))
}

fn trim_leading_blanks(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|&&b| is_blank(b)).count();
    &bytes[skip..]
}

fn strip_prefix_ignore_case<'a>(bytes: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&bytes[prefix.len()..])
    } else {
        None
    }
}

/// `GET <url> HTTP/1.1`, with an absolute `http://host/path` url reduced to `/path`.
fn parse_request_line(line: Line<'_>) -> Option<RequestHead> {
    let (method, rest) = split_blank(line.bytes)?;
    // Case-sensitive: only the literal token is served.
    if method != b"GET" {
        return None;
    }

    let (mut url, version) = split_blank(rest)?;
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return None;
    }

    if let Some(authority) = strip_prefix_ignore_case(url, b"http://") {
        let slash = authority.iter().position(|&b| b == b'/')?;
        url = &authority[slash..];
    }
    if url.first() != Some(&b'/') {
        return None;
    }

    Some(RequestHead {
        method: Method::Get,
        url: line.span_of(url),
        version: line.span_of(version),
        ..RequestHead::default()
    })
}

fn apply_header(head: &mut RequestHead, line: Line<'_>) {
    if let Some(value) = strip_prefix_ignore_case(line.bytes, b"Connection:") {
        if trim_leading_blanks(value).eq_ignore_ascii_case(b"keep-alive") {
            head.keep_alive = true;
        }
    } else if let Some(value) = strip_prefix_ignore_case(line.bytes, b"Content-Length:") {
        // Repeated headers: last one wins.
        head.content_length = parse_decimal_prefix(trim_leading_blanks(value));
    } else if let Some(value) = strip_prefix_ignore_case(line.bytes, b"Host:") {
        head.host = Some(line.span_of(trim_leading_blanks(value)));
    } else {
        debug!(header = %String::from_utf8_lossy(line.bytes), "ignoring unknown header");
    }
}

/// Leading decimal digits, saturating; anything else (including a sign) is 0.
fn parse_decimal_prefix(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0usize, |acc, &b| {
            acc.saturating_mul(10).saturating_add((b - b'0') as usize)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(bytes: &[u8]) -> Line<'_> {
        Line::new(0, bytes)
    }

    fn request_line(text: &[u8]) -> (ParseState, Progress) {
        transition(ParseState::RequestLine, line(text))
    }

    fn headers_with(lines: &[&[u8]]) -> RequestHead {
        let (mut state, _) = request_line(b"GET / HTTP/1.1");
        for l in lines {
            state = transition(state, line(l)).0;
        }
        *state.head().unwrap()
    }

    #[test]
    fn test_parse_line_complete() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let mut checked = 0;
        assert_eq!(parse_line(buf, &mut checked), LineStatus::Complete);
        assert_eq!(checked, 16);
        assert_eq!(&buf[..checked - 2], b"GET / HTTP/1.1");
        assert_eq!(parse_line(buf, &mut checked), LineStatus::Complete);
        assert_eq!(checked, buf.len());
    }

    #[test]
    fn test_parse_line_trailing_cr_is_incomplete_and_idempotent() {
        let buf = b"GET / HTTP/1.1\r";
        let mut checked = 0;
        assert_eq!(parse_line(buf, &mut checked), LineStatus::Incomplete);
        assert_eq!(checked, 14);
        assert_eq!(parse_line(buf, &mut checked), LineStatus::Incomplete);
        assert_eq!(checked, 14);

        let grown = b"GET / HTTP/1.1\r\n";
        assert_eq!(parse_line(grown, &mut checked), LineStatus::Complete);
        assert_eq!(checked, 16);
    }

    #[test]
    fn test_parse_line_without_terminator_does_not_rescan() {
        let mut checked = 0;
        assert_eq!(parse_line(b"GET /ind", &mut checked), LineStatus::Incomplete);
        assert_eq!(checked, 8);
        assert_eq!(parse_line(b"GET /ind", &mut checked), LineStatus::Incomplete);
        assert_eq!(checked, 8);
    }

    #[test]
    fn test_parse_line_lf_after_cr_is_accepted() {
        // The scan resumes on the LF of a CRLF whose CR was already passed.
        let buf = b"abc\r\nrest";
        let mut checked = 4;
        assert_eq!(parse_line(buf, &mut checked), LineStatus::Complete);
        assert_eq!(checked, 5);
    }

    #[test]
    fn test_parse_line_malformed() {
        let mut checked = 0;
        assert_eq!(parse_line(b"abc\ndef", &mut checked), LineStatus::Malformed);

        let mut checked = 0;
        assert_eq!(parse_line(b"abc\rdef", &mut checked), LineStatus::Malformed);

        let mut checked = 0;
        assert_eq!(parse_line(b"\n", &mut checked), LineStatus::Malformed);
    }

    #[test]
    fn test_request_line_get() {
        let text = b"GET /index.html HTTP/1.1";
        let (state, progress) = request_line(text);
        assert_eq!(progress, Progress::NeedMore);
        let head = state.head().unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.url.slice(text), b"/index.html");
        assert_eq!(head.version.slice(text), b"HTTP/1.1");
        assert!(matches!(state, ParseState::Headers(_)));
    }

    #[test]
    fn test_request_line_tabs_and_runs_of_blanks() {
        let text = b"GET \t /a  \tHTTP/1.1";
        let (state, progress) = request_line(text);
        assert_eq!(progress, Progress::NeedMore);
        assert_eq!(state.head().unwrap().url.slice(text), b"/a");
    }

    #[test]
    fn test_request_line_rejects_other_methods() {
        for text in [
            &b"POST / HTTP/1.1"[..],
            b"HEAD / HTTP/1.1",
            b"get / HTTP/1.1",
            b"DELETE /x HTTP/1.1",
        ] {
            assert_eq!(request_line(text).1, Progress::Malformed, "{:?}", text);
        }
    }

    #[test]
    fn test_request_line_version() {
        assert_eq!(request_line(b"GET / http/1.1").1, Progress::NeedMore);
        assert_eq!(request_line(b"GET / HTTP/1.0").1, Progress::Malformed);
        assert_eq!(request_line(b"GET / HTTP/1.1 extra").1, Progress::Malformed);
        assert_eq!(request_line(b"GET /").1, Progress::Malformed);
        assert_eq!(request_line(b"GET").1, Progress::Malformed);
    }

    #[test]
    fn test_request_line_absolute_url_is_reduced_to_path() {
        let text = b"GET http://example.com/docs/a.txt HTTP/1.1";
        let (state, progress) = request_line(text);
        assert_eq!(progress, Progress::NeedMore);
        assert_eq!(state.head().unwrap().url.slice(text), b"/docs/a.txt");

        let text = b"GET HTTP://example.com/ HTTP/1.1";
        let (state, _) = request_line(text);
        assert_eq!(state.head().unwrap().url.slice(text), b"/");

        assert_eq!(
            request_line(b"GET http://example.com HTTP/1.1").1,
            Progress::Malformed
        );
    }

    #[test]
    fn test_request_line_requires_absolute_path() {
        assert_eq!(request_line(b"GET index.html HTTP/1.1").1, Progress::Malformed);
        assert_eq!(request_line(b"GET * HTTP/1.1").1, Progress::Malformed);
    }

    #[test]
    fn test_spans_are_relative_to_buffer_offset() {
        let buf = b"xxxxGET /p HTTP/1.1";
        let (state, _) = transition(ParseState::RequestLine, Line::new(4, &buf[4..]));
        assert_eq!(state.head().unwrap().url.slice(buf), b"/p");
    }

    #[test]
    fn test_headers_recognized_case_insensitively() {
        let head = headers_with(&[
            b"connection:  Keep-Alive",
            b"HOST: example.com",
            b"X-Custom: whatever",
        ]);
        assert!(head.keep_alive);
        assert_eq!(head.content_length, 0);
        assert!(head.host.is_some());
    }

    #[test]
    fn test_connection_other_values_do_not_keep_alive() {
        assert!(!headers_with(&[b"Connection: close"]).keep_alive);
        assert!(!headers_with(&[b"Connection: keep-alive, upgrade"]).keep_alive);
    }

    #[test]
    fn test_content_length_parsing() {
        assert_eq!(headers_with(&[b"Content-Length: 42"]).content_length, 42);
        assert_eq!(headers_with(&[b"Content-Length:7"]).content_length, 7);
        assert_eq!(headers_with(&[b"Content-Length: 12abc"]).content_length, 12);
        assert_eq!(headers_with(&[b"Content-Length: -5"]).content_length, 0);
        assert_eq!(headers_with(&[b"Content-Length: nope"]).content_length, 0);
        assert_eq!(
            headers_with(&[b"Content-Length: 3", b"Content-Length: 9"]).content_length,
            9
        );
        assert_eq!(
            headers_with(&[b"Content-Length: 99999999999999999999999999"]).content_length,
            usize::MAX
        );
    }

    #[test]
    fn test_blank_line_completes_without_body() {
        let (state, _) = request_line(b"GET / HTTP/1.1");
        let (_, progress) = transition(state, line(b""));
        assert!(matches!(progress, Progress::Complete(_)));
    }

    #[test]
    fn test_blank_line_with_content_length_waits_for_body() {
        let (state, _) = request_line(b"GET / HTTP/1.1");
        let (state, _) = transition(state, line(b"Content-Length: 4"));
        let (state, progress) = transition(state, line(b""));
        assert_eq!(progress, Progress::NeedMore);
        assert!(matches!(state, ParseState::Body(h) if h.content_length == 4));

        // Body does not consume lines.
        let (same, progress) = transition(state, line(b"ab"));
        assert_eq!(same, state);
        assert_eq!(progress, Progress::NeedMore);
    }

    #[test]
    fn test_head_method_never_waits_for_a_body() {
        let head = RequestHead {
            method: Method::Head,
            content_length: 10,
            ..RequestHead::default()
        };
        let (_, progress) = transition(ParseState::Headers(head), line(b""));
        assert!(matches!(progress, Progress::Complete(_)));
    }

    #[test]
    fn test_body_complete() {
        assert!(!body_complete(10, 8, 4));
        assert!(body_complete(12, 8, 4));
        assert!(body_complete(20, 8, 4));
        assert!(!body_complete(20, 8, usize::MAX));
    }
}
