// src/response.rs
//! Response head/body serialization into a connection's fixed write buffer.
//!
//! A [`ResponseBuilder`] collects the status, declared length, connection
//! disposition and an optional inline body, then serializes in one pass.
//! Serialization either fits entirely or fails with [`Overflow`]; nothing is
//! ever truncated.

pub const EMPTY_DOCUMENT: &[u8] = b"<html><body></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    #[inline(always)]
    fn status_line(self) -> &'static [u8] {
        match self {
            Status::Ok => b"HTTP/1.1 200 OK\r\n",
            Status::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            Status::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            Status::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            Status::InternalError => b"HTTP/1.1 500 Internal Error\r\n",
        }
    }

    /// Fixed plain-text body sent with each error status.
    pub fn canned_body(self) -> &'static [u8] {
        match self {
            Status::Ok => b"",
            Status::BadRequest => {
                b"Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => b"You do not have permission to get file from this server.\n",
            Status::NotFound => b"The requested file was not found on this server.\n",
            Status::InternalError => b"There was an unusual problem serving the requested file.\n",
        }
    }
}

/// The response did not fit in the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

#[derive(Debug, Clone, Copy)]
pub struct ResponseBuilder<'a> {
    status: Status,
    content_length: usize,
    keep_alive: bool,
    body: &'a [u8],
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            content_length: 0,
            keep_alive: false,
            body: b"",
        }
    }

    /// Error status with its canned body.
    pub fn error(status: Status, keep_alive: bool) -> ResponseBuilder<'static> {
        let body = status.canned_body();
        ResponseBuilder::new(status)
            .keep_alive(keep_alive)
            .body(body)
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Declare a body sent out of band (e.g. from a file mapping).
    pub fn content_length(mut self, len: usize) -> Self {
        self.content_length = len;
        self
    }

    /// Inline body, copied right after the headers. Sets Content-Length.
    pub fn body<'b>(self, body: &'b [u8]) -> ResponseBuilder<'b> {
        ResponseBuilder {
            status: self.status,
            content_length: body.len(),
            keep_alive: self.keep_alive,
            body,
        }
    }

    /// Serialize into `buf`, returning the number of bytes written.
    pub fn write_into(&self, buf: &mut [u8]) -> Result<usize, Overflow> {
        let mut out = Cursor { buf, pos: 0 };
        let mut len_buf = itoa::Buffer::new();

        out.put(self.status.status_line())?;
        out.put(b"Content-Length: ")?;
        out.put(len_buf.format(self.content_length).as_bytes())?;
        out.put(b"\r\n")?;
        if self.keep_alive {
            out.put(b"Connection: keep-alive\r\n")?;
        } else {
            out.put(b"Connection: close\r\n")?;
        }
        out.put(b"\r\n")?;
        out.put(self.body)?;

        Ok(out.pos)
    }
}

struct Cursor<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Cursor<'_> {
    #[inline(always)]
    fn put(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.pos.checked_add(bytes.len()).ok_or(Overflow)?;
        if end > self.buf.len() {
            return Err(Overflow);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(builder: ResponseBuilder<'_>) -> String {
        let mut buf = [0u8; 1024];
        let n = builder.write_into(&mut buf).unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn test_not_found_with_close() {
        let text = render(ResponseBuilder::error(Status::NotFound, false));
        assert_eq!(
            text,
            "HTTP/1.1 404 Not Found\r\nContent-Length: 49\r\nConnection: close\r\n\r\n\
             The requested file was not found on this server.\n"
        );
    }

    #[test]
    fn test_error_keep_alive_header() {
        let text = render(ResponseBuilder::error(Status::BadRequest, true));
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("impossible to satisfy.\n"));
    }

    #[test]
    fn test_canned_bodies_match_declared_lengths() {
        for status in [
            Status::BadRequest,
            Status::Forbidden,
            Status::NotFound,
            Status::InternalError,
        ] {
            let text = render(ResponseBuilder::error(status, false));
            let body = status.canned_body();
            let header = format!("Content-Length: {}\r\n", body.len());
            assert!(text.contains(&header), "{}", text);
            assert!(text.ends_with(std::str::from_utf8(body).unwrap()));
        }
    }

    #[test]
    fn test_headers_only_for_out_of_band_body() {
        let text = render(
            ResponseBuilder::new(Status::Ok)
                .keep_alive(true)
                .content_length(123_456),
        );
        assert_eq!(
            text,
            "HTTP/1.1 200 OK\r\nContent-Length: 123456\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn test_empty_document() {
        let text = render(ResponseBuilder::new(Status::Ok).body(EMPTY_DOCUMENT));
        assert!(text.contains("Content-Length: 26\r\n"));
        assert!(text.ends_with("<html><body></body></html>"));
    }

    #[test]
    fn test_overflow_is_rejected_not_truncated() {
        let mut small = [0u8; 40];
        let result = ResponseBuilder::error(Status::NotFound, false).write_into(&mut small);
        assert_eq!(result, Err(Overflow));

        let big_body = [b'x'; 2048];
        let mut buf = [0u8; 1024];
        assert_eq!(
            ResponseBuilder::new(Status::Ok).body(&big_body).write_into(&mut buf),
            Err(Overflow)
        );
    }

    #[test]
    fn test_exact_fit() {
        let builder = ResponseBuilder::error(Status::Forbidden, false);
        let mut probe = [0u8; 1024];
        let n = builder.write_into(&mut probe).unwrap();

        let mut exact = vec![0u8; n];
        assert_eq!(builder.write_into(&mut exact), Ok(n));
        let mut short = vec![0u8; n - 1];
        assert_eq!(builder.write_into(&mut short), Err(Overflow));
    }
}
