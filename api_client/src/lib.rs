// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Minimal blocking HTTP/1.1 client for the hypervisor control-plane
//! socket. The control plane speaks plain HTTP over a local stream, so a
//! hand-rolled request/response pair is all that is needed here.

use std::io::{Read, Write};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error writing to or reading from the API socket")]
    Socket(#[source] std::io::Error),
    #[error("error parsing the HTTP status code")]
    StatusCodeParsing(#[source] std::num::ParseIntError),
    #[error("HTTP response is missing the protocol statement")]
    MissingProtocol,
    #[error("error parsing the HTTP Content-Length header")]
    ContentLengthParsing(#[source] std::num::ParseIntError),
    #[error("the server responded with an error: {0:?}: {1:?}")]
    ServerResponse(StatusCode, Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Continue,
    Ok,
    NoContent,
    BadRequest,
    NotFound,
    InternalServerError,
    NotImplemented,
    Unknown,
}

impl StatusCode {
    fn from_raw(code: usize) -> StatusCode {
        match code {
            100 => StatusCode::Continue,
            200 => StatusCode::Ok,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            404 => StatusCode::NotFound,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::NotImplemented,
            _ => StatusCode::Unknown,
        }
    }

    fn parse(code: &str) -> Result<StatusCode, Error> {
        Ok(StatusCode::from_raw(
            code.trim().parse().map_err(Error::StatusCodeParsing)?,
        ))
    }

    fn is_server_error(self) -> bool {
        !matches!(
            self,
            StatusCode::Ok | StatusCode::Continue | StatusCode::NoContent
        )
    }
}

fn get_header<'a>(res: &'a str, header: &str) -> Option<&'a str> {
    let needle = format!("{header}: ");
    let start = res.find(&needle)? + needle.len();
    let end = start + res[start..].find('\r')?;
    Some(&res[start..end])
}

fn get_status_code(res: &str) -> Result<StatusCode, Error> {
    let offset = res.find("HTTP/1.1 ").ok_or(Error::MissingProtocol)?;
    let line = &res[offset + "HTTP/1.1 ".len()..];
    let code = line.split('\r').next().ok_or(Error::MissingProtocol)?;
    StatusCode::parse(code)
}

fn parse_http_response(socket: &mut dyn Read) -> Result<Option<String>, Error> {
    let mut res = String::new();
    let mut body_offset = None;
    let mut content_length: Option<usize> = None;
    loop {
        let mut bytes = vec![0; 256];
        let count = socket.read(&mut bytes).map_err(Error::Socket)?;
        res.push_str(&String::from_utf8_lossy(&bytes[0..count]));

        // With all headers available we can see if there is any body
        if body_offset.is_none() {
            if let Some(o) = res.find("\r\n\r\n") {
                body_offset = Some(o + "\r\n\r\n".len());
                content_length = match get_header(&res, "Content-Length") {
                    Some(length) => {
                        Some(length.trim().parse().map_err(Error::ContentLengthParsing)?)
                    }
                    None => None,
                };
            }
        }

        match (body_offset, content_length) {
            (Some(_), None) => break,
            (Some(offset), Some(length)) if res.len() >= offset + length => break,
            _ => {}
        }

        if count == 0 {
            // Peer closed the stream before the response was complete;
            // fall through and let the status-code parsing report it.
            break;
        }
    }

    let status_code = get_status_code(&res)?;
    let body = match (body_offset, content_length) {
        (Some(offset), Some(_)) => Some(String::from(&res[offset..])),
        _ => None,
    };

    if status_code.is_server_error() {
        Err(Error::ServerResponse(status_code, body))
    } else {
        Ok(body)
    }
}

/// Issue a single `vm.<command>` request and block until the control plane
/// answers. Returns the response body, if the server sent one.
pub fn simple_api_command<T: Read + Write>(
    socket: &mut T,
    method: &str,
    command: &str,
    request_body: Option<&str>,
) -> Result<Option<String>, Error> {
    socket
        .write_all(
            format!("{method} /api/v1/vm.{command} HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n")
                .as_bytes(),
        )
        .map_err(Error::Socket)?;

    if let Some(request_body) = request_body {
        socket
            .write_all(format!("Content-Length: {}\r\n", request_body.len()).as_bytes())
            .map_err(Error::Socket)?;
    }

    socket.write_all(b"\r\n").map_err(Error::Socket)?;

    if let Some(request_body) = request_body {
        socket
            .write_all(request_body.as_bytes())
            .map_err(Error::Socket)?;
    }

    socket.flush().map_err(Error::Socket)?;

    parse_http_response(socket)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    // One scripted response on the read side, captured request bytes on the
    // write side.
    struct FakeSocket {
        response: Cursor<Vec<u8>>,
        request: Vec<u8>,
    }

    impl FakeSocket {
        fn new(response: &str) -> Self {
            FakeSocket {
                response: Cursor::new(response.as_bytes().to_vec()),
                request: Vec::new(),
            }
        }

        fn request_str(&self) -> String {
            String::from_utf8_lossy(&self.request).into_owned()
        }
    }

    impl Read for FakeSocket {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for FakeSocket {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.request.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_no_content_response() {
        let mut socket = FakeSocket::new("HTTP/1.1 204 No Content\r\n\r\n");
        let body = simple_api_command(&mut socket, "PUT", "add-disk", Some("{}")).unwrap();
        assert!(body.is_none());

        let request = socket.request_str();
        assert!(request.starts_with("PUT /api/v1/vm.add-disk HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 2\r\n"));
        assert!(request.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn test_response_body_is_returned() {
        let mut socket =
            FakeSocket::new("HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"id\":\"vdb\"}\n");
        let body = simple_api_command(&mut socket, "PUT", "add-disk", Some("{}")).unwrap();
        assert_eq!(body.as_deref(), Some("{\"id\":\"vdb\"}\n"));
    }

    #[test]
    fn test_server_error_is_reported() {
        let mut socket =
            FakeSocket::new("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\noops");
        let err = simple_api_command(&mut socket, "PUT", "remove-device", Some("{}")).unwrap_err();
        match err {
            Error::ServerResponse(StatusCode::InternalServerError, Some(body)) => {
                assert_eq!(body, "oops")
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_missing_protocol() {
        let mut socket = FakeSocket::new("not http at all\r\n\r\n");
        let err = simple_api_command(&mut socket, "GET", "info", None).unwrap_err();
        assert!(matches!(err, Error::MissingProtocol));
    }

    #[test]
    fn test_truncated_response() {
        // Stream closed before the advertised body arrived in full; the
        // reported body is what was actually read.
        let mut socket = FakeSocket::new("HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\nshort");
        let body = simple_api_command(&mut socket, "GET", "info", None).unwrap();
        assert_eq!(body.as_deref(), Some("short"));
    }
}
