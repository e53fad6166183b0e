//! Parsing of guest stdout into an HTTP response.
//!
//! A guest answers like a CGI script: header lines, a blank line, then the
//! body. Only the header block is read here; the body is left in the stdout
//! file and streamed from [`ParsedResponse::body_offset`].
//!
//! ```text
//! SCANNING_HEADER --(blank line)--> STREAMING_BODY
//! ```

use std::io::{self, BufReader, Read, Seek};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use wagi_common::RuntimeError;

use crate::temp::TempResource;

/// Status used when the guest does not send one.
pub const DEFAULT_STATUS: u16 = 200;

/// Status line and headers written by a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// HTTP status code.
    pub status: u16,

    /// Header name/value pairs in output order. Names keep the guest's case.
    pub headers: Vec<(String, String)>,

    /// Offset of the first body byte in the output.
    pub body_offset: u64,
}

impl ParsedResponse {
    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read the header block from guest output.
///
/// Lines end at `\n` and are trimmed, so `\r\n` endings work. NUL bytes are
/// ignored. The first blank line ends the block, even before any header, so
/// output starting with a blank line has an empty header block.
///
/// # Errors
///
/// - [`RuntimeError::HeaderTooLong`] if a line exceeds `max_header_bytes`
/// - [`RuntimeError::MalformedResponse`] for a line without `:` or a bad status
/// - [`RuntimeError::InsufficientResponse`] if none of `content-type`,
///   `location` or `status` was sent
pub fn parse_response(
    output: impl Read,
    max_header_bytes: usize,
) -> Result<ParsedResponse, RuntimeError> {
    let (lines, body_offset) = read_header_lines(output, max_header_bytes)?;

    let mut status = DEFAULT_STATUS;
    let mut headers = Vec::new();
    let mut sufficient = false;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(RuntimeError::malformed_response(format!(
                "header line without ':' ({} bytes)",
                line.len()
            )));
        };
        let name = name.trim();
        let value = value.trim();

        match name.to_ascii_lowercase().as_str() {
            "location" | "content-type" => {
                headers.push((name.to_string(), value.to_string()));
                sufficient = true;
            }
            "status" => {
                status = parse_status(value)?;
                sufficient = true;
            }
            _ => headers.extend(
                value
                    .split(',')
                    .map(|v| (name.to_string(), v.trim().to_string())),
            ),
        }
    }

    if !sufficient {
        return Err(RuntimeError::InsufficientResponse);
    }

    Ok(ParsedResponse {
        status,
        headers,
        body_offset,
    })
}

fn read_header_lines(
    output: impl Read,
    max_header_bytes: usize,
) -> Result<(Vec<String>, u64), RuntimeError> {
    let mut lines = Vec::new();
    let mut line = Vec::new();
    let mut offset = 0u64;

    for byte in BufReader::new(output).bytes() {
        let byte = byte?;
        offset += 1;

        match byte {
            b'\n' => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                line.clear();

                if text.is_empty() {
                    return Ok((lines, offset));
                }
                lines.push(text);
            }
            0 => {}
            _ => {
                if line.len() >= max_header_bytes {
                    return Err(RuntimeError::HeaderTooLong {
                        limit: max_header_bytes,
                    });
                }
                line.push(byte);
            }
        }
    }

    // Output ended inside the header block; there is no body.
    let text = String::from_utf8_lossy(&line).trim().to_string();
    if !text.is_empty() {
        lines.push(text);
    }
    Ok((lines, offset))
}

fn parse_status(value: &str) -> Result<u16, RuntimeError> {
    let (code, reason) = value.split_once(' ').unwrap_or((value, ""));

    let status = code
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| RuntimeError::malformed_response(format!("invalid status '{code}'")))?;

    if !reason.trim().is_empty() {
        debug!(status = status, reason = reason.trim(), "Ignoring status reason");
    }
    Ok(status)
}

/// The body of a guest response, read from its stdout file.
///
/// Owns the stdout [`TempResource`] so the file outlives the stream.
#[derive(Debug)]
pub struct ResponseBody {
    file: tokio::fs::File,
    _stdout: TempResource,
}

impl ResponseBody {
    /// Open the stdout file at `offset`.
    ///
    /// Performs blocking file I/O.
    pub fn open(stdout: TempResource, offset: u64) -> io::Result<Self> {
        let mut file = stdout.reopen()?;
        file.seek(io::SeekFrom::Start(offset))?;
        Ok(Self {
            file: tokio::fs::File::from_std(file),
            _stdout: stdout,
        })
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}
