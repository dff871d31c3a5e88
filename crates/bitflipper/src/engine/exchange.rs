//! Request building, response framing and the per-connection exchange state
//! machine.
//!
//! ## Request Format
//! ```text
//! GET /AAAA...AAAA HTTP/1.1\r\n
//! Host: example.com\r\n
//! \r\n
//! ```
//!
//! ## Framing
//! A response is complete once the blank line ending its header block has
//! arrived. When the headers announce a `Content-Length` the body must follow
//! in full; for `Transfer-Encoding: chunked` the terminating zero-size chunk
//! must be seen. Bytes may arrive split anywhere, including in the middle of
//! the terminator.
//!
//! ## State Machine
//! ```text
//! Connecting -> Sending -> AwaitingResponse -> Sending ... -> Closing
//! ```
//! The machine never touches a socket. The worker feeds it events and
//! performs the action it returns.

use bytes::{Bytes, BytesMut};

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CHUNKED_TERMINATOR: &[u8] = b"\r\n0\r\n\r\n";

pub fn build_request(payload_char: char, length: usize, hostname: &str, keep_alive: bool) -> Bytes {
    let payload: String = std::iter::repeat(payload_char).take(length).collect();
    let connection = if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        ""
    };
    Bytes::from(format!(
        "GET /{payload} HTTP/1.1\r\nHost: {hostname}\r\n{connection}\r\n"
    ))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Looks up a header value (case-insensitive name) in a raw header block.
pub fn header_value<'a>(head: &'a [u8], name: &str) -> Option<&'a str> {
    head.split(|&b| b == b'\n')
        .skip(1)
        .filter_map(|line| std::str::from_utf8(line).ok())
        .filter_map(|line| line.trim_end_matches('\r').split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Empty,
    Length(usize),
    Chunked,
}

fn body_framing(head: &[u8]) -> Body {
    let chunked = header_value(head, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return Body::Chunked;
    }
    match header_value(head, "content-length").and_then(|v| v.parse::<usize>().ok()) {
        Some(0) | None => Body::Empty,
        Some(n) => Body::Length(n),
    }
}

/// Accumulates received bytes and cuts complete responses off the front.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buf: BytesMut,
    // Prefix of `buf` already searched for the header terminator.
    scanned: usize,
    // Header length and body framing once the terminator has been seen.
    head: Option<(usize, Body)>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a completed response.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete response, or `None` while it is still
    /// accumulating.
    pub fn next_response(&mut self) -> Option<Bytes> {
        let (head_len, body) = match self.head {
            Some(head) => head,
            None => {
                // A terminator may straddle the previous scan boundary.
                let from = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
                match find(&self.buf[from..], HEADER_TERMINATOR) {
                    Some(pos) => {
                        let head_len = from + pos + HEADER_TERMINATOR.len();
                        let head = (head_len, body_framing(&self.buf[..head_len]));
                        self.head = Some(head);
                        head
                    }
                    None => {
                        self.scanned = self.buf.len();
                        return None;
                    }
                }
            }
        };

        let total = match body {
            Body::Empty => head_len,
            Body::Length(n) => head_len + n,
            Body::Chunked => {
                // The zero-size chunk may directly follow the headers.
                let from = head_len - 2;
                let end = find(&self.buf[from..], CHUNKED_TERMINATOR)?;
                from + end + CHUNKED_TERMINATOR.len()
            }
        };
        if self.buf.len() < total {
            return None;
        }

        self.head = None;
        self.scanned = 0;
        Some(self.buf.split_to(total).freeze())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.head = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Connecting,
    Sending,
    AwaitingResponse,
    Closing,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExchangeEvent<'a> {
    Connected,
    RequestSent,
    DataReceived(&'a [u8]),
    PeerClosed,
    StopRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    PeerClosed { completed: u32 },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write the next request. Every request but the first passes the rate gate.
    SendRequest { gated: bool },
    /// The response is still incomplete; read more.
    AwaitData,
    Close(CloseReason),
}

/// Drives one connection through `expected` request/response exchanges.
#[derive(Debug)]
pub struct Exchange {
    state: ExchangeState,
    expected: u32,
    completed: u32,
    framer: ResponseFramer,
    outcome: Option<CloseReason>,
}

impl Exchange {
    pub fn new(expected: u32) -> Self {
        Self {
            state: ExchangeState::Connecting,
            expected,
            completed: 0,
            framer: ResponseFramer::new(),
            outcome: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn handle(&mut self, event: ExchangeEvent<'_>) -> Action {
        if let Some(reason) = self.outcome {
            return Action::Close(reason);
        }

        match (self.state, event) {
            (ExchangeState::Connecting, ExchangeEvent::Connected) => self.send_next(),
            (ExchangeState::Sending, ExchangeEvent::RequestSent) => {
                self.state = ExchangeState::AwaitingResponse;
                self.poll_response()
            }
            (ExchangeState::AwaitingResponse, ExchangeEvent::DataReceived(data)) => {
                self.framer.push(data);
                self.poll_response()
            }
            (_, ExchangeEvent::PeerClosed) => {
                self.state = ExchangeState::Closed;
                self.finish(CloseReason::PeerClosed {
                    completed: self.completed,
                })
            }
            (_, ExchangeEvent::StopRequested) => {
                self.state = ExchangeState::Closing;
                self.finish(CloseReason::Cancelled)
            }
            (ExchangeState::Connecting, _) => Action::AwaitData,
            (ExchangeState::Sending, ExchangeEvent::DataReceived(data)) => {
                // Early bytes belong to the response of the request about to go out.
                self.framer.push(data);
                self.send_action()
            }
            (ExchangeState::Sending, _) => self.send_action(),
            (_, _) => Action::AwaitData,
        }
    }

    fn send_action(&self) -> Action {
        Action::SendRequest {
            gated: self.completed > 0,
        }
    }

    fn send_next(&mut self) -> Action {
        self.state = ExchangeState::Sending;
        self.send_action()
    }

    fn poll_response(&mut self) -> Action {
        if self.framer.next_response().is_none() {
            return Action::AwaitData;
        }
        self.completed += 1;
        if self.completed >= self.expected {
            self.state = ExchangeState::Closing;
            return self.finish(CloseReason::Completed);
        }
        self.send_next()
    }

    fn finish(&mut self, reason: CloseReason) -> Action {
        self.framer.clear();
        self.outcome = Some(reason);
        Action::Close(reason)
    }
}
