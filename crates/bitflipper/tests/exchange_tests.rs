use bitflipper::engine::exchange::{
    build_request, header_value, Action, CloseReason, Exchange, ExchangeEvent, ExchangeState,
    ResponseFramer,
};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n";

#[test]
fn test_build_request_format() {
    let request = build_request('A', 5, "example.com", false);
    assert_eq!(&request[..], b"GET /AAAAA HTTP/1.1\r\nHost: example.com\r\n\r\n");

    let request = build_request('A', 2, "example.com", true);
    assert_eq!(
        &request[..],
        b"GET /AA HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n"
    );
}

#[test]
fn test_terminator_split_across_fragments() {
    let mut framer = ResponseFramer::new();
    framer.push(b"HTTP/1.1 200 OK\r\nServer: stub\r\n\r");
    assert!(framer.next_response().is_none());
    framer.push(b"\n");
    let response = framer.next_response().expect("terminator is complete");
    assert!(response.ends_with(b"\r\n\r\n"));
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_terminator_split_in_the_middle() {
    let mut framer = ResponseFramer::new();
    framer.push(b"HTTP/1.1 200 OK\r\n");
    assert!(framer.next_response().is_none());
    framer.push(b"\r");
    assert!(framer.next_response().is_none());
    framer.push(b"\n");
    assert!(framer.next_response().is_some());
}

#[test]
fn test_content_length_body_must_arrive() {
    let mut framer = ResponseFramer::new();
    framer.push(b"HTTP/1.1 200 OK\r\ncontent-length: 6\r\n\r\nAAA");
    assert!(framer.next_response().is_none());
    framer.push(b"AAA");
    let response = framer.next_response().unwrap();
    assert!(response.ends_with(b"\r\n\r\nAAAAAA"));
}

#[test]
fn test_leftover_bytes_stay_for_next_response() {
    let mut framer = ResponseFramer::new();
    framer.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nAAHTTP/1.1 200");
    assert!(framer.next_response().is_some());
    assert_eq!(framer.buffered(), b"HTTP/1.1 200".len());
    framer.push(b" OK\r\n\r\n");
    assert!(framer.next_response().is_some());
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_chunked_body_waits_for_last_chunk() {
    let mut framer = ResponseFramer::new();
    framer.push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nAAAA\r\n");
    assert!(framer.next_response().is_none());
    framer.push(b"0\r\n\r\n");
    assert!(framer.next_response().is_some());
    assert_eq!(framer.buffered(), 0);
}

#[test]
fn test_header_lookup_is_case_insensitive() {
    let head = b"HTTP/1.1 200 OK\r\nCONNECTION: Keep-Alive\r\nContent-Length:  12 \r\n\r\n";
    assert_eq!(header_value(head, "connection"), Some("Keep-Alive"));
    assert_eq!(header_value(head, "content-length"), Some("12"));
    assert_eq!(header_value(head, "server"), None);
}

#[test]
fn test_exchange_cycle_for_two_requests() {
    let mut exchange = Exchange::new(2);
    assert_eq!(exchange.state(), ExchangeState::Connecting);

    assert_eq!(
        exchange.handle(ExchangeEvent::Connected),
        Action::SendRequest { gated: false }
    );
    assert_eq!(exchange.handle(ExchangeEvent::RequestSent), Action::AwaitData);
    assert_eq!(exchange.state(), ExchangeState::AwaitingResponse);

    assert_eq!(
        exchange.handle(ExchangeEvent::DataReceived(RESPONSE)),
        Action::SendRequest { gated: true }
    );
    assert_eq!(exchange.completed(), 1);

    assert_eq!(exchange.handle(ExchangeEvent::RequestSent), Action::AwaitData);
    assert_eq!(
        exchange.handle(ExchangeEvent::DataReceived(RESPONSE)),
        Action::Close(CloseReason::Completed)
    );
    assert_eq!(exchange.completed(), 2);
    assert_eq!(exchange.state(), ExchangeState::Closing);
}

#[test]
fn test_fragmented_response_counts_once_complete() {
    let mut exchange = Exchange::new(3);
    exchange.handle(ExchangeEvent::Connected);
    exchange.handle(ExchangeEvent::RequestSent);

    let (first, second) = RESPONSE.split_at(RESPONSE.len() - 2);
    assert_eq!(
        exchange.handle(ExchangeEvent::DataReceived(first)),
        Action::AwaitData
    );
    assert_eq!(exchange.completed(), 0);
    assert_eq!(
        exchange.handle(ExchangeEvent::DataReceived(second)),
        Action::SendRequest { gated: true }
    );
    assert_eq!(exchange.completed(), 1);
}

#[test]
fn test_peer_close_reports_completed_count() {
    let mut exchange = Exchange::new(5);
    exchange.handle(ExchangeEvent::Connected);
    exchange.handle(ExchangeEvent::RequestSent);
    exchange.handle(ExchangeEvent::DataReceived(RESPONSE));
    exchange.handle(ExchangeEvent::RequestSent);

    assert_eq!(
        exchange.handle(ExchangeEvent::PeerClosed),
        Action::Close(CloseReason::PeerClosed { completed: 1 })
    );
    assert_eq!(exchange.state(), ExchangeState::Closed);
    // Late events do not reopen a finished exchange.
    assert_eq!(
        exchange.handle(ExchangeEvent::DataReceived(RESPONSE)),
        Action::Close(CloseReason::PeerClosed { completed: 1 })
    );
    assert_eq!(exchange.completed(), 1);
}

#[test]
fn test_stop_while_awaiting_response_cancels() {
    let mut exchange = Exchange::new(2);
    exchange.handle(ExchangeEvent::Connected);
    exchange.handle(ExchangeEvent::RequestSent);

    assert_eq!(
        exchange.handle(ExchangeEvent::StopRequested),
        Action::Close(CloseReason::Cancelled)
    );
    assert_eq!(exchange.state(), ExchangeState::Closing);
}

#[test]
fn test_completed_never_exceeds_expected() {
    let mut exchange = Exchange::new(1);
    exchange.handle(ExchangeEvent::Connected);
    exchange.handle(ExchangeEvent::RequestSent);

    let mut doubled = RESPONSE.to_vec();
    doubled.extend_from_slice(RESPONSE);
    assert_eq!(
        exchange.handle(ExchangeEvent::DataReceived(&doubled)),
        Action::Close(CloseReason::Completed)
    );
    assert_eq!(exchange.completed(), 1);
}
