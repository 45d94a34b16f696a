//! Connection tests against scripted and echo backends.

use std::time::{Duration, Instant};

use bytes::Bytes;
use hmux_common::transport::{HmuxServer, TcpTransport, WireCodec};
use hmux_common::{Frame, HmuxError, Opcode, RequestAttributes, Response, ResponseEvent};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::*;

// ============================================================================
// Test Helpers
// ============================================================================

/// Backend that waits for each request's quit and answers with `reply`.
async fn scripted_backend(reply: Vec<Frame>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut codec = WireCodec::new(stream);
                loop {
                    loop {
                        match codec.read_frame().await {
                            Ok(Some(frame)) if frame.opcode == Opcode::Quit => break,
                            Ok(Some(_)) => {}
                            _ => return,
                        }
                    }
                    if reply.is_empty() {
                        // Never answer; hold the socket open.
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    for frame in &reply {
                        codec.write_frame(frame).unwrap();
                    }
                    if codec.flush().await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    addr
}

/// Backend echoing method, uri and body back.
async fn echo_backend() -> String {
    let server = HmuxServer::new("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        server
            .run_with_handler(|request: RequestAttributes, body: Bytes| async move {
                Response::new("200 OK")
                    .with_header("X-Echo-Method", request.method)
                    .with_header("X-Echo-Uri", request.uri)
                    .with_body(body)
            })
            .await
    });
    addr
}

async fn open(addr: &str) -> Connection {
    Connection::open(&TcpTransport::default(), addr, 7, Duration::from_secs(5))
        .await
        .unwrap()
}

fn text(op: Opcode, value: &str) -> Frame {
    Frame::new(op, Bytes::copy_from_slice(value.as_bytes()))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_relay_collects_response() {
    let addr = echo_backend().await;
    let mut conn = open(&addr).await;

    let mut response = Response::default();
    conn.relay(&RequestAttributes::new("GET", "/hello"), None, &mut response)
        .await
        .unwrap();

    assert_eq!(response.status_code(), Some(200));
    assert_eq!(response.header("x-echo-method"), Some("GET"));
    assert_eq!(response.header("x-echo-uri"), Some("/hello"));
    assert!(response.body.is_empty());
    assert!(conn.is_reusable());
}

#[tokio::test]
async fn test_relay_streams_large_body() {
    let addr = echo_backend().await;
    let mut conn = open(&addr).await;

    let payload: Vec<u8> = (0..(BODY_CHUNK_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();
    let mut body: &[u8] = &payload;

    let mut response = Response::default();
    conn.relay(&RequestAttributes::new("POST", "/upload"), Some(&mut body), &mut response)
        .await
        .unwrap();

    assert_eq!(&response.body[..], &payload[..]);
}

/// Backend that acks every yield. The first yield is answered with the
/// response head ahead of the ack; with `finish_early` the response ends
/// there. Otherwise the quit is answered with a body describing what
/// arrived.
async fn acking_backend(finish_early: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut codec = WireCodec::new(stream);
        let mut received = 0;
        let mut yields = 0;
        while let Ok(Some(frame)) = codec.read_frame().await {
            match frame.opcode {
                Opcode::Data => received += frame.payload.len(),
                Opcode::Yield => {
                    yields += 1;
                    if yields == 1 {
                        codec.write_channel_open(2);
                        codec.write_attribute(Opcode::Status, b"200 OK").unwrap();
                        codec.write_opcode(Opcode::SendHeader);
                        if finish_early {
                            codec.write_opcode(Opcode::Quit);
                            codec.flush().await.unwrap();
                            continue;
                        }
                    }
                    codec.write_opcode(Opcode::Ack);
                    codec.flush().await.unwrap();
                }
                Opcode::Quit => {
                    let summary = format!("{} bytes {} yields", received, yields);
                    codec.write_attribute(Opcode::Data, summary.as_bytes()).unwrap();
                    codec.write_opcode(Opcode::Quit);
                    codec.flush().await.unwrap();
                }
                _ => {}
            }
        }
    });

    addr
}

#[tokio::test]
async fn test_body_yields_every_ack_size_bytes() {
    let addr = acking_backend(false).await;
    let mut conn = open(&addr).await.with_ack_size(10);
    assert_eq!(conn.ack_size(), 10);

    // Three reads of 12, 12 and 3 bytes: the first two each cross the ack size.
    let mut body = (&[1u8; 12][..]).chain(&[2u8; 12][..]).chain(&[3u8; 3][..]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sink = tx;
    conn.relay(&RequestAttributes::new("POST", "/upload"), Some(&mut body), &mut sink)
        .await
        .unwrap();
    drop(sink);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events[0], ResponseEvent::Status("200 OK".to_string()));
    assert_eq!(events[1], ResponseEvent::HeadersComplete);
    assert_eq!(events[2], ResponseEvent::Data(Bytes::from_static(b"27 bytes 2 yields")));
    assert!(conn.is_reusable());
}

#[tokio::test]
async fn test_response_ending_during_upload_drops_rest_of_body() {
    let addr = acking_backend(true).await;
    let mut conn = open(&addr).await.with_ack_size(10);

    let mut body = (&[1u8; 12][..]).chain(&[2u8; 12][..]);
    let mut response = Response::default();
    conn.relay(&RequestAttributes::new("POST", "/upload"), Some(&mut body), &mut response)
        .await
        .unwrap();

    assert_eq!(response.status, "200 OK");
    assert!(response.body.is_empty());
    assert!(!conn.is_reusable());
}

#[tokio::test]
async fn test_ack_size_of_zero_is_one() {
    let addr = echo_backend().await;
    let conn = open(&addr).await.with_ack_size(0);
    assert_eq!(conn.ack_size(), 1);
}

#[tokio::test]
async fn test_keepalive_connection_serves_several_requests() {
    let addr = echo_backend().await;
    let mut conn = open(&addr).await;

    for i in 0..3 {
        let mut response = Response::default();
        let uri = format!("/n/{}", i);
        conn.relay(&RequestAttributes::new("GET", uri.clone()), None, &mut response)
            .await
            .unwrap();
        assert_eq!(response.header("X-Echo-Uri"), Some(uri.as_str()));
    }
}

#[tokio::test]
async fn test_relay_streams_events_to_channel() {
    let addr = scripted_backend(vec![
        Frame::channel(2),
        text(Opcode::Status, "200 OK"),
        text(Opcode::Header, "Content-Type"),
        text(Opcode::String, "text/plain"),
        Frame::new(Opcode::SendHeader, Bytes::new()),
        text(Opcode::Data, "part one, "),
        Frame::new(Opcode::Flush, Bytes::new()),
        text(Opcode::Data, "part two"),
        Frame::bare(Opcode::Quit),
    ])
    .await;
    let mut conn = open(&addr).await;

    let (mut tx, mut rx) = mpsc::unbounded_channel();
    conn.relay(&RequestAttributes::new("GET", "/"), None, &mut tx)
        .await
        .unwrap();
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            ResponseEvent::Status("200 OK".to_string()),
            ResponseEvent::Header("Content-Type".to_string(), "text/plain".to_string()),
            ResponseEvent::HeadersComplete,
            ResponseEvent::Data(Bytes::from_static(b"part one, ")),
            ResponseEvent::Flush,
            ResponseEvent::Data(Bytes::from_static(b"part two")),
        ]
    );
}

#[tokio::test]
async fn test_meta_headers_are_not_forwarded() {
    let addr = scripted_backend(vec![
        Frame::channel(2),
        text(Opcode::Status, "200 OK"),
        text(Opcode::MetaHeader, "cache-control"),
        text(Opcode::String, "private"),
        Frame::bare(Opcode::Yield),
        Frame::bare(Opcode::Quit),
    ])
    .await;
    let mut conn = open(&addr).await;

    let mut response = Response::default();
    conn.relay(&RequestAttributes::new("GET", "/"), None, &mut response)
        .await
        .unwrap();

    assert!(response.headers.is_empty());
    assert!(conn.is_reusable());
}

#[tokio::test]
async fn test_exit_ends_keepalive() {
    let addr = scripted_backend(vec![
        Frame::channel(2),
        text(Opcode::Status, "200 OK"),
        Frame::bare(Opcode::Exit),
    ])
    .await;
    let mut conn = open(&addr).await;

    let mut response = Response::default();
    conn.relay(&RequestAttributes::new("GET", "/"), None, &mut response)
        .await
        .unwrap();

    assert_eq!(response.status, "200 OK");
    assert!(!conn.is_reusable());
}

#[tokio::test]
async fn test_backend_error_frame_is_protocol_error() {
    let addr = scripted_backend(vec![
        Frame::channel(2),
        text(Opcode::Error, "no such application"),
        Frame::bare(Opcode::Quit),
    ])
    .await;
    let mut conn = open(&addr).await;

    let mut response = Response::default();
    let result = conn.relay(&RequestAttributes::new("GET", "/"), None, &mut response).await;

    match result {
        Err(HmuxError::Protocol(msg)) => assert!(msg.contains("no such application")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!conn.is_reusable());
}

#[tokio::test]
async fn test_header_without_value_is_protocol_error() {
    let addr = scripted_backend(vec![
        Frame::channel(2),
        text(Opcode::Header, "X-Broken"),
        Frame::bare(Opcode::Quit),
    ])
    .await;
    let mut conn = open(&addr).await;

    let mut response = Response::default();
    let result = conn.relay(&RequestAttributes::new("GET", "/"), None, &mut response).await;
    assert!(matches!(result, Err(HmuxError::Protocol(_))));
}

#[tokio::test]
async fn test_backend_closing_mid_response_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut codec = WireCodec::new(stream);
        while let Ok(Some(frame)) = codec.read_frame().await {
            if frame.opcode == Opcode::Quit {
                break;
            }
        }
        codec.write_channel_open(2);
        codec.write_attribute(Opcode::Status, b"200 OK").unwrap();
        let _ = codec.flush().await;
    });
    let mut conn = open(&addr).await;

    let mut response = Response::default();
    let result = conn.relay(&RequestAttributes::new("GET", "/"), None, &mut response).await;

    let err = result.unwrap_err();
    assert!(err.is_backend_failure(), "got {:?}", err);
    assert!(!conn.is_reusable());
}

#[tokio::test]
async fn test_socket_timeout() {
    let addr = scripted_backend(Vec::new()).await;
    let mut conn = Connection::open(&TcpTransport::default(), &addr, 1, Duration::from_millis(100))
        .await
        .unwrap();

    let mut response = Response::default();
    let result = conn.relay(&RequestAttributes::new("GET", "/slow"), None, &mut response).await;
    assert!(matches!(result, Err(HmuxError::Timeout(100))));
}

#[tokio::test]
async fn test_oversized_attribute_breaks_connection() {
    let addr = echo_backend().await;
    let mut conn = open(&addr).await;

    let request = RequestAttributes::new("GET", "/").with_header("X-Huge", "v".repeat(70_000));
    let mut response = Response::default();
    let result = conn.relay(&request, None, &mut response).await;

    assert!(matches!(result, Err(HmuxError::Protocol(_))));
    assert!(!conn.is_reusable());
}

#[tokio::test]
async fn test_idle_stamps_and_expiry() {
    let addr = echo_backend().await;
    let mut conn = open(&addr).await;
    let timeout = Duration::from_secs(10);
    let now = Instant::now();

    assert_eq!(conn.idle_start(), None);
    assert!(!conn.is_expired(now + Duration::from_secs(60), timeout));

    conn.mark_idle(now);
    assert_eq!(conn.idle_start(), Some(now));
    assert!(!conn.is_expired(now + Duration::from_secs(9), timeout));
    assert!(conn.is_expired(now + Duration::from_secs(10), timeout));

    conn.clear_idle();
    assert_eq!(conn.idle_start(), None);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let addr = echo_backend().await;
    let mut conn = open(&addr).await;
    assert_eq!(conn.trace_id(), 7);
    assert_eq!(conn.address(), addr);

    conn.close().await;
    conn.close().await;
    assert!(conn.is_closed());
    assert!(!conn.is_reusable());

    let mut response = Response::default();
    let result = conn.relay(&RequestAttributes::new("GET", "/"), None, &mut response).await;
    assert!(matches!(result, Err(HmuxError::Transport(_))));
}

#[tokio::test]
async fn test_open_refused_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = Connection::open(&TcpTransport::default(), &addr, 1, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(HmuxError::Connect(_))));
}
