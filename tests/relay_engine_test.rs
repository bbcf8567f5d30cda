//! Tests for the relay engine

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{pkt, MemorySink};
use gitspy::error::RelayError;
use gitspy::protocol::Frame;
use gitspy::relay::{ByteSink, ChannelSink, RelayEngine};
use tokio::io::AsyncWriteExt;

fn engine() -> (RelayEngine, Arc<MemorySink>, Arc<MemorySink>) {
    let toward_client = Arc::new(MemorySink::new());
    let toward_upstream = Arc::new(MemorySink::new());
    let engine = RelayEngine::new(
        "test_session",
        Arc::clone(&toward_client) as Arc<dyn ByteSink>,
        Arc::clone(&toward_upstream) as Arc<dyn ByteSink>,
    );
    (engine, toward_client, toward_upstream)
}

/// Ref advertisement, flush, then the start of a packfile.
fn upload_pack_response() -> Vec<u8> {
    let mut wire = Vec::new();
    wire.extend(pkt(b"# service=git-upload-pack\n"));
    wire.extend(pkt(b"0123456789abcdef0123456789abcdef01234567 HEAD\n"));
    wire.extend_from_slice(b"0000");
    wire.extend_from_slice(b"PACK\x00\x00\x00\x02zz");
    wire
}

async fn wait_until_closed(sink: &MemorySink) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !sink.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sink was not closed in time");
}

#[tokio::test]
async fn test_framed_then_raw_end_to_end() {
    let (mut engine, toward_client, _) = engine();
    let stats = engine.stats();
    let mut server = engine.server_pipe();

    let input = upload_pack_response();
    server.write_all(&input).await.unwrap();
    server.shutdown().await.unwrap();

    let summary = engine.finish().await.unwrap();
    assert_eq!(stats.frames(), 2);
    assert_eq!(stats.flushes(), 1);

    assert_eq!(toward_client.contents(), input);
    assert_eq!(summary.frames, 2);
    assert_eq!(summary.flushes, 1);
    assert_eq!(summary.bytes_down, input.len() as u64);
    assert!(toward_client.is_closed());
}

#[tokio::test]
async fn test_framed_output_precedes_raw_bytes() {
    let (mut engine, toward_client, _) = engine();
    let mut server = engine.server_pipe();

    // One write containing everything, so framed and raw bytes arrive together.
    let input = upload_pack_response();
    server.write_all(&input).await.unwrap();
    drop(server);

    engine.finish().await.unwrap();

    let output = toward_client.contents();
    let flush_end = output
        .windows(4)
        .position(|w| w == b"0000")
        .map(|p| p + 4)
        .unwrap();
    assert_eq!(&output[flush_end..], b"PACK\x00\x00\x00\x02zz");
}

#[tokio::test]
async fn test_inspector_sees_only_framed_phase() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        move |frame: Frame| {
            seen.lock().unwrap().push(frame.text());
            Frame::new(frame.payload().to_ascii_uppercase())
        }
    };

    let (engine, toward_client, _) = engine();
    let mut engine = engine.with_inspector(Arc::new(recorder));
    let mut server = engine.server_pipe();

    let mut input = pkt(b"ack abc\n");
    input.extend_from_slice(b"0000");
    input.extend_from_slice(b"pack bytes");
    server.write_all(&input).await.unwrap();
    server.shutdown().await.unwrap();

    engine.finish().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["ack abc".to_string()]);

    let mut expected = pkt(b"ACK ABC\n");
    expected.extend_from_slice(b"0000");
    expected.extend_from_slice(b"pack bytes");
    assert_eq!(toward_client.contents(), expected);
}

#[tokio::test]
async fn test_client_pipe_chunk_size_independence() {
    let input: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();

    for chunk in [1usize, 7, 4096, input.len()] {
        let (mut engine, _, toward_upstream) = engine();
        let mut client = engine.client_pipe();

        for part in input.chunks(chunk) {
            client.write_all(part).await.unwrap();
        }
        client.shutdown().await.unwrap();

        wait_until_closed(&toward_upstream).await;
        let summary = engine.finish().await.unwrap();

        assert_eq!(toward_upstream.contents(), input, "chunk size {}", chunk);
        assert_eq!(summary.bytes_up, input.len() as u64);
    }
}

#[tokio::test]
async fn test_client_eof_closes_only_upstream() {
    let (mut engine, toward_client, toward_upstream) = engine();
    let mut client = engine.client_pipe();
    let mut server = engine.server_pipe();

    client.write_all(&pkt(b"want 0123\n")).await.unwrap();
    client.shutdown().await.unwrap();
    wait_until_closed(&toward_upstream).await;

    assert!(!toward_client.is_closed());

    // The upstream can still answer after the client finished sending.
    server.write_all(&pkt(b"NAK\n")).await.unwrap();
    server.shutdown().await.unwrap();
    engine.finish().await.unwrap();

    assert_eq!(toward_client.contents(), pkt(b"NAK\n"));
}

#[tokio::test]
async fn test_cascade_close() {
    let (engine, toward_client, toward_upstream) = engine();

    engine.close().await;
    engine.close().await;

    assert!(matches!(
        toward_client.write_all(b"x").await,
        Err(RelayError::SinkClosed)
    ));
    assert!(matches!(
        toward_upstream.write_all(b"x").await,
        Err(RelayError::SinkClosed)
    ));
}

#[tokio::test]
async fn test_close_stops_idle_pipes() {
    let (mut engine, _, _) = engine();
    let _client = engine.client_pipe();
    let _server = engine.server_pipe();

    engine.close().await;

    // Neither pipe was shut down by its producer; close alone must end the tasks.
    let result = tokio::time::timeout(Duration::from_secs(5), engine.finish()).await;
    assert!(result.expect("relay did not stop after close").is_ok());
}

#[tokio::test]
async fn test_decode_error_closes_client_side() {
    let (mut engine, toward_client, _) = engine();
    let mut server = engine.server_pipe();

    let mut input = pkt(b"version 2\n");
    input.extend_from_slice(b"00zz");
    // The relay task may already have dropped its end.
    let _ = server.write_all(&input).await;
    let _ = server.shutdown().await;

    match engine.finish().await {
        Err(RelayError::DecodeFailed(_)) => {}
        other => panic!("expected DecodeFailed, got {:?}", other),
    }

    assert!(toward_client.is_closed());
    assert_eq!(toward_client.contents(), pkt(b"version 2\n"));
}

#[tokio::test]
async fn test_short_frame_from_upstream_is_decode_error() {
    let (mut engine, _, _) = engine();
    let mut server = engine.server_pipe();

    server.write_all(b"0010only-six").await.unwrap();
    server.shutdown().await.unwrap();

    assert!(matches!(
        engine.finish().await,
        Err(RelayError::DecodeFailed(_))
    ));
}

#[tokio::test]
async fn test_relay_into_channel_sink() {
    let (to_upstream, mut upstream_rx) = ChannelSink::bounded(4);
    let toward_client = Arc::new(MemorySink::new());
    let mut engine = RelayEngine::new(
        "channel_sink",
        Arc::clone(&toward_client) as Arc<dyn ByteSink>,
        Arc::new(to_upstream),
    );

    let mut client = engine.client_pipe();
    client.write_all(b"0009done\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    while let Some(chunk) = upstream_rx.recv().await {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(Bytes::from(received), Bytes::from_static(b"0009done\n"));

    let _server = engine.server_pipe();
    engine.close().await;
    engine.finish().await.unwrap();
}
