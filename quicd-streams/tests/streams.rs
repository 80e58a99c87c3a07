//! Integration tests for stream lifecycles across a client and a server.
//!
//! These tests drive two directories back to back through the public API:
//! opening streams, exchanging data, resets, stream limits and teardown.

mod common;

use bytes::Bytes;
use common::{endpoint, params, produce, stream_frames, Pair};
use parking_lot::Mutex;
use quicd_streams::frames::{Frame, ResetStreamFrame, StreamFrame, StreamsBlockedFrame};
use quicd_streams::{
    Error, QuicStream, ReceivingState, SendingState, StreamDirection, StreamId,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_request_response_round_trip() {
    let pair = Pair::new(params(2, 10_000), params(2, 10_000));

    let stream = pair
        .client
        .try_create_stream(StreamDirection::Bidirectional)
        .unwrap()
        .unwrap();
    assert_eq!(stream.id(), StreamId(0));
    let request = stream.writer();
    request
        .write_all(Bytes::from_static(b"GET /index.html"), true)
        .await
        .unwrap();
    pair.client_to_server(1200).unwrap();

    let incoming = pair.server.find_stream(StreamId(0)).unwrap();
    let body = incoming.reader().read_to_end().await.unwrap();
    assert_eq!(&body[..], b"GET /index.html");
    incoming
        .writer()
        .write_all(Bytes::from_static(b"hello"), true)
        .await
        .unwrap();
    pair.settle(1200).unwrap();

    let response = stream.reader().read_to_end().await.unwrap();
    assert_eq!(&response[..], b"hello");
    assert_eq!(stream.sending_state(), Some(SendingState::DataRecvd));
    assert_eq!(stream.receiving_state(), Some(ReceivingState::DataRead));

    // Both ends reclaim the stream and the server hands the slot back
    pair.settle(1200).unwrap();
    assert_eq!(pair.client.stream_count(), 0);
    assert_eq!(pair.server.stream_count(), 0);
    assert_eq!(pair.client.max_local_streams(StreamDirection::Bidirectional), 3);
    assert_eq!(pair.server_conn.received(), 15);
    assert_eq!(pair.client_conn.processed(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_create_stream_times_out_at_limit() {
    let pair = Pair::new(params(10, 1000), params(2, 1000));
    for _ in 0..2 {
        pair.client
            .try_create_stream(StreamDirection::Bidirectional)
            .unwrap()
            .unwrap();
    }

    let timeout = Duration::from_millis(50);
    let err = pair
        .client
        .create_stream(StreamDirection::Bidirectional, timeout)
        .await
        .unwrap_err();
    assert_eq!(err, Error::StreamLimit { timeout });
    assert_eq!(pair.client.stream_count(), 2);

    // The client reports being blocked; nothing was freed, so the server
    // has no room to grant
    let frames = pair.client_to_server(1200).unwrap();
    assert!(frames.contains(&Frame::StreamsBlocked(StreamsBlockedFrame {
        stream_limit: 2,
        bidirectional: true,
    })));
    assert_eq!(
        pair.server.next_max_streams_limit(StreamDirection::Bidirectional),
        None
    );
}

#[tokio::test]
async fn test_waiting_creator_gets_freed_slot() {
    let pair = Pair::new(params(10, 1000), params(1, 1000));
    let first = pair
        .client
        .try_create_stream(StreamDirection::Bidirectional)
        .unwrap()
        .unwrap();
    first
        .writer()
        .schedule_write(Bytes::from_static(b"a"), true)
        .unwrap();

    let waiter = {
        let client = pair.client.clone();
        tokio::spawn(async move {
            client
                .create_stream(StreamDirection::Bidirectional, Duration::from_secs(5))
                .await
        })
    };
    while !pair.client.has_blocked_streams() {
        tokio::task::yield_now().await;
    }

    pair.client_to_server(1200).unwrap();
    let incoming = pair.server.find_stream(StreamId(0)).unwrap();
    assert_eq!(&incoming.reader().read_to_end().await.unwrap()[..], b"a");
    incoming.writer().finish().unwrap();
    pair.settle(1200).unwrap();

    let second = waiter.await.unwrap().unwrap();
    assert_eq!(second.id(), StreamId(4));
    assert_eq!(pair.client.max_local_streams(StreamDirection::Bidirectional), 2);
}

#[tokio::test]
async fn test_out_of_order_frames_read_in_order() {
    let (_conn, server) = endpoint(false, params(10, 1000), params(10, 1000));
    server
        .process_stream_frame(&StreamFrame::new(
            StreamId(0),
            10,
            Bytes::from_static(b"klmno"),
            true,
        ))
        .unwrap();

    let stream = server.find_stream(StreamId(0)).unwrap();
    let reader = stream.reader();
    assert_eq!(reader.poll().unwrap(), None);
    assert_eq!(stream.receiving_state(), Some(ReceivingState::SizeKnown));

    server
        .process_stream_frame(&StreamFrame::new(
            StreamId(0),
            0,
            Bytes::from_static(b"abcdefghij"),
            false,
        ))
        .unwrap();
    assert_eq!(stream.receiving_state(), Some(ReceivingState::DataRecvd));
    let data = reader.read_to_end().await.unwrap();
    assert_eq!(&data[..], b"abcdefghijklmno");
    assert_eq!(reader.state(), ReceivingState::DataRead);
}

#[test]
fn test_local_reset_discards_buffered_data() {
    let (_conn, client) = endpoint(true, params(10, 1000), params(10, 100));
    let stream = client
        .try_create_stream(StreamDirection::Unidirectional)
        .unwrap()
        .unwrap();
    let writer = stream.writer();
    writer
        .schedule_write(Bytes::from(vec![7u8; 1000]), false)
        .unwrap();
    assert_eq!(stream_frames(&produce(&client, 1200)), vec![(2, 100)]);

    writer.reset(7);
    assert_eq!(writer.state(), SendingState::ResetSent);
    let frames = produce(&client, 1200);
    assert_eq!(
        frames,
        vec![Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId(2),
            error_code: 7,
            final_size: 100,
        })]
    );
    assert!(!client.has_available_data());

    let err = writer
        .schedule_write(Bytes::from_static(b"more"), false)
        .unwrap_err();
    assert_eq!(
        err,
        Error::StreamReset {
            stream_id: StreamId(2),
            error_code: 7
        }
    );

    client.on_reset_stream_acked(&ResetStreamFrame {
        stream_id: StreamId(2),
        error_code: 7,
        final_size: 100,
    });
    assert_eq!(writer.state(), SendingState::ResetRecvd);
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn test_stop_sending_resets_peer_writer() {
    let pair = Pair::new(params(10, 1000), params(10, 1000));
    let stream = pair
        .client
        .try_create_stream(StreamDirection::Bidirectional)
        .unwrap()
        .unwrap();
    let writer = stream.writer();
    writer
        .schedule_write(Bytes::from_static(b"0123456789"), false)
        .unwrap();
    pair.client_to_server(1200).unwrap();

    let incoming = pair.server.find_stream(StreamId(0)).unwrap();
    let reader = incoming.reader();
    reader.stop_sending(9);
    pair.settle(1200).unwrap();

    let err = writer
        .schedule_write(Bytes::from_static(b"late"), false)
        .unwrap_err();
    assert_eq!(
        err,
        Error::StopSending {
            stream_id: StreamId(0),
            error_code: 9
        }
    );
    assert!(matches!(
        incoming.receiving_state(),
        Some(ReceivingState::ResetRecvd | ReceivingState::ResetRead)
    ));
}

#[tokio::test]
async fn test_listener_accepts_incoming_streams() {
    let pair = Pair::new(params(10, 1000), params(10, 1000));
    let accepted = Arc::new(Mutex::new(Vec::new()));
    {
        let accepted = accepted.clone();
        pair.server.add_listener(move |stream: &QuicStream| {
            accepted.lock().push(stream.clone());
            true
        });
    }

    let mut writers = Vec::new();
    for _ in 0..3 {
        let stream = pair
            .client
            .try_create_stream(StreamDirection::Unidirectional)
            .unwrap()
            .unwrap();
        let writer = stream.writer();
        writer
            .schedule_write(Bytes::from_static(b"push"), true)
            .unwrap();
        writers.push(writer);
    }
    pair.settle(1200).unwrap();

    let ids: Vec<StreamId> = accepted.lock().iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![StreamId(2), StreamId(6), StreamId(10)]);
    assert_eq!(pair.server.unclaimed_streams(), 0);

    let streams = accepted.lock().clone();
    for stream in streams {
        assert_eq!(&stream.reader().read_to_end().await.unwrap()[..], b"push");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_writer_and_reader() {
    let pair = Arc::new(Pair::new(params(10, 16 * 1024), params(10, 16 * 1024)));
    let payload: Bytes = (0..256 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();

    let stream = pair
        .client
        .try_create_stream(StreamDirection::Unidirectional)
        .unwrap()
        .unwrap();
    let writer = stream.writer();
    let writing = {
        let payload = payload.clone();
        tokio::spawn(async move { writer.write_all(payload, true).await })
    };

    let pump = {
        let pair = pair.clone();
        tokio::spawn(async move {
            loop {
                pair.settle(1200)?;
                if pair.client.stream_count() == 0 && pair.server.stream_count() == 0 {
                    return Ok::<_, Error>(());
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let incoming = loop {
        if let Some(stream) = pair.server.find_stream(StreamId(2)) {
            break stream;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    let received = tokio::time::timeout(Duration::from_secs(10), incoming.reader().read_to_end())
        .await
        .expect("reader timed out")
        .unwrap();
    assert_eq!(received, payload);

    writing.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(10), pump)
        .await
        .expect("pump never settled")
        .unwrap()
        .unwrap();
    assert_eq!(pair.server_conn.processed(), payload.len() as u64);
}

#[tokio::test]
async fn test_terminate_fails_pending_operations() {
    let (_conn, client) = endpoint(true, params(10, 1000), params(1, 1000));
    let stream = client
        .try_create_stream(StreamDirection::Bidirectional)
        .unwrap()
        .unwrap();

    let creating = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .create_stream(StreamDirection::Bidirectional, Duration::from_secs(10))
                .await
        })
    };
    let reading = {
        let reader = stream.reader();
        tokio::spawn(async move { reader.read().await })
    };
    while !client.has_blocked_streams() {
        tokio::task::yield_now().await;
    }

    client.terminate("idle timeout");
    assert!(client.is_terminated());
    assert_eq!(
        creating.await.unwrap().unwrap_err(),
        Error::connection_closed("idle timeout")
    );
    assert!(matches!(
        reading.await.unwrap(),
        Err(Error::ConnectionClosed { .. })
    ));
    assert_eq!(client.stream_count(), 0);
    assert!(client
        .try_create_stream(StreamDirection::Unidirectional)
        .is_err());
}
