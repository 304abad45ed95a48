//! End-to-end tests for the SSE variant: id assignment, keep-alive pings,
//! and the reconnect-and-resume consumer.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::json;
use sluice::{
    sse_produce, sse_resume, ConsumeError, SseConsumer, SseConsumerConfig, SseEvent,
    SseProducerConfig,
};

async fn collect_text(stream: sluice::SseProducerStream) -> String {
    let frames: Vec<_> = stream.collect().await;
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&frame);
    }
    String::from_utf8(out).unwrap()
}

fn frame_ids(text: &str) -> Vec<u64> {
    text.lines()
        .filter_map(|line| line.strip_prefix("id: "))
        .map(|id| id.parse().unwrap())
        .collect()
}

#[tokio::test]
async fn test_producer_assigns_strictly_increasing_ids() {
    let events = futures::stream::iter([
        Ok(SseEvent::data(json!(1))),
        Ok(SseEvent::data(json!(2))),
        Ok(SseEvent::data(json!(3))),
    ]);
    let text = collect_text(sse_produce(events, SseProducerConfig::default())).await;
    assert_eq!(frame_ids(&text), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_producer_drops_non_increasing_ids() {
    let events = futures::stream::iter([
        Ok(SseEvent::data(json!("a")).with_id(5)),
        // Regressing id: the whole event is dropped.
        Ok(SseEvent::data(json!("b")).with_id(3)),
        // No id: continues from the last accepted one.
        Ok(SseEvent::data(json!("c"))),
    ]);
    let text = collect_text(sse_produce(events, SseProducerConfig::default())).await;
    assert_eq!(frame_ids(&text), vec![5, 6]);
    assert!(!text.contains(r#""b""#));
}

#[tokio::test(start_paused = true)]
async fn test_idle_producer_emits_pings() {
    let mut stream = sse_produce(
        futures::stream::pending::<Result<SseEvent, anyhow::Error>>(),
        SseProducerConfig::default(),
    );
    let frame = stream.next().await.unwrap();
    assert_eq!(&frame[..], b"event: ping\ndata: \n\n".as_slice());
    // Pings repeat while the source stays idle.
    let frame = stream.next().await.unwrap();
    assert_eq!(&frame[..], b"event: ping\ndata: \n\n".as_slice());
}

#[tokio::test]
async fn test_resume_hands_cursor_to_the_source() {
    let text = collect_text(sse_resume(
        |last| {
            assert_eq!(last, Some(41));
            let next = last.map_or(0, |id| id + 1);
            futures::stream::iter(vec![Ok(SseEvent::data(json!("resumed")).with_id(next))])
        },
        Some(41),
        SseProducerConfig::default(),
    ))
    .await;
    assert_eq!(frame_ids(&text), vec![42]);
}

#[tokio::test]
async fn test_consumer_reconnects_with_last_event_id() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let connect = {
        let seen = Arc::clone(&seen);
        let mut segments = VecDeque::from(vec![
            b"data: 1\nid: 1\n\n".to_vec(),
            // Trailing ping: filtered, but its frame still parses.
            b"data: 2\nid: 2\n\ndata: 3\nid: 3\n\nevent: ping\ndata: \n\n".to_vec(),
        ]);
        move |last: Option<u64>| {
            seen.lock().unwrap().push(last);
            futures::future::ready(match segments.pop_front() {
                Some(bytes) => Ok(Cursor::new(bytes)),
                None => Err(std::io::Error::new(std::io::ErrorKind::Other, "source gone")),
            })
        }
    };

    let mut consumer = SseConsumer::new(connect, SseConsumerConfig::default());
    let mut got = Vec::new();
    loop {
        match consumer.next().await {
            Some(Ok(event)) => got.push((event.id, event.data)),
            Some(Err(error)) => {
                assert!(matches!(error, ConsumeError::Io(_)));
                break;
            }
            None => panic!("reconnecting consumer must surface the connector error"),
        }
    }

    assert_eq!(
        got,
        vec![
            (Some(1), Some(json!(1))),
            (Some(2), Some(json!(2))),
            (Some(3), Some(json!(3))),
        ]
    );
    assert_eq!(seen.lock().unwrap().as_slice(), &[None, Some(1), Some(3)]);
    assert_eq!(consumer.last_event_id(), Some(3));
}

#[tokio::test]
async fn test_consumer_without_reconnect_ends_at_eof() {
    let connect = |_| futures::future::ready(Ok(Cursor::new(b"data: true\nid: 0\n\n".to_vec())));
    let config = SseConsumerConfig {
        reconnect: false,
        ..Default::default()
    };
    let mut consumer = SseConsumer::new(connect, config);

    let event = consumer.next().await.unwrap().unwrap();
    assert_eq!(event.data, Some(json!(true)));
    assert!(consumer.next().await.is_none());
}

#[tokio::test]
async fn test_producer_to_consumer_roundtrip() {
    let events = futures::stream::iter([
        Ok(SseEvent::data(json!({"n": 1}))),
        Ok(SseEvent::data(json!({"n": 2}))),
    ]);
    let stream = sse_produce(events, SseProducerConfig::default());

    let (client, mut server) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let _ = stream.write_to(&mut server).await;
    });

    let mut transport = Some(client);
    let connect = move |_| {
        let next = transport.take();
        futures::future::ready(match next {
            Some(client) => Ok(client),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "single-shot transport",
            )),
        })
    };
    let config = SseConsumerConfig {
        reconnect: false,
        ..Default::default()
    };
    let mut consumer = SseConsumer::new(connect, config);

    let first = consumer.next().await.unwrap().unwrap();
    assert_eq!(first.id, Some(0));
    assert_eq!(first.data, Some(json!({"n": 1})));
    let second = consumer.next().await.unwrap().unwrap();
    assert_eq!(second.id, Some(1));
    assert_eq!(second.data, Some(json!({"n": 2})));
    assert!(consumer.next().await.is_none());
}
