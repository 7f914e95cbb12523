mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use ptymux::protocol::{Frame, FrameKind};
use ptymux::term::TermRunner;
use ptymux::transport;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

fn handshake_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected http handshake rejection, got: {other}"),
    }
}

/// Reads binary messages until `count` have arrived.
async fn collect_binary(ws: &mut WsClient, count: usize) -> Vec<Vec<u8>> {
    let mut collected = Vec::with_capacity(count);
    timeout(Duration::from_secs(10), async {
        while collected.len() < count {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => collected.push(data.to_vec()),
                Some(Ok(_)) => {}
                Some(Err(err)) => panic!("websocket error: {err}"),
                None => panic!("stream ended after {} messages", collected.len()),
            }
        }
    })
    .await
    .expect("timed out collecting messages");
    collected
}

#[tokio::test]
async fn rejects_wrong_token() {
    let (port, bus) = start_server().await;
    let url = format!("ws://127.0.0.1:{port}/ws/process?token=wrong&processId=p1");
    let err = connect_async(url.as_str())
        .await
        .expect_err("handshake should be rejected");
    assert_eq!(handshake_status(err), 401);
    assert!(bus.session("p1").is_none());
}

#[tokio::test]
async fn rejects_missing_or_unknown_parameters() {
    let (port, _bus) = start_server().await;

    let missing_token = format!("ws://127.0.0.1:{port}/ws/process?processId=p1");
    let err = connect_async(missing_token.as_str()).await.expect_err("no token");
    assert_eq!(handshake_status(err), 400);

    let missing_process = format!("ws://127.0.0.1:{port}/ws/process?token={TOKEN}");
    let err = connect_async(missing_process.as_str())
        .await
        .expect_err("no process id");
    assert_eq!(handshake_status(err), 400);

    let unknown_type = format!("ws://127.0.0.1:{port}/ws/observer?token={TOKEN}&processId=p1");
    let err = connect_async(unknown_type.as_str())
        .await
        .expect_err("unknown connection type");
    assert_eq!(handshake_status(err), 400);
}

#[tokio::test]
async fn rejects_subscriber_for_unknown_process() {
    let (port, _bus) = start_server().await;
    let err = connect_async(client_url(port, "nobody").as_str())
        .await
        .expect_err("no session registered");
    assert_eq!(handshake_status(err), 404);
}

#[tokio::test]
async fn rejects_second_producer_for_same_id() {
    let (port, _bus) = start_server().await;
    let _producer = connect(&process_url(port, "dup")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = connect_async(process_url(port, "dup").as_str())
        .await
        .expect_err("id already claimed");
    assert_eq!(handshake_status(err), 409);
}

#[tokio::test]
async fn fans_out_in_producer_order_after_warmup() {
    let (port, _bus) = start_server().await;
    let mut producer = connect(&process_url(port, "fan")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub_a = connect(&client_url(port, "fan")).await;
    let mut sub_b = connect(&client_url(port, "fan")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let payloads: Vec<Vec<u8>> = (0..20)
        .map(|i| Frame::data(format!("chunk-{i}").into_bytes()).encode())
        .collect();
    for payload in &payloads {
        producer
            .send(Message::binary(payload.clone()))
            .await
            .unwrap();
    }

    // Both subscribers see the zero-length warm-up frame first, then every
    // payload in producer order.
    for sub in [&mut sub_a, &mut sub_b] {
        let received = collect_binary(sub, payloads.len() + 1).await;
        assert!(received[0].is_empty(), "first frame should be the warm-up");
        assert_eq!(&received[1..], &payloads[..]);
    }
}

#[tokio::test]
async fn subscriber_input_reaches_producer() {
    let (port, _bus) = start_server().await;
    let mut producer = connect(&process_url(port, "input")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = connect(&client_url(port, "input")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    sub.send(Message::binary(Frame::ready().encode()))
        .await
        .unwrap();
    // Text frames are coerced to DATA for controllers that cannot emit
    // binary.
    sub.send(Message::text("typed")).await.unwrap();

    let received = collect_binary(&mut producer, 2).await;
    assert_eq!(Frame::decode(&received[0]).unwrap(), Frame::ready());
    assert_eq!(
        Frame::decode(&received[1]).unwrap(),
        Frame::data(b"typed".to_vec())
    );
}

#[tokio::test]
async fn producer_disconnect_cancels_subscribers_and_frees_id() {
    let (port, bus) = start_server().await;
    let mut producer = connect(&process_url(port, "gone")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = connect(&client_url(port, "gone")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    producer.close(None).await.unwrap();

    // The subscriber's attachment terminates within a bounded time.
    timeout(Duration::from_secs(5), async {
        loop {
            match sub.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    })
    .await
    .expect("subscriber should be disconnected");

    // The id becomes reusable once the registry entry is gone.
    timeout(Duration::from_secs(5), async {
        loop {
            if bus.session("gone").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry entry should be removed");

    let _second = connect(&process_url(port, "gone")).await;
}

#[tokio::test]
async fn short_lived_command_delivers_buffered_output() {
    let (port, _bus) = start_server().await;

    let (socket, _) = connect_async(process_url(port, "short").as_str())
        .await
        .unwrap();
    let (sink, source) = transport::split_client(socket);
    let runner = TermRunner::new(24, 80, &args(&["sh", "-c", "printf hello"])).unwrap();
    let run = tokio::spawn(runner.run(sink, source));

    // The child exits long before any controller attaches; nothing may be
    // delivered yet.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut sub = connect(&client_url(port, "short")).await;
    sub.send(Message::binary(Frame::ready().encode()))
        .await
        .unwrap();

    let mut output = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            match sub.next().await {
                Some(Ok(Message::Binary(data))) if data.is_empty() => {} // warm-up
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::decode(&data).unwrap();
                    assert_eq!(frame.kind(), FrameKind::Data);
                    output.extend_from_slice(frame.as_data().unwrap());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    })
    .await
    .expect("timed out waiting for buffered output");

    assert_eq!(output, b"hello");
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn two_subscribers_observe_live_session_identically() {
    let (port, _bus) = start_server().await;

    let (socket, _) = connect_async(process_url(port, "cat").as_str())
        .await
        .unwrap();
    let (sink, source) = transport::split_client(socket);
    let runner = TermRunner::new(24, 80, &args(&["cat"])).unwrap();
    let run = tokio::spawn(runner.run(sink, source));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub_a = connect(&client_url(port, "cat")).await;
    sub_a
        .send(Message::binary(Frame::ready().encode()))
        .await
        .unwrap();
    sub_a
        .send(Message::binary(Frame::data(b"a\n".to_vec()).encode()))
        .await
        .unwrap();
    wait_for_output(&mut sub_a, b"a").await;

    let mut sub_b = connect(&client_url(port, "cat")).await;
    sub_b
        .send(Message::binary(Frame::ready().encode()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Bytes produced after B attached arrive at both, in the same order.
    sub_a
        .send(Message::binary(Frame::data(b"b\n".to_vec()).encode()))
        .await
        .unwrap();
    wait_for_output(&mut sub_a, b"b").await;
    wait_for_output(&mut sub_b, b"b").await;

    run.abort();
}

/// Drains subscriber frames until the decoded DATA payloads contain `needle`.
async fn wait_for_output(ws: &mut WsClient, needle: &[u8]) {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) if data.is_empty() => {}
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(frame) = Frame::decode(&data) {
                        if frame.kind() == FrameKind::Data {
                            seen.extend_from_slice(frame.as_data().unwrap());
                            if seen
                                .windows(needle.len())
                                .any(|window| window == needle)
                            {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => panic!("websocket error: {err}"),
                None => panic!("stream ended while waiting for output"),
            }
        }
    })
    .await
    .expect("timed out waiting for echoed output");
}
