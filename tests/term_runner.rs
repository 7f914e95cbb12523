mod common;

use std::time::Duration;

use common::{args, ChannelSink, ChannelSource};
use ptymux::protocol::Frame;
use ptymux::term::TermRunner;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn buffers_short_lived_output_until_ready() {
    let (out_tx, mut out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);

    let runner = TermRunner::new(24, 80, &args(&["sh", "-c", "printf hello"])).unwrap();
    let run = tokio::spawn(runner.run(ChannelSink(out_tx), ChannelSource(in_rx)));

    // Child exits immediately, but nothing leaves the runner pre-READY.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(out_rx.try_recv().is_err());

    in_tx.send(Frame::ready().encode()).await.unwrap();

    let flushed = timeout(Duration::from_secs(5), out_rx.recv())
        .await
        .expect("flush timed out")
        .expect("sink closed early");
    assert_eq!(flushed, b"hello");

    timeout(Duration::from_secs(5), run)
        .await
        .expect("runner should finish")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn on_ready_hook_fires_and_backlog_flushes() {
    let (out_tx, mut out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let (hook_tx, hook_rx) = tokio::sync::oneshot::channel::<()>();
    let hook_tx = parking_lot::Mutex::new(Some(hook_tx));

    let runner = TermRunner::new(24, 80, &args(&["sh", "-c", "printf x"]))
        .unwrap()
        .with_on_ready(move || {
            if let Some(tx) = hook_tx.lock().take() {
                let _ = tx.send(());
            }
        });
    let run = tokio::spawn(runner.run(ChannelSink(out_tx), ChannelSource(in_rx)));

    in_tx.send(Frame::ready().encode()).await.unwrap();
    timeout(Duration::from_secs(5), hook_rx)
        .await
        .expect("hook timed out")
        .unwrap();

    let flushed = timeout(Duration::from_secs(5), out_rx.recv())
        .await
        .expect("flush timed out")
        .expect("sink closed early");
    assert_eq!(flushed, b"x");

    timeout(Duration::from_secs(5), run)
        .await
        .expect("runner should finish")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn interactive_input_round_trips_after_ready() {
    let (out_tx, mut out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);

    let runner = TermRunner::new(24, 80, &args(&["cat"])).unwrap();
    let run = tokio::spawn(runner.run(ChannelSink(out_tx), ChannelSource(in_rx)));

    in_tx.send(Frame::ready().encode()).await.unwrap();
    in_tx
        .send(Frame::data(b"ping\n".to_vec()).encode())
        .await
        .unwrap();

    // Echo plus cat's copy arrive through the PTY.
    timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            let chunk = out_rx.recv().await.expect("sink closed early");
            seen.extend_from_slice(&chunk);
            if seen.windows(4).any(|window| window == b"ping") {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for echo");

    // Ctrl-D at line start makes cat exit, which closes the PTY.
    in_tx.send(Frame::data(vec![0x04]).encode()).await.unwrap();

    timeout(Duration::from_secs(5), run)
        .await
        .expect("runner should finish")
        .unwrap()
        .unwrap();
}
