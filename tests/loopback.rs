use std::time::Duration;

use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use vidlink::{
    codec::{MediaCodec, RawFrame},
    io::TestPattern,
    relay::{self, RelayMode},
    Pipeline, StreamConfig, TransportError, TransportStatus,
};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;

async fn start_relay(mode: RelayMode) -> anyhow::Result<(String, CancellationToken)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}{}", listener.local_addr()?, relay::VIDEO_PATH);
    let cancel = CancellationToken::new();
    tokio::spawn(relay::serve(listener, mode, cancel.clone()));
    Ok((url, cancel))
}

fn config(endpoint: String) -> StreamConfig {
    StreamConfig {
        endpoint,
        reconnect_delay_secs: 0.2,
        max_retries: 3,
        fps: 30,
        poll_interval_ms: 50,
        grace_period_ms: 500,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_through_echo_relay() -> anyhow::Result<()> {
    vidlink::codec::init()?;
    let (url, relay_cancel) = start_relay(RelayMode::Echo).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = move |frame: RawFrame, sequence: u64| {
        let _ = tx.send((sequence, frame.width(), frame.height()));
    };
    let pipeline = Pipeline::new(config(url), TestPattern::new(WIDTH, HEIGHT, 30), sink);
    assert!(pipeline.start());

    let mut received = Vec::new();
    while received.len() < 20 {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(item)) => received.push(item),
            _ => break,
        }
    }
    assert_eq!(pipeline.status(), TransportStatus::Connected);
    pipeline.stop().await;

    assert_eq!(received.len(), 20, "only {} frames came back", received.len());
    assert!(received
        .iter()
        .all(|&(_, width, height)| (width, height) == (WIDTH, HEIGHT)));
    assert!(
        received.windows(2).all(|w| w[0].0 <= w[1].0),
        "sequence went backwards: {:?}",
        received.iter().map(|r| r.0).collect::<Vec<_>>()
    );

    let codec = pipeline.codec().lock().unwrap();
    assert!(codec.is_closed());
    assert!(!codec.has_decoder() && !codec.has_encoder());
    drop(codec);

    relay_cancel.cancel();
    Ok(())
}

/// Largest spread between the colour channels of any pixel.
fn channel_spread(frame: &RawFrame) -> u8 {
    let mut spread = 0;
    for y in 0..frame.height() as usize {
        for pixel in frame.row(y).chunks_exact(3) {
            let max = pixel.iter().copied().max().unwrap_or(0);
            let min = pixel.iter().copied().min().unwrap_or(0);
            spread = spread.max(max - min);
        }
    }
    spread
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gray_relay_returns_grayscale_stream() -> anyhow::Result<()> {
    vidlink::codec::init()?;
    let (url, relay_cancel) = start_relay(RelayMode::Gray).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = move |frame: RawFrame, _sequence: u64| {
        let _ = tx.send((frame.width(), frame.height(), channel_spread(&frame)));
    };
    let pipeline = Pipeline::new(config(url), TestPattern::new(WIDTH, HEIGHT, 30), sink);
    pipeline.start();

    let mut received = Vec::new();
    while received.len() < 10 {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(item)) => received.push(item),
            _ => break,
        }
    }
    pipeline.stop().await;
    relay_cancel.cancel();

    assert_eq!(received.len(), 10, "only {} frames came back", received.len());
    for &(width, height, spread) in &received {
        assert_eq!((width, height), (WIDTH, HEIGHT));
        // neutral chroma survives the round trip within rounding
        assert!(spread <= 3, "frame is not gray, channel spread {}", spread);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_endpoint_exhausts_retries() -> anyhow::Result<()> {
    vidlink::codec::init()?;
    // bind then drop so nothing listens on the port
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let config = StreamConfig {
        reconnect_delay_secs: 0.05,
        ..config(format!("ws://{}/ws/video", addr))
    };
    let pipeline = Pipeline::new(
        config,
        TestPattern::new(WIDTH, HEIGHT, 30),
        |_: RawFrame, _: u64| {},
    );
    pipeline.start();

    let result = tokio::time::timeout(Duration::from_secs(10), pipeline.join()).await?;
    match result {
        Err(TransportError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected exhausted, got {:?}", other),
    }
    pipeline.stop().await;
    Ok(())
}
