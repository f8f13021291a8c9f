use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vidlink::{
    io::{LogSink, LogStatus, TestPattern},
    relay::{self, RelayMode},
    Pipeline, StreamConfig,
};

const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_SIZE: (u32, u32) = (640, 480);

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("vidlink", log::LevelFilter::Debug)
        .filter_module("vidlink_codec", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("echo") => {
            let (gray, rest): (Vec<String>, Vec<String>) = args.partition(|a| a == "--gray");
            let mode = if gray.is_empty() {
                RelayMode::Echo
            } else {
                RelayMode::Gray
            };
            run_relay(rest.into_iter().next(), mode).await
        }
        Some("stream") | None => run_stream(args.next()).await,
        Some(other) => anyhow::bail!("unknown command {:?}, expected `echo` or `stream`", other),
    }
}

async fn run_relay(addr: Option<String>, mode: RelayMode) -> anyhow::Result<()> {
    if mode == RelayMode::Gray {
        vidlink::codec::init()?;
    }
    let addr = addr.unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    let cancel = CancellationToken::new();
    let server = tokio::spawn(relay::serve(listener, mode, cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => cancel.cancel(),
        _ = cancel.cancelled() => {}
    }
    server.await??;
    Ok(())
}

async fn run_stream(url: Option<String>) -> anyhow::Result<()> {
    vidlink::codec::init()?;
    let mut config = StreamConfig::from_env()?;
    if let Some(url) = url {
        config.endpoint = url;
    }
    config.validate()?;

    let (width, height) = config.target_size().unwrap_or(DEFAULT_SIZE);
    let source = TestPattern::new(width, height, config.fps);
    let every = u64::from(config.fps);
    let pipeline = Pipeline::new(config, source, LogSink::new(every)).with_status(LogStatus);
    pipeline.start();

    let result = tokio::select! {
        result = pipeline.join() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("ctrl-c received, stopping");
            Ok(())
        }
    };
    pipeline.stop().await;
    result?;
    Ok(())
}
