//! Driver binary: ping, pong, or relay over a broker overlay.

use broker_core::{
    telemetry,
    topic::{ERRORS_TOPIC, STATUSES_TOPIC},
    Config, Error, Filter, Result, Topic,
};
use broker_node::{Endpoint, Status};
use clap::{Parser, ValueEnum};
use std::{
    path::PathBuf,
    process::ExitCode,
    time::{Duration, Instant},
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "broker-node",
    version,
    about = "Broker overlay node: sends pings, answers them, or relays traffic"
)]
struct Cli {
    /// Operating mode.
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// Topic for sending and receiving messages.
    #[arg(short, long)]
    topic: String,

    /// Number of pings to send; ignored in pong and relay mode.
    #[arg(short = 'n', long, default_value_t = 10)]
    num_pings: usize,

    /// Peers to connect to on startup, in tcp://host:port notation.
    #[arg(short, long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Local port for publishing this endpoint at.
    #[arg(short, long)]
    local_port: Option<u16>,

    /// Print status and error events.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file.
    #[arg(long)]
    config_file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Send pings and measure round trips.
    Ping,
    /// Answer every ping with a pong.
    Pong,
    /// Forward traffic and log what passes through.
    Relay,
}

/// How long ping mode waits for an answer before sending again. Resending
/// covers the window in which remote subscriptions are still propagating.
const PING_RETRY: Duration = Duration::from_secs(1);

fn parse_peer_uri(uri: &str) -> Option<(String, u16)> {
    let rest = uri.strip_prefix("tcp://")?;
    let (host, port) = rest.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

async fn ping_mode(endpoint: &Endpoint, topic: Topic, count: usize) -> Result<()> {
    if count == 0 {
        warn!("send no pings: n = 0");
        return Ok(());
    }
    info!(topic = %topic, count, "sending pings");
    let mut incoming = endpoint.make_subscriber(Filter::from_topics([topic.clone()])).await?;
    let mut rtts = Vec::with_capacity(count);
    for seq in 0..count {
        let started = Instant::now();
        endpoint.publish(topic.clone(), "ping").await?;
        loop {
            match tokio::time::timeout(PING_RETRY, incoming.recv()).await {
                Ok(Some(msg)) if msg.data.as_str() == Some("pong") => break,
                Ok(Some(_)) => {},
                Ok(None) => return Err(Error::Detached),
                Err(_) => endpoint.publish(topic.clone(), "ping").await?,
            }
        }
        let rtt = started.elapsed();
        println!("{seq}: {rtt:?}");
        rtts.push(rtt);
    }
    let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
    println!("AVG: {avg:?}");
    endpoint.publish(topic, "stop").await?;
    Ok(())
}

async fn pong_mode(endpoint: &Endpoint, topic: Topic) -> Result<()> {
    info!(topic = %topic, "answering pings");
    let mut incoming = endpoint.make_subscriber(Filter::from_topics([topic.clone()])).await?;
    while let Some(msg) = incoming.recv().await {
        match msg.data.as_str() {
            Some("ping") => {
                info!("received a ping");
                endpoint.publish(topic.clone(), "pong").await?;
            },
            Some("stop") => {
                info!("received stop");
                break;
            },
            _ => {},
        }
    }
    Ok(())
}

async fn relay_mode(endpoint: &Endpoint, topic: Topic) -> Result<()> {
    info!(topic = %topic, "relaying messages");
    let mut incoming = endpoint.make_subscriber(Filter::from_topics([topic])).await?;
    while let Some(msg) = incoming.recv().await {
        match msg.data.as_str() {
            Some("stop") => {
                info!("received stop");
                break;
            },
            _ => info!(topic = %msg.topic, data = %msg.data, "passing through"),
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config_file.as_deref())?;
    let endpoint = Endpoint::new(config)?;

    if cli.verbose {
        let internal =
            Filter::from_topics([Topic::new(ERRORS_TOPIC)?, Topic::new(STATUSES_TOPIC)?]);
        let mut events = endpoint.make_subscriber(internal).await?;
        tokio::spawn(async move {
            while let Some(msg) = events.recv().await {
                match Status::from_data(&msg.data) {
                    Some(status) => info!(%status, "status"),
                    None => info!(topic = %msg.topic, data = %msg.data, "event"),
                }
            }
        });
    }

    if let Some(port) = cli.local_port {
        let bound = endpoint.listen("", port).await?;
        info!(port = bound, "listening for peers");
    }

    let mut connected = Vec::new();
    for uri in &cli.peers {
        match parse_peer_uri(uri) {
            Some((host, port)) => match endpoint.peer(&host, port).await {
                Ok(remote) => {
                    info!(host = %host, port, peer = %remote, "connected");
                    connected.push((host, port));
                },
                Err(error) => warn!(host = %host, port, %error, "cannot connect"),
            },
            None => warn!(uri = %uri, "unrecognized peer URI, expected tcp://host:port"),
        }
    }

    let topic = Topic::new(cli.topic.clone())?;
    match cli.mode {
        Mode::Ping => ping_mode(&endpoint, topic, cli.num_pings).await?,
        Mode::Pong => pong_mode(&endpoint, topic).await?,
        Mode::Relay => relay_mode(&endpoint, topic).await?,
    }

    for (host, port) in connected {
        let _ = endpoint.unpeer(&host, port).await;
    }
    endpoint.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_uri_parsing() {
        assert_eq!(parse_peer_uri("tcp://localhost:9999"), Some(("localhost".to_string(), 9999)));
        assert_eq!(parse_peer_uri("tcp://10.0.0.1:1"), Some(("10.0.0.1".to_string(), 1)));
        assert_eq!(parse_peer_uri("udp://localhost:9999"), None);
        assert_eq!(parse_peer_uri("tcp://localhost"), None);
        assert_eq!(parse_peer_uri("tcp://:9999"), None);
        assert_eq!(parse_peer_uri("tcp://host:notaport"), None);
    }

    #[test]
    fn test_cli_requires_mode_and_topic() {
        assert!(Cli::try_parse_from(["broker-node"]).is_err());
        assert!(Cli::try_parse_from(["broker-node", "--mode", "ping"]).is_err());
        assert!(Cli::try_parse_from(["broker-node", "--topic", "t"]).is_err());
        assert!(
            Cli::try_parse_from(["broker-node", "--mode", "juggle", "--topic", "t"]).is_err()
        );
        let cli =
            Cli::try_parse_from(["broker-node", "--mode", "pong", "--topic", "t"]).unwrap();
        assert!(matches!(cli.mode, Mode::Pong));
        assert_eq!(cli.num_pings, 10);
    }
}
