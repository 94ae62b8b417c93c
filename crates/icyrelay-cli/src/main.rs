//! icyrelay CLI: relay an internet radio stream to a local URL

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use icyrelay::{ConnectionState, IcecastProxy, NowPlaying, RelayConfig, RelayEvent};

#[derive(Parser)]
#[command(
    name = "icyrelay",
    about = "Relay an Icecast/Shoutcast stream to a local URL without ICY framing",
    version
)]
struct Cli {
    /// Stream URL to relay
    url: String,

    /// Do not request interleaved ICY metadata
    #[arg(long)]
    no_icy: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local proxy port (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "icyrelay=debug"
    } else {
        "icyrelay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> icyrelay::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::from_json_file(path)?,
        None => RelayConfig::default(),
    };
    if let Some(port) = cli.port {
        config.bind_port = port;
    }

    let mut relay = IcecastProxy::new(config)?;
    let events = relay.subscribe();
    relay.start_url(cli.url, !cli.no_icy)?;

    for event in events.iter() {
        match event {
            RelayEvent::ProxyUrlReady(url) => println!("Listening on {}", url),
            RelayEvent::StreamInfo(info) => {
                if let Some(name) = &info.station_name {
                    println!("Station: {}", name);
                }
                let format = info.format_hint().unwrap_or("unknown");
                match info.bitrate {
                    Some(kbps) => println!("Format: {} @ {} kbps", format, kbps),
                    None => println!("Format: {}", format),
                }
            }
            RelayEvent::IcecastDetected(false) => {
                println!("No ICY metadata on this stream, relaying audio only")
            }
            RelayEvent::MetadataChanged(record) => {
                match NowPlaying::from_record(&record) {
                    Some(NowPlaying {
                        artist: Some(artist),
                        title: Some(title),
                    }) => println!("Now playing: {} - {}", artist, title),
                    Some(NowPlaying {
                        title: Some(title), ..
                    }) => println!("Now playing: {}", title),
                    _ => debug!(?record, "metadata without title"),
                }
            }
            RelayEvent::StateChanged(ConnectionState::Error(msg)) => {
                eprintln!("Error: {}", msg);
                relay.stop();
                return Ok(ExitCode::FAILURE);
            }
            RelayEvent::StateChanged(state) => println!("[{}]", state),
            RelayEvent::ProgressChanged(bytes) => debug!(bytes, "progress"),
            RelayEvent::BufferReady | RelayEvent::LoadingChanged(_) | RelayEvent::IcecastDetected(_) => {}
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let cli = Cli::parse_from(["icyrelay", "http://radio.test/live", "--no-icy", "-p", "8123"]);
        assert_eq!(cli.url, "http://radio.test/live");
        assert!(cli.no_icy);
        assert_eq!(cli.port, Some(8123));
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn url_is_required() {
        assert!(Cli::try_parse_from(["icyrelay"]).is_err());
    }
}
