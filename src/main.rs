use clap::Parser;
use piecemeal::config::{Config, DEFAULT_PORT};
use piecemeal::session::{Session, Source};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Download a torrent, or share a file with a built-in tracker
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Log everything, not just the highlights
    #[arg(long)]
    debug: bool,

    /// Port to listen on for peers (and tracker requests when sharing)
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Where downloads go
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Share the given path, running a tracker reachable as this host
    #[arg(long, value_name = "HOST")]
    share: Option<String>,

    /// Piece size for shared content
    #[arg(long)]
    piece_size: Option<u32>,

    /// A torrent file, an http(s) url serving one, or with --share the file or directory to share
    source: String,
}

fn set_up_tracing(debug: bool) {
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let fmt_layer = fmt::layer().compact().with_line_number(true).with_filter(level);

    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    set_up_tracing(args.debug);

    let mut config = Config::with_port(args.port);
    config.download_dir = args.dir;
    if let Some(piece_size) = args.piece_size {
        config.piece_size = piece_size;
    }

    let source = match args.share {
        Some(host) => Source::Share {
            path: PathBuf::from(args.source),
            host,
        },
        None => Source::Torrent(args.source),
    };

    Session::launch(config, source).await?.run().await
}
