use std::{path::PathBuf, process};

use clap::Parser;

use leechbit::{conf::Conf, engine, error::Result, metainfo::Metainfo};

/// A minimal single-file BitTorrent leech client.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .torrent file to download.
    torrent: PathBuf,

    /// Directory the downloaded file is placed in.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Cap on the number of concurrently connected peers.
    #[arg(long)]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().default_filter_or("info"),
    );

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let contents = std::fs::read(&args.torrent)?;
    let metainfo = Metainfo::from_bytes(&contents)?;

    let mut conf = Conf::new(args.output);
    if let Some(max_sessions) = args.max_sessions {
        conf.max_sessions = max_sessions;
    }

    engine::download(conf, metainfo).await
}
