use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_bittorrent::{bencoding::decoder, client, Config, PieceManager, Torrent, Tracker};

#[derive(Debug, Parser)]
#[command(version, about = "a small single file bittorrent client")]
struct Cli {
    /// Port reported to the tracker
    #[arg(long, global = true, default_value_t = rust_bittorrent::config::DEFAULT_PORT)]
    port: u16,

    /// How many pieces may be downloading at the same time
    #[arg(
        long = "max-concurrency",
        global = true,
        default_value_t = rust_bittorrent::config::MAX_CONCURRENT_PIECES
    )]
    max_concurrency: usize,

    /// Block requests kept in flight per peer
    #[arg(long, global = true, default_value_t = 1)]
    pipeline: usize,

    /// Seconds before a silent peer is given up on
    #[arg(long = "peer-timeout", global = true, default_value_t = 30)]
    peer_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Decode {
        value: String,
    },
    Info {
        torrent: PathBuf,
    },
    Peers {
        torrent: PathBuf,
    },
    Handshake {
        torrent: PathBuf,
        peer: SocketAddr,
    },
    #[command(name = "download_piece")]
    DownloadPiece {
        #[arg(short)]
        output: PathBuf,
        torrent: PathBuf,
        index: usize,
    },
    Download {
        #[arg(short)]
        output: PathBuf,
        torrent: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            port: self.port,
            max_concurrent_pieces: self.max_concurrency,
            pipeline_depth: self.pipeline,
            peer_timeout: Duration::from_secs(self.peer_timeout),
            ..Config::default()
        }
    }
}

async fn load(path: &Path) -> Result<Torrent> {
    Torrent::from_file(path)
        .await
        .with_context(|| format!("reading torrent {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Command::Decode { value } => {
            let (decoded, _) =
                decoder::decode(value.as_bytes()).context("decoding bencoded value")?;
            println!("{}", decoded.to_json());
        }
        Command::Info { torrent } => {
            let torrent = load(&torrent).await?;
            println!("Tracker URL: {}", torrent.announce);
            println!("Length: {}", torrent.length);
            println!("Info Hash: {}", torrent.info_hash_hex());
            println!("Piece Length: {}", torrent.piece_length);
            println!("Piece Hashes:");
            for hash in torrent.piece_hashes_hex() {
                println!("{}", hash);
            }
        }
        Command::Peers { torrent } => {
            let torrent = load(&torrent).await?;
            let peers = Tracker::new(&config)
                .announce(&torrent)
                .await
                .context("getting peers from tracker")?;
            for peer in peers {
                println!("{}", peer);
            }
        }
        Command::Handshake { torrent, peer } => {
            let torrent = load(&torrent).await?;
            let remote_id = client::handshake(&torrent, peer, &config)
                .await
                .with_context(|| format!("handshaking with {}", peer))?;
            println!("Peer ID: {}", hex::encode(remote_id));
        }
        Command::DownloadPiece { output, torrent, index } => {
            let torrent = load(&torrent).await?;
            let manager = PieceManager::from_tracker(torrent, config)
                .await
                .context("getting peers from tracker")?;
            let piece = manager
                .download_piece(index)
                .await
                .with_context(|| format!("downloading piece {}", index))?;
            tokio::fs::write(&output, piece)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Piece {} downloaded to {}.", index, output.display());
        }
        Command::Download { output, torrent } => {
            let path = torrent;
            let torrent = load(&path).await?;
            let manager = PieceManager::from_tracker(torrent, config)
                .await
                .context("getting peers from tracker")?;
            let data = manager.download().await.context("downloading file")?;
            tokio::fs::write(&output, data)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Downloaded {} to {}.", path.display(), output.display());
        }
    }

    Ok(())
}
