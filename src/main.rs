use anyhow::Context;
use bitpull::torrent::Torrent;
use bitpull::{engine, storage, tracker, utils, LISTEN_PORT};
use clap::Parser;
use std::process::ExitCode;

/// Single-torrent BitTorrent downloader: contacts trackers, pulls pieces
/// from peers concurrently, and writes the verified content to a file.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the metainfo (`.torrent`) file.
    metainfo_path: String,

    /// Path to write the downloaded content to.
    output_path: String,

    #[arg(short, long, default_value_t = LISTEN_PORT)]
    port: u16,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let torrent = Torrent::from_file(&cli.metainfo_path)
        .with_context(|| format!("failed to decode {}", cli.metainfo_path))?;
    log::info!(
        "{}: {} pieces, {} bytes",
        torrent.name,
        torrent.num_pieces(),
        torrent.length
    );

    let peer_id = utils::generate_peer_id();
    let peers = tracker::find_peers(&torrent, peer_id, cli.port)
        .context("failed to obtain peers from any tracker")?;
    log::info!("found {} peers", peers.len());

    let buffer = engine::run(&torrent, peers, peer_id).context("download failed")?;
    storage::write_output(&cli.output_path, &buffer)
        .with_context(|| format!("failed to write {}", cli.output_path))?;

    log::info!("wrote {} bytes to {}", buffer.len(), cli.output_path);
    Ok(())
}
