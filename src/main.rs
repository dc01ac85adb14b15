use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Parser;

use leechtorrent::{conf::Conf, engine, metainfo::Metainfo};

/// Downloads the single file described by a .torrent, resuming where an
/// earlier run left off.
#[derive(Parser)]
#[command(name = "leechtorrent", version, about)]
struct Args {
    /// Path of the .torrent metainfo file.
    torrent: PathBuf,

    /// Directory the file and its resume metadata are downloaded into.
    #[arg(short, long, default_value = "download")]
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args = Args::parse();
    let buf = fs::read(&args.torrent)
        .with_context(|| format!("could not read {:?}", args.torrent))?;
    let metainfo =
        Metainfo::from_bytes(&buf).context("could not parse metainfo")?;

    let conf = Conf::new(args.download_dir);
    engine::download(conf, metainfo).await?;

    Ok(())
}
