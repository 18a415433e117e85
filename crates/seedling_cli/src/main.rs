use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use seedling::{
    client::{Client, ClientHandle},
    config::Config,
    error::Error,
    metainfo::MetaInfo,
    torrent::{InfoHash, SessionState, TorrentStats},
    utils::to_human_readable,
};
use tokio::{fs, select, signal, time::interval};
use tracing::{debug, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;

use args::Args;

mod args;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let _guard = init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => Config::load_from(path).await?,
        None => Config::load().await?,
    };
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(port) = args.port {
        config.listen_port_min = port;
        config.listen_port_max = port;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if let Some(limit) = args.upload_limit {
        config.upload_limit = limit;
    }
    if let Some(limit) = args.download_limit {
        config.download_limit = limit;
    }
    if args.seed.is_some() {
        config.rng_seed = args.seed;
    }

    let resume_dir = Config::config_dir()?.join("resume");
    let download_dir = config.download_dir.clone();

    let (client, handle) = Client::with_http(config)?;
    let client = tokio::spawn(client.run());

    let mut torrents = Vec::new();
    for path in &args.torrents {
        match add_torrent(&handle, path, &download_dir, &resume_dir).await {
            Ok(info_hash) => {
                if !args.peers.is_empty() {
                    handle.add_peers(info_hash, args.peers.clone()).await?;
                }
                torrents.push(info_hash);
            }
            Err(e) => eprintln!("could not add {}: {e}", path.display()),
        }
    }

    if torrents.is_empty() {
        warn!("no torrent to download");
    }

    let mut status = interval(STATUS_INTERVAL);
    loop {
        select! {
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
            _ = status.tick() => {
                let stats = handle.all_stats().await?;
                for s in &stats {
                    print_status(s);
                }
                let done = stats.iter().all(|s| s.state == SessionState::Seeding);
                if args.quit_after_complete && !stats.is_empty() && done {
                    info!("every torrent is complete");
                    break;
                }
            }
        }
    }

    for info_hash in torrents {
        if let Err(e) = save_resume_state(&handle, info_hash, &resume_dir).await {
            warn!("could not save the resume state of {info_hash}: {e}");
        }
    }

    handle.quit().await?;
    if let Ok(r) = client.await {
        r?;
    }

    Ok(())
}

/// Log to stderr, or through a non-blocking writer to `--log-file`.
fn init_logging(args: &Args) -> Result<Option<WorkerGuard>, Error> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false).compact();

    let Some(path) = &args.log_file else {
        builder.with_writer(io::stderr).init();
        return Ok(None);
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::NotAFile(path.display().to_string()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    builder.with_writer(writer).with_ansi(false).init();
    Ok(Some(guard))
}

fn resume_file(resume_dir: &Path, info_hash: InfoHash) -> PathBuf {
    resume_dir.join(format!("{info_hash}.resume"))
}

async fn add_torrent(
    handle: &ClientHandle,
    path: &Path,
    download_dir: &Path,
    resume_dir: &Path,
) -> Result<InfoHash, Error> {
    let bytes = fs::read(path).await?;
    let meta = MetaInfo::from_bytes(&bytes)?;

    let resume = fs::read(resume_file(resume_dir, meta.info_hash)).await.ok();
    if resume.is_some() {
        debug!("found a resume state for {}", meta.info.name);
    }

    handle.add_torrent(bytes, download_dir, resume).await
}

async fn save_resume_state(
    handle: &ClientHandle,
    info_hash: InfoHash,
    resume_dir: &Path,
) -> Result<(), Error> {
    let state = handle.dump_state(info_hash).await?;
    fs::create_dir_all(resume_dir).await?;
    fs::write(resume_file(resume_dir, info_hash), state).await?;
    Ok(())
}

fn print_status(s: &TorrentStats) {
    let mut line = format!(
        "{} [{}] {}% {} of {}, down {}/s, up {}/s, {} connections, {} peers",
        s.name,
        s.state,
        s.progress,
        to_human_readable(s.downloaded),
        to_human_readable(s.size),
        to_human_readable(s.download_rate),
        to_human_readable(s.upload_rate),
        s.connections,
        s.peers,
    );
    if s.state == SessionState::Preparing {
        line.push_str(&format!(", checking {}%", s.verification));
    }
    if let Some((code, message)) = &s.error {
        line.push_str(&format!(", {code:?}: {message}"));
    }
    println!("{line}");
}
