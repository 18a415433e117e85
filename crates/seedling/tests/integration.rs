use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use bendy::encoding::{AsString, Error as EncodingError, SingleItemEncoder, ToBencode};
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, RngCore, SeedableRng};
use seedling::{
    client::{Client, ClientHandle},
    config::Config,
    error::Error,
    torrent::{InfoHash, SessionState, TorrentStats},
};
use tokio::time::{sleep, timeout};

const PIECE_LEN: u64 = 32 * 1024;

struct Fixture {
    name: String,
    data: Vec<u8>,
}

impl ToBencode for Fixture {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), EncodingError> {
        let pieces: Vec<u8> = self
            .data
            .chunks(PIECE_LEN as usize)
            .flat_map(|chunk| sha1_smol::Sha1::from(chunk).digest().bytes())
            .collect();

        encoder.emit_dict(|mut e| {
            e.emit_pair_with(b"info", |e| {
                e.emit_dict(|mut e| {
                    e.emit_pair(b"length", self.data.len() as u64)?;
                    e.emit_pair(b"name", &self.name)?;
                    e.emit_pair(b"piece length", PIECE_LEN)?;
                    e.emit_pair(b"pieces", AsString(&pieces))
                })
            })
        })
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .without_time()
        .with_test_writer()
        .try_init();
}

fn random_name() -> String {
    rand::thread_rng().sample_iter(Alphanumeric).take(20).map(char::from).collect()
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("seedling-{}", random_name()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A little over three pieces of noise, so the last piece is short.
fn fixture() -> Fixture {
    let mut data = vec![0u8; 3 * PIECE_LEN as usize + 1000];
    StdRng::seed_from_u64(42).fill_bytes(&mut data);
    Fixture { name: random_name(), data }
}

fn config(download_dir: &PathBuf) -> Config {
    Config {
        download_dir: download_dir.clone(),
        listen_port_min: 0,
        listen_port_max: 0,
        max_connections: 50,
        upload_limit: 16 * 1024 * 1024,
        download_limit: 16 * 1024 * 1024,
        rng_seed: Some(1),
    }
}

fn spawn_client(download_dir: &PathBuf) -> ClientHandle {
    let (client, handle) = Client::with_http(config(download_dir)).unwrap();
    tokio::spawn(client.run());
    handle
}

async fn wait_for(handle: &ClientHandle, info_hash: InfoHash, state: SessionState) -> TorrentStats {
    let wait = async {
        loop {
            let stats = handle.stats(info_hash).await.unwrap();
            if stats.state == state {
                return stats;
            }
            sleep(Duration::from_millis(50)).await;
        }
    };
    match timeout(Duration::from_secs(30), wait).await {
        Ok(stats) => stats,
        Err(_) => panic!("{info_hash} never reached {state}"),
    }
}

// Two clients on loopback: one seeds a file, the other downloads it from
// that single peer, then a third client resumes from the saved state
// without checking the pieces again.
#[tokio::test]
async fn leecher_downloads_from_seeder() {
    init_logging();
    let fixture = fixture();
    let torrent = fixture.to_bencode().unwrap();

    let seed_dir = scratch_dir();
    let leech_dir = scratch_dir();
    std::fs::write(seed_dir.join(&fixture.name), &fixture.data).unwrap();

    let seeder = spawn_client(&seed_dir);
    let info_hash = seeder.add_torrent(torrent.clone(), &seed_dir, None).await.unwrap();
    let stats = wait_for(&seeder, info_hash, SessionState::Seeding).await;
    assert_eq!(stats.completed_pieces, 4);
    assert_eq!(stats.size, fixture.data.len() as u64);

    let port = seeder.listen_port().await.unwrap().unwrap();
    let seeder_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    let leecher = spawn_client(&leech_dir);
    assert_eq!(leecher.add_torrent(torrent.clone(), &leech_dir, None).await.unwrap(), info_hash);
    leecher.add_peers(info_hash, vec![seeder_addr]).await.unwrap();

    let stats = wait_for(&leecher, info_hash, SessionState::Seeding).await;
    assert_eq!(stats.progress, 100);
    assert!(stats.downloaded >= fixture.data.len() as u64);
    assert_eq!(std::fs::read(leech_dir.join(&fixture.name)).unwrap(), fixture.data);
    assert!(seeder.stats(info_hash).await.unwrap().uploaded >= fixture.data.len() as u64);

    let resume = leecher.dump_state(info_hash).await.unwrap();
    leecher.quit().await.unwrap();
    seeder.quit().await.unwrap();

    let resumed = spawn_client(&leech_dir);
    resumed.add_torrent(torrent, &leech_dir, Some(resume)).await.unwrap();
    let stats = wait_for(&resumed, info_hash, SessionState::Seeding).await;
    assert_eq!(stats.completed_pieces, 4);
    resumed.quit().await.unwrap();

    std::fs::remove_dir_all(seed_dir).unwrap();
    std::fs::remove_dir_all(leech_dir).unwrap();
}

#[tokio::test]
async fn bad_requests_leave_no_trace() {
    let dir = scratch_dir();
    let client = spawn_client(&dir);

    let r = client.add_torrent(b"d4:infoi3ee".to_vec(), &dir, None).await;
    assert!(matches!(r, Err(Error::MetaInfoInvalid(_))));
    let r = client.add_torrent(b"not bencode".to_vec(), &dir, None).await;
    assert!(matches!(r, Err(Error::BencodeError(_))));
    assert!(client.all_stats().await.unwrap().is_empty());

    let torrent = fixture().to_bencode().unwrap();
    let info_hash = client.add_torrent(torrent.clone(), &dir, None).await.unwrap();
    let r = client.add_torrent(torrent, &dir, None).await;
    assert!(matches!(r, Err(Error::NoDuplicateTorrent)));

    let unknown = InfoHash([7; 20]);
    assert!(matches!(client.stats(unknown).await, Err(Error::TorrentDoesNotExist)));
    assert!(matches!(client.pause(unknown, true).await, Err(Error::TorrentDoesNotExist)));

    // nothing on disk yet, the session searches for peers
    wait_for(&client, info_hash, SessionState::Searching).await;
    client.pause(info_hash, true).await.unwrap();
    assert_eq!(client.stats(info_hash).await.unwrap().state, SessionState::Paused);

    // no tracker, so the stop is immediate
    client.stop(info_hash).await.unwrap();
    assert_eq!(client.stats(info_hash).await.unwrap().state, SessionState::Idle);

    client.quit().await.unwrap();
    std::fs::remove_dir_all(dir).unwrap();
}
