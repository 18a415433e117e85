use std::time::Duration;

/// Counter of rates, used in downloaded and uploaded.
///
/// Bytes are added to the newest bucket and [`Counter::rotate`] is called
/// on a fixed tick. The rate is the sum of every bucket divided by the
/// window length, which smooths bursty transfers.
#[derive(Debug, Clone)]
pub struct Counter {
    // -- cumulative counters --
    pub total_downloaded: u64,
    pub total_uploaded: u64,

    // -- windows, index 0 is the current tick --
    download: Vec<u64>,
    upload: Vec<u64>,
    tick: Duration,
}

impl Counter {
    /// Window used by peer connections: 8 buckets of 2 seconds.
    pub const PEER_BUCKETS: usize = 8;
    pub const PEER_TICK: Duration = Duration::from_secs(2);

    /// Window used by a torrent session: 10 buckets of 1 second.
    pub const SESSION_BUCKETS: usize = 10;
    pub const SESSION_TICK: Duration = Duration::from_secs(1);

    pub fn new(buckets: usize, tick: Duration) -> Self {
        let buckets = buckets.max(1);
        Self {
            total_downloaded: 0,
            total_uploaded: 0,
            download: vec![0; buckets],
            upload: vec![0; buckets],
            tick,
        }
    }

    pub fn peer() -> Self {
        Self::new(Self::PEER_BUCKETS, Self::PEER_TICK)
    }

    pub fn session() -> Self {
        Self::new(Self::SESSION_BUCKETS, Self::SESSION_TICK)
    }

    /// Record downloaded bytes
    pub fn record_download(&mut self, bytes: u64) {
        self.total_downloaded += bytes;
        self.download[0] += bytes;
    }

    /// Record uploaded bytes
    pub fn record_upload(&mut self, bytes: u64) {
        self.total_uploaded += bytes;
        self.upload[0] += bytes;
    }

    /// Drop the oldest bucket and open a new one.
    pub fn rotate(&mut self) {
        self.download.rotate_right(1);
        self.upload.rotate_right(1);
        self.download[0] = 0;
        self.upload[0] = 0;
    }

    /// Bytes per second over the whole window.
    pub fn download_rate(&self) -> u64 {
        self.rate(&self.download)
    }

    /// Bytes per second over the whole window.
    pub fn upload_rate(&self) -> u64 {
        self.rate(&self.upload)
    }

    /// No bytes moved in the whole window.
    pub fn is_idle(&self) -> bool {
        self.download.iter().chain(&self.upload).all(|b| *b == 0)
    }

    fn rate(&self, buckets: &[u64]) -> u64 {
        let window_ms = buckets.len() as u128 * self.tick.as_millis().max(1);
        let sum: u64 = buckets.iter().sum();
        (sum as u128 * 1000 / window_ms) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_window_average() {
        let mut counter = Counter::peer();
        counter.record_download(16_000);
        counter.record_upload(1_600);

        // 8 buckets * 2s = 16s window
        assert_eq!(counter.download_rate(), 1_000);
        assert_eq!(counter.upload_rate(), 100);

        counter.rotate();
        counter.record_download(16_000);
        assert_eq!(counter.download_rate(), 2_000);
        assert_eq!(counter.total_downloaded, 32_000);
    }

    #[test]
    fn old_buckets_fall_off() {
        let mut counter = Counter::session();
        counter.record_upload(10_000);
        assert!(!counter.is_idle());

        for _ in 0..Counter::SESSION_BUCKETS - 1 {
            counter.rotate();
            assert_eq!(counter.upload_rate(), 1_000);
        }

        counter.rotate();
        assert_eq!(counter.upload_rate(), 0);
        assert!(counter.is_idle());
        assert_eq!(counter.total_uploaded, 10_000);
    }
}
