//! Global bandwidth shaping.
//!
//! The [`RateController`] owns the upload and download budget of the whole
//! process. On every tick the budget earned since the last tick is split
//! evenly between the connections that have something to move, in rounds,
//! until nobody can make progress or the budget is spent.
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// A connection whose socket I/O is driven by the [`RateController`].
pub trait RateLimited {
    fn is_connected(&self) -> bool;

    /// Called once per tick before anything is transferred.
    fn rearm(&mut self) {}

    /// Bytes are waiting on either side of the connection.
    fn can_transfer_more(&self) -> bool;

    fn socket_bytes_available(&self) -> usize;

    /// Bytes handed to the socket that it did not send yet.
    fn bytes_to_write(&self) -> usize;

    /// Read at most `max` bytes, returns how many were read.
    fn read_from_socket(&mut self, max: usize) -> usize;

    /// Write at most `max` bytes, returns how many were written.
    fn write_to_socket(&mut self, max: usize) -> usize;
}

#[derive(Debug, Clone)]
pub struct RateController {
    /// Bytes per second, 0 blocks uploads.
    upload_limit: u64,
    /// Bytes per second, 0 blocks downloads.
    download_limit: u64,
    last_transfer: Option<Instant>,
}

impl RateController {
    /// Interval between two transfers.
    pub const TICK: Duration = Duration::from_millis(50);

    pub fn new(upload_limit: u64, download_limit: u64) -> Self {
        Self { upload_limit, download_limit, last_transfer: None }
    }

    pub fn upload_limit(&self) -> u64 {
        self.upload_limit
    }

    pub fn download_limit(&self) -> u64 {
        self.download_limit
    }

    pub fn set_upload_limit(&mut self, bytes_per_sec: u64) {
        self.upload_limit = bytes_per_sec;
    }

    pub fn set_download_limit(&mut self, bytes_per_sec: u64) {
        self.download_limit = bytes_per_sec;
    }

    /// Move the bytes earned since the last call.
    ///
    /// Returns whether a connection still had data to move when the budget
    /// ran out.
    pub fn transfer<'a, C, I>(&mut self, conns: I) -> bool
    where
        C: RateLimited + 'a,
        I: IntoIterator<Item = &'a mut C>,
    {
        let now = Instant::now();
        let msecs = match self.last_transfer {
            Some(last) => now.duration_since(last).as_millis().min(1000) as u64,
            None => 1000,
        };
        let wants_more = self.transfer_with_elapsed(msecs, conns);
        self.last_transfer = Some(now);
        wants_more
    }

    /// [`Self::transfer`] with an explicit elapsed time.
    pub fn transfer_with_elapsed<'a, C, I>(&mut self, msecs: u64, conns: I) -> bool
    where
        C: RateLimited + 'a,
        I: IntoIterator<Item = &'a mut C>,
    {
        let mut pending: Vec<&mut C> = Vec::new();
        for conn in conns {
            conn.rearm();
            if conn.is_connected() && conn.can_transfer_more() {
                pending.push(conn);
            }
        }
        if pending.is_empty() {
            return false;
        }

        let mut bytes_to_write = (self.upload_limit * msecs / 1000) as usize;
        let mut bytes_to_read = (self.download_limit * msecs / 1000) as usize;
        if bytes_to_write == 0 && bytes_to_read == 0 {
            return true;
        }

        // a single connection may not queue more than this in the socket
        let write_cap = (self.upload_limit * 2) as usize;

        let mut can_transfer_more;
        loop {
            can_transfer_more = false;
            let write_chunk = (bytes_to_write / pending.len()).max(1);
            let read_chunk = (bytes_to_read / pending.len()).max(1);

            let mut next_round = Vec::with_capacity(pending.len());
            for conn in pending.drain(..) {
                if bytes_to_write == 0 && bytes_to_read == 0 {
                    break;
                }
                if !conn.is_connected() {
                    continue;
                }

                let mut transferred = false;

                let to_read = conn.socket_bytes_available().min(read_chunk).min(bytes_to_read);
                if to_read > 0 {
                    let read = conn.read_from_socket(to_read);
                    if read > 0 {
                        bytes_to_read -= read.min(bytes_to_read);
                        transferred = true;
                    }
                }

                let queued = conn.bytes_to_write();
                if write_cap > queued {
                    let to_write = (write_cap - queued).min(write_chunk).min(bytes_to_write);
                    if to_write > 0 {
                        let written = conn.write_to_socket(to_write);
                        if written > 0 {
                            bytes_to_write -= written.min(bytes_to_write);
                            transferred = true;
                        }
                    }
                }

                if transferred && conn.can_transfer_more() {
                    can_transfer_more = true;
                    next_round.push(conn);
                }
            }
            pending = next_round;

            if !can_transfer_more
                || (bytes_to_write == 0 && bytes_to_read == 0)
                || pending.is_empty()
            {
                break;
            }
        }

        trace!("transfer left {bytes_to_write} up and {bytes_to_read} down unused");
        can_transfer_more || bytes_to_write == 0 || bytes_to_read == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A socket with an endless supply of bytes.
    #[derive(Default)]
    struct Sink {
        reads: Vec<usize>,
        writes: Vec<usize>,
        outgoing: usize,
    }

    impl RateLimited for Sink {
        fn is_connected(&self) -> bool {
            true
        }

        fn can_transfer_more(&self) -> bool {
            true
        }

        fn socket_bytes_available(&self) -> usize {
            usize::MAX
        }

        fn bytes_to_write(&self) -> usize {
            0
        }

        fn read_from_socket(&mut self, max: usize) -> usize {
            self.reads.push(max);
            max
        }

        fn write_to_socket(&mut self, max: usize) -> usize {
            let n = max.min(self.outgoing);
            self.outgoing -= n;
            self.writes.push(n);
            n
        }
    }

    #[test]
    fn zero_download_limit_never_reads() {
        let mut rc = RateController::new(1000, 0);
        let mut conns: Vec<Sink> =
            (0..3).map(|_| Sink { outgoing: 10_000, ..Default::default() }).collect();

        for _ in 0..5 {
            rc.transfer_with_elapsed(1000, conns.iter_mut());
        }

        for conn in &conns {
            assert!(conn.reads.is_empty());
            assert!(!conn.writes.is_empty());
        }
    }

    #[test]
    fn both_limits_zero() {
        let mut rc = RateController::new(0, 0);
        let mut conns = vec![Sink::default()];
        assert!(rc.transfer_with_elapsed(1000, conns.iter_mut()));
        assert!(conns[0].reads.is_empty());
        assert!(conns[0].writes.is_empty());
    }

    #[test]
    fn budget_is_split_between_connections() {
        let mut rc = RateController::new(0, 4000);
        let mut conns: Vec<Sink> = (0..4).map(|_| Sink::default()).collect();

        // 100ms of a 4000 B/s budget
        rc.transfer_with_elapsed(100, conns.iter_mut());

        let total: usize = conns.iter().flat_map(|c| c.reads.iter()).sum();
        assert_eq!(total, 400);
        for conn in &conns {
            assert_eq!(conn.reads, vec![100]);
        }
    }

    #[test]
    fn leftover_budget_goes_to_active_connections() {
        let mut rc = RateController::new(3000, 0);
        // the first connection only has 100 bytes to send
        let mut conns = vec![
            Sink { outgoing: 100, ..Default::default() },
            Sink { outgoing: 10_000, ..Default::default() },
        ];

        rc.transfer_with_elapsed(1000, conns.iter_mut());

        let sent: Vec<usize> = conns.iter().map(|c| c.writes.iter().sum()).collect();
        assert_eq!(sent[0], 100);
        assert_eq!(sent[0] + sent[1], 3000);
        // no single write took more than half of the budget
        assert!(conns.iter().flat_map(|c| c.writes.iter()).all(|w| *w <= 1500));
    }

    #[test]
    fn elapsed_time_is_capped() {
        let mut rc = RateController::new(0, 1000);
        let mut conns = vec![Sink::default()];
        rc.transfer(conns.iter_mut());
        // the first transfer assumes a full second
        assert_eq!(conns[0].reads, vec![1000]);
    }
}
