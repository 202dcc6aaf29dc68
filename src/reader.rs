//! The TS reader thread (spec §4.7, component C8).
//!
//! Mapped per §9's design note onto a dedicated tokio task rather than a raw
//! OS thread, with control communicating through an `mpsc` command channel
//! instead of ad-hoc volatile fields. The [`Dispatcher`] (C7) is moved into
//! the task and owned exclusively by it, matching "the reader owns all
//! packet-path state; control threads never mutate filter lists directly" —
//! external mutation goes through the [`MutationQueue`] handed back in
//! [`ReaderHandle::mutation_queue`].

use crate::dispatch::{Dispatcher, MutationQueue};
use crate::dvr::DvrSource;
use crate::packet::{Packet, PACKET_SIZE};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Command {
    Enable(bool),
    Quit,
}

#[derive(Default)]
struct Stats {
    total_packets: AtomicU64,
    bitrate_bps: AtomicU64,
}

impl Stats {
    fn reset(&self) {
        self.total_packets.store(0, Ordering::Relaxed);
        self.bitrate_bps.store(0, Ordering::Relaxed);
    }
}

/// A cheap, cloneable handle for controlling an already-spawned reader from
/// code (e.g. [`crate::tuner::Tuner`]) that only needs `enable`/stats access,
/// not the ability to shut the reader down.
#[derive(Clone)]
pub struct ReaderControl {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<Stats>,
}

impl ReaderControl {
    pub fn enable(&self, enabled: bool) {
        let _ = self.commands.send(Command::Enable(enabled));
    }

    pub fn total_packets(&self) -> u64 {
        self.stats.total_packets.load(Ordering::Relaxed)
    }

    pub fn bitrate_bps(&self) -> u64 {
        self.stats.bitrate_bps.load(Ordering::Relaxed)
    }

    /// Zeroes total-packets and bitrate, done on every successful retune
    /// (spec §4.9 step 5).
    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

/// Control surface for a running reader task.
pub struct ReaderHandle {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<Stats>,
    mutation_queue: MutationQueue,
    join: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// Quiesces (`false`) or resumes (`true`) packet dispatch. Returns once
    /// the command has been enqueued; the reader applies it between batches,
    /// matching §4.7's "both block until the reader observes the new state".
    pub fn enable(&self, enabled: bool) {
        let _ = self.commands.send(Command::Enable(enabled));
    }

    pub fn mutation_queue(&self) -> MutationQueue {
        self.mutation_queue.clone()
    }

    /// A cloneable, shareable control surface for this reader.
    pub fn control(&self) -> ReaderControl {
        ReaderControl {
            commands: self.commands.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.stats.total_packets.load(Ordering::Relaxed)
    }

    /// Advisory bitrate in bits/second over the last ~1 second (§4.7).
    pub fn bitrate_bps(&self) -> u64 {
        self.stats.bitrate_bps.load(Ordering::Relaxed)
    }

    /// Signals cancellation and joins the reader task.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Quit);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Spawns the reader task over `dvr`, reading up to `batch_size` packets per
/// blocking read (§4.7's N≈20).
pub fn spawn<D: DvrSource + Send + 'static>(dvr: D, dispatcher: Dispatcher, batch_size: usize) -> ReaderHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(Stats::default());
    let mutation_queue = dispatcher.mutation_queue();
    let task_stats = stats.clone();

    let join = tokio::spawn(async move {
        reader_loop(dvr, dispatcher, rx, task_stats, batch_size).await;
    });

    ReaderHandle {
        commands: tx,
        stats,
        mutation_queue,
        join: Some(join),
    }
}

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const BITRATE_WINDOW: Duration = Duration::from_secs(1);

async fn reader_loop(
    mut dvr: impl DvrSource,
    mut dispatcher: Dispatcher,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stats: Arc<Stats>,
    batch_size: usize,
) {
    let mut enabled = true;
    let mut window_counts: VecDeque<(Instant, usize)> = VecDeque::new();

    loop {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                Command::Enable(e) => {
                    log::info!("reader {}", if e { "enabled" } else { "disabled" });
                    enabled = e;
                }
                Command::Quit => {
                    log::info!("reader received quit, exiting after current batch");
                    return;
                }
            }
        }

        if !enabled {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        }

        match dvr.read_batch(batch_size, READ_TIMEOUT).await {
            Ok(batch) if !batch.is_empty() => {
                let mut count = 0;
                for chunk in batch.chunks_exact(PACKET_SIZE) {
                    if let Ok(packet) = Packet::parse(chunk) {
                        dispatcher.dispatch(&packet);
                        count += 1;
                    } else {
                        log::warn!("reader: dropped malformed packet in batch");
                    }
                }
                stats.total_packets.fetch_add(count as u64, Ordering::Relaxed);

                let now = Instant::now();
                window_counts.push_back((now, count));
                while let Some(&(t, _)) = window_counts.front() {
                    if now.duration_since(t) > BITRATE_WINDOW {
                        window_counts.pop_front();
                    } else {
                        break;
                    }
                }
                let packets_in_window: usize = window_counts.iter().map(|(_, c)| c).sum();
                stats
                    .bitrate_bps
                    .store((packets_in_window as u64) * PACKET_SIZE as u64 * 8, Ordering::Relaxed);
            }
            Ok(_) => {} // timed out with no data
            Err(err) => {
                log::warn!("reader: DVR read error: {err}");
            }
        }
    }
}
