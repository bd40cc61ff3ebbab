//! Multi-tracker support (BEP 12) and the per-torrent announcer task.
//!
//! The metainfo's `announce-list` is a list of tiers. Within a tier the
//! trackers are shuffled once, then tried in order; across tiers the order
//! is fixed. A tracker that answers is promoted to the head of its tier so
//! subsequent announces reach it first.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use url::Url;

use super::{Announce, Event, Response, Tracker};
use crate::error::tracker::{Result, TrackerError};
use crate::{alert, torrent, InfoHash, PeerId, TorrentId};

pub struct TrackerTiers {
    tiers: Vec<Vec<Tracker>>,
}

impl TrackerTiers {
    /// Builds the tier list, shuffling within each tier as BEP 12
    /// prescribes. URLs that fail to construct a client (unsupported
    /// scheme, unresolvable host) are dropped with a log line.
    pub fn new(tier_urls: Vec<Vec<Url>>) -> Self {
        let mut rng = rand::thread_rng();
        let tiers = tier_urls
            .into_iter()
            .map(|urls| {
                let mut tier: Vec<Tracker> = urls
                    .into_iter()
                    .filter_map(|url| match Tracker::new(url.clone()) {
                        Ok(tracker) => Some(tracker),
                        Err(e) => {
                            log::warn!("Dropping tracker {}: {}", url, e);
                            None
                        }
                    })
                    .collect();
                tier.shuffle(&mut rng);
                tier
            })
            .filter(|tier: &Vec<Tracker>| !tier.is_empty())
            .collect();
        Self { tiers }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Announces to the first tracker that answers, trying tier by tier
    /// and promoting the successful tracker to its tier's head.
    pub async fn announce(
        &mut self,
        params: &Announce,
    ) -> Result<(String, Response)> {
        let mut last_error = TrackerError::Timeout;
        for tier in self.tiers.iter_mut() {
            for index in 0..tier.len() {
                let url = tier[index].url().to_string();
                match tier[index].announce(params).await {
                    Ok(response) => {
                        // promote so the next announce tries it first
                        tier[..=index].rotate_right(1);
                        return Ok((url, response));
                    }
                    Err(e) => {
                        log::debug!("Tracker {} announce failed: {}", url, e);
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }
}

/// The transfer totals the announcer includes with each announce, updated
/// by the torrent through a watch channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Lifecycle events the torrent pushes into the announcer.
#[derive(Debug)]
pub enum AnnouncerCommand {
    /// Announce the completed event (we became a seeder).
    Completed,
    /// Announce the stopped event and exit.
    Shutdown,
}

pub type AnnouncerSender = mpsc::UnboundedSender<AnnouncerCommand>;

/// The per-torrent announcer: owns the tracker tiers and runs the announce
/// schedule, feeding discovered peers back to the torrent.
pub struct Announcer {
    tiers: TrackerTiers,
    torrent_id: TorrentId,
    info_hash: InfoHash,
    client_id: PeerId,
    listen_port: u16,
    /// The interval to fall back to when the tracker doesn't name one.
    default_interval: Duration,
    stats_rx: watch::Receiver<AnnounceStats>,
    cmd_rx: mpsc::UnboundedReceiver<AnnouncerCommand>,
    torrent_tx: torrent::Sender,
    alert_tx: alert::AlertSender,
    /// The tracker id some trackers require us to echo.
    tracker_id: Option<String>,
}

impl Announcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tiers: TrackerTiers,
        torrent_id: TorrentId,
        info_hash: InfoHash,
        client_id: PeerId,
        listen_port: u16,
        default_interval: Duration,
        stats_rx: watch::Receiver<AnnounceStats>,
        torrent_tx: torrent::Sender,
        alert_tx: alert::AlertSender,
    ) -> (Self, AnnouncerSender) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                tiers,
                torrent_id,
                info_hash,
                client_id,
                listen_port,
                default_interval,
                stats_rx,
                cmd_rx,
                torrent_tx,
                alert_tx,
                tracker_id: None,
            },
            cmd_tx,
        )
    }

    /// Runs the announce schedule until shutdown.
    pub async fn run(mut self) {
        if self.tiers.is_empty() {
            log::info!("Torrent {} has no trackers", self.torrent_id);
            // nothing to announce to; wait for shutdown so the stopped
            // event logic stays uniform
            while let Some(cmd) = self.cmd_rx.recv().await {
                if matches!(cmd, AnnouncerCommand::Shutdown) {
                    return;
                }
            }
            return;
        }

        let mut event = Some(Event::Started);
        loop {
            let interval = match self.announce_once(event).await {
                Ok(interval) => {
                    event = None;
                    interval
                }
                Err(e) => {
                    log::warn!(
                        "Torrent {} announce round failed: {}",
                        self.torrent_id,
                        e
                    );
                    // retry on a shortened schedule, keeping the event so
                    // `started` isn't lost
                    self.default_interval.min(Duration::from_secs(60))
                }
            };

            let next_announce = Instant::now() + interval;
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(AnnouncerCommand::Completed) => {
                            if let Err(e) =
                                self.announce_once(Some(Event::Completed)).await
                            {
                                log::warn!(
                                    "Torrent {} completed announce failed: {}",
                                    self.torrent_id,
                                    e
                                );
                            }
                        }
                        Some(AnnouncerCommand::Shutdown) | None => {
                            let _ = self
                                .announce_once(Some(Event::Stopped))
                                .await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_announce.into()) => {}
            }
        }
    }

    /// One announce round: send, record the tracker id, forward peers,
    /// return the interval to the next round.
    async fn announce_once(
        &mut self,
        event: Option<Event>,
    ) -> Result<Duration> {
        let stats = *self.stats_rx.borrow();
        let params = Announce {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: self.listen_port,
            ip: None,
            downloaded: stats.downloaded,
            uploaded: stats.uploaded,
            left: stats.left,
            peer_count: None,
            tracker_id: self.tracker_id.clone(),
            event,
        };

        let (url, response) = self.tiers.announce(&params).await?;

        if response.tracker_id.is_some() {
            self.tracker_id = response.tracker_id.clone();
        }

        let peers: Vec<SocketAddr> = response.all_peers().collect();
        log::info!(
            "Torrent {} announced to {}: {} peers",
            self.torrent_id,
            url,
            peers.len()
        );

        alert::send(
            &self.alert_tx,
            alert::Alert::TrackerAnnounced {
                id: self.torrent_id,
                url,
                peer_count: peers.len(),
            },
        );

        if !peers.is_empty() && !matches!(event, Some(Event::Stopped)) {
            let _ = self.torrent_tx.send(torrent::Command::AvailablePeers {
                addrs: peers,
                source: torrent::PeerSource::Tracker,
            });
        }

        // the next round follows the tracker's interval, but never sooner
        // than its `min interval`
        let interval = response
            .interval
            .unwrap_or(self.default_interval)
            .max(response.min_interval.unwrap_or(Duration::ZERO));
        Ok(interval)
    }
}
