use crate::avg::SlidingAvg;

/// Counts the bytes transferred in one direction of a channel.
///
/// The counter is advanced with [`Counter::tick`], which is expected to be
/// called roughly once a second by the owner's periodic loop; the rolling
/// average it maintains is therefore a bytes-per-second rate.
#[derive(Debug, Default)]
pub struct Counter {
    /// The total number of bytes since the counter was created.
    total: u64,
    /// The number of bytes recorded in the current round, folded into the
    /// average on the next tick.
    round: u64,
    /// The highest per-round throughput observed.
    peak: u64,
    /// The rolling per-round (i.e. per second) throughput average.
    avg: SlidingAvg,
}

impl Counter {
    pub fn add(&mut self, bytes: u64) {
        self.round += bytes;
    }

    /// Folds the current round into the average and starts a new round.
    pub fn tick(&mut self) {
        self.total += self.round;
        self.peak = self.peak.max(self.round);
        self.avg.update(self.round as i64);
        self.round = 0;
    }

    pub fn total(&self) -> u64 {
        self.total + self.round
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// The rolling per second average.
    pub fn avg(&self) -> u64 {
        self.avg.mean().max(0) as u64
    }

    /// The bytes recorded since the last tick.
    pub fn round(&self) -> u64 {
        self.round
    }
}

/// A pair of counters for the two directions of a channel.
#[derive(Debug, Default)]
pub struct ChannelCounter {
    pub down: Counter,
    pub up: Counter,
}

impl ChannelCounter {
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
    }
}

/// The per-session (and, aggregated, per-torrent) transfer statistics.
#[derive(Debug, Default)]
pub struct ThruputCounters {
    /// Payload bytes: the actual torrent content in `piece` messages.
    pub payload: ChannelCounter,
    /// Protocol chatter: everything that is not block payload.
    pub protocol: ChannelCounter,
    /// Bytes received that were dropped: duplicate blocks, blocks arriving
    /// after cancellation, unsolicited blocks.
    pub waste: Counter,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.payload.tick();
        self.protocol.tick();
        self.waste.tick();
    }

    /// Takes a plain-number snapshot suitable for sending across tasks.
    pub fn snapshot(&self) -> ThruputSnapshot {
        ThruputSnapshot {
            payload_down_total: self.payload.down.total(),
            payload_up_total: self.payload.up.total(),
            payload_down_rate: self.payload.down.avg(),
            payload_up_rate: self.payload.up.avg(),
            protocol_down_total: self.protocol.down.total(),
            protocol_up_total: self.protocol.up.total(),
            waste_total: self.waste.total(),
        }
    }
}

/// A copyable snapshot of [`ThruputCounters`], taken once per tick and
/// shipped to the torrent for choking decisions and stats aggregation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThruputSnapshot {
    pub payload_down_total: u64,
    pub payload_up_total: u64,
    /// Rolling per second rates.
    pub payload_down_rate: u64,
    pub payload_up_rate: u64,
    pub protocol_down_total: u64,
    pub protocol_up_total: u64,
    pub waste_total: u64,
}
