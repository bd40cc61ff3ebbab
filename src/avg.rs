use std::time::Duration;

/// A running average accumulator with warm-up bias correction.
///
/// Early samples are given a proportionally larger gain than the steady
/// state gain, so the average is meaningful from the first sample instead
/// of being dragged toward zero. The first sample has a gain of 1, the
/// second 1/2, and so on until the inverted gain is reached, after which
/// the gain stays fixed.
///
/// Ported from libtorrent: https://blog.libtorrent.org/2014/09/running-averages/
#[derive(Debug)]
pub struct SlidingAvg {
    /// The current running average, effectively the mean.
    ///
    /// This is a fixed-point value: samples are multiplied by 64 before
    /// adding, and 32 is added before dividing back by 64 when reading, to
    /// eliminate the truncation bias of integer division.
    mean: i64,
    /// The average deviation, in the same fixed-point representation.
    deviation: i64,
    /// The number of samples received, but no more than `inverted_gain`.
    sample_count: usize,
    /// How many initial samples get a higher gain than the steady state.
    inverted_gain: usize,
}

impl SlidingAvg {
    pub fn new(inverted_gain: usize) -> Self {
        SlidingAvg {
            mean: 0,
            deviation: 0,
            sample_count: 0,
            inverted_gain,
        }
    }

    pub fn update(&mut self, mut sample: i64) {
        sample *= 64;

        let deviation = if self.sample_count > 0 {
            (self.mean - sample).abs()
        } else {
            0
        };

        if self.sample_count < self.inverted_gain {
            self.sample_count += 1;
        }

        self.mean += (sample - self.mean) / self.sample_count as i64;

        if self.sample_count > 1 {
            self.deviation +=
                (deviation - self.deviation) / (self.sample_count - 1) as i64;
        }
    }

    pub fn mean(&self) -> i64 {
        if self.sample_count == 0 {
            0
        } else {
            (self.mean + 32) / 64
        }
    }

    pub fn deviation(&self) -> i64 {
        if self.sample_count == 0 {
            0
        } else {
            (self.deviation + 32) / 64
        }
    }
}

impl Default for SlidingAvg {
    /// Creates a sliding average with an inverted gain of 20.
    fn default() -> Self {
        Self::new(20)
    }
}

/// Wraps a [`SlidingAvg`] and converts the statistic to
/// [`std::time::Duration`] units (the underlying layer is milliseconds).
#[derive(Debug)]
pub struct SlidingDurationAvg(SlidingAvg);

impl SlidingDurationAvg {
    pub fn new(inverted_gain: usize) -> Self {
        SlidingDurationAvg(SlidingAvg::new(inverted_gain))
    }

    pub fn update(&mut self, sample: Duration) {
        let ms = sample.as_millis().try_into().expect("millisecond overflow");
        self.0.update(ms);
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.0.mean() as u64)
    }

    pub fn deviation(&self) -> Duration {
        Duration::from_millis(self.0.deviation() as u64)
    }
}

impl Default for SlidingDurationAvg {
    /// Creates a sliding average with an inverted gain of 20.
    fn default() -> Self {
        SlidingDurationAvg(SlidingAvg::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_average() {
        let inverted_gain = 4;
        let mut a = SlidingAvg::new(inverted_gain);

        // the first sample should have a weight of 100%
        let sample = 10;
        a.update(sample);
        assert_eq!(a.sample_count, 1);
        assert_eq!(a.mean(), sample);

        // the second sample should have less weight
        let sample = 15;
        a.update(sample);
        assert_eq!(a.sample_count, 2);
        assert_eq!(a.mean(), 13);

        // the third sample even less
        let sample = 20;
        a.update(sample);
        assert_eq!(a.sample_count, 3);
        assert_eq!(a.mean(), 15);

        // The fourth sample reaches the inverted gain, after which the
        // sample count stops increasing and the gain stays fixed.
        let sample = 19;
        a.update(sample);
        assert_eq!(a.sample_count, 4);
        assert_eq!(a.mean(), 16);

        let sample = 20;
        a.update(sample);
        assert_eq!(a.sample_count, 4);
        assert_eq!(a.mean(), 17);

        // a large sample only moves the mean proportionally to its weight,
        // that is by (sample - mean) / 4
        let sample = 117;
        a.update(sample);
        assert_eq!(a.mean(), 43);
    }

    #[test]
    fn test_sliding_duration_average() {
        // the averaging itself is shared with `SlidingAvg`, only the
        // i64 <-> Duration conversions need a check
        let mut a = SlidingDurationAvg::default();

        let sample = Duration::from_secs(10);
        a.update(sample);
        assert_eq!(a.0.sample_count, 1);
        assert_eq!(a.mean(), sample);
    }
}
