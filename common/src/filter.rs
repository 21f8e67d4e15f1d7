/// Fixed-depth moving average over the most recent samples.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    values: Vec<u32>,
    index: usize,
    count: usize,
    sum: u64,
}

impl RunningAverage {
    /// A zero depth filter has no storage and returns every sample unchanged.
    pub fn new(depth: usize) -> Self {
        Self {
            values: vec![0; depth],
            index: 0,
            count: 0,
            sum: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Pushes `value`, evicting the oldest sample once full, and returns the new average.
    pub fn run(&mut self, value: u32) -> u32 {
        if self.values.is_empty() {
            return value;
        }

        self.sum -= u64::from(self.values[self.index]);
        self.values[self.index] = value;
        self.sum += u64::from(value);
        self.index = (self.index + 1) % self.values.len();
        if self.count < self.values.len() {
            self.count += 1;
        }

        (self.sum / self.count as u64) as u32
    }

    pub fn average(&self) -> Option<u32> {
        (self.count > 0).then(|| (self.sum / self.count as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_partial_window() {
        let mut filter = RunningAverage::new(4);
        assert_eq!(filter.average(), None);
        assert_eq!(filter.run(10), 10);
        assert_eq!(filter.run(20), 15);
        assert_eq!(filter.count(), 2);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut filter = RunningAverage::new(3);
        for value in [30, 30, 30] {
            filter.run(value);
        }
        assert_eq!(filter.run(90), 50);
        assert_eq!(filter.run(90), 70);
        assert_eq!(filter.run(90), 90);
        assert_eq!(filter.count(), 3);
    }

    #[test]
    fn zero_depth_passes_samples_through() {
        let mut filter = RunningAverage::new(0);
        assert_eq!(filter.run(42), 42);
        assert_eq!(filter.average(), None);
    }
}
