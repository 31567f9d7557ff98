use std::collections::VecDeque;

/// Tracks recent action fingerprints and reports runs of identical ones.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    history: VecDeque<String>,
    capacity: usize,
    threshold: u32,
}

impl LoopDetector {
    pub fn new(threshold: u32, capacity: usize) -> Self {
        Self {
            history: VecDeque::new(),
            capacity: capacity.max(threshold as usize),
            threshold,
        }
    }

    /// Records `fingerprint`; true when it completes a run of `threshold`
    /// identical consecutive actions. The run is forgotten once reported.
    pub fn record(&mut self, fingerprint: &str) -> bool {
        self.history.push_back(fingerprint.to_string());
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        if self.streak() >= self.threshold as usize {
            self.history.clear();
            return true;
        }
        false
    }

    /// Length of the identical run at the tail of the history.
    pub fn streak(&self) -> usize {
        let Some(last) = self.history.back() else {
            return 0;
        };
        self.history.iter().rev().take_while(|f| *f == last).count()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn reconfigure(&mut self, threshold: u32, capacity: usize) {
        self.threshold = threshold;
        self.capacity = capacity.max(threshold as usize);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }
}
