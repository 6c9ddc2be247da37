//! Single-writer aggregation of processed curves.
//!
//! Pool workers finish in any order. Each result is handed to the
//! [`Aggregator`] under its sequence number; with reordering enabled the
//! curves are applied to the running average strictly in acquisition order.
//! A frame that failed to project is still reported (as `None`) so the
//! sequence never stalls.

use crate::data::processor::{ProcessedCurve, RunningAverage};
use std::collections::BTreeMap;
use tracing::trace;

/// Running average plus the reorder buffer feeding it.
#[derive(Debug, Clone)]
pub struct Aggregator {
    average: RunningAverage,
    reorder: bool,
    pending: BTreeMap<u64, Option<ProcessedCurve>>,
    next_seq: Option<u64>,
}

impl Aggregator {
    /// Empty aggregator averaging over `window` curves
    pub fn new(window: usize, reorder: bool) -> Self {
        Self {
            average: RunningAverage::new(window),
            reorder,
            pending: BTreeMap::new(),
            next_seq: Some(0),
        }
    }

    /// Hand over the result for frame `seq`.
    ///
    /// Returns the running averages produced by every curve applied as a
    /// consequence, oldest first.
    pub fn submit(&mut self, seq: u64, curve: Option<ProcessedCurve>) -> Vec<ProcessedCurve> {
        if !self.reorder {
            return curve.and_then(|c| self.apply(c)).into_iter().collect();
        }

        let next = *self.next_seq.get_or_insert(seq);
        if seq < next {
            trace!(seq, next, "discarding result from before resync");
            return Vec::new();
        }
        self.pending.insert(seq, curve);

        let mut averages = Vec::new();
        let mut cursor = next;
        while let Some(entry) = self.pending.remove(&cursor) {
            cursor += 1;
            if let Some(average) = entry.and_then(|c| self.apply(c)) {
                averages.push(average);
            }
        }
        self.next_seq = Some(cursor);
        averages
    }

    fn apply(&mut self, curve: ProcessedCurve) -> Option<ProcessedCurve> {
        self.average.push(curve).cloned()
    }

    /// Forget pending results and restart numbering at 0 (new producer).
    pub fn restart_sequence(&mut self) {
        self.pending.clear();
        self.next_seq = Some(0);
    }

    /// Forget pending results and follow whatever sequence arrives next.
    pub fn resync(&mut self) {
        self.pending.clear();
        self.next_seq = None;
    }

    /// Change the window and recompute from the retained curves
    pub fn set_window(&mut self, window: usize) -> Option<ProcessedCurve> {
        self.average.set_window(window).cloned()
    }

    /// Apply curves in acquisition order or in completion order
    pub fn set_reorder(&mut self, reorder: bool) {
        self.reorder = reorder;
    }

    /// Results waiting for an earlier sequence number
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The running average
    pub fn average(&self) -> &RunningAverage {
        &self.average
    }

    /// Drop curves and average. Pending results are discarded.
    pub fn clear(&mut self) {
        self.average.clear();
        self.resync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(seq: u64, value: f64) -> ProcessedCurve {
        ProcessedCurve::new(seq, 1.0, BTreeMap::from([(0, value)]))
    }

    #[test]
    fn out_of_order_results_are_applied_in_sequence() {
        let mut agg = Aggregator::new(10, true);
        assert!(agg.submit(1, Some(curve(1, 1.0))).is_empty());
        assert!(agg.submit(2, Some(curve(2, 2.0))).is_empty());
        assert_eq!(agg.pending(), 2);

        let averages = agg.submit(0, Some(curve(0, 0.0)));
        assert_eq!(averages.len(), 3);
        assert_eq!(averages.last().unwrap().seq, 2);
        let order: Vec<u64> = agg.average().history().iter().map(|c| c.seq).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn failed_projection_does_not_stall_the_sequence() {
        let mut agg = Aggregator::new(10, true);
        agg.submit(1, Some(curve(1, 1.0)));
        let averages = agg.submit(0, None);
        assert_eq!(averages.len(), 1);
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn completion_order_without_reordering() {
        let mut agg = Aggregator::new(10, false);
        agg.submit(2, Some(curve(2, 2.0)));
        agg.submit(0, Some(curve(0, 0.0)));
        let order: Vec<u64> = agg.average().history().iter().map(|c| c.seq).collect();
        assert_eq!(order, vec![2, 0]);
    }

    #[test]
    fn resync_follows_the_next_sequence() {
        let mut agg = Aggregator::new(10, true);
        agg.submit(0, Some(curve(0, 0.0)));
        agg.clear();
        assert_eq!(agg.submit(7, Some(curve(7, 7.0))).len(), 1);
        // older in-flight result predates the reset
        assert!(agg.submit(5, Some(curve(5, 5.0))).is_empty());
        assert_eq!(agg.average().history().len(), 1);
    }
}
