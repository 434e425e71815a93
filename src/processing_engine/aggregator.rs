//! Per-batch detection aggregation shared by the frame workers

use crate::detection_log_service::EmployeeDetection;
use crate::employee_registry::EmployeeMatch;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Confidence is summed in millionths so the total does not depend on
/// the order workers finish in.
const CONFIDENCE_SCALE: f64 = 1_000_000.0;

/// What one frame contributed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub faces_detected: u64,
    pub matches: Vec<EmployeeMatch>,
}

impl FrameOutcome {
    pub fn faces_unknown(&self) -> u64 {
        self.faces_detected.saturating_sub(self.matches.len() as u64)
    }
}

#[derive(Debug, Default)]
struct Tally {
    name: String,
    count: u64,
    confidence_micros: u64,
}

#[derive(Debug, Default)]
struct State {
    frames_processed: u64,
    frames_failed: u64,
    faces_detected: u64,
    faces_recognized: u64,
    faces_unknown: u64,
    employees: BTreeMap<String, Tally>,
}

/// Totals for one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSummary {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub faces_detected: u64,
    pub faces_recognized: u64,
    pub faces_unknown: u64,
    /// Sorted by employee id
    pub detections: Vec<EmployeeDetection>,
}

impl AggregateSummary {
    /// Every frame failed (and there was at least one)
    pub fn all_frames_failed(&self) -> bool {
        self.frames_processed == 0 && self.frames_failed > 0
    }
}

#[derive(Debug, Default)]
pub struct DetectionAggregator {
    state: Mutex<State>,
}

impl DetectionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_frame(&self, outcome: &FrameOutcome) {
        let mut state = self.lock();
        state.frames_processed += 1;
        state.faces_detected += outcome.faces_detected;
        state.faces_recognized += outcome.matches.len() as u64;
        state.faces_unknown += outcome.faces_unknown();

        for m in &outcome.matches {
            let tally = state.employees.entry(m.employee_id.clone()).or_default();
            if tally.name.is_empty() {
                tally.name = m.name.clone();
            }
            tally.count += 1;
            tally.confidence_micros += (m.confidence() * CONFIDENCE_SCALE).round() as u64;
        }
    }

    pub fn add_failure(&self) {
        self.lock().frames_failed += 1;
    }

    pub fn summary(&self) -> AggregateSummary {
        let state = self.lock();
        let detections = state
            .employees
            .iter()
            .map(|(employee_id, tally)| EmployeeDetection {
                employee_id: employee_id.clone(),
                name: tally.name.clone(),
                detection_count: tally.count,
                average_confidence: if tally.count == 0 {
                    0.0
                } else {
                    tally.confidence_micros as f64 / tally.count as f64 / CONFIDENCE_SCALE
                },
            })
            .collect();

        AggregateSummary {
            frames_processed: state.frames_processed,
            frames_failed: state.frames_failed,
            faces_detected: state.faces_detected,
            faces_recognized: state.faces_recognized,
            faces_unknown: state.faces_unknown,
            detections,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn matched(id: &str, distance: f64) -> EmployeeMatch {
        EmployeeMatch {
            employee_id: id.to_string(),
            name: format!("Name {}", id),
            distance,
        }
    }

    fn outcomes() -> Vec<FrameOutcome> {
        vec![
            FrameOutcome {
                faces_detected: 2,
                matches: vec![matched("E1", 0.2)],
            },
            FrameOutcome {
                faces_detected: 1,
                matches: vec![matched("E1", 0.35)],
            },
            FrameOutcome::default(),
            FrameOutcome {
                faces_detected: 3,
                matches: vec![matched("E2", 0.1), matched("E1", 0.45)],
            },
        ]
    }

    #[test]
    fn test_totals() {
        let agg = DetectionAggregator::new();
        for o in outcomes() {
            agg.add_frame(&o);
        }
        agg.add_failure();

        let summary = agg.summary();
        assert_eq!(summary.frames_processed, 4);
        assert_eq!(summary.frames_failed, 1);
        assert_eq!(summary.faces_detected, 6);
        assert_eq!(summary.faces_recognized, 4);
        assert_eq!(summary.faces_unknown, 2);
        assert!(!summary.all_frames_failed());

        assert_eq!(summary.detections.len(), 2);
        let e1 = &summary.detections[0];
        assert_eq!(e1.employee_id, "E1");
        assert_eq!(e1.detection_count, 3);
        assert!((e1.average_confidence - (0.8 + 0.65 + 0.55) / 3.0).abs() < 1e-6);
        assert_eq!(summary.detections[1].detection_count, 1);
    }

    #[test]
    fn test_order_independent() {
        let forward = DetectionAggregator::new();
        for o in outcomes() {
            forward.add_frame(&o);
        }
        let reverse = DetectionAggregator::new();
        for o in outcomes().iter().rev() {
            reverse.add_frame(o);
        }
        let rotated = DetectionAggregator::new();
        let mut list = outcomes();
        list.rotate_left(2);
        for o in &list {
            rotated.add_frame(o);
        }

        assert_eq!(forward.summary(), reverse.summary());
        assert_eq!(forward.summary(), rotated.summary());
    }

    #[tokio::test]
    async fn test_concurrent_workers() {
        let agg = Arc::new(DetectionAggregator::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let agg = agg.clone();
            tasks.push(tokio::spawn(async move {
                agg.add_frame(&FrameOutcome {
                    faces_detected: 1,
                    matches: vec![matched(if i % 2 == 0 { "E1" } else { "E2" }, 0.25)],
                });
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let summary = agg.summary();
        assert_eq!(summary.frames_processed, 16);
        assert_eq!(summary.detections[0].detection_count, 8);
        assert_eq!(summary.detections[1].detection_count, 8);
        assert!((summary.detections[0].average_confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_all_frames_failed() {
        let agg = DetectionAggregator::new();
        assert!(!agg.summary().all_frames_failed());
        agg.add_failure();
        agg.add_failure();
        assert!(agg.summary().all_frames_failed());
    }
}
