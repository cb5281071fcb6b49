//! Calibration schedules.
//!
//! Pairwise calibration measures every ordered `(initiator, responder)` pair;
//! triplet calibration measures every ordered 3-permutation of the device set
//! in positions A / B / C.  A [`CalibrationPlan`] hands the rounds out one at a
//! time and keeps `completed.len() == total - remaining.len()`.

use std::collections::VecDeque;

use crate::types::MeasurementType;

/// One scheduled calibration session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Round {
    Pair { initiator: String, responder: String },
    Triplet([String; 3]),
}

impl Round {
    /// Participants in setup order (initiator / A first).
    pub fn devices(&self) -> Vec<String> {
        match self {
            Self::Pair { initiator, responder } => vec![initiator.clone(), responder.clone()],
            Self::Triplet(devices) => devices.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Pairwise,
    Triplet,
}

/// Parameters shared by every round of a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundSettings {
    pub max_count: u32,
    pub measurement_type: MeasurementType,
    /// Antenna delays in ticks.
    pub rx_ticks: u32,
    pub tx_ticks: u32,
}

/// Devices in first-seen order with duplicates removed.
fn distinct(devices: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(devices.len());
    for d in devices {
        if !out.contains(d) {
            out.push(d.clone());
        }
    }
    out
}

/// Every ordered pair of distinct devices: `N × (N − 1)` rounds.
pub fn pairwise_schedule(devices: &[String]) -> Vec<Round> {
    let devices = distinct(devices);
    let mut rounds = Vec::with_capacity(devices.len() * devices.len().saturating_sub(1));
    for initiator in &devices {
        for responder in &devices {
            if initiator != responder {
                rounds.push(Round::Pair {
                    initiator: initiator.clone(),
                    responder: responder.clone(),
                });
            }
        }
    }
    rounds
}

/// Every ordered 3-permutation of distinct devices: `N! / (N − 3)!` rounds.
pub fn triplet_schedule(devices: &[String]) -> Vec<Round> {
    let devices = distinct(devices);
    let n = devices.len();
    let mut rounds = Vec::new();
    for a in 0..n {
        for b in (0..n).filter(|&b| b != a) {
            for c in (0..n).filter(|&c| c != a && c != b) {
                rounds.push(Round::Triplet([
                    devices[a].clone(),
                    devices[b].clone(),
                    devices[c].clone(),
                ]));
            }
        }
    }
    rounds
}

/// Rounds pairing `initiator` with each responder in turn.
pub fn debug_schedule(initiator: &str, responders: &[String]) -> Vec<Round> {
    distinct(responders)
        .into_iter()
        .filter(|r| r != initiator)
        .map(|responder| Round::Pair {
            initiator: initiator.to_owned(),
            responder,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CalibrationPlan {
    pub calibration_id: u64,
    pub kind: PlanKind,
    pub settings: RoundSettings,
    remaining: VecDeque<Round>,
    completed: Vec<Round>,
    total: usize,
}

impl CalibrationPlan {
    pub fn new(calibration_id: u64, kind: PlanKind, settings: RoundSettings, rounds: Vec<Round>) -> Self {
        let total = rounds.len();
        Self {
            calibration_id,
            kind,
            settings,
            remaining: rounds.into(),
            completed: Vec::with_capacity(total),
            total,
        }
    }

    /// Pop the next round and record it as completed.
    pub fn next_round(&mut self) -> Option<Round> {
        let round = self.remaining.pop_front()?;
        self.completed.push(round.clone());
        Some(round)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn completed(&self) -> &[Round] {
        &self.completed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("D{i}")).collect()
    }

    fn settings() -> RoundSettings {
        RoundSettings {
            max_count: 10,
            measurement_type: MeasurementType::DsTwr,
            rx_ticks: 0,
            tx_ticks: 0,
        }
    }

    #[test]
    fn pairwise_covers_every_ordered_pair_once() {
        for n in 0..6 {
            let rounds = pairwise_schedule(&names(n));
            assert_eq!(rounds.len(), n * n.saturating_sub(1));
            let unique: HashSet<_> = rounds
                .iter()
                .map(|r| match r {
                    Round::Pair { initiator, responder } => {
                        assert_ne!(initiator, responder);
                        (initiator.clone(), responder.clone())
                    }
                    Round::Triplet(_) => panic!("pairwise produced a triplet"),
                })
                .collect();
            assert_eq!(unique.len(), rounds.len());
        }
    }

    #[test]
    fn triplet_covers_every_permutation_once() {
        for n in 0..7 {
            let rounds = triplet_schedule(&names(n));
            let expected = if n < 3 { 0 } else { n * (n - 1) * (n - 2) };
            assert_eq!(rounds.len(), expected);
            let unique: HashSet<_> = rounds.iter().map(Round::devices).collect();
            assert_eq!(unique.len(), rounds.len());
            for r in &rounds {
                let d = r.devices();
                assert!(d[0] != d[1] && d[1] != d[2] && d[0] != d[2]);
            }
        }
    }

    #[test]
    fn duplicate_devices_are_ignored() {
        let devices: Vec<String> = ["A", "B", "A"].map(String::from).to_vec();
        assert_eq!(pairwise_schedule(&devices).len(), 2);
    }

    #[test]
    fn debug_schedule_skips_self_pairing() {
        let responders: Vec<String> = ["B", "A", "C"].map(String::from).to_vec();
        let rounds = debug_schedule("A", &responders);
        assert_eq!(rounds.iter().map(Round::devices).collect::<Vec<_>>(), [["A", "B"], ["A", "C"]]);
    }

    #[test]
    fn plan_bookkeeping_stays_consistent() {
        let mut plan = CalibrationPlan::new(1, PlanKind::Pairwise, settings(), pairwise_schedule(&names(3)));
        assert_eq!(plan.total(), 6);
        while plan.next_round().is_some() {
            assert_eq!(plan.completed().len(), plan.total() - plan.remaining());
        }
        assert_eq!(plan.remaining(), 0);
        assert_eq!(plan.completed().len(), 6);
    }
}
