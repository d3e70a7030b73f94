use std::{
    collections::HashMap,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::entities::ZoneID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ZonePhase {
    Pending = 0,
    Processing = 1,
    Completed = 2,
    Error = 3,
    Skipped = 4,
    Incomplete = 5,
}

impl ZonePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ZonePhase::Processing,
            2 => ZonePhase::Completed,
            3 => ZonePhase::Error,
            4 => ZonePhase::Skipped,
            5 => ZonePhase::Incomplete,
            _ => ZonePhase::Pending,
        }
    }

    /// Counted as done in progress reports.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ZonePhase::Completed | ZonePhase::Error | ZonePhase::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed_zones: usize,
    pub total_zones: usize,
    pub processing: Vec<ZoneID>,
}

/// Lock-free per-run zone phases.
///
/// Every transition is a compare-and-swap from the expected phase, so a zone
/// reaches a done phase, and bumps the counter, at most once.
#[derive(Debug)]
pub struct ProgressTracker {
    zone_ids: Vec<ZoneID>,
    index: HashMap<ZoneID, usize>,
    phases: Vec<AtomicU8>,
    completed: AtomicUsize,
}

impl ProgressTracker {
    pub fn new(zone_ids: impl IntoIterator<Item = ZoneID>) -> Self {
        let zone_ids = zone_ids.into_iter().collect::<Vec<_>>();
        let index = zone_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let phases = zone_ids
            .iter()
            .map(|_| AtomicU8::new(ZonePhase::Pending as u8))
            .collect();
        Self {
            zone_ids,
            index,
            phases,
            completed: AtomicUsize::new(0),
        }
    }

    fn transition(&self, zone_id: ZoneID, from: ZonePhase, to: ZonePhase) -> bool {
        let Some(&i) = self.index.get(&zone_id) else {
            return false;
        };
        let swapped = self.phases[i]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped && to.is_done() {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        swapped
    }

    pub fn start(&self, zone_id: ZoneID) -> bool {
        self.transition(zone_id, ZonePhase::Pending, ZonePhase::Processing)
    }

    pub fn finish(&self, zone_id: ZoneID, phase: ZonePhase) -> bool {
        self.transition(zone_id, ZonePhase::Processing, phase)
    }

    pub fn skip(&self, zone_id: ZoneID) -> bool {
        self.transition(zone_id, ZonePhase::Pending, ZonePhase::Skipped)
    }

    pub fn phase(&self, zone_id: ZoneID) -> Option<ZonePhase> {
        let &i = self.index.get(&zone_id)?;
        Some(ZonePhase::from_u8(self.phases[i].load(Ordering::Acquire)))
    }

    /// Zones still pending, in document order.
    pub fn pending(&self) -> Vec<ZoneID> {
        self.zone_ids
            .iter()
            .zip(self.phases.iter())
            .filter(|(_, p)| p.load(Ordering::Acquire) == ZonePhase::Pending as u8)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn snapshot(&self) -> Progress {
        let processing = self
            .zone_ids
            .iter()
            .zip(self.phases.iter())
            .filter(|(_, p)| p.load(Ordering::Acquire) == ZonePhase::Processing as u8)
            .map(|(id, _)| *id)
            .collect();
        Progress {
            completed_zones: self.completed.load(Ordering::Acquire),
            total_zones: self.zone_ids.len(),
            processing,
        }
    }
}
