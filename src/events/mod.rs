//! Event camera data: change-detection events, trigger pulses and the EVT 2.0 format.

pub mod evt2;
pub mod frame_gen;
pub mod source;

pub use frame_gen::FrameGenerator;
pub use source::{Evt2Driver, Evt2Source, Evt2Writer};

/// Change-detection event. `t` is in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdEvent {
    pub x: u16,
    pub y: u16,
    pub polarity: u8,
    pub t: u64,
}

/// Edge seen on the external trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub t: u64,
    pub id: u8,
    pub polarity: u8,
}

/// Events decoded from one read of the stream, each list in time order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub cd: Vec<CdEvent>,
    pub triggers: Vec<TriggerEvent>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.cd.is_empty() && self.triggers.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        let cd = self.cd.last().map(|e| e.t);
        let trig = self.triggers.last().map(|e| e.t);
        cd.max(trig)
    }
}

/// Counts falling edges on the trigger line. The count is the event camera's frame counter.
#[derive(Debug, Clone)]
pub struct TriggerCounter {
    falling_polarity: u8,
    count: u64,
}

impl TriggerCounter {
    pub fn new(falling_polarity: u8) -> Self {
        Self { falling_polarity, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the new count if `trigger` is a falling edge.
    pub fn observe(&mut self, trigger: &TriggerEvent) -> Option<u64> {
        if trigger.polarity != self.falling_polarity {
            return None;
        }
        self.count += 1;
        Some(self.count)
    }
}
