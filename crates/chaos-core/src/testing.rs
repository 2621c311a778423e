//! Test doubles for the hardware seams.

use crate::radio::{Clock, Radio, RoundTimer};
use crate::ChaosConfig;
use chaos_packet::{encode_packet, FloodRecord, Footer, WirePacket};

/// Scriptable radio and clock. Time only moves when a test or a wait moves it.
#[derive(Debug, Default)]
pub struct MockHardware {
    pub now_hi: u64,
    /// Extra ticks added to every `wait_until_hi`.
    pub latency: u64,
    pub radio_on: bool,
    pub transmitted: Vec<Vec<u8>>,
    pub tx_times: Vec<u64>,
    pub compare: Option<u64>,
    pub flushes: u32,
}

impl Radio for MockHardware {
    fn on(&mut self) {
        self.radio_on = true;
    }

    fn off(&mut self) {
        self.radio_on = false;
    }

    fn transmit(&mut self, frame: &[u8]) {
        self.transmitted.push(frame.to_vec());
        self.tx_times.push(self.now_hi);
    }

    fn flush_rx(&mut self) {
        self.flushes += 1;
    }
}

impl Clock for MockHardware {
    fn now_hi(&self) -> u64 {
        self.now_hi
    }

    fn now_lo(&self) -> u64 {
        self.now_hi / 128
    }

    fn capture_next_tick(&mut self) -> (u64, u64) {
        let lo = self.now_hi / 128 + 1;
        self.now_hi = lo * 128;
        (self.now_hi, lo)
    }

    fn wait_until_hi(&mut self, target: u64) -> u64 {
        self.now_hi = self.now_hi.max(target) + self.latency;
        self.now_hi
    }

    fn compensate(&mut self, ticks: u64) {
        self.now_hi += ticks;
    }

    fn arm_compare(&mut self, at: u64) {
        self.compare = Some(at);
    }

    fn cancel_compare(&mut self) {
        self.compare = None;
    }
}

/// Records every round timer request.
#[derive(Debug, Default)]
pub struct MockTimer {
    pub scheduled: Vec<u64>,
}

impl RoundTimer for MockTimer {
    fn schedule_at(&mut self, at: u64) {
        self.scheduled.push(at);
    }
}

/// A received frame (footer included) carrying `record`.
pub fn frame_bytes(
    config: &ChaosConfig,
    record: &FloodRecord,
    header: u8,
    relay_counter: u8,
    crc_ok: bool,
) -> Vec<u8> {
    let layout = config.layout().unwrap();
    let packet = WirePacket {
        header,
        relay_counter: Some(relay_counter),
        record: record.clone(),
        footer: Footer::default(),
    };
    let mut bytes = encode_packet(&packet, &layout).unwrap();
    bytes.extend_from_slice(&Footer::new(-60, crc_ok, 100).to_bytes());
    bytes
}
