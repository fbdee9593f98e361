//! Handshake admission rate limiter
//!
//! Two 4096-cell byte arrays, each indexed by an independent SipHash-2-4
//! of the source IP; the pair forms a tiny CountMin sketch. Every
//! initiation bumps both cells and is admitted while the smaller cell is
//! under the accumulation cap. Cells decay each second, and a flood that
//! exhausts the global per-second budget halves the decay rate, giving
//! exponential back-off until traffic calms down.

use rand::RngCore;

use crate::crypto::siphash::siphash_u64;

/// Cells per hash bin
const BIN_SIZE: usize = 4096;

/// Baseline decay per cell per second
const PACKETS_PER_SEC: u32 = 25;

/// Per-IP accumulation cap; a cell at or above this blocks admission
const PACKET_ACCUM: u8 = 100;

/// Global admissions per second before the flood back-off kicks in
const TOTAL_PACKETS_PER_SEC: u32 = 25_000;

/// Outcome of an admission probe, applied with [`RateLimiter::commit`]
/// only if the caller goes on to process the packet.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    cell_a: usize,
    cell_b: usize,
    new_value: u8,
    admitted: bool,
}

impl Admission {
    pub fn is_rate_limited(&self) -> bool {
        !self.admitted
    }

    /// First packet seen from this source since its cells decayed out
    pub fn is_first_from_ip(&self) -> bool {
        self.new_value == 1
    }
}

pub struct RateLimiter {
    bins: Box<[[u8; BIN_SIZE]; 2]>,
    key1: [u64; 2],
    key2: [u64; 2],
    packets_per_sec: u32,
    used_rate_limit: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            bins: Box::new([[0u8; BIN_SIZE]; 2]),
            key1: [rng.next_u64(), rng.next_u64()],
            key2: [rng.next_u64(), rng.next_u64()],
            packets_per_sec: PACKETS_PER_SEC,
            used_rate_limit: 0,
        }
    }

    /// Probe both cells for a packed source IP.
    pub fn check(&self, ip: u64) -> Admission {
        let cell_a = (siphash_u64(self.key1[0], self.key1[1], ip) as usize) % BIN_SIZE;
        let cell_b = (siphash_u64(self.key2[0], self.key2[1], ip) as usize) % BIN_SIZE;
        let floor = self.bins[0][cell_a].min(self.bins[1][cell_b]);
        Admission {
            cell_a,
            cell_b,
            new_value: floor.saturating_add(1),
            admitted: floor < PACKET_ACCUM,
        }
    }

    /// Charge an admitted packet: raise both cells and burn global budget.
    pub fn commit(&mut self, admission: &Admission) {
        self.bins[0][admission.cell_a] = self.bins[0][admission.cell_a].max(admission.new_value);
        self.bins[1][admission.cell_b] = self.bins[1][admission.cell_b].max(admission.new_value);
        self.used_rate_limit += 1;
        if self.used_rate_limit == TOTAL_PACKETS_PER_SEC {
            // Flood: halve the decay rate until things calm down
            self.packets_per_sec = (self.packets_per_sec + 1) >> 1;
        }
    }

    /// Anything charged recently, or still recovering from a flood.
    ///
    /// This is the device's "under load" signal: while true, initiations
    /// must carry a valid mac2.
    pub fn is_used(&self) -> bool {
        self.used_rate_limit != 0 || self.packets_per_sec != PACKETS_PER_SEC
    }

    /// Once-per-second maintenance.
    ///
    /// Decays every cell by the current rate, walks the decay rate back
    /// toward baseline, and re-keys the hashes from `seed` whenever the
    /// limiter goes fully idle (cheap, and unlearns any bin-targeting).
    pub fn periodic(&mut self, seed: [u32; 5]) {
        let decay = self.packets_per_sec.min(u8::MAX as u32) as u8;
        for bin in self.bins.iter_mut() {
            for cell in bin.iter_mut() {
                *cell = cell.saturating_sub(decay);
            }
        }

        if self.used_rate_limit < TOTAL_PACKETS_PER_SEC {
            self.packets_per_sec = (self.packets_per_sec * 2).min(PACKETS_PER_SEC);
        }
        self.used_rate_limit = 0;

        if !self.is_used() && self.bins.iter().all(|bin| bin.iter().all(|&c| c == 0)) {
            let mix = |a: u32, b: u32| ((a as u64) << 32) | b as u64;
            self.key1 = [mix(seed[0], seed[1]), mix(seed[2], seed[3])];
            self.key2 = [
                mix(seed[4], seed[0].rotate_left(13) ^ seed[2]),
                mix(seed[1].rotate_left(7) ^ seed[3], seed[4].rotate_left(21)),
            ];
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
