//! Snowflake-style identifier generation.
//!
//! Produces process-wide unique, roughly time-ordered 64-bit identifiers
//! used for tunnel IDs and request IDs. Layout: 41-bit millisecond timestamp
//! since 2021-01-01, 10-bit worker ID (derived from the exposed IP), 12-bit
//! per-millisecond sequence.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::TunnelError;

/// Milliseconds between the unix epoch and 2021-01-01T00:00:00Z.
const EPOCH_OFFSET_MS: u64 = 1_609_459_200_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;

/// Generator handed to tunnels; cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct IdGen {
    worker_id: u64,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_ms: u64,
    sequence: u64,
}

impl IdGen {
    pub fn new(worker_id: u64) -> Self {
        Self {
            worker_id: worker_id & WORKER_MASK,
            state: Mutex::new(State::default()),
        }
    }

    /// Derive the worker ID from the low bytes of an IP address, so that
    /// gateway replicas on different hosts draw from disjoint ID spaces.
    pub fn from_ip(ip: IpAddr) -> Self {
        let worker_id = match ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                ((o[2] as u64) << 8) | o[3] as u64
            }
            IpAddr::V6(v6) => {
                let o = v6.octets();
                ((o[14] as u64) << 8) | o[15] as u64
            }
        };
        Self::new(worker_id)
    }

    /// Produce the next identifier, or fail if the clock has moved backwards
    /// past what the sequence window can absorb.
    pub fn next(&self) -> Result<u64, TunnelError> {
        let mut state = self.state.lock().expect("idgen lock poisoned");

        let mut now = current_ms()?;
        if now < state.last_ms {
            // Clock skew: refuse rather than risk duplicate IDs.
            return Err(TunnelError::IdGen(format!(
                "clock moved backwards by {}ms",
                state.last_ms - now
            )));
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; spin to the next.
                while now <= state.last_ms {
                    now = current_ms()?;
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let id = (now << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;

        // The timestamp component keeps this non-zero for any realistic clock.
        Ok(id)
    }
}

fn current_ms() -> Result<u64, TunnelError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| TunnelError::IdGen(e.to_string()))?;
    Ok(elapsed.as_millis() as u64 - EPOCH_OFFSET_MS)
}
