use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2024-09-05T00:00:00Z
const EPOCH: u64 = 1_725_513_600_000u64;
const COUNTER_BITS: u64 = 12;
const WORKER_BITS: u64 = 5;
const SERVER_BITS: u64 = 5;
const TS_SHIFT: u64 = COUNTER_BITS + SERVER_BITS + WORKER_BITS;

#[derive(Debug, Default)]
struct GeneratorState {
    last_ts: u64,
    counter: u64,
}

/// Time-ordered 64-bit ids: `ts | worker | server | counter`.
/// Ids from one generator are strictly increasing, so the embedded
/// timestamp doubles as the feed sort key.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    state: Mutex<GeneratorState>,
    server_id: u64,
    worker_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    pub timestamp_ms: u64,
    pub server_id: u8,
    pub worker_id: u8,
    pub counter: u16,
}

impl SnowflakeGenerator {
    pub fn new(server_id: u8, worker_id: u64) -> Self {
        Self {
            state: Mutex::new(GeneratorState::default()),
            server_id: u64::from(server_id) & ((1 << SERVER_BITS) - 1),
            worker_id: worker_id & ((1 << WORKER_BITS) - 1),
        }
    }

    fn now_since_epoch() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(EPOCH)
    }

    pub fn generate(&self) -> u64 {
        let seq_mask = (1u64 << COUNTER_BITS) - 1;

        let (ts, counter) = loop {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Self::now_since_epoch();

            // Clock went backwards or the counter is exhausted: wait a tick.
            if now < st.last_ts || (now == st.last_ts && st.counter >= seq_mask) {
                drop(st);
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            if now == st.last_ts {
                st.counter += 1;
            } else {
                st.last_ts = now;
                st.counter = 0;
            }
            break (st.last_ts, st.counter);
        };

        (ts << TS_SHIFT)
            | (self.worker_id << (COUNTER_BITS + SERVER_BITS))
            | (self.server_id << COUNTER_BITS)
            | (counter & seq_mask)
    }

    pub fn parse(id: u64) -> SnowflakeParts {
        SnowflakeParts {
            timestamp_ms: (id >> TS_SHIFT) + EPOCH,
            worker_id: ((id >> (COUNTER_BITS + SERVER_BITS)) & ((1 << WORKER_BITS) - 1)) as u8,
            server_id: ((id >> COUNTER_BITS) & ((1 << SERVER_BITS) - 1)) as u8,
            counter: (id & ((1 << COUNTER_BITS) - 1)) as u16,
        }
    }

    /// Unix milliseconds embedded in a string id, if it is one of ours.
    pub fn timestamp_ms(id: &str) -> Option<u64> {
        id.parse::<u64>().ok().map(|id| Self::parse(id).timestamp_ms)
    }
}
