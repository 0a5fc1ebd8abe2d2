use crate::utils::snowflake::SnowflakeGenerator;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread_local;

static THREAD_COUNTER: AtomicUsize = AtomicUsize::new(0);
static SERVER_ID: AtomicU8 = AtomicU8::new(0);

thread_local! {
    static GENERATOR: RefCell<Option<SnowflakeGenerator>> = const { RefCell::new(None) };
}

/// Must run before the first `generate_id` on any thread to take effect there.
pub fn set_server_id(server_id: u8) {
    SERVER_ID.store(server_id, Ordering::Relaxed);
}

/// Each thread lazily gets its own generator with a distinct worker id.
pub fn generate_id() -> u64 {
    GENERATOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let generator = slot.get_or_insert_with(|| {
            let worker_id = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed) as u64;
            SnowflakeGenerator::new(SERVER_ID.load(Ordering::Relaxed), worker_id)
        });
        generator.generate()
    })
}

pub fn generate_id_string() -> String {
    generate_id().to_string()
}
