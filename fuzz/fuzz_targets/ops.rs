#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use node_pool_fuzzing::Ops;

/// Live bytes a single run may hold at once.
const ALLOCATION_LIMIT: usize = 1 << 20;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Occasionally let libFuzzer mutate the raw bytes.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(data).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    // Drop trailing ops until the encoding fits in `data`.
    loop {
        if let Ok(new_size) = bincode::encode_into_slice(&ops, data, bincode_config()) {
            return new_size;
        }
        if !ops.pop() {
            return fuzzer_mutate(data, size, max_size);
        }
    }
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = decode(data) else {
        return;
    };
    if let Err(e) = ops.run(ALLOCATION_LIMIT) {
        panic!("pool invariant violated: {e}");
    }
});
