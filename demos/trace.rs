//! Run with e.g. `HEAPTRAP_TRACE=1 HEAPTRAP_MAX_COUNT=50 HEAPTRAP_MAX_COUNT_FATAL=0`
//! to watch a program run into a limit and carry on.

use heaptrap::{Config, StderrSink, Trap};

#[global_allocator]
static GLOBAL: Trap = Trap::new(heaptrap::DlsymNext, StderrSink, Config::from_env);

fn main() {
    // stdout's buffer, before there is any chance of it being refused
    println!("allocating");
    let mut boxes = Vec::with_capacity(100);
    for i in 0..100u64 {
        // `try_reserve` lets us see a refusal instead of aborting
        let mut v: Vec<u64> = Vec::new();
        if v.try_reserve_exact(4).is_err() {
            println!("refused after {i} boxes");
            break;
        }
        v.push(i);
        boxes.push(v);
    }

    let stats = GLOBAL.stats();
    drop(boxes);
    println!(
        "{} live allocations, {} bytes (peak {} / {})",
        stats.tracked_count, stats.tracked_bytes, stats.peak_count, stats.peak_bytes
    );
    println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
}
