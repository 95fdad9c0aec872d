//! End-to-end demo: a three-stage pipeline reporting one percent-done signal.

use taskmeter_core::{MeterOptions, Result};
use taskmeter_progress::{SpawnOptions, Tracker};

fn main() -> Result<()> {
    println!("=== Taskmeter pipeline demo ===\n");

    let job = Tracker::new(MeterOptions {
        total: Some(3.0),
        ..MeterOptions::default()
    });
    job.on(|event| {
        println!(
            "[{:>3.0}%] {}",
            event.ratio * 100.0,
            event.message.as_deref().unwrap_or("-")
        );
    });

    // Stage 1: a fixed step, booked directly on the job.
    job.tick(Some("fetched manifest"))?;

    // Stage 2: 40 files of unknown cost, worth one step overall.
    let scan = job.spawn(SpawnOptions {
        total: Some(40.0),
        ..SpawnOptions::default()
    })?;
    for file in 0..40 {
        scan.tick(Some(&format!("scanned file {file}")))?;
    }

    // Stage 3: whatever is left; land the job exactly on 3.
    let publish = job.spawn(SpawnOptions {
        total: Some(2.0),
        to: Some(3.0),
        ..SpawnOptions::default()
    })?;
    publish.tick(Some("uploaded archive"))?;
    publish.end(Some("published"))?;

    println!("\n[OK] job done: {}/{}", job.current(), job.total()?);
    Ok(())
}
