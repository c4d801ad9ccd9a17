use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Progress sink that logs once per 10% step.
pub fn log_every_tenth(label: String) -> impl Fn(u64, u64) + Send + Sync + 'static {
    let last_step = AtomicU64::new(u64::MAX);
    move |done, total| {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        let step = percent / 10;
        if last_step.swap(step, Ordering::Relaxed) != step {
            info!("{}: {}% ({} / {} bytes)", label, percent, done, total);
        }
    }
}
