//! Producer thread simulating staggered request arrivals
//!
//! Replays each request's `arrival_delay_ms` relative to a common start
//! instant, submitting to the arrival queue at the scheduled time, then
//! signals completion.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::info;

use crate::serving::arrival_queue::ArrivalQueue;
use crate::serving::request::Request;

/// Spawn the submission thread. Requests must be sorted by arrival delay if
/// FIFO arrival order is expected; each is submitted once its delay elapses.
pub fn spawn_submitter(requests: Vec<Request>, queue: Arc<ArrivalQueue>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let start = Instant::now();
        let total = requests.len();

        for request in requests {
            let target = Duration::from_millis(request.arrival_delay_ms);
            let elapsed = start.elapsed();
            if target > elapsed {
                std::thread::sleep(target - elapsed);
            }

            info!(
                "request {} arrived (delay={}ms, prompt={:?})",
                request.id,
                request.arrival_delay_ms,
                truncate(&request.prompt, 20)
            );
            queue.submit(request);
        }

        queue.mark_done();
        info!("all {} requests submitted", total);
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
