//! Continuous-batching scheduler
//!
//! Each tick produces one single-phase batch: either decode steps for the
//! running set (one token per request) or prefill chunks popped off the
//! pending queue, never both. Decode has priority: a request that has started
//! generating reaches EOS sooner and returns its blocks to the pool.
//!
//! Prefill is chunked against `max_tokens_per_batch`: running requests with
//! prompt tokens left continue first, then new requests are admitted from the
//! pending queue, so a prompt longer than the budget advances one chunk per
//! tick instead of stalling. When the batch is empty the head request is
//! always scheduled at least one token.
//!
//! The scheduler stores request ids only; the forward driver owns the
//! `Request` objects and passes its map in for each call.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::serving::request::{Request, RequestId, RequestStatus};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum requests per batch
    pub max_batch_size: usize,
    /// Maximum total scheduled tokens per batch
    pub max_tokens_per_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_tokens_per_batch: 512,
        }
    }
}

/// One tick's worth of work: `(request id, scheduled token count)` pairs, all
/// in the same phase. Decode entries always carry exactly one token.
#[derive(Debug, Default)]
pub struct ScheduledBatch {
    pub entries: Vec<(RequestId, usize)>,
    pub is_prefill: bool,
    pub total_scheduled_tokens: usize,
}

impl ScheduledBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    pending_queue: VecDeque<RequestId>,
    /// Insertion-ordered ids of requests in Prefilling or Decoding status.
    running: Vec<RequestId>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            pending_queue: VecDeque::new(),
            running: Vec::new(),
        }
    }

    /// Queue a newly arrived request.
    pub fn add_request(&mut self, request: &mut Request) {
        request.status = RequestStatus::Pending;
        self.pending_queue.push_back(request.id);
        debug!("scheduler: queued request {}", request.id);
    }

    /// Form the next batch. Mutates request status for newly admitted
    /// requests (Pending → Prefilling).
    pub fn schedule(&mut self, requests: &mut HashMap<RequestId, Request>) -> ScheduledBatch {
        let mut batch = ScheduledBatch::default();

        // Decode first: never delay an in-flight decode for a new prefill.
        for &id in &self.running {
            let Some(req) = requests.get(&id) else {
                continue;
            };
            if req.status != RequestStatus::Decoding {
                continue;
            }
            if batch.size() >= self.config.max_batch_size
                || batch.total_scheduled_tokens + 1 > self.config.max_tokens_per_batch
            {
                break;
            }
            batch.entries.push((id, 1));
            batch.total_scheduled_tokens += 1;
        }
        if !batch.is_empty() {
            batch.is_prefill = false;
            return batch;
        }

        // Otherwise schedule prefill chunks. Running requests still mid-way
        // through their prompt continue first, in admission order.
        for &id in &self.running {
            if batch.size() >= self.config.max_batch_size {
                break;
            }
            let Some(req) = requests.get_mut(&id) else {
                continue;
            };
            if req.status != RequestStatus::Prefilling {
                continue;
            }

            let remaining = req.remaining_prompt();
            let mut budget_left = self
                .config
                .max_tokens_per_batch
                .saturating_sub(batch.total_scheduled_tokens);
            if batch.is_empty() {
                budget_left = budget_left.max(1);
            }
            let chunk = remaining.min(budget_left);
            if chunk == 0 {
                break;
            }
            batch.entries.push((id, chunk));
            batch.total_scheduled_tokens += chunk;
        }

        // Then admit new requests from the pending queue.
        while batch.size() < self.config.max_batch_size {
            let Some(&id) = self.pending_queue.front() else {
                break;
            };
            let Some(req) = requests.get_mut(&id) else {
                self.pending_queue.pop_front();
                continue;
            };

            let remaining = req.remaining_prompt();
            let mut budget_left = self
                .config
                .max_tokens_per_batch
                .saturating_sub(batch.total_scheduled_tokens);
            if batch.is_empty() {
                // Always make progress on the head request, even when the
                // budget is smaller than one token.
                budget_left = budget_left.max(1);
            }
            let chunk = remaining.min(budget_left);
            if chunk == 0 {
                break;
            }

            self.pending_queue.pop_front();
            req.status = RequestStatus::Prefilling;
            self.running.push(id);
            batch.entries.push((id, chunk));
            batch.total_scheduled_tokens += chunk;
            debug!(
                "scheduler: admitted request {} ({} of {} prompt tokens)",
                id, chunk, remaining
            );
        }

        batch.is_prefill = !batch.is_empty();
        batch
    }

    /// Mark a request finished and drop it from the running set.
    pub fn finish_request(&mut self, request: &mut Request) {
        request.status = RequestStatus::Finished;
        self.remove_running(request.id);
        debug!("scheduler: request {} finished", request.id);
    }

    /// Drop a failed request from the running set. The caller has already set
    /// the failure status and reason.
    pub fn fail_request(&mut self, request: &mut Request) {
        request.status = RequestStatus::Failed;
        self.remove_running(request.id);
        debug!("scheduler: request {} failed", request.id);
    }

    fn remove_running(&mut self, id: RequestId) {
        self.running.retain(|&r| r != id);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_queue.is_empty()
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn has_work(&self) -> bool {
        self.has_pending() || self.has_running()
    }

    pub fn num_pending(&self) -> usize {
        self.pending_queue.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serving::request::SamplingParams;

    fn make_request(id: RequestId, prompt_len: usize) -> Request {
        let mut req = Request::new(id, "p", SamplingParams::default());
        req.prompt_tokens = (0..prompt_len as u32).collect();
        req
    }

    fn setup(
        prompts: &[usize],
        config: SchedulerConfig,
    ) -> (Scheduler, HashMap<RequestId, Request>) {
        let mut scheduler = Scheduler::new(config);
        let mut requests = HashMap::new();
        for (i, &len) in prompts.iter().enumerate() {
            let mut req = make_request(i as RequestId, len);
            scheduler.add_request(&mut req);
            requests.insert(req.id, req);
        }
        (scheduler, requests)
    }

    #[test]
    fn test_empty_scheduler_returns_empty_batch() {
        let (mut scheduler, mut requests) = setup(&[], SchedulerConfig::default());
        assert!(!scheduler.has_work());
        assert!(scheduler.schedule(&mut requests).is_empty());
    }

    #[test]
    fn test_prefill_batch_within_budget() {
        let config = SchedulerConfig {
            max_batch_size: 2,
            max_tokens_per_batch: 4,
        };
        let (mut scheduler, mut requests) = setup(&[2, 2], config);

        let batch = scheduler.schedule(&mut requests);
        assert!(batch.is_prefill);
        assert_eq!(batch.entries, vec![(0, 2), (1, 2)]);
        assert_eq!(batch.total_scheduled_tokens, 4);
        assert_eq!(requests[&0].status, RequestStatus::Prefilling);
        assert_eq!(scheduler.num_running(), 2);
    }

    #[test]
    fn test_chunked_prefill_across_ticks() {
        // Prompt of 10 against a budget of 4: chunks of 4, 4, 2.
        let config = SchedulerConfig {
            max_batch_size: 8,
            max_tokens_per_batch: 4,
        };
        let (mut scheduler, mut requests) = setup(&[10], config);

        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.entries, vec![(0, 4)]);
        assert_eq!(requests[&0].status, RequestStatus::Prefilling);

        // The driver advances the cursor; the request stays running.
        requests.get_mut(&0).unwrap().prefill_cursor = 4;
        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.entries, vec![(0, 4)]);

        requests.get_mut(&0).unwrap().prefill_cursor = 8;
        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.entries, vec![(0, 2)]);
    }

    #[test]
    fn test_decode_has_priority_over_prefill() {
        let config = SchedulerConfig {
            max_batch_size: 4,
            max_tokens_per_batch: 16,
        };
        let (mut scheduler, mut requests) = setup(&[2, 2], config);

        // First tick: both prefill
        let batch = scheduler.schedule(&mut requests);
        assert!(batch.is_prefill);
        for (id, _) in &batch.entries {
            let req = requests.get_mut(id).unwrap();
            req.prefill_cursor = req.num_prompt_tokens();
            req.status = RequestStatus::Decoding;
        }

        // New arrival must wait: decode wins
        let mut late = make_request(9, 3);
        scheduler.add_request(&mut late);
        requests.insert(9, late);

        let batch = scheduler.schedule(&mut requests);
        assert!(!batch.is_prefill);
        assert_eq!(batch.entries, vec![(0, 1), (1, 1)]);
        assert_eq!(batch.total_scheduled_tokens, 2);
        assert_eq!(requests[&9].status, RequestStatus::Pending);
    }

    #[test]
    fn test_decode_batch_never_mixes_prefill() {
        let config = SchedulerConfig {
            max_batch_size: 8,
            max_tokens_per_batch: 512,
        };
        let (mut scheduler, mut requests) = setup(&[2, 4], config);

        // Admit request 0, finish its prefill
        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.size(), 2);
        let req0 = requests.get_mut(&0).unwrap();
        req0.prefill_cursor = 2;
        req0.status = RequestStatus::Decoding;

        // Request 1 still prefilling, a third arrives
        let mut late = make_request(2, 2);
        scheduler.add_request(&mut late);
        requests.insert(2, late);

        let batch = scheduler.schedule(&mut requests);
        assert!(!batch.is_prefill);
        assert_eq!(batch.entries, vec![(0, 1)]);
    }

    #[test]
    fn test_max_batch_size_limits_admission() {
        let config = SchedulerConfig {
            max_batch_size: 2,
            max_tokens_per_batch: 512,
        };
        let (mut scheduler, mut requests) = setup(&[1, 1, 1, 1], config);

        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.size(), 2);
        assert_eq!(scheduler.num_pending(), 2);
    }

    #[test]
    fn test_head_request_always_progresses() {
        // Budget of zero is degenerate; the empty-batch exemption still
        // schedules one token for the head request.
        let config = SchedulerConfig {
            max_batch_size: 4,
            max_tokens_per_batch: 0,
        };
        let (mut scheduler, mut requests) = setup(&[5], config);

        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.entries, vec![(0, 1)]);
    }

    #[test]
    fn test_budget_stops_second_admission() {
        let config = SchedulerConfig {
            max_batch_size: 4,
            max_tokens_per_batch: 6,
        };
        let (mut scheduler, mut requests) = setup(&[4, 4], config);

        // First takes 4, second gets the leftover 2
        let batch = scheduler.schedule(&mut requests);
        assert_eq!(batch.entries, vec![(0, 4), (1, 2)]);
        assert_eq!(batch.total_scheduled_tokens, 6);
    }

    #[test]
    fn test_finish_request_removes_from_running() {
        let (mut scheduler, mut requests) = setup(&[2], SchedulerConfig::default());
        scheduler.schedule(&mut requests);
        assert!(scheduler.has_running());

        let mut req = requests.remove(&0).unwrap();
        scheduler.finish_request(&mut req);
        assert_eq!(req.status, RequestStatus::Finished);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn test_fail_request_removes_from_running() {
        let (mut scheduler, mut requests) = setup(&[2], SchedulerConfig::default());
        scheduler.schedule(&mut requests);

        let mut req = requests.remove(&0).unwrap();
        scheduler.fail_request(&mut req);
        assert_eq!(req.status, RequestStatus::Failed);
        assert!(!scheduler.has_work());
    }
}
