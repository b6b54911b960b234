//! Aggregate throughput metrics for a benchmark run

use crate::serving::request::Request;

#[derive(Debug, Default, Clone)]
pub struct BenchmarkMetrics {
    pub total_requests: usize,
    pub total_prompt_tokens: usize,
    pub total_generated_tokens: usize,
    pub total_prefill_time_ms: f64,
    pub total_decode_time_ms: f64,
    pub total_time_ms: f64,
}

impl BenchmarkMetrics {
    /// Fold one finished (or failed) request into the totals.
    pub fn add_request(&mut self, request: &Request) {
        self.total_requests += 1;
        self.total_prompt_tokens += request.num_prompt_tokens();
        self.total_generated_tokens += request.num_generated_tokens();
        self.total_prefill_time_ms += request.prefill_time_ms;
        self.total_decode_time_ms += request.decode_time_ms;
    }

    pub fn prefill_tokens_per_sec(&self) -> f64 {
        if self.total_prefill_time_ms > 0.0 {
            self.total_prompt_tokens as f64 * 1000.0 / self.total_prefill_time_ms
        } else {
            0.0
        }
    }

    pub fn decode_tokens_per_sec(&self) -> f64 {
        if self.total_decode_time_ms > 0.0 {
            self.total_generated_tokens as f64 * 1000.0 / self.total_decode_time_ms
        } else {
            0.0
        }
    }

    pub fn overall_tokens_per_sec(&self) -> f64 {
        let total_tokens = self.total_prompt_tokens + self.total_generated_tokens;
        if self.total_time_ms > 0.0 {
            total_tokens as f64 * 1000.0 / self.total_time_ms
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        println!("\n========================================");
        println!("         BENCHMARK RESULTS");
        println!("========================================");
        println!("Total requests:         {}", self.total_requests);
        println!("Total prompt tokens:    {}", self.total_prompt_tokens);
        println!("Total generated tokens: {}", self.total_generated_tokens);
        println!("----------------------------------------");
        println!("Prefill time:           {:.2} ms", self.total_prefill_time_ms);
        println!("Decode time:            {:.2} ms", self.total_decode_time_ms);
        println!("Total time:             {:.2} ms", self.total_time_ms);
        println!("----------------------------------------");
        println!("Prefill throughput:     {:.2} tokens/sec", self.prefill_tokens_per_sec());
        println!("Decode throughput:      {:.2} tokens/sec", self.decode_tokens_per_sec());
        println!("Overall throughput:     {:.2} tokens/sec", self.overall_tokens_per_sec());
        println!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serving::request::SamplingParams;

    #[test]
    fn test_add_request_accumulates() {
        let mut metrics = BenchmarkMetrics::default();
        let mut req = Request::new(0, "p", SamplingParams::default());
        req.prompt_tokens = vec![1, 2, 3];
        req.generated_tokens = vec![4, 5];
        req.prefill_time_ms = 10.0;
        req.decode_time_ms = 20.0;

        metrics.add_request(&req);
        metrics.add_request(&req);

        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.total_prompt_tokens, 6);
        assert_eq!(metrics.total_generated_tokens, 4);
        assert_eq!(metrics.total_prefill_time_ms, 20.0);
        assert_eq!(metrics.total_decode_time_ms, 40.0);
    }

    #[test]
    fn test_throughput_ratios() {
        let metrics = BenchmarkMetrics {
            total_requests: 1,
            total_prompt_tokens: 100,
            total_generated_tokens: 50,
            total_prefill_time_ms: 500.0,
            total_decode_time_ms: 1000.0,
            total_time_ms: 2000.0,
        };
        assert!((metrics.prefill_tokens_per_sec() - 200.0).abs() < 1e-9);
        assert!((metrics.decode_tokens_per_sec() - 50.0).abs() < 1e-9);
        assert!((metrics.overall_tokens_per_sec() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_time_guards() {
        let metrics = BenchmarkMetrics::default();
        assert_eq!(metrics.prefill_tokens_per_sec(), 0.0);
        assert_eq!(metrics.decode_tokens_per_sec(), 0.0);
        assert_eq!(metrics.overall_tokens_per_sec(), 0.0);
    }
}
