use std::time::Duration;

use crate::llm::RetryPolicy;

/// Configuration for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Generation attempts per stage invocation
    pub max_attempts: u32,
    /// Sampling temperature for regular stage calls
    pub temperature: f64,
    /// Sampling temperature for repair calls (lower = more deterministic)
    pub repair_temperature: f64,
    /// Nucleus-sampling parameter
    pub top_p: f64,
    /// Maximum output tokens per call
    pub max_tokens: u32,
    /// Timeout applied to every backend call
    pub request_timeout: Duration,
    /// Backoff for transport failures
    pub retry: RetryPolicy,
    /// Critic severity at or above which a targeted revision cycle runs
    pub critic_severity_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            temperature: 0.7,
            repair_temperature: 0.2,
            top_p: 0.95,
            max_tokens: 4096,
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            critic_severity_threshold: 0.5,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the regular sampling temperature.
    ///
    /// Repair calls stay strictly cooler than the original call.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        if self.repair_temperature >= temperature {
            self.repair_temperature = temperature * 0.5;
        }
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
