use std::time::Duration;

use serde::Serialize;

/// Throughput counters of one processing context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextDiagnostics {
    pub load_ms: u64,
    pub prompt_tokens: u64,
    pub prompt_tokens_per_sec: f64,
    pub generated_tokens: u64,
    pub generation_tokens_per_sec: f64,
    #[serde(skip)]
    prompt_time: Duration,
    #[serde(skip)]
    generation_time: Duration,
}

fn rate(tokens: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

impl ContextDiagnostics {
    pub(crate) fn record_load(&mut self, elapsed: Duration) {
        self.load_ms = elapsed.as_millis() as u64;
    }

    pub(crate) fn record_prompt(&mut self, tokens: usize, elapsed: Duration) {
        self.prompt_tokens += tokens as u64;
        self.prompt_time += elapsed;
        self.prompt_tokens_per_sec = rate(self.prompt_tokens, self.prompt_time);
    }

    pub(crate) fn record_generation(&mut self, tokens: usize, elapsed: Duration) {
        self.generated_tokens += tokens as u64;
        self.generation_time += elapsed;
        self.generation_tokens_per_sec = rate(self.generated_tokens, self.generation_time);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::ContextDiagnostics;
    use std::time::Duration;

    #[test]
    fn rates_accumulate_across_batches() {
        let mut diag = ContextDiagnostics::default();
        diag.record_prompt(100, Duration::from_millis(500));
        diag.record_prompt(100, Duration::from_millis(500));
        assert_eq!(diag.prompt_tokens, 200);
        assert!((diag.prompt_tokens_per_sec - 200.0).abs() < 1e-6);

        diag.record_generation(0, Duration::ZERO);
        assert_eq!(diag.generation_tokens_per_sec, 0.0);
    }

    #[test]
    fn snapshot_serializes_public_counters_only() {
        let mut diag = ContextDiagnostics::default();
        diag.record_load(Duration::from_millis(42));
        let json = diag.to_json().expect("serialize diagnostics");
        assert!(json.contains("\"load_ms\":42"));
        assert!(!json.contains("prompt_time"));
    }
}
