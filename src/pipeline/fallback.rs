//! Tagged per-attempt results and the bookkeeping for provider chains.
//!
//! Narration and the closing clip both try an ordered list of providers.
//! Each provider reports an [`Attempt`]; a [`ChainLog`] decides whether the
//! chain moves on and keeps every failure reason for the final report.
//!
//! ```text
//! Success(v)   → stop, return v
//! Retryable(r) → record r, try the next provider
//! Fatal(r)     → record r, stop the chain
//! ```

use std::fmt;

/// Outcome of one provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Success(T),
    /// A later provider may still succeed.
    Retryable(String),
    /// No provider can succeed for this input.
    Fatal(String),
}

impl<T> Attempt<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Attempt::Success(_))
    }
}

/// What a chain loop should do after recording an attempt.
#[derive(Debug, PartialEq)]
pub enum Step<T> {
    Done(T),
    Next,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub provider: String,
    pub reason: String,
    pub fatal: bool,
}

/// Failure reasons collected while walking a chain.
#[derive(Debug, Default)]
pub struct ChainLog {
    failures: Vec<StageFailure>,
}

impl ChainLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of `provider` and tell the caller how to proceed.
    pub fn record<T>(&mut self, provider: &str, attempt: Attempt<T>) -> Step<T> {
        match attempt {
            Attempt::Success(v) => Step::Done(v),
            Attempt::Retryable(reason) => {
                tracing::debug!("{provider}: {reason}; trying next provider");
                self.failures.push(StageFailure {
                    provider: provider.to_string(),
                    reason,
                    fatal: false,
                });
                Step::Next
            }
            Attempt::Fatal(reason) => {
                self.failures.push(StageFailure {
                    provider: provider.to_string(),
                    reason,
                    fatal: true,
                });
                Step::Stop
            }
        }
    }

    pub fn into_failure(self) -> ChainFailure {
        ChainFailure {
            failures: self.failures,
        }
    }
}

/// Every provider in the chain failed (or one failed fatally).
#[derive(Debug, Clone, PartialEq)]
pub struct ChainFailure {
    pub failures: Vec<StageFailure>,
}

impl fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("no provider configured");
        }
        let parts: Vec<String> = self
            .failures
            .iter()
            .map(|s| format!("{}: {}", s.provider, s.reason))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ChainFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(attempts: Vec<(&str, Attempt<u32>)>) -> Result<u32, ChainFailure> {
        let mut log = ChainLog::new();
        for (name, attempt) in attempts {
            match log.record(name, attempt) {
                Step::Done(v) => return Ok(v),
                Step::Next => continue,
                Step::Stop => break,
            }
        }
        Err(log.into_failure())
    }

    #[test]
    fn first_success_wins() {
        let r = walk(vec![("a", Attempt::Success(1)), ("b", Attempt::Success(2))]);
        assert_eq!(r.unwrap(), 1);
    }

    #[test]
    fn retryable_falls_through() {
        let r = walk(vec![
            ("primary", Attempt::Retryable("HTTP 503".into())),
            ("fallback", Attempt::Success(7)),
        ]);
        assert_eq!(r.unwrap(), 7);
    }

    #[test]
    fn fatal_stops_the_chain() {
        let r = walk(vec![
            ("primary", Attempt::Fatal("empty text".into())),
            ("fallback", Attempt::Success(7)),
        ]);
        let err = r.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(err.failures[0].fatal);
    }

    #[test]
    fn failure_lists_every_provider() {
        let err = walk(vec![
            ("lmnt", Attempt::Retryable("HTTP 500".into())),
            ("edge-tts", Attempt::Retryable("exit 1".into())),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "lmnt: HTTP 500; edge-tts: exit 1");
    }

    #[test]
    fn empty_chain_reports_no_provider() {
        let err = walk(vec![]).unwrap_err();
        assert_eq!(err.to_string(), "no provider configured");
    }
}
