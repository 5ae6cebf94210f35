//! Ordered chain of interchangeable backends for one capability.
//!
//! Backends are tried in priority order. Availability is probed at most once
//! per backend for the lifetime of the chain; an `Unavailable` verdict is never
//! retried. A backend that ran and failed ends the chain: falling through on
//! execution errors would hide real failures behind a different engine.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Why a backend could not produce an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    /// The engine is missing or unusable; try the next backend.
    EngineUnavailable(String),
    /// The engine ran the request and it failed; terminal.
    Execution(String),
}

#[async_trait]
pub trait Backend<Req: Sync, Out>: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap availability check, run once per chain.
    async fn probe(&self) -> Result<(), String>;

    async fn run(&self, request: &Req) -> Result<Out, BackendFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("no backend available:{}", render_diagnostics(.diagnostics))]
    AllUnavailable { diagnostics: Vec<SkippedBackend> },
    #[error("{backend} failed: {message}")]
    Execution { backend: String, message: String },
    #[error("no backends configured for '{0}'")]
    Unsupported(String),
}

fn render_diagnostics(diagnostics: &[SkippedBackend]) -> String {
    if diagnostics.is_empty() {
        return " (none configured)".to_string();
    }
    diagnostics
        .iter()
        .map(|skipped| format!("\n- {skipped}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBackend {
    pub backend: String,
    pub reason: String,
}

impl fmt::Display for SkippedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

/// Output of the first available backend plus the ones skipped before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutput<Out> {
    pub output: Out,
    pub backend: String,
    pub skipped: Vec<SkippedBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Availability {
    Unknown,
    Available,
    Unavailable(String),
}

struct Slot<Req, Out> {
    backend: Box<dyn Backend<Req, Out>>,
    availability: Mutex<Availability>,
}

pub struct FallbackChain<Req, Out> {
    capability: String,
    slots: Vec<Slot<Req, Out>>,
}

impl<Req: Sync, Out> fmt::Debug for FallbackChain<Req, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.slots.iter().map(|s| s.backend.name()).collect();
        f.debug_struct("FallbackChain")
            .field("capability", &self.capability)
            .field("backends", &names)
            .finish()
    }
}

impl<Req: Sync, Out: Send> FallbackChain<Req, Out> {
    pub fn new(capability: impl Into<String>, backends: Vec<Box<dyn Backend<Req, Out>>>) -> Self {
        Self {
            capability: capability.into(),
            slots: backends
                .into_iter()
                .map(|backend| Slot {
                    backend,
                    availability: Mutex::new(Availability::Unknown),
                })
                .collect(),
        }
    }

    /// Backend names in priority order.
    pub fn backend_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.backend.name()).collect()
    }

    #[instrument(skip_all, fields(capability = %self.capability))]
    pub async fn run(&self, request: &Req) -> Result<ChainOutput<Out>, ChainError> {
        let mut skipped = Vec::new();

        for slot in &self.slots {
            let name = slot.backend.name().to_string();
            if let Some(reason) = self.ensure_probed(slot).await {
                debug!(backend = %name, reason = %reason, "skipping unavailable backend");
                skipped.push(SkippedBackend {
                    backend: name,
                    reason,
                });
                continue;
            }

            match slot.backend.run(request).await {
                Ok(output) => {
                    info!(backend = %name, skipped = skipped.len(), "backend succeeded");
                    return Ok(ChainOutput {
                        output,
                        backend: name,
                        skipped,
                    });
                }
                Err(BackendFailure::EngineUnavailable(reason)) => {
                    warn!(backend = %name, reason = %reason, "backend became unavailable");
                    *slot.availability.lock().await = Availability::Unavailable(reason.clone());
                    skipped.push(SkippedBackend {
                        backend: name,
                        reason,
                    });
                }
                Err(BackendFailure::Execution(message)) => {
                    return Err(ChainError::Execution {
                        backend: name,
                        message,
                    });
                }
            }
        }

        Err(ChainError::AllUnavailable {
            diagnostics: skipped,
        })
    }

    /// Probe once and cache. Returns the unavailability reason, if any.
    async fn ensure_probed(&self, slot: &Slot<Req, Out>) -> Option<String> {
        let mut availability = slot.availability.lock().await;
        if *availability == Availability::Unknown {
            *availability = match slot.backend.probe().await {
                Ok(()) => Availability::Available,
                Err(reason) => Availability::Unavailable(reason),
            };
            debug!(backend = slot.backend.name(), state = ?*availability, "probed backend");
        }
        match &*availability {
            Availability::Unavailable(reason) => Some(reason.clone()),
            Availability::Available | Availability::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fake {
        name: &'static str,
        available: bool,
        result: Result<String, BackendFailure>,
        probes: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    impl Fake {
        fn new(name: &'static str, available: bool, result: Result<String, BackendFailure>) -> Self {
            Self {
                name,
                available,
                result,
                probes: Arc::new(AtomicUsize::new(0)),
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Backend<String, String> for Fake {
        fn name(&self) -> &str {
            self.name
        }

        async fn probe(&self) -> Result<(), String> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.available {
                Ok(())
            } else {
                Err(format!("{} not installed", self.name))
            }
        }

        async fn run(&self, request: &String) -> Result<String, BackendFailure> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .map(|out| format!("{out}:{request}"))
        }
    }

    #[tokio::test]
    async fn skips_unavailable_and_probes_once() {
        let a = Fake::new("a", false, Ok("a".to_string()));
        let (a_probes, a_runs) = (a.probes.clone(), a.runs.clone());
        let b = Fake::new("b", true, Ok("b".to_string()));
        let b_probes = b.probes.clone();
        let chain: FallbackChain<String, String> =
            FallbackChain::new("test", vec![Box::new(a), Box::new(b)]);

        let first = chain.run(&"x".to_string()).await.expect("run");
        assert_eq!(first.output, "b:x");
        assert_eq!(first.backend, "b");
        assert_eq!(
            first.skipped,
            vec![SkippedBackend {
                backend: "a".to_string(),
                reason: "a not installed".to_string()
            }]
        );

        let second = chain.run(&"y".to_string()).await.expect("run");
        assert_eq!(second.output, "b:y");
        assert_eq!(a_probes.load(Ordering::SeqCst), 1);
        assert_eq!(a_runs.load(Ordering::SeqCst), 0);
        assert_eq!(b_probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lists_backends_in_priority_order() {
        let chain: FallbackChain<String, String> = FallbackChain::new(
            "javascript",
            vec![
                Box::new(Fake::new("node", true, Ok(String::new()))),
                Box::new(Fake::new("deno", true, Ok(String::new()))),
            ],
        );
        assert_eq!(chain.backend_names(), vec!["node", "deno"]);
        let debug = format!("{chain:?}");
        assert!(debug.contains("javascript"));
        assert!(debug.contains("\"node\", \"deno\""));
    }

    #[tokio::test]
    async fn execution_error_does_not_fall_through() {
        let a = Fake::new(
            "a",
            true,
            Err(BackendFailure::Execution("syntax error".to_string())),
        );
        let b = Fake::new("b", true, Ok("b".to_string()));
        let b_runs = b.runs.clone();
        let chain: FallbackChain<String, String> =
            FallbackChain::new("test", vec![Box::new(a), Box::new(b)]);

        let err = chain.run(&"x".to_string()).await.unwrap_err();
        assert_eq!(
            err,
            ChainError::Execution {
                backend: "a".to_string(),
                message: "syntax error".to_string()
            }
        );
        assert_eq!(b_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_unavailable_lists_each_backend() {
        let chain: FallbackChain<String, String> = FallbackChain::new(
            "test",
            vec![
                Box::new(Fake::new("a", false, Ok(String::new()))),
                Box::new(Fake::new("b", false, Ok(String::new()))),
            ],
        );
        let err = chain.run(&"x".to_string()).await.unwrap_err();
        let ChainError::AllUnavailable { diagnostics } = &err else {
            panic!("expected AllUnavailable, got {err:?}");
        };
        assert_eq!(diagnostics.len(), 2);
        let rendered = err.to_string();
        assert!(rendered.contains("a: a not installed"));
        assert!(rendered.contains("b: b not installed"));
    }

    #[tokio::test]
    async fn unavailable_at_run_time_is_cached() {
        let a = Fake::new(
            "a",
            true,
            Err(BackendFailure::EngineUnavailable("vanished".to_string())),
        );
        let a_runs = a.runs.clone();
        let b = Fake::new("b", true, Ok("b".to_string()));
        let chain: FallbackChain<String, String> =
            FallbackChain::new("test", vec![Box::new(a), Box::new(b)]);

        chain.run(&"x".to_string()).await.expect("first");
        let second = chain.run(&"y".to_string()).await.expect("second");
        assert_eq!(second.skipped[0].reason, "vanished");
        assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    }
}
