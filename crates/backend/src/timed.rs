//! Per-compile deadline wrapper.

use crate::compiler::{BackendCompiler, CompilationError, CompiledKernel};
use kernelvault_ir::{MappingOptions, ShapeSignature, TensorDescriptor};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Timed-out compilations allowed to keep running before new calls are
/// refused.
pub const DEFAULT_MAX_ABANDONED: usize = 4;

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

/// Runs each compilation on a helper thread and gives up after `deadline`.
///
/// An abandoned compilation keeps running to completion in the background;
/// its result is dropped. While `max_abandoned` of them are still running,
/// further calls fail with [`CompilationError::TooManyAbandoned`] without
/// spawning anything.
pub struct TimedBackend {
    inner: Arc<dyn BackendCompiler>,
    deadline: Duration,
    max_abandoned: usize,
    abandoned: Arc<AtomicUsize>,
    name: String,
}

impl TimedBackend {
    pub fn new(inner: Arc<dyn BackendCompiler>, deadline: Duration) -> Self {
        let name = format!("{}+deadline", inner.name());
        Self {
            inner,
            deadline,
            max_abandoned: DEFAULT_MAX_ABANDONED,
            abandoned: Arc::new(AtomicUsize::new(0)),
            name,
        }
    }

    pub fn with_max_abandoned(mut self, max_abandoned: usize) -> Self {
        self.max_abandoned = max_abandoned.max(1);
        self
    }

    /// Abandoned compilations that have not finished yet.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

impl BackendCompiler for TimedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
        options: &MappingOptions,
    ) -> Result<CompiledKernel, CompilationError> {
        let stragglers = self.abandoned();
        if stragglers >= self.max_abandoned {
            return Err(CompilationError::TooManyAbandoned(stragglers));
        }

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let program = program.to_string();
        let entry_name = entry.to_string();
        let inputs = inputs.clone();
        let options = options.clone();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let helper_state = Arc::clone(&state);
        let abandoned = Arc::clone(&self.abandoned);

        thread::Builder::new()
            .name("kernelvault-compile".to_string())
            .spawn(move || {
                let _ = tx.send(inner.compile(&program, &entry_name, &inputs, &options));
                let finished = helper_state.compare_exchange(
                    RUNNING,
                    FINISHED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if finished.is_err() {
                    abandoned.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .map_err(|err| CompilationError::Backend {
                backend: self.name.clone(),
                message: format!("failed to spawn compile thread: {err}"),
            })?;

        match rx.recv_timeout(self.deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Count first so the helper never decrements below zero.
                self.abandoned.fetch_add(1, Ordering::SeqCst);
                let marked = state.compare_exchange(
                    RUNNING,
                    ABANDONED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if marked.is_err() {
                    self.abandoned.fetch_sub(1, Ordering::SeqCst);
                }
                warn!(
                    entry,
                    deadline_ms = self.deadline.as_millis() as u64,
                    abandoned = self.abandoned(),
                    "compilation timed out"
                );
                Err(CompilationError::Timeout(self.deadline))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CompilationError::Backend {
                backend: self.name.clone(),
                message: "compile thread exited without a result".to_string(),
            }),
        }
    }

    fn infer_output_shapes(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
    ) -> Result<Vec<TensorDescriptor>, CompilationError> {
        self.inner.infer_output_shapes(program, entry, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_ir::CudaDim;

    struct SlowBackend {
        delay: Duration,
    }

    impl BackendCompiler for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        fn compile(
            &self,
            _program: &str,
            entry: &str,
            _inputs: &ShapeSignature,
            _options: &MappingOptions,
        ) -> Result<CompiledKernel, CompilationError> {
            thread::sleep(self.delay);
            Ok(CompiledKernel {
                source: String::new(),
                specialized_name: entry.to_string(),
                parameters: Vec::new(),
                grid: CudaDim::unit(),
                block: CudaDim::unit(),
            })
        }
    }

    #[test]
    fn test_deadline_exceeded() {
        let backend = TimedBackend::new(
            Arc::new(SlowBackend {
                delay: Duration::from_millis(500),
            }),
            Duration::from_millis(20),
        );
        let err = backend
            .compile("", "k", &ShapeSignature::new(vec![]), &MappingOptions::naive())
            .unwrap_err();
        assert_eq!(err, CompilationError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_abandoned_compiles_are_capped() {
        let backend = TimedBackend::new(
            Arc::new(SlowBackend {
                delay: Duration::from_millis(400),
            }),
            Duration::from_millis(10),
        )
        .with_max_abandoned(2);
        let signature = ShapeSignature::new(vec![]);
        let options = MappingOptions::naive();
        for _ in 0..2 {
            assert_eq!(
                backend.compile("", "k", &signature, &options).unwrap_err(),
                CompilationError::Timeout(Duration::from_millis(10))
            );
        }
        assert_eq!(backend.abandoned(), 2);
        assert_eq!(
            backend.compile("", "k", &signature, &options).unwrap_err(),
            CompilationError::TooManyAbandoned(2)
        );

        // Stragglers finish on their own and free their slots.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while backend.abandoned() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(backend.abandoned(), 0);
    }

    #[test]
    fn test_fast_compile_passes_through() {
        let backend = TimedBackend::new(
            Arc::new(SlowBackend {
                delay: Duration::from_millis(1),
            }),
            Duration::from_secs(5),
        );
        let kernel = backend
            .compile("", "k", &ShapeSignature::new(vec![]), &MappingOptions::naive())
            .unwrap();
        assert_eq!(kernel.specialized_name, "k");
        assert_eq!(backend.name(), "slow+deadline");
        assert_eq!(backend.abandoned(), 0);
    }
}
