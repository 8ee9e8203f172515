//! JSON run reports.
//!
//! A report pairs the run summary with per-shape progress so a finished (or
//! interrupted) run can be audited without reopening the catalog.

use crate::generator::{Generator, RunSummary};
use anyhow::{Context, Result};
use kernelvault_search::ShapeProgress;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub entry_point: String,
    pub backend: String,
    pub seed: u64,
    pub preloaded: usize,
    pub generated_at_unix_ms: u128,
    pub summary: RunSummary,
    pub shapes: Vec<ShapeProgress>,
}

impl RunReport {
    pub fn new(generator: &Generator, summary: RunSummary) -> Self {
        let ctx = generator.context();
        Self {
            entry_point: ctx.entry_point().to_string(),
            backend: ctx.backend().name().to_string(),
            seed: ctx.seed(),
            preloaded: ctx.preloaded(),
            generated_at_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
            summary,
            shapes: ctx.issuer().progress(),
        }
    }

    pub fn saturated_shapes(&self) -> usize {
        self.shapes.iter().filter(|s| s.saturated).count()
    }

    pub fn retired_shapes(&self) -> usize {
        self.shapes.iter().filter(|s| s.retired).count()
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob).with_context(|| format!("failed to write report {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneratorConfig;
    use crate::context::StopFlag;
    use kernelvault_backend::ReferenceBackend;
    use kernelvault_search::WorkloadFamily;
    use std::sync::Arc;

    #[test]
    fn test_report_round_trips_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = GeneratorConfig {
            family: WorkloadFamily::GroupConvolution,
            shapes: 2,
            options_per_shape: 2,
            seed: Some(3),
            output: dir.path().join("kernels.json"),
            ..GeneratorConfig::default()
        };
        let stop = StopFlag::new();
        stop.request_stop();
        let generator = Generator::from_config(&config, Arc::new(ReferenceBackend), stop).unwrap();
        let summary = generator.run().unwrap();
        let report = RunReport::new(&generator, summary);
        assert_eq!(report.shapes.len(), 2);
        assert_eq!(report.seed, 3);
        assert_eq!(report.saturated_shapes(), 0);

        let path = dir.path().join("report").join("run.json");
        report.write_to(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["entry_point"], "group_convolution");
        assert_eq!(value["backend"], "reference-cuda");
        assert_eq!(value["summary"]["stopped_early"], true);
    }
}
