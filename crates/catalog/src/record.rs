use kernelvault_ir::{CudaDim, MappingOptions, TensorDescriptor};
use serde::{Deserialize, Serialize};

/// Provenance tag stamped on every record this build produces.
pub fn build_version() -> String {
    format!("kernelvault {}", env!("CARGO_PKG_VERSION"))
}

/// One accepted kernel: everything needed to launch it later without
/// compiling again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelCandidate {
    pub id: u64,
    pub program: String,
    pub entry_point: String,
    pub inputs: Vec<TensorDescriptor>,
    pub outputs: Vec<TensorDescriptor>,
    pub options: MappingOptions,
    pub kernel_source: String,
    pub specialized_name: String,
    pub parameters: Vec<i64>,
    pub tight_block: CudaDim,
    pub tight_grid: CudaDim,
    pub build_version: String,
    pub compilation_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_dims_default_to_one() {
        let candidate = KernelCandidate {
            id: 3,
            program: "def f(float(N) I) -> (O) { O(n) = I(n) }".into(),
            entry_point: "f".into(),
            inputs: vec![TensorDescriptor::float32(&[8])],
            outputs: vec![TensorDescriptor::float32(&[8])],
            options: MappingOptions::naive(),
            kernel_source: "__global__ void f_8() {}".into(),
            specialized_name: "f_8".into(),
            parameters: vec![8],
            tight_block: CudaDim::new(8, 1, 1),
            tight_grid: CudaDim::new(1, 1, 1),
            build_version: build_version(),
            compilation_time_ms: 4,
        };
        let mut json = serde_json::to_value(&candidate).unwrap();
        json["tight_block"] = serde_json::json!({ "x": 8 });
        let back: KernelCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, candidate);
        assert!(candidate.build_version.starts_with("kernelvault "));
    }
}
