use anyhow::{ensure, Context, Result};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;

/// Build an ONNX Runtime session for `path`.
pub(crate) fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model from {}", path.display()))?;
    Ok(session)
}

/// Copy an extracted 4-D tensor into an owned array.
pub(crate) fn to_array4(shape: &[i64], data: &[f32]) -> Result<Array4<f32>> {
    ensure!(shape.len() == 4, "expected a 4-D tensor, got shape {:?}", shape);
    ensure!(
        shape.iter().all(|d| *d > 0),
        "tensor has dynamic or empty dimensions: {:?}",
        shape
    );
    let dims = (
        shape[0] as usize,
        shape[1] as usize,
        shape[2] as usize,
        shape[3] as usize,
    );
    Array4::from_shape_vec(dims, data.to_vec()).context("tensor data does not match its shape")
}
