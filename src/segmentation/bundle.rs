use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Network family, which decides the input/output wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// RobustVideoMatting: recurrent states, alpha output named `pha`.
    #[default]
    Rvm,
    /// One image input, one mask output (selfie segmentation style).
    SingleOutput,
}

/// Memory order of the input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// [1, 3, H, W]
    #[default]
    Nchw,
    /// [1, H, W, 3]
    Nhwc,
}

/// Per-channel normalization applied after scaling to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

fn default_input_size() -> u32 {
    512
}

fn default_downsample_ratio() -> f32 {
    0.25
}

/// Static model assets: the ONNX weights plus how to feed them.
///
/// Loaded from a JSON manifest, or built with defaults from a bare `.onnx`
/// path. Immutable after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundle {
    /// Weights file. Relative paths resolve against the manifest directory.
    pub model: PathBuf,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default)]
    pub layout: TensorLayout,
    #[serde(default)]
    pub normalization: Normalization,
    /// Ratio RVM uses internally for its recurrent states.
    #[serde(default = "default_downsample_ratio")]
    pub downsample_ratio: f32,
    /// Output slot holding the mask for single-output models.
    #[serde(default)]
    pub output_index: usize,
}

impl ResourceBundle {
    /// Defaults for a bare weights file: RVM at 512x512, NCHW, no normalization.
    pub fn from_model_path<P: AsRef<Path>>(model: P) -> Self {
        Self {
            model: model.as_ref().to_path_buf(),
            architecture: Architecture::default(),
            input_width: default_input_size(),
            input_height: default_input_size(),
            layout: TensorLayout::default(),
            normalization: Normalization::default(),
            downsample_ratio: default_downsample_ratio(),
            output_index: 0,
        }
    }

    /// Load a `.json` manifest or wrap a weights file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_manifest = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        let bundle = if is_manifest {
            tracing::info!("Reading resource manifest {}", path.display());
            let text = fs::read_to_string(path).map_err(|e| {
                PipelineError::ResourceLoadFailed(format!("{}: {}", path.display(), e))
            })?;
            let mut bundle: ResourceBundle = serde_json::from_str(&text).map_err(|e| {
                PipelineError::ResourceLoadFailed(format!("{}: {}", path.display(), e))
            })?;
            if bundle.model.is_relative() {
                if let Some(dir) = path.parent() {
                    bundle.model = dir.join(&bundle.model);
                }
            }
            bundle
        } else {
            Self::from_model_path(path)
        };

        bundle.validate()?;
        Ok(bundle)
    }

    /// Check that the weights exist and the declared shapes are usable.
    pub fn validate(&self) -> Result<()> {
        if !self.model.is_file() {
            return Err(PipelineError::ResourceLoadFailed(format!(
                "model weights not found at {}",
                self.model.display()
            )));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(PipelineError::ResourceLoadFailed(format!(
                "input size {}x{} is empty",
                self.input_width, self.input_height
            )));
        }
        if self.normalization.std.iter().any(|s| *s == 0.0) {
            return Err(PipelineError::ResourceLoadFailed(
                "normalization std contains zero".to_string(),
            ));
        }
        if !(self.downsample_ratio > 0.0 && self.downsample_ratio <= 1.0) {
            return Err(PipelineError::ResourceLoadFailed(format!(
                "downsample ratio {} outside (0, 1]",
                self.downsample_ratio
            )));
        }
        Ok(())
    }
}
