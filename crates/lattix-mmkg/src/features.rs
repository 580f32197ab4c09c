//! Per-entity side information (image, text, numeric, audio, video).
//!
//! Each modality is a dense `(num_entities, raw_dim)` table produced by an
//! upstream encoder (e.g. a vision backbone or a sentence encoder). Raw
//! encoder outputs are large, so tables are first reduced by average pooling
//! each row viewed as a 2-D grid:
//!
//! | Modality | Raw grid | Pooled grid | Pooled dim |
//! |----------|----------|-------------|------------|
//! | Visual   | 64 x 64  | 16 x 16     | 256        |
//! | Textual, Numeric, Audio, Video | 12 x 64 | 4 x 64 | 256 |
//!
//! Tables whose width does not match the raw grid are used as-is; the
//! scorer's projection adapts to any width.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Kinds of side information an entity can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Visual,
    Textual,
    Numeric,
    Audio,
    Video,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::Visual,
        Modality::Textual,
        Modality::Numeric,
        Modality::Audio,
        Modality::Video,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Modality::Visual => "visual",
            Modality::Textual => "textual",
            Modality::Numeric => "numeric",
            Modality::Audio => "audio",
            Modality::Video => "video",
        }
    }

    /// `(raw grid, pooled grid)` used by [`ModalityFeatures::pooled_default`].
    pub fn pooling_grid(&self) -> ((usize, usize), (usize, usize)) {
        match self {
            Modality::Visual => ((64, 64), (16, 16)),
            _ => ((12, 64), (4, 64)),
        }
    }

    /// Text tables are fine-tuned; encoder outputs for the others stay fixed.
    pub fn trainable_by_default(&self) -> bool {
        matches!(self, Modality::Textual)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Modality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "visual" | "image" | "img" => Ok(Modality::Visual),
            "textual" | "text" => Ok(Modality::Textual),
            "numeric" | "num" => Ok(Modality::Numeric),
            "audio" => Ok(Modality::Audio),
            "video" => Ok(Modality::Video),
            other => Err(Error::InvalidConfig(format!("unknown modality {other:?}"))),
        }
    }
}

/// One modality's feature table.
#[derive(Debug, Clone)]
pub struct ModalityFeatures {
    modality: Modality,
    table: Tensor,
    trainable: bool,
}

impl ModalityFeatures {
    /// Wrap a `(num_entities, raw_dim)` table.
    pub fn new(modality: Modality, table: Tensor) -> Result<Self> {
        if table.rank() != 2 {
            return Err(Error::DimensionMismatch {
                expected: 2,
                got: table.rank(),
            });
        }
        Ok(Self {
            modality,
            table: table.to_dtype(DType::F32)?,
            trainable: modality.trainable_by_default(),
        })
    }

    /// Build from a flat row-major buffer.
    pub fn from_vec(modality: Modality, values: Vec<f32>, rows: usize, device: &Device) -> Result<Self> {
        if rows == 0 || values.len() % rows != 0 {
            return Err(Error::DimensionMismatch {
                expected: rows,
                got: values.len(),
            });
        }
        let cols = values.len() / rows;
        Self::new(modality, Tensor::from_vec(values, (rows, cols), device)?)
    }

    /// Load from `.safetensors` (key `embeddings`, or the only tensor) or `.npy`.
    pub fn load(modality: Modality, path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let table = match path.extension().and_then(|e| e.to_str()) {
            Some("npy") => Tensor::read_npy(path)?,
            Some("safetensors") => {
                let mut tensors = candle_core::safetensors::load(path, device)?;
                match tensors.remove("embeddings") {
                    Some(t) => t,
                    None if tensors.len() == 1 => tensors
                        .into_values()
                        .next()
                        .ok_or_else(|| Error::InvalidConfig("empty safetensors file".into()))?,
                    None => {
                        return Err(Error::InvalidConfig(format!(
                            "{}: expected an `embeddings` tensor among {} entries",
                            path.display(),
                            tensors.len()
                        )))
                    }
                }
            }
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "{}: unsupported feature file (use .safetensors or .npy)",
                    path.display()
                )))
            }
        };
        debug!(%modality, path = %path.display(), shape = ?table.dims(), "loaded features");
        Self::new(modality, table.to_device(device)?)
    }

    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Average-pool every row from `grid` to `out`.
    pub fn pooled(self, grid: (usize, usize), out: (usize, usize)) -> Result<Self> {
        let table = adaptive_avg_pool(&self.table, grid, out)?;
        Ok(Self { table, ..self })
    }

    /// Pool with [`Modality::pooling_grid`] when the width matches the raw grid.
    pub fn pooled_default(self) -> Result<Self> {
        let (grid, out) = self.modality.pooling_grid();
        if self.feature_dim() == grid.0 * grid.1 {
            self.pooled(grid, out)
        } else {
            Ok(self)
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn num_rows(&self) -> usize {
        self.table.dims()[0]
    }

    pub fn feature_dim(&self) -> usize {
        self.table.dims()[1]
    }
}

/// Average pooling of each row of `table` (viewed as `grid`) down to `out`.
///
/// Both grid sides must be divisible by the output sides.
pub fn adaptive_avg_pool(table: &Tensor, grid: (usize, usize), out: (usize, usize)) -> Result<Tensor> {
    let (rows, cols) = table.dims2()?;
    if cols != grid.0 * grid.1 {
        return Err(Error::DimensionMismatch {
            expected: grid.0 * grid.1,
            got: cols,
        });
    }
    if out.0 == 0 || out.1 == 0 || grid.0 % out.0 != 0 || grid.1 % out.1 != 0 {
        return Err(Error::InvalidConfig(format!(
            "cannot pool {}x{} to {}x{}",
            grid.0, grid.1, out.0, out.1
        )));
    }
    let (kh, kw) = (grid.0 / out.0, grid.1 / out.1);
    let pooled = table
        .reshape((rows, out.0, kh, out.1, kw))?
        .mean(4)?
        .mean(2)?
        .reshape((rows, out.0 * out.1))?;
    Ok(pooled)
}
