//! Model bundle: the immutable artifacts one session decodes against.
//!
//! A bundle is loaded once and shared read-only across sessions via `Arc`;
//! nothing in it is mutated after load.

use crate::config::ModelPaths;
use crate::error::ModelError;
use crate::features::FeatureConfig;
use crate::fst::{EPSILON, Fst};
use crate::symbols::SymbolTable;
use ndarray::{Array1, Array2};
use std::path::Path;
use std::sync::Arc;

/// Splice context used when an LDA transform is present.
const SPLICE_LEFT: usize = 3;
const SPLICE_RIGHT: usize = 3;

/// Per-pdf diagonal-Gaussian acoustic model.
///
/// The on-disk format (`final.mdl`) is a text matrix with two rows per
/// pdf: the mean vector followed by the variance vector.
pub struct AcousticModel {
    means: Array2<f32>,
    inv_vars: Array2<f32>,
    log_consts: Array1<f32>,
}

impl AcousticModel {
    /// Build from per-pdf means and variances, both `[num_pdfs, dim]`.
    pub fn from_gaussians(means: Array2<f32>, vars: Array2<f32>) -> Self {
        let two_pi = 2.0 * std::f32::consts::PI;
        let vars = vars.mapv(|v| v.max(1e-10));

        let log_consts = Array1::from_iter(
            vars.rows()
                .into_iter()
                .map(|row| -0.5 * row.iter().map(|&v| (two_pi * v).ln()).sum::<f32>()),
        );
        let inv_vars = vars.mapv(|v| 1.0 / v);

        Self {
            means,
            inv_vars,
            log_consts,
        }
    }

    pub fn num_pdfs(&self) -> usize {
        self.means.nrows()
    }

    pub fn dim(&self) -> usize {
        self.means.ncols()
    }

    /// Unscaled log-likelihood of `features` under pdf `pdf`.
    pub fn log_likelihood(&self, features: &[f32], pdf: usize) -> f32 {
        let mean = self.means.row(pdf);
        let inv_var = self.inv_vars.row(pdf);

        let mut mahalanobis = 0.0;
        for ((&x, &mu), &iv) in features.iter().zip(mean.iter()).zip(inv_var.iter()) {
            let d = x - mu;
            mahalanobis += d * d * iv;
        }

        self.log_consts[pdf] - 0.5 * mahalanobis
    }

    fn from_text_file(path: &Path) -> Result<Self, ModelError> {
        let matrix = read_text_matrix(path)?;

        if matrix.nrows() == 0 || matrix.nrows() % 2 != 0 {
            return Err(ModelError::Parse {
                path: path.to_path_buf(),
                line: 0,
                message: format!(
                    "expected an even, positive number of rows (mean/variance pairs), got {}",
                    matrix.nrows()
                ),
            });
        }

        let num_pdfs = matrix.nrows() / 2;
        let dim = matrix.ncols();
        let mut means = Array2::zeros((num_pdfs, dim));
        let mut vars = Array2::zeros((num_pdfs, dim));
        for pdf in 0..num_pdfs {
            means.row_mut(pdf).assign(&matrix.row(2 * pdf));
            vars.row_mut(pdf).assign(&matrix.row(2 * pdf + 1));
        }

        Ok(Self::from_gaussians(means, vars))
    }
}

/// Optional feature transform chain: global CMVN, splice + LDA, fMLLR.
pub struct FeatureTransforms {
    cmvn: Option<(Array1<f32>, Array1<f32>)>,
    lda: Option<Array2<f32>>,
    fmllr: Option<Array2<f32>>,
}

impl FeatureTransforms {
    /// No transforms: features are the raw log-mel frames.
    pub fn none() -> Self {
        Self {
            cmvn: None,
            lda: None,
            fmllr: None,
        }
    }

    pub fn new(
        cmvn: Option<(Array1<f32>, Array1<f32>)>,
        lda: Option<Array2<f32>>,
        fmllr: Option<Array2<f32>>,
    ) -> Self {
        Self { cmvn, lda, fmllr }
    }

    /// Global CMVN mean and inverse standard deviation, if configured.
    pub fn cmvn(&self) -> Option<(&Array1<f32>, &Array1<f32>)> {
        self.cmvn.as_ref().map(|(m, s)| (m, s))
    }

    /// Splice look-ahead frames required before a frame can be emitted.
    pub fn right_context(&self) -> usize {
        if self.lda.is_some() { SPLICE_RIGHT } else { 0 }
    }

    /// Final feature dimension given the base (log-mel) dimension.
    pub fn output_dim(&self, base_dim: usize) -> usize {
        let after_lda = match &self.lda {
            Some(lda) => lda.nrows(),
            None => base_dim,
        };
        match &self.fmllr {
            Some(fmllr) => fmllr.nrows(),
            None => after_lda,
        }
    }

    /// Transform base frame `t`, splicing neighbours with edge replication.
    pub fn apply(&self, base: &[Array1<f32>], t: usize) -> Array1<f32> {
        let mut out = match &self.lda {
            Some(lda) => {
                let dim = base[t].len();
                let mut spliced = Array1::zeros(dim * (SPLICE_LEFT + SPLICE_RIGHT + 1));
                for (slot, offset) in (-(SPLICE_LEFT as isize)..=SPLICE_RIGHT as isize).enumerate()
                {
                    let idx = (t as isize + offset).clamp(0, base.len() as isize - 1) as usize;
                    spliced
                        .slice_mut(ndarray::s![slot * dim..(slot + 1) * dim])
                        .assign(&base[idx]);
                }
                lda.dot(&spliced)
            }
            None => base[t].clone(),
        };

        if let Some(fmllr) = &self.fmllr {
            out = fmllr.dot(&out);
        }

        out
    }

    fn check_dims(&self, base_dim: usize) -> Result<(), ModelError> {
        if let Some((mean, inv_std)) = &self.cmvn {
            if mean.len() != base_dim || inv_std.len() != base_dim {
                return Err(ModelError::DimensionMismatch {
                    what: "cmvn stats vs mel bins",
                    expected: base_dim,
                    got: mean.len(),
                });
            }
        }
        if let Some(lda) = &self.lda {
            let spliced = base_dim * (SPLICE_LEFT + SPLICE_RIGHT + 1);
            if lda.ncols() != spliced {
                return Err(ModelError::DimensionMismatch {
                    what: "lda columns vs spliced feature dim",
                    expected: spliced,
                    got: lda.ncols(),
                });
            }
        }
        if let Some(fmllr) = &self.fmllr {
            let in_dim = match &self.lda {
                Some(lda) => lda.nrows(),
                None => base_dim,
            };
            if fmllr.ncols() != in_dim {
                return Err(ModelError::DimensionMismatch {
                    what: "fmllr columns vs input feature dim",
                    expected: in_dim,
                    got: fmllr.ncols(),
                });
            }
        }
        Ok(())
    }
}

/// One loaded model bundle: acoustic model, search graph, word symbols,
/// feature geometry, and transforms.
pub struct ModelBundle {
    pub meta: FeatureConfig,
    pub am: AcousticModel,
    pub graph: Fst,
    pub words: SymbolTable,
    pub transforms: Arc<FeatureTransforms>,
}

impl ModelBundle {
    /// Load a bundle from a directory using the default artifact names
    /// (`model.json`, `final.mdl`, `HCLG.fst`, `words.txt`, and the
    /// optional `lda.mat` / `fmllr.mat` / `cmvn.mat`).
    pub fn load(dir: &Path) -> Result<Self, crate::error::Error> {
        Self::load_with_paths(dir.join("model.json"), &ModelPaths::in_dir(dir))
    }

    /// Load a bundle from explicit artifact paths (the config-file surface).
    pub fn load_with_paths(
        meta_path: impl AsRef<Path>,
        paths: &ModelPaths,
    ) -> Result<Self, crate::error::Error> {
        let meta_path = meta_path.as_ref();
        let (model, hclg, words) = paths.require()?;

        let meta_text = std::fs::read_to_string(meta_path).map_err(|source| ModelError::Io {
            path: meta_path.to_path_buf(),
            source,
        })?;
        let meta: FeatureConfig =
            serde_json::from_str(&meta_text).map_err(|source| ModelError::Metadata {
                path: meta_path.to_path_buf(),
                source,
            })?;
        meta.check()?;

        tracing::debug!(path = %meta_path.display(), "loading model bundle");

        let am = AcousticModel::from_text_file(model)?;
        let graph = Fst::from_text_file(hclg)?;
        let words = SymbolTable::from_text_file(words)?;

        let cmvn = match &paths.mat_cmvn {
            Some(path) => Some(read_cmvn_stats(path)?),
            None => None,
        };
        let lda = match &paths.mat_lda {
            Some(path) => Some(read_text_matrix(path)?),
            None => None,
        };
        let fmllr = match &paths.mat_fmllr {
            Some(path) => Some(read_text_matrix(path)?),
            None => None,
        };
        let transforms = FeatureTransforms::new(cmvn, lda, fmllr);

        Ok(Self::from_parts(meta, am, graph, words, transforms)?)
    }

    /// Assemble a bundle from in-memory parts, checking consistency.
    pub fn from_parts(
        meta: FeatureConfig,
        am: AcousticModel,
        graph: Fst,
        words: SymbolTable,
        transforms: FeatureTransforms,
    ) -> Result<Self, ModelError> {
        meta.check()?;
        transforms.check_dims(meta.num_mel_bins)?;

        let feature_dim = transforms.output_dim(meta.num_mel_bins);
        if am.dim() != feature_dim {
            return Err(ModelError::DimensionMismatch {
                what: "acoustic model dim vs feature dim",
                expected: feature_dim,
                got: am.dim(),
            });
        }

        let max_ilabel = graph.max_ilabel();
        if max_ilabel != EPSILON && (max_ilabel - 1) as usize >= am.num_pdfs() {
            return Err(ModelError::IlabelOutOfRange {
                ilabel: max_ilabel,
                num_pdfs: am.num_pdfs(),
            });
        }

        tracing::debug!(
            pdfs = am.num_pdfs(),
            states = graph.num_states(),
            vocab = words.len(),
            "model bundle ready"
        );

        Ok(Self {
            meta,
            am,
            graph,
            words,
            transforms: Arc::new(transforms),
        })
    }
}

/// Read a whitespace-separated text matrix: one row per line, `#` comments
/// and blank lines ignored.
pub(crate) fn read_text_matrix(path: &Path) -> Result<Array2<f32>, ModelError> {
    let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut rows: Vec<Vec<f32>> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let row: Result<Vec<f32>, _> = line.split_whitespace().map(str::parse).collect();
        let row = row.map_err(|_| ModelError::Parse {
            path: path.to_path_buf(),
            line: lineno + 1,
            message: "invalid matrix entry".to_string(),
        })?;

        if let Some(first) = rows.first()
            && first.len() != row.len()
        {
            return Err(ModelError::Parse {
                path: path.to_path_buf(),
                line: lineno + 1,
                message: format!("ragged matrix: expected {} columns", first.len()),
            });
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(ModelError::Parse {
            path: path.to_path_buf(),
            line: 0,
            message: "empty matrix".to_string(),
        });
    }

    let ncols = rows[0].len();
    let flat: Vec<f32> = rows.concat();
    Array2::from_shape_vec((flat.len() / ncols, ncols), flat).map_err(|e| ModelError::Parse {
        path: path.to_path_buf(),
        line: 0,
        message: e.to_string(),
    })
}

/// Read global CMVN stats: a 2-row matrix of per-dimension mean and
/// variance. Returns `(mean, 1 / stddev)`.
fn read_cmvn_stats(path: &Path) -> Result<(Array1<f32>, Array1<f32>), ModelError> {
    let matrix = read_text_matrix(path)?;
    if matrix.nrows() != 2 {
        return Err(ModelError::Parse {
            path: path.to_path_buf(),
            line: 0,
            message: format!("expected 2 rows (mean, variance), got {}", matrix.nrows()),
        });
    }

    let mean = matrix.row(0).to_owned();
    let inv_std = matrix.row(1).mapv(|v| 1.0 / v.max(1e-10).sqrt());
    Ok((mean, inv_std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn meta() -> FeatureConfig {
        FeatureConfig {
            sample_rate: 16000,
            frame_length: 400,
            frame_shift: 160,
            num_mel_bins: 2,
            preemphasis: 0.97,
        }
    }

    #[test]
    fn gaussian_log_likelihood_peaks_at_mean() {
        let am = AcousticModel::from_gaussians(
            array![[0.0, 0.0], [5.0, 5.0]],
            array![[1.0, 1.0], [1.0, 1.0]],
        );

        let at_mean = am.log_likelihood(&[0.0, 0.0], 0);
        let off_mean = am.log_likelihood(&[1.0, 1.0], 0);
        let other_pdf = am.log_likelihood(&[0.0, 0.0], 1);

        assert!(at_mean > off_mean);
        assert!(at_mean > other_pdf);
        assert!((at_mean - off_mean - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_feature_dim_mismatch() {
        let am = AcousticModel::from_gaussians(array![[0.0, 0.0, 0.0]], array![[1.0, 1.0, 1.0]]);
        let graph = Fst::from_parts(0, vec![vec![]], vec![0.0]);
        let words = SymbolTable::from_words(["<eps>"]);

        let result = ModelBundle::from_parts(meta(), am, graph, words, FeatureTransforms::none());

        assert!(matches!(
            result,
            Err(ModelError::DimensionMismatch {
                expected: 2,
                got: 3,
                ..
            })
        ));
    }

    #[test]
    fn rejects_graph_ilabel_beyond_pdfs() {
        use crate::fst::FstArc;

        let am = AcousticModel::from_gaussians(array![[0.0, 0.0]], array![[1.0, 1.0]]);
        let arcs = vec![vec![FstArc {
            ilabel: 5,
            olabel: 0,
            weight: 0.0,
            nextstate: 0,
        }]];
        let graph = Fst::from_parts(0, arcs, vec![0.0]);
        let words = SymbolTable::from_words(["<eps>"]);

        let result = ModelBundle::from_parts(meta(), am, graph, words, FeatureTransforms::none());

        assert!(matches!(result, Err(ModelError::IlabelOutOfRange { .. })));
    }

    #[test]
    fn splice_and_lda_shape() {
        // 2-dim base, splice 7 frames -> 14 columns, project to 3
        let lda = Array2::from_shape_fn((3, 14), |(r, c)| if r == c % 3 { 0.5 } else { 0.0 });
        let transforms = FeatureTransforms::new(None, Some(lda), None);

        assert_eq!(transforms.right_context(), 3);
        assert_eq!(transforms.output_dim(2), 3);

        let base: Vec<Array1<f32>> = (0..5).map(|i| array![i as f32, -(i as f32)]).collect();
        let out = transforms.apply(&base, 0);

        assert_eq!(out.len(), 3);
    }

    #[test]
    fn reads_text_matrix_from_file() {
        let path = std::env::temp_dir().join("latgen_matrix_test.txt");
        std::fs::write(&path, "# mean\n1.0 2.0\n3.0 4.0\n").unwrap();

        let matrix = read_text_matrix(&path).unwrap();

        assert_eq!(matrix, array![[1.0, 2.0], [3.0, 4.0]]);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_ragged_matrix() {
        let path = std::env::temp_dir().join("latgen_matrix_ragged.txt");
        std::fs::write(&path, "1.0 2.0\n3.0\n").unwrap();

        let result = read_text_matrix(&path);

        assert!(matches!(result, Err(ModelError::Parse { line: 2, .. })));
        std::fs::remove_file(path).ok();
    }
}
