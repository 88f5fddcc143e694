use ndarray::{Array3, ArrayD, Axis, Ix3, Ix4};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::data::volume::{Case, LabelMap, Volume};
use crate::error::{Result, SegError};

/// Anything that can hand out validated cases by identifier.
///
/// Implementations must be shareable with the prefetch thread.
pub trait VolumeSource: Send + Sync {
    /// Identifiers of every case, in a stable order.
    fn case_ids(&self) -> &[String];

    /// Load one case. Fails with [`SegError::DataIntegrity`] when the pair is unusable.
    fn load(&self, id: &str) -> Result<Case>;

    fn len(&self) -> usize {
        self.case_ids().len()
    }

    fn is_empty(&self) -> bool {
        self.case_ids().is_empty()
    }
}

/// NIfTI dataset in the Medical Segmentation Decathlon layout.
///
/// Expected structure:
/// Task01_BrainTumour/
/// ├── imagesTr/
/// │   ├── BRATS_001.nii.gz    [x, y, z, modality]
/// │   └── ...
/// └── labelsTr/
///     ├── BRATS_001.nii.gz    [x, y, z]
///     └── ...
#[derive(Debug, Clone)]
pub struct NiftiDataset {
    images_dir: PathBuf,
    labels_dir: PathBuf,
    ids: Vec<String>,
    in_channels: usize,
    num_classes: usize,
}

impl NiftiDataset {
    pub fn open(
        root: impl AsRef<Path>,
        images_subdir: &str,
        labels_subdir: &str,
        in_channels: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let root = root.as_ref();
        let images_dir = root.join(images_subdir);
        let labels_dir = root.join(labels_subdir);

        for dir in [&images_dir, &labels_dir] {
            if !dir.is_dir() {
                return Err(SegError::config(format!(
                    "dataset directory not found: {}",
                    dir.display()
                )));
            }
        }

        let mut ids = Vec::new();
        for entry in WalkDir::new(&images_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(id) = case_id(entry.path()) else {
                continue;
            };
            if find_volume(&labels_dir, &id).is_some() {
                ids.push(id);
            } else {
                log::warn!("label not found for {}", entry.path().display());
            }
        }
        ids.sort();

        if ids.is_empty() {
            return Err(SegError::config(format!(
                "no image/label pairs found in {}",
                images_dir.display()
            )));
        }

        log::info!("found {} cases under {}", ids.len(), root.display());

        Ok(Self {
            images_dir,
            labels_dir,
            ids,
            in_channels,
            num_classes,
        })
    }

    fn resolve(&self, dir: &Path, id: &str) -> Result<PathBuf> {
        find_volume(dir, id)
            .ok_or_else(|| SegError::integrity(id, format!("no volume in {}", dir.display())))
    }
}

impl VolumeSource for NiftiDataset {
    fn case_ids(&self) -> &[String] {
        &self.ids
    }

    fn load(&self, id: &str) -> Result<Case> {
        let image_path = self.resolve(&self.images_dir, id)?;
        let label_path = self.resolve(&self.labels_dir, id)?;

        let volume = read_image(&image_path, id)?;
        let label = read_label(&label_path, id)?;
        let case = Case::new(id, volume, label);
        case.validate(self.in_channels, self.num_classes)?;

        log::debug!(
            "loaded {}: {} channels, shape {:?}, spacing {:?}",
            id,
            case.volume.channels(),
            case.volume.spatial_shape(),
            case.volume.spacing()
        );
        Ok(case)
    }
}

/// Cases held in memory: synthetic data, or a cached copy of another source.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    ids: Vec<String>,
    cases: Vec<Case>,
}

impl InMemoryDataset {
    pub fn from_cases(cases: Vec<Case>) -> Self {
        let ids = cases.iter().map(|c| c.id.clone()).collect();
        Self { ids, cases }
    }

    /// Load every listed case from `source` up front.
    ///
    /// With `skip_corrupt`, cases failing integrity checks are logged and left out.
    pub fn cache(source: &dyn VolumeSource, ids: &[String], skip_corrupt: bool) -> Result<Self> {
        let mut cases = Vec::with_capacity(ids.len());
        for id in ids {
            match source.load(id) {
                Ok(case) => cases.push(case),
                Err(e) if skip_corrupt && e.is_sample_local() => {
                    log::warn!("skipping case {}: {}", id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self::from_cases(cases))
    }
}

impl VolumeSource for InMemoryDataset {
    fn case_ids(&self) -> &[String] {
        &self.ids
    }

    fn load(&self, id: &str) -> Result<Case> {
        self.cases
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| SegError::integrity(id, "unknown case id"))
    }
}

/// Train/validation indices for one cross-validation fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

/// Shuffled k-fold split of `n` items.
///
/// The first `n % k` folds receive one extra validation item.
pub fn k_fold_splits(n: usize, k: usize, seed: u64) -> Result<Vec<Fold>> {
    if k < 2 || k > n {
        return Err(SegError::config(format!(
            "cannot split {} cases into {} folds",
            n, k
        )));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = n / k + usize::from(fold < n % k);
        let val: Vec<usize> = indices[start..start + size].to_vec();
        let train: Vec<usize> = indices[..start]
            .iter()
            .chain(indices[start + size..].iter())
            .copied()
            .collect();
        folds.push(Fold { train, val });
        start += size;
    }
    Ok(folds)
}

fn case_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    // macOS resource forks ship with the Decathlon archives
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .map(str::to_string)
}

fn find_volume(dir: &Path, id: &str) -> Option<PathBuf> {
    ["nii.gz", "nii"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", id, ext)))
        .find(|p| p.is_file())
}

fn read_nifti(path: &Path, id: &str) -> Result<(ArrayD<f32>, [f32; 3])> {
    let unreadable =
        |e: nifti::NiftiError| SegError::integrity(id, format!("cannot read {}: {}", path.display(), e));

    let obj = ReaderOptions::new().read_file(path).map_err(unreadable)?;
    let pixdim = obj.header().pixdim;
    let spacing = [pixdim[1].abs(), pixdim[2].abs(), pixdim[3].abs()];
    let data = obj.into_volume().into_ndarray::<f32>().map_err(unreadable)?;
    Ok((data, spacing))
}

fn read_image(path: &Path, id: &str) -> Result<Volume> {
    let (data, spacing) = read_nifti(path, id)?;

    // [x, y, z, c] -> [c, x, y, z]
    let data = match data.ndim() {
        3 => data.insert_axis(Axis(0)),
        4 => data.permuted_axes(vec![3, 0, 1, 2]),
        n => {
            return Err(SegError::integrity(
                id,
                format!("image must be 3-D or 4-D, found {} dimensions", n),
            ))
        }
    };
    let data = data
        .as_standard_layout()
        .into_owned()
        .into_dimensionality::<Ix4>()
        .map_err(|e| SegError::integrity(id, e.to_string()))?;

    if data.iter().any(|v| !v.is_finite()) {
        return Err(SegError::integrity(id, "image contains non-finite intensities"));
    }

    Ok(Volume::new(data, spacing))
}

fn read_label(path: &Path, id: &str) -> Result<LabelMap> {
    let (data, spacing) = read_nifti(path, id)?;

    let data = match data.shape() {
        [_, _, _] => data,
        [_, _, _, 1] => data.index_axis_move(Axis(3), 0),
        other => {
            return Err(SegError::integrity(
                id,
                format!("label map must be 3-D, found shape {:?}", other),
            ))
        }
    };
    let data = data
        .into_dimensionality::<Ix3>()
        .map_err(|e| SegError::integrity(id, e.to_string()))?;

    let mut labels = Array3::<u8>::zeros(data.raw_dim());
    for (dst, &v) in labels.iter_mut().zip(data.iter()) {
        if !v.is_finite() || v < 0.0 || v > u8::MAX as f32 || v.fract() != 0.0 {
            return Err(SegError::integrity(
                id,
                format!("label value {} is not a class index", v),
            ));
        }
        *dst = v as u8;
    }

    Ok(LabelMap::new(labels, spacing))
}
