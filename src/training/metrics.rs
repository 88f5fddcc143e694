use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Per-class scores of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Dice per class (background included), averaged over cases.
    pub dice: Vec<f32>,
    /// 95th percentile Hausdorff distance (mm) per class, averaged over cases
    /// where it is defined.
    pub hd95: Vec<Option<f32>>,
    pub loss: Option<f32>,
    pub num_cases: usize,
}

impl MetricReport {
    /// Mean Dice over classes 1.. (model selection score).
    pub fn mean_foreground_dice(&self) -> f32 {
        let fg = self.dice.get(1..).unwrap_or(&[]);
        if fg.is_empty() {
            return 0.0;
        }
        fg.iter().sum::<f32>() / fg.len() as f32
    }

    /// Average per-case reports class by class.
    pub fn aggregate(cases: &[CaseMetrics], loss: Option<f32>) -> Self {
        let num_classes = cases.first().map(|c| c.dice.len()).unwrap_or(0);
        let mut dice = vec![0.0; num_classes];
        let mut hd_sum = vec![0.0f32; num_classes];
        let mut hd_count = vec![0usize; num_classes];

        for case in cases {
            for c in 0..num_classes {
                dice[c] += case.dice[c];
                if let Some(h) = case.hd95[c] {
                    hd_sum[c] += h;
                    hd_count[c] += 1;
                }
            }
        }
        if !cases.is_empty() {
            dice.iter_mut().for_each(|d| *d /= cases.len() as f32);
        }
        let hd95 = hd_sum
            .iter()
            .zip(hd_count.iter())
            .map(|(&s, &n)| (n > 0).then(|| s / n as f32))
            .collect();

        Self {
            dice,
            hd95,
            loss,
            num_cases: cases.len(),
        }
    }

    /// Element-wise mean over several reports (e.g. cross-validation folds).
    pub fn average(reports: &[MetricReport]) -> Option<Self> {
        let first = reports.first()?;
        let k = first.dice.len();
        let mut dice = vec![0.0; k];
        let mut hd_sum = vec![0.0; k];
        let mut hd_count = vec![0usize; k];
        let mut loss_sum = 0.0;
        let mut loss_count = 0;

        for report in reports {
            for c in 0..k.min(report.dice.len()) {
                dice[c] += report.dice[c] / reports.len() as f32;
                if let Some(Some(h)) = report.hd95.get(c) {
                    hd_sum[c] += h;
                    hd_count[c] += 1;
                }
            }
            if let Some(l) = report.loss {
                loss_sum += l;
                loss_count += 1;
            }
        }

        Some(Self {
            dice,
            hd95: hd_sum
                .iter()
                .zip(hd_count.iter())
                .map(|(&s, &n)| (n > 0).then(|| s / n as f32))
                .collect(),
            loss: (loss_count > 0).then(|| loss_sum / loss_count as f32),
            num_cases: reports.iter().map(|r| r.num_cases).sum(),
        })
    }
}

/// Scores of a single volume.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseMetrics {
    pub case_id: String,
    pub dice: Vec<f32>,
    pub hd95: Vec<Option<f32>>,
}

impl CaseMetrics {
    pub fn compute(
        case_id: impl Into<String>,
        prediction: ArrayView3<u8>,
        truth: ArrayView3<u8>,
        num_classes: usize,
        spacing: [f32; 3],
    ) -> Self {
        let mut dice = Vec::with_capacity(num_classes);
        let mut hd95 = Vec::with_capacity(num_classes);

        for class in 0..num_classes {
            let class = class as u8;
            let pred = prediction.mapv(|v| v == class);
            let gt = truth.mapv(|v| v == class);
            dice.push(dice_score(pred.view(), gt.view()));
            hd95.push(hausdorff95(pred.view(), gt.view(), spacing));
        }

        Self {
            case_id: case_id.into(),
            dice,
            hd95,
        }
    }
}

/// `2|P∩G| / (|P|+|G|)`; 1.0 when both masks are empty.
pub fn dice_score(prediction: ArrayView3<bool>, truth: ArrayView3<bool>) -> f32 {
    let mut intersection = 0usize;
    let mut total = 0usize;
    for (&p, &g) in prediction.iter().zip(truth.iter()) {
        intersection += usize::from(p && g);
        total += usize::from(p) + usize::from(g);
    }
    if total == 0 {
        1.0
    } else {
        2.0 * intersection as f32 / total as f32
    }
}

/// Symmetric 95th percentile surface distance in mm.
///
/// `None` when either mask is empty.
pub fn hausdorff95(prediction: ArrayView3<bool>, truth: ArrayView3<bool>, spacing: [f32; 3]) -> Option<f32> {
    let pred_surface = surface(prediction);
    let truth_surface = surface(truth);
    if pred_surface.is_empty() || truth_surface.is_empty() {
        return None;
    }

    let to_truth = distance_transform(truth, spacing);
    let to_pred = distance_transform(prediction, spacing);

    let mut distances: Vec<f32> = pred_surface
        .iter()
        .map(|&idx| to_truth[idx])
        .chain(truth_surface.iter().map(|&idx| to_pred[idx]))
        .collect();
    distances.sort_by(|a, b| a.total_cmp(b));

    let rank = ((distances.len() as f32) * 0.95).ceil() as usize;
    Some(distances[rank.clamp(1, distances.len()) - 1])
}

/// Mask voxels with at least one 6-neighbour outside the mask (or the volume).
fn surface(mask: ArrayView3<bool>) -> Vec<[usize; 3]> {
    let (d, h, w) = mask.dim();
    let mut out = Vec::new();
    for ((z, y, x), &m) in mask.indexed_iter() {
        if !m {
            continue;
        }
        let border = z == 0 || y == 0 || x == 0 || z + 1 == d || y + 1 == h || x + 1 == w;
        if border
            || !mask[[z - 1, y, x]]
            || !mask[[z + 1, y, x]]
            || !mask[[z, y - 1, x]]
            || !mask[[z, y + 1, x]]
            || !mask[[z, y, x - 1]]
            || !mask[[z, y, x + 1]]
        {
            out.push([z, y, x]);
        }
    }
    out
}

/// Exact Euclidean distance (mm) from every voxel to the nearest `true` voxel.
///
/// Separable lower-envelope transform (Felzenszwalb & Huttenlocher), one pass per axis.
pub fn distance_transform(mask: ArrayView3<bool>, spacing: [f32; 3]) -> Array3<f32> {
    let mut sq: Array3<f32> = mask.mapv(|m| if m { 0.0 } else { f32::INFINITY });

    for axis in 0..3 {
        let step = spacing[axis] * spacing[axis];
        for mut lane in sq.lanes_mut(ndarray::Axis(axis)) {
            let input: Vec<f32> = lane.iter().copied().collect();
            let output = edt_1d(&input, step);
            for (v, o) in lane.iter_mut().zip(output) {
                *v = o;
            }
        }
    }

    sq.mapv_into(f32::sqrt)
}

/// Squared distance transform of a sampled function along one line.
fn edt_1d(f: &[f32], step: f32) -> Vec<f32> {
    let n = f.len();
    let mut out = vec![f32::INFINITY; n];
    let sites: Vec<usize> = (0..n).filter(|&i| f[i].is_finite()).collect();
    if sites.is_empty() {
        return out;
    }

    // parabola vertices and the boundaries between them
    let mut v: Vec<usize> = Vec::with_capacity(sites.len());
    let mut z: Vec<f32> = Vec::with_capacity(sites.len() + 1);
    let intersect = |q: usize, p: usize| -> f32 {
        let (qf, pf) = (q as f32, p as f32);
        ((f[q] / step + qf * qf) - (f[p] / step + pf * pf)) / (2.0 * (qf - pf))
    };

    v.push(sites[0]);
    z.push(f32::NEG_INFINITY);
    z.push(f32::INFINITY);

    for &q in &sites[1..] {
        let mut s = intersect(q, v[v.len() - 1]);
        while v.len() > 1 && s <= z[v.len() - 1] {
            v.pop();
            z.pop();
            s = intersect(q, v[v.len() - 1]);
        }
        let last = z.len() - 1;
        z[last] = s;
        v.push(q);
        z.push(f32::INFINITY);
    }

    let mut k = 0;
    for (q, o) in out.iter_mut().enumerate() {
        while z[k + 1] < q as f32 {
            k += 1;
        }
        let p = v[k];
        let d = q as f32 - p as f32;
        *o = d * d * step + f[p];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(shape: usize, lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn((shape, shape, shape), |(z, y, x)| {
            (lo..hi).contains(&z) && (lo..hi).contains(&y) && (lo..hi).contains(&x)
        })
    }

    #[test]
    fn test_dice_identical_and_disjoint() {
        let a = cube(8, 2, 5);
        let b = cube(8, 5, 8);
        assert_eq!(dice_score(a.view(), a.view()), 1.0);
        assert_eq!(dice_score(a.view(), b.view()), 0.0);
    }

    #[test]
    fn test_dice_both_empty_is_one() {
        let empty = Array3::from_elem((4, 4, 4), false);
        assert_eq!(dice_score(empty.view(), empty.view()), 1.0);
    }

    #[test]
    fn test_distance_transform_matches_brute_force() {
        let mut mask = Array3::from_elem((5, 6, 7), false);
        mask[[1, 2, 3]] = true;
        mask[[4, 0, 6]] = true;
        let spacing = [1.0, 2.0, 0.5];
        let dt = distance_transform(mask.view(), spacing);

        for ((z, y, x), &d) in dt.indexed_iter() {
            let brute = [[1usize, 2usize, 3usize], [4, 0, 6]]
                .iter()
                .map(|p| {
                    let dz = (z as f32 - p[0] as f32) * spacing[0];
                    let dy = (y as f32 - p[1] as f32) * spacing[1];
                    let dx = (x as f32 - p[2] as f32) * spacing[2];
                    (dz * dz + dy * dy + dx * dx).sqrt()
                })
                .fold(f32::INFINITY, f32::min);
            assert!((d - brute).abs() < 1e-4, "at {:?}: {} vs {}", (z, y, x), d, brute);
        }
    }

    #[test]
    fn test_hd95_shifted_cube() {
        let a = cube(12, 2, 6);
        let b = Array3::from_shape_fn((12, 12, 12), |(z, y, x)| {
            (4..8).contains(&z) && (2..6).contains(&y) && (2..6).contains(&x)
        });
        let hd = hausdorff95(a.view(), b.view(), [1.0; 3]).unwrap();
        assert!((hd - 2.0).abs() < 1e-5);
        assert_eq!(hausdorff95(a.view(), a.view(), [1.0; 3]), Some(0.0));
    }

    #[test]
    fn test_hd95_empty_is_none() {
        let a = cube(6, 1, 3);
        let empty = Array3::from_elem((6, 6, 6), false);
        assert_eq!(hausdorff95(a.view(), empty.view(), [1.0; 3]), None);
    }

    #[test]
    fn test_report_aggregation() {
        let cases = vec![
            CaseMetrics {
                case_id: "a".into(),
                dice: vec![1.0, 0.5, 0.0],
                hd95: vec![Some(0.0), Some(2.0), None],
            },
            CaseMetrics {
                case_id: "b".into(),
                dice: vec![1.0, 1.0, 1.0],
                hd95: vec![Some(0.0), Some(4.0), None],
            },
        ];
        let report = MetricReport::aggregate(&cases, Some(0.3));
        assert_eq!(report.dice, vec![1.0, 0.75, 0.5]);
        assert_eq!(report.hd95, vec![Some(0.0), Some(3.0), None]);
        assert!((report.mean_foreground_dice() - 0.625).abs() < 1e-6);

        let avg = MetricReport::average(&[report.clone(), report]).unwrap();
        assert_eq!(avg.dice, vec![1.0, 0.75, 0.5]);
        assert_eq!(avg.num_cases, 4);
    }
}
