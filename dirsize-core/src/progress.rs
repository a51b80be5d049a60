//! Computes a weighted completion estimate for a live scan against the most
//! recent successful baseline for the same paths.

use std::collections::HashMap;

use dirsize_common::ScanResult;

use crate::executor::LiveScanState;
use crate::path::normalize;

const SIZE_WEIGHT: f64 = 0.7;
const DIRS_WEIGHT: f64 = 0.2;
const FILES_WEIGHT: f64 = 0.1;

struct BaselinePath {
    size: u64,
    dirs: u64,
    files: u64,
}

/// Weighted completion estimate in `[0, 100]`, or `None` if the baseline has
/// no usable path.
pub fn estimate(live: &LiveScanState, baseline: &ScanResult) -> Option<f64> {
    let mut by_path: HashMap<String, BaselinePath> = HashMap::new();
    for item in &baseline.items {
        if !item.success {
            continue;
        }
        let key = normalize(&item.folder_name);
        let size = item.total_size_bytes.unwrap_or(0);
        let entry = by_path.entry(key).or_insert(BaselinePath {
            size,
            dirs: item.num_dir.unwrap_or(0),
            files: item.num_file.unwrap_or(0),
        });
        // On collision keep the item with the larger totalSize.
        if size > entry.size {
            entry.size = size;
            entry.dirs = item.num_dir.unwrap_or(0);
            entry.files = item.num_file.unwrap_or(0);
        }
    }

    if by_path.is_empty() {
        return fallback_from_aggregates(live, baseline);
    }

    let mut weighted_size = 0.0;
    let mut weighted_dirs = 0.0;
    let mut weighted_files = 0.0;
    let mut total_weight = 0.0;

    for (path, hist) in &by_path {
        let current = live.per_path.get(path);
        let (cur_size, cur_dirs, cur_files, finished) = current
            .map(|p| (p.total_size, p.num_dir, p.num_file, p.finished))
            .unwrap_or((0, 0, 0, false));

        let size_pct = axis_pct(hist.size, cur_size, finished);
        let dirs_pct = axis_pct(hist.dirs, cur_dirs, finished);
        let files_pct = axis_pct(hist.files, cur_files, finished);

        let weight = if hist.size > 0 {
            hist.size as f64
        } else if hist.dirs > 0 {
            hist.dirs as f64 * 1000.0
        } else if hist.files > 0 {
            hist.files as f64
        } else {
            1.0
        };

        weighted_size += weight * size_pct;
        weighted_dirs += weight * dirs_pct;
        weighted_files += weight * files_pct;
        total_weight += weight;
    }

    if total_weight == 0.0 {
        return fallback_from_aggregates(live, baseline);
    }

    let size_pct = weighted_size / total_weight;
    let dirs_pct = weighted_dirs / total_weight;
    let files_pct = weighted_files / total_weight;

    Some(combine(size_pct, dirs_pct, files_pct))
}

/// `histSize`/`histDirs`/`histFiles` denominators of zero degrade to 0%
/// while running, 100% once the path is marked finished.
fn axis_pct(hist: u64, current: u64, finished: bool) -> f64 {
    if hist == 0 {
        return if finished { 100.0 } else { 0.0 };
    }
    (current as f64 / hist as f64 * 100.0).clamp(0.0, 100.0)
}

fn combine(size_pct: f64, dirs_pct: f64, files_pct: f64) -> f64 {
    let raw = SIZE_WEIGHT * size_pct + DIRS_WEIGHT * dirs_pct + FILES_WEIGHT * files_pct;
    (raw * 10.0).round() / 10.0
}

/// Used when the baseline has items but none index into a usable path
/// (e.g. every baseline item was a zero-metric success): aggregate the
/// live scan's sums against the baseline's sums for each axis instead of
/// per-path weighting.
fn fallback_from_aggregates(live: &LiveScanState, baseline: &ScanResult) -> Option<f64> {
    let successes: Vec<_> = baseline.items.iter().filter(|i| i.success).collect();
    if successes.is_empty() {
        return None;
    }
    let hist_size: u64 = successes.iter().filter_map(|i| i.total_size_bytes).sum();
    let hist_dirs: u64 = successes.iter().filter_map(|i| i.num_dir).sum();
    let hist_files: u64 = successes.iter().filter_map(|i| i.num_file).sum();

    let agg = live.aggregate();
    let size_pct = axis_pct(hist_size, agg.total_size, agg.finished);
    let dirs_pct = axis_pct(hist_dirs, agg.num_dir, agg.finished);
    let files_pct = axis_pct(hist_files, agg.num_file, agg.finished);

    Some(combine(size_pct, dirs_pct, files_pct))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PathProgress;
    use dirsize_common::{ScanResultItem, ScanStatus};
    use std::time::Duration;

    fn baseline(items: Vec<ScanResultItem>) -> ScanResult {
        ScanResult {
            slug: "docs".into(),
            scan_name: "Docs".into(),
            timestamp: chrono::Utc::now(),
            status: ScanStatus::Completed,
            items,
            error: None,
        }
    }

    #[test]
    fn returns_none_when_baseline_has_no_successes() {
        let live = LiveScanState::default();
        let b = baseline(vec![ScanResultItem::failure("/a".into(), "boom")]);
        assert!(estimate(&live, &b).is_none());
    }

    #[test]
    fn size_axis_dominates_weighting() {
        let gib = 1024u64 * 1024 * 1024;
        let b = baseline(vec![
            ScanResultItem::success("/a".into(), 10, 100, 10 * gib, 0),
            ScanResultItem::success("/b".into(), 1, 10, 1024 * 1024, 0),
        ]);
        let mut live = LiveScanState::default();
        live.expected_paths = vec!["/a".into(), "/b".into()];
        live.per_path.insert(
            "/a".into(),
            PathProgress {
                num_dir: 5,
                num_file: 50,
                total_size: 5 * gib,
                waited: Duration::ZERO,
                finished: false,
            },
        );
        live.per_path.insert(
            "/b".into(),
            PathProgress {
                num_dir: 1,
                num_file: 10,
                total_size: 1024 * 1024,
                waited: Duration::ZERO,
                finished: true,
            },
        );

        let pct = estimate(&live, &b).unwrap();
        // Size axis is ~50% and dominates at weight 0.7; final should land
        // comfortably between 40 and 60.
        assert!(pct > 40.0 && pct < 60.0, "pct = {pct}");
    }

    #[test]
    fn unfinished_zero_denominator_path_contributes_zero_not_full() {
        let b = baseline(vec![ScanResultItem::success("/a".into(), 0, 0, 0, 0)]);
        let mut live = LiveScanState::default();
        live.expected_paths = vec!["/a".into()];
        live.per_path.insert(
            "/a".into(),
            PathProgress {
                finished: false,
                ..Default::default()
            },
        );
        assert_eq!(estimate(&live, &b), Some(0.0));
    }

    #[test]
    fn finished_zero_denominator_path_counts_as_complete() {
        let b = baseline(vec![ScanResultItem::success("/a".into(), 0, 0, 0, 0)]);
        let mut live = LiveScanState::default();
        live.expected_paths = vec!["/a".into()];
        live.per_path.insert(
            "/a".into(),
            PathProgress {
                finished: true,
                ..Default::default()
            },
        );
        assert_eq!(estimate(&live, &b), Some(100.0));
    }

    #[test]
    fn collision_on_normalized_path_keeps_larger_size() {
        let b = baseline(vec![
            ScanResultItem::success("/a/".into(), 1, 1, 100, 0),
            ScanResultItem::success("//a".into(), 2, 2, 500, 0),
        ]);
        let mut live = LiveScanState::default();
        live.expected_paths = vec!["/a".into()];
        live.per_path.insert(
            "/a".into(),
            PathProgress {
                total_size: 500,
                finished: true,
                ..Default::default()
            },
        );
        assert_eq!(estimate(&live, &b), Some(100.0));
    }
}
