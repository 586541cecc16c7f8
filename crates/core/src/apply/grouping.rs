//! File-overlap grouping for the parallel strategy.

use std::collections::HashMap;

use crate::models::Patch;

/// Partition `patches` into waves of pairwise file-disjoint patches.
///
/// Each patch lands in the earliest wave after every earlier patch it
/// shares a file with, so overlapping patches keep their relative order.
/// Returns indices into `patches`.
pub fn plan_waves(patches: &[Patch]) -> Vec<Vec<usize>> {
    let mut waves: Vec<Vec<usize>> = Vec::new();
    // Latest wave that touched each path.
    let mut last_wave_for: HashMap<String, usize> = HashMap::new();

    for (idx, patch) in patches.iter().enumerate() {
        let targets = patch.target_paths();
        let wave = targets
            .iter()
            .filter_map(|p| last_wave_for.get(p))
            .map(|w| w + 1)
            .max()
            .unwrap_or(0);

        if wave == waves.len() {
            waves.push(Vec::new());
        }
        waves[wave].push(idx);
        for path in targets {
            last_wave_for.insert(path, wave);
        }
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileOperation, FilePatch};

    fn patch(id: &str, paths: &[&str]) -> Patch {
        Patch {
            id: id.into(),
            file_patches: paths
                .iter()
                .map(|p| FilePatch {
                    path: p.to_string(),
                    operation: FileOperation::Modify,
                    changes: Vec::new(),
                    content: None,
                    confidence: 1.0,
                    description: String::new(),
                })
                .collect(),
            config_patches: Vec::new(),
            confidence: 1.0,
            breaking_change: false,
            description: None,
        }
    }

    #[test]
    fn test_disjoint_patches_share_a_wave() {
        let patches = vec![patch("a", &["x"]), patch("b", &["y"]), patch("c", &["z"])];
        assert_eq!(plan_waves(&patches), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_overlap_keeps_order() {
        let patches = vec![
            patch("a", &["x"]),
            patch("b", &["x", "y"]),
            patch("c", &["z"]),
            patch("d", &["y"]),
        ];
        assert_eq!(plan_waves(&patches), vec![vec![0, 2], vec![1], vec![3]]);
    }

    #[test]
    fn test_aliased_paths_overlap() {
        let patches = vec![
            patch("a", &["a.txt"]),
            patch("b", &["./a.txt"]),
            patch("c", &["src//lib.rs"]),
            patch("d", &["src/lib.rs"]),
        ];
        assert_eq!(plan_waves(&patches), vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_empty() {
        assert!(plan_waves(&[]).is_empty());
    }
}
