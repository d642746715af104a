//! Volume assignment
//!
//! Picks the volumes a new file is written to:
//!
//! 1. volumes are shuffled with a random generator seeded by the file
//!    opening time, so the same file always gets the same volumes;
//! 2. the shuffled list is stably ordered by preferred type (types not in
//!    the preference list go last);
//! 3. volumes on distinct nodes are taken first, then the remaining ones in
//!    the same order, until `count` volumes are picked.

use super::registry::VolumeInfo;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sinkhouse_core::{AssignmentConfig, VolumeId};
use std::collections::HashSet;

pub fn assign_volumes(all: &[VolumeInfo], config: &AssignmentConfig, seed: i64) -> Vec<VolumeId> {
    let mut volumes: Vec<&VolumeInfo> = all.iter().collect();
    // Input order must not influence the result.
    volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

    let mut rng = StdRng::seed_from_u64(seed as u64);
    volumes.shuffle(&mut rng);

    volumes.sort_by_key(|v| {
        config
            .preferred_types
            .iter()
            .position(|t| *t == v.volume_type)
            .unwrap_or(usize::MAX)
    });

    let count = config.count.min(volumes.len());
    let mut picked = vec![false; volumes.len()];
    let mut nodes = HashSet::new();
    let mut out = Vec::with_capacity(count);

    for (i, v) in volumes.iter().enumerate() {
        if out.len() == count {
            break;
        }
        if nodes.insert(v.node_id.as_str()) {
            picked[i] = true;
            out.push(v.volume_id.clone());
        }
    }
    for (i, v) in volumes.iter().enumerate() {
        if out.len() == count {
            break;
        }
        if !picked[i] {
            out.push(v.volume_id.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Volume spec in the "node/type/n" form.
    fn volumes(specs: &[&str]) -> Vec<VolumeInfo> {
        specs
            .iter()
            .map(|spec| {
                let parts: Vec<&str> = spec.split('/').collect();
                VolumeInfo {
                    volume_id: VolumeId::new(spec.replace('/', "-")).unwrap(),
                    node_id: parts[0].to_string(),
                    node_address: format!("{}:4000", parts[0]),
                    volume_type: parts[1].to_string(),
                    label: parts[2].to_string(),
                    path: format!("/data/{}/{}", parts[1], parts[2]),
                }
            })
            .collect()
    }

    fn config(count: usize, preferred: &[&str]) -> AssignmentConfig {
        AssignmentConfig {
            count,
            preferred_types: preferred.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(out: &[VolumeId]) -> Vec<&str> {
        out.iter().map(|v| v.as_str()).collect()
    }

    #[test]
    fn test_empty() {
        assert!(assign_volumes(&[], &config(1, &["ssd"]), 1).is_empty());
    }

    #[test]
    fn test_same_seed_same_assignment() {
        let all = volumes(&["a/hdd/1", "a/hdd/2", "a/ssd/1", "b/ssd/1", "b/hdd/1"]);
        let mut reversed = all.clone();
        reversed.reverse();
        for seed in 0..20 {
            let cfg = config(2, &["ssd"]);
            assert_eq!(
                assign_volumes(&all, &cfg, seed),
                assign_volumes(&reversed, &cfg, seed)
            );
        }
    }

    #[test]
    fn test_preferred_type_first() {
        let all = volumes(&["n/hdd/1", "n/hdd/2", "n/hdd/3", "n/ssd/1", "n/ssd/2", "n/top/1"]);
        for seed in 0..20 {
            let out = assign_volumes(&all, &config(3, &["ssd"]), seed);
            let out = ids(&out);
            assert_eq!(out.len(), 3);
            assert!(out[0].starts_with("n-ssd"));
            assert!(out[1].starts_with("n-ssd"));
            assert!(!out[2].starts_with("n-ssd"));

            let out = assign_volumes(&all, &config(1, &["top"]), seed);
            assert_eq!(ids(&out), vec!["n-top-1"]);
        }
    }

    #[test]
    fn test_distinct_nodes_first() {
        let all = volumes(&["a/ssd/1", "a/ssd/2", "a/ssd/3", "b/hdd/1", "c/hdd/1"]);
        for seed in 0..20 {
            let out = assign_volumes(&all, &config(3, &["ssd", "hdd"]), seed);
            let out = ids(&out);
            assert!(out[0].starts_with("a-ssd"));
            assert!(out.contains(&"b-hdd-1"));
            assert!(out.contains(&"c-hdd-1"));
        }
    }

    #[test]
    fn test_count_larger_than_volumes() {
        let all = volumes(&["a/hdd/1", "a/hdd/2"]);
        let out = assign_volumes(&all, &config(10, &["hdd"]), 7);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_seed_changes_choice_within_priority() {
        let all = volumes(&["n/hdd/1", "n/hdd/2", "n/hdd/3", "n/hdd/4", "n/hdd/5"]);
        let picks: HashSet<String> = (0..50)
            .map(|seed| assign_volumes(&all, &config(1, &["hdd"]), seed)[0].to_string())
            .collect();
        assert!(picks.len() > 1);
    }
}
