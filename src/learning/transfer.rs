//! Transfer bootstrap across institutions.
//!
//! An institution is profiled by a handful of size features. A new
//! institution's Q-table starts as the similarity-weighted average of the
//! tables of its nearest prior institutions.

use itertools::Itertools;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::qtable::{ActionKey, QTable, StateKey};
use crate::data::Snapshot;

pub const FEATURES: usize = 6;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstitutionProfile {
    pub institution: String,
    /// students, faculty, courses, rooms, mean class size, departments
    pub features: [f64; FEATURES],
}

impl InstitutionProfile {
    pub fn from_snapshot(institution: impl Into<String>, snapshot: &Snapshot) -> Self {
        let courses = snapshot.courses();
        let mut students: BTreeSet<u32> = snapshot.students().iter().map(|s| s.id).collect();
        students.extend(courses.iter().flat_map(|c| c.student_ids.iter().copied()));
        let mean_class = if courses.is_empty() {
            0.0
        } else {
            courses.iter().map(|c| snapshot.enrollment(c) as f64).sum::<f64>() / courses.len() as f64
        };
        let departments = courses
            .iter()
            .map(|c| c.department_id)
            .chain(snapshot.faculty().iter().map(|f| f.department_id))
            .unique()
            .count();
        Self {
            institution: institution.into(),
            features: [
                students.len() as f64,
                snapshot.faculty().len() as f64,
                courses.len() as f64,
                snapshot.rooms().len() as f64,
                mean_class,
                departments as f64,
            ],
        }
    }
}

/// Log-scaled features divided by `scale`, so every dimension lies in [0, 1].
fn normalize(features: &[f64; FEATURES], scale: &[f64; FEATURES]) -> [f64; FEATURES] {
    let mut out = [0.0; FEATURES];
    for i in 0..FEATURES {
        let v = features[i].max(0.0).ln_1p();
        out[i] = if scale[i] > 0.0 { v / scale[i] } else { 0.0 };
    }
    out
}

pub fn cosine(a: &[f64; FEATURES], b: &[f64; FEATURES]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

/// Known institution profiles, optionally grouped by k-means.
#[derive(Debug, Clone, Default)]
pub struct ProfileIndex {
    profiles: Vec<InstitutionProfile>,
    groups: Vec<usize>,
    centroids: Vec<[f64; FEATURES]>,
    // normalization the centroids were built with
    group_scale: [f64; FEATURES],
}

impl ProfileIndex {
    pub fn new(profiles: Vec<InstitutionProfile>) -> Self {
        Self {
            profiles,
            groups: Vec::new(),
            centroids: Vec::new(),
            group_scale: [0.0; FEATURES],
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Adds or replaces a profile; existing groups go stale until the next recluster.
    pub fn upsert(&mut self, profile: InstitutionProfile) {
        match self.profiles.iter_mut().find(|p| p.institution == profile.institution) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
        self.groups.clear();
        self.centroids.clear();
    }

    fn scale(&self, extra: Option<&InstitutionProfile>) -> [f64; FEATURES] {
        let mut scale = [0.0f64; FEATURES];
        for p in self.profiles.iter().chain(extra) {
            for (s, v) in scale.iter_mut().zip(p.features) {
                *s = s.max(v.max(0.0).ln_1p());
            }
        }
        scale
    }

    /// Up to `k` most similar other institutions with positive similarity,
    /// drawn from the target's group first when groups are current.
    pub fn similar(&self, target: &InstitutionProfile, k: usize) -> Vec<(String, f64)> {
        let scale = self.scale(Some(target));
        let t = normalize(&target.features, &scale);
        let group = self.group_of(target);
        let mut ranked: Vec<(bool, String, f64)> = self
            .profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| p.institution != target.institution)
            .map(|(i, p)| {
                let same_group = group.is_some() && self.groups.get(i).copied() == group;
                (same_group, p.institution.clone(), cosine(&t, &normalize(&p.features, &scale)))
            })
            .filter(|(_, _, sim)| *sim > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.2.total_cmp(&a.2)).then(a.1.cmp(&b.1)));
        ranked.into_iter().take(k).map(|(_, name, sim)| (name, sim)).collect()
    }

    /// Group of a profile, if the index has been clustered. The profile is
    /// normalized on the same scale as the centroids.
    pub fn group_of(&self, profile: &InstitutionProfile) -> Option<usize> {
        let v = normalize(&profile.features, &self.group_scale);
        self.centroids
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| cosine(&v, a).total_cmp(&cosine(&v, b)))
            .map(|(g, _)| g)
    }

    /// K-means over normalized profiles (cosine assignment).
    pub fn recluster(&mut self, k: usize, seed: u64) {
        let k = k.min(self.profiles.len());
        if k == 0 {
            self.groups.clear();
            self.centroids.clear();
            return;
        }
        let scale = self.scale(None);
        let points: Vec<[f64; FEATURES]> = self.profiles.iter().map(|p| normalize(&p.features, &scale)).collect();
        // random first centre, then farthest-first
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picks = vec![rng.random_range(0..points.len())];
        while picks.len() < k {
            let next = (0..points.len())
                .filter(|i| !picks.contains(i))
                .min_by(|&a, &b| {
                    let near = |i: usize| picks.iter().map(|&c| cosine(&points[i], &points[c])).fold(f64::MIN, f64::max);
                    near(a).total_cmp(&near(b))
                });
            match next {
                Some(i) => picks.push(i),
                None => break,
            }
        }
        let mut centroids: Vec<[f64; FEATURES]> = picks.iter().map(|&i| points[i]).collect();
        let mut groups = vec![usize::MAX; points.len()];
        for round in 0..50 {
            let mut changed = false;
            for (i, p) in points.iter().enumerate() {
                let g = centroids
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| cosine(p, a).total_cmp(&cosine(p, b)))
                    .map_or(0, |(g, _)| g);
                if groups[i] != g {
                    changed = true;
                    groups[i] = g;
                }
            }
            for (g, centroid) in centroids.iter_mut().enumerate() {
                let members: Vec<&[f64; FEATURES]> =
                    points.iter().zip(&groups).filter(|(_, pg)| **pg == g).map(|(p, _)| p).collect();
                if members.is_empty() {
                    continue;
                }
                for d in 0..FEATURES {
                    centroid[d] = members.iter().map(|m| m[d]).sum::<f64>() / members.len() as f64;
                }
            }
            if !changed {
                debug!("profile k-means converged after {round} rounds");
                break;
            }
        }
        info!("Re-clustered {} institution profiles into {k} groups", self.profiles.len());
        self.groups = groups;
        self.centroids = centroids;
        self.group_scale = scale;
    }
}

/// Similarity-weighted average of the donors' tables.
///
/// Each (state, action) value is averaged over the donors that know it.
pub fn bootstrap(donors: &[(f64, &QTable)]) -> QTable {
    let mut acc: HashMap<(StateKey, ActionKey), (f64, f64)> = HashMap::new();
    for (sim, table) in donors {
        if *sim <= 0.0 {
            continue;
        }
        for (state, action, value) in table.iter() {
            let e = acc.entry((*state, *action)).or_insert((0.0, 0.0));
            e.0 += sim * value;
            e.1 += sim;
        }
    }
    let mut table = QTable::new();
    for ((state, action), (weighted, weight)) in acc {
        table.set(state, action, weighted / weight);
    }
    table
}
