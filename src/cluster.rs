//! Course clustering.
//!
//! Courses are nodes of a weighted coupling graph; clusters are grown by
//! greedily merging the most strongly coupled pair of groups until no merge
//! fits under the size cap, then undersized groups are folded into their
//! best neighbour. Clusters are weakly coupled, not independent: the merged
//! result is always re-validated.

use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::config::ClusteringConfig;
use crate::data::{CourseId, Snapshot};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: usize,
    pub courses: Vec<CourseId>,
    /// Intra-cluster weight over all weight touching the cluster.
    pub cohesion: f64,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

/// Symmetric edge weights keyed by ordered course pair.
#[derive(Debug, Clone, Default)]
pub struct CouplingGraph {
    edges: HashMap<(CourseId, CourseId), f64>,
}

impl CouplingGraph {
    pub fn build(snapshot: &Snapshot, config: &ClusteringConfig) -> Self {
        let mut graph = Self::default();
        let courses = snapshot.courses();

        // shared faculty
        let by_faculty = courses.iter().map(|c| (c.faculty_id, c.id)).into_group_map();
        for group in by_faculty.values() {
            for (a, b) in group.iter().tuple_combinations() {
                graph.add(*a, *b, config.faculty_weight);
            }
        }

        // student overlap, weighted by headcount
        for course in courses {
            for other in snapshot.conflicting_courses(course.id) {
                if course.id < other {
                    let overlap = snapshot.student_overlap(course.id, other) as f64;
                    graph.add(course.id, other, config.student_weight * overlap);
                }
            }
        }

        // contention for scarce rooms
        let scarce_limit = (snapshot.rooms().len() / 4).max(1);
        let mut by_room: HashMap<u32, Vec<CourseId>> = HashMap::new();
        for course in courses {
            let rooms = snapshot.candidate_rooms(course);
            if !rooms.is_empty() && rooms.len() <= scarce_limit {
                for r in rooms {
                    by_room.entry(r).or_default().push(course.id);
                }
            }
        }
        for group in by_room.values() {
            for (a, b) in group.iter().tuple_combinations() {
                graph.add(*a, *b, config.room_weight);
            }
        }
        graph
    }

    fn add(&mut self, a: CourseId, b: CourseId, w: f64) {
        if a == b || w <= 0.0 {
            return;
        }
        let key = if a < b { (a, b) } else { (b, a) };
        *self.edges.entry(key).or_default() += w;
    }

    pub fn weight(&self, a: CourseId, b: CourseId) -> f64 {
        let key = if a < b { (a, b) } else { (b, a) };
        self.edges.get(&key).copied().unwrap_or(0.0)
    }

    /// Total weight between two course groups.
    pub fn coupling(&self, a: &[CourseId], b: &[CourseId]) -> f64 {
        a.iter().flat_map(|x| b.iter().map(move |y| (*x, *y))).map(|(x, y)| self.weight(x, y)).sum()
    }

    fn cohesion(&self, members: &[CourseId]) -> f64 {
        let inside: BTreeSet<CourseId> = members.iter().copied().collect();
        let (mut intra, mut cut) = (0.0, 0.0);
        for (&(a, b), &w) in &self.edges {
            match (inside.contains(&a), inside.contains(&b)) {
                (true, true) => intra += w,
                (true, false) | (false, true) => cut += w,
                _ => {}
            }
        }
        if intra + cut == 0.0 { 1.0 } else { intra / (intra + cut) }
    }
}

/// Partitions all courses of the snapshot.
pub fn partition(snapshot: &Snapshot, config: &ClusteringConfig) -> (Vec<Cluster>, CouplingGraph) {
    let graph = CouplingGraph::build(snapshot, config);
    let mut groups: Vec<Vec<CourseId>> = snapshot.courses().iter().map(|c| vec![c.id]).collect();
    let max = config.max_cluster_size.max(1);
    let min = config.min_cluster_size.min(max);

    // agglomerate strongest pairs under the size cap
    loop {
        let owner: HashMap<CourseId, usize> = groups
            .iter()
            .enumerate()
            .flat_map(|(g, members)| members.iter().map(move |c| (*c, g)))
            .collect();
        let mut between: HashMap<(usize, usize), f64> = HashMap::new();
        for (&(a, b), &w) in &graph.edges {
            let (ga, gb) = (owner[&a], owner[&b]);
            if ga != gb {
                let key = if ga < gb { (ga, gb) } else { (gb, ga) };
                *between.entry(key).or_default() += w;
            }
        }
        let best = between
            .into_iter()
            .filter(|((ga, gb), _)| groups[*ga].len() + groups[*gb].len() <= max)
            .max_by(|(ka, wa), (kb, wb)| wa.total_cmp(wb).then_with(|| kb.cmp(ka)));
        let Some(((ga, gb), w)) = best else { break };
        debug!("merging groups {ga} and {gb} (weight {w:.2})");
        let absorbed = std::mem::take(&mut groups[gb]);
        groups[ga].extend(absorbed);
        groups.swap_remove(gb);
    }

    // fold undersized groups into their best-coupled neighbour
    groups.sort_by_key(|g| g.len());
    let mut i = 0;
    while i < groups.len() {
        if groups[i].len() >= min || groups.len() == 1 {
            i += 1;
            continue;
        }
        let target = (0..groups.len())
            .filter(|&j| j != i && groups[i].len() + groups[j].len() <= max)
            .max_by(|&a, &b| {
                graph
                    .coupling(&groups[i], &groups[a])
                    .total_cmp(&graph.coupling(&groups[i], &groups[b]))
                    .then_with(|| groups[b].len().cmp(&groups[a].len()))
            });
        match target {
            Some(j) => {
                let small = std::mem::take(&mut groups[i]);
                groups[j].extend(small);
                groups.remove(i);
                i = 0;
            }
            None => i += 1,
        }
    }

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|mut courses| {
            courses.sort_unstable();
            let cohesion = graph.cohesion(&courses);
            Cluster { id: 0, courses, cohesion }
        })
        .collect();
    clusters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.courses[0].cmp(&b.courses[0])));
    for (id, c) in clusters.iter_mut().enumerate() {
        c.id = id;
    }
    info!(
        "Partitioned {} courses into {} clusters (sizes {:?})",
        snapshot.courses().len(),
        clusters.len(),
        clusters.iter().map(Cluster::len).collect::<Vec<_>>()
    );
    (clusters, graph)
}

/// One cluster holding every course.
pub fn single(snapshot: &Snapshot) -> Cluster {
    let mut courses: Vec<CourseId> = snapshot.courses().iter().map(|c| c.id).collect();
    courses.sort_unstable();
    Cluster {
        id: 0,
        courses,
        cohesion: 1.0,
    }
}

/// The other cluster most strongly coupled to `clusters[index]`.
pub fn strongest_neighbour(clusters: &[Cluster], index: usize, graph: &CouplingGraph) -> Option<usize> {
    (0..clusters.len())
        .filter(|&j| j != index)
        .max_by(|&a, &b| {
            graph
                .coupling(&clusters[index].courses, &clusters[a].courses)
                .total_cmp(&graph.coupling(&clusters[index].courses, &clusters[b].courses))
                .then_with(|| b.cmp(&a))
        })
}

/// Union of two clusters, keeping the id of the first.
pub fn merge(a: &Cluster, b: &Cluster, graph: &CouplingGraph) -> Cluster {
    let mut courses: Vec<CourseId> = a.courses.iter().chain(&b.courses).copied().collect();
    courses.sort_unstable();
    courses.dedup();
    let cohesion = graph.cohesion(&courses);
    Cluster {
        id: a.id,
        courses,
        cohesion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;

    fn config(min: usize, max: usize) -> ClusteringConfig {
        ClusteringConfig {
            min_cluster_size: min,
            max_cluster_size: max,
            ..ClusteringConfig::default()
        }
    }

    fn two_communities() -> Snapshot {
        // {1,2,3} share students, {4,5,6} share students, nothing across
        let courses = vec![
            course(1, 10, &[1, 2], 1),
            course(2, 11, &[1, 2], 1),
            course(3, 12, &[2, 3], 1),
            course(4, 13, &[7, 8], 1),
            course(5, 14, &[7, 8], 1),
            course(6, 15, &[8, 9], 1),
        ];
        let faculty = (10..16).map(faculty).collect();
        Snapshot::new(courses, faculty, vec![room(1, 10), room(2, 10), room(3, 10), room(4, 10)], grid(2, 3), vec![])
    }

    #[test]
    fn test_every_course_in_exactly_one_cluster() {
        let snap = campus();
        let (clusters, _) = partition(&snap, &config(1, 3));
        let mut seen: Vec<CourseId> = clusters.iter().flat_map(|c| c.courses.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
        assert!(clusters.iter().all(|c| c.len() <= 3));
    }

    #[test]
    fn test_student_communities_stay_together() {
        let snap = two_communities();
        let (clusters, _) = partition(&snap, &config(2, 3));
        assert_eq!(clusters.len(), 2);
        let sets: Vec<Vec<CourseId>> = clusters.iter().map(|c| c.courses.clone()).collect();
        assert!(sets.contains(&vec![1, 2, 3]));
        assert!(sets.contains(&vec![4, 5, 6]));
        assert!(clusters.iter().all(|c| (c.cohesion - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_student_weight_dominates_faculty() {
        let cfg = ClusteringConfig::default();
        let snap = campus();
        let graph = CouplingGraph::build(&snap, &cfg);
        // 1 and 3 share two students; 1 and 2 share only faculty
        assert!(graph.weight(1, 3) > graph.weight(1, 2));
        assert_eq!(graph.weight(1, 2), cfg.faculty_weight);
    }

    #[test]
    fn test_undersized_groups_are_folded() {
        let snap = two_communities();
        let (clusters, _) = partition(&snap, &config(4, 6));
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 6);
    }

    #[test]
    fn test_merge_and_neighbour() {
        let snap = campus();
        let cfg = config(1, 2);
        let (clusters, graph) = partition(&snap, &cfg);
        let n = strongest_neighbour(&clusters, 0, &graph).unwrap();
        let merged = merge(&clusters[0], &clusters[n], &graph);
        assert_eq!(merged.len(), clusters[0].len() + clusters[n].len());
        assert_eq!(merged.id, clusters[0].id);
    }
}
