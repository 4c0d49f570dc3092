use crate::data::{Assignment, CourseId, FacultyId, Placement, RoomId, SessionKey, Snapshot, TimeSlotId};
use crate::error::{EngineError, Result};
use good_lp::variable;
use good_lp::{
    Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable, constraint, default_solver,
};
use itertools::Itertools;
use log::{info, trace};
use std::collections::HashMap;
use std::time::Instant;

/// Exact 0/1 model of one cluster, solved with the HiGHS ILP solver.
///
/// `domains` holds the admissible placements of every session; placements
/// that clash with bookings outside the cluster must already be filtered out.
/// Returns `Ok(None)` when the model is infeasible.
pub fn solve_exact(
    snapshot: &Snapshot,
    domains: &[(SessionKey, Vec<Placement>)],
    time_limit_secs: f64,
) -> Result<Option<Assignment>> {
    let start_time = Instant::now();
    let mut problem = ProblemVariables::new();

    // x_sp = 1 if session s takes placement p
    let candidates: Vec<(SessionKey, Placement)> = domains
        .iter()
        .flat_map(|(key, domain)| domain.iter().map(move |p| (*key, *p)))
        .collect();
    info!(
        "Setting up ILP model with {} sessions and {} candidate placements...",
        domains.len(),
        candidates.len()
    );
    if domains.iter().any(|(_, d)| d.is_empty()) {
        trace!("a session has an empty domain, model is trivially infeasible");
        return Ok(None);
    }
    let vars = problem.add_vector(variable().binary(), candidates.len());

    // lookups
    let mut by_session: HashMap<SessionKey, Vec<Variable>> = HashMap::new();
    let mut by_room: HashMap<(RoomId, TimeSlotId), Vec<Variable>> = HashMap::new();
    let mut by_faculty: HashMap<(FacultyId, TimeSlotId), Vec<Variable>> = HashMap::new();
    let mut by_course: HashMap<(CourseId, TimeSlotId), Vec<Variable>> = HashMap::new();
    for (i, (key, p)) in candidates.iter().enumerate() {
        by_session.entry(*key).or_default().push(vars[i]);
        by_room.entry((p.room, p.slot)).or_default().push(vars[i]);
        by_faculty.entry((p.faculty, p.slot)).or_default().push(vars[i]);
        by_course.entry((key.course_id, p.slot)).or_default().push(vars[i]);
    }

    // prefer slots the faculty rates highly
    let objective: Expression = candidates
        .iter()
        .zip(&vars)
        .map(|((_, p), var)| {
            let weight = snapshot.faculty_member(p.faculty).map(|f| f.preference(p.slot)).unwrap_or(0.5);
            weight * *var
        })
        .sum();

    let mut model = problem
        .maximise(objective)
        .using(default_solver)
        .set_option("threads", 1) // limit to 1 thread for reproducibility
        .set_option("random_seed", 1234) //set seed for reproducibility
        .set_option("time_limit", time_limit_secs)
        .set_option("log_to_console", false);

    // every session exactly once
    for session_vars in by_session.values() {
        let scheduled_once: Expression = session_vars.iter().copied().sum();
        model.add_constraint(constraint!(scheduled_once == 1));
    }

    // no room double-booking
    for room_vars in by_room.values().filter(|v| v.len() > 1) {
        let room_occupied: Expression = room_vars.iter().copied().sum();
        model.add_constraint(constraint!(room_occupied <= 1));
    }

    // no faculty overlap
    for faculty_vars in by_faculty.values().filter(|v| v.len() > 1) {
        let faculty_busy: Expression = faculty_vars.iter().copied().sum();
        model.add_constraint(constraint!(faculty_busy <= 1));
    }

    // no student overlap: a course with itself, and every conflicting pair
    let courses: Vec<CourseId> = domains.iter().map(|(k, _)| k.course_id).unique().collect();
    let slots: Vec<TimeSlotId> = snapshot.time_slots().iter().map(|s| s.id).collect();
    for &slot in &slots {
        for &course in &courses {
            if let Some(v) = by_course.get(&(course, slot)).filter(|v| v.len() > 1) {
                let same_course: Expression = v.iter().copied().sum();
                model.add_constraint(constraint!(same_course <= 1));
            }
        }
        for (&a, &b) in courses.iter().tuple_combinations() {
            if !snapshot.courses_conflict(a, b) {
                continue;
            }
            let (Some(va), Some(vb)) = (by_course.get(&(a, slot)), by_course.get(&(b, slot))) else {
                continue;
            };
            let shared: Expression = va.iter().chain(vb.iter()).copied().sum();
            model.add_constraint(constraint!(shared <= 1));
        }
    }

    //solve
    info!("Starting ILP solver...");
    let solution = match model.solve() {
        Ok(s) => s,
        Err(ResolutionError::Infeasible) => {
            info!("ILP model infeasible after {:.2?}", start_time.elapsed());
            return Ok(None);
        }
        Err(e) => {
            return Err(EngineError::Solver(format!("ILP solver failed: {e}")));
        }
    };
    info!("Solution found in {:.2?}", start_time.elapsed());

    // get assignments from solution
    let mut assignment = Assignment::new();
    for ((key, p), var) in candidates.iter().zip(&vars) {
        if solution.value(*var) > 0.9 {
            assignment.insert(*key, *p);
        }
    }
    if assignment.len() != domains.len() {
        // time limit hit before a feasible incumbent
        return Ok(None);
    }
    Ok(Some(assignment))
}

/// Decision variables the model would create.
pub fn model_size(domains: &[(SessionKey, Vec<Placement>)]) -> usize {
    domains.iter().map(|(_, d)| d.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use crate::validation::find_conflicts;

    fn domains_for(snapshot: &Snapshot) -> Vec<(SessionKey, Vec<Placement>)> {
        snapshot
            .sessions()
            .map(|key| {
                let course = snapshot.course(key.course_id).unwrap();
                let domain = snapshot
                    .time_slots()
                    .iter()
                    .flat_map(|s| {
                        snapshot.rooms().iter().map(move |r| Placement {
                            slot: s.id,
                            room: r.id,
                            faculty: course.faculty_id,
                        })
                    })
                    .filter(|p| snapshot.is_admissible(course, p))
                    .collect();
                (key, domain)
            })
            .collect()
    }

    #[test]
    fn test_exact_solution_is_conflict_free() {
        let snap = campus();
        let domains = domains_for(&snap);
        let assignment = solve_exact(&snap, &domains, 10.0).unwrap().expect("feasible");
        assert_eq!(assignment.len(), snap.total_sessions());
        assert!(find_conflicts(&snap, &assignment).is_empty());
    }

    #[test]
    fn test_exact_reports_infeasible() {
        // two single-session courses, one faculty, one slot
        let snap = Snapshot::new(
            vec![course(1, 10, &[1], 1), course(2, 10, &[2], 1)],
            vec![faculty(10)],
            vec![room(1, 5), room(2, 5)],
            grid(1, 1),
            vec![],
        );
        let domains = domains_for(&snap);
        assert!(solve_exact(&snap, &domains, 10.0).unwrap().is_none());
    }

    #[test]
    fn test_empty_domain_short_circuits() {
        let snap = campus();
        let domains = vec![(SessionKey::new(1, 0), Vec::new())];
        assert_eq!(model_size(&domains), 0);
        assert!(solve_exact(&snap, &domains, 1.0).unwrap().is_none());
    }
}
