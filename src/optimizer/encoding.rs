//! Bijective mapping between an [`Assignment`] and a flat gene vector.
//!
//! Gene `i` is the session `genes[i]`; its value indexes the (slot, room)
//! pair table, laid out slot-major. Faculty is not encoded: each gene keeps
//! the faculty of the assignment the table was built from. The table is
//! built once per job and never re-derived mid-run.

use std::collections::{BTreeSet, HashMap};

use crate::data::{Assignment, FacultyId, Placement, RoomId, SessionKey, Snapshot, TimeSlotId};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct EncodingTable {
    genes: Vec<SessionKey>,
    gene_faculty: Vec<FacultyId>,
    slots: Vec<TimeSlotId>,
    rooms: Vec<RoomId>,
    /// Admissible pair indices per gene.
    domains: Vec<Vec<u32>>,
    /// Gene pairs that must never share a slot.
    conflict_pairs: Vec<(usize, usize)>,
}

impl EncodingTable {
    pub fn build(snapshot: &Snapshot, base: &Assignment) -> Self {
        let slots: Vec<TimeSlotId> = snapshot.time_slots().iter().map(|s| s.id).collect();
        let rooms: Vec<RoomId> = snapshot.rooms().iter().map(|r| r.id).collect();
        let genes: Vec<SessionKey> = base.keys().copied().collect();
        let gene_faculty: Vec<FacultyId> = base.iter().map(|(_, p)| p.faculty).collect();

        let mut domains = Vec::with_capacity(genes.len());
        for (i, key) in genes.iter().enumerate() {
            let mut domain = Vec::new();
            if let Some(course) = snapshot.course(key.course_id) {
                for (si, &slot) in slots.iter().enumerate() {
                    for (ri, &room) in rooms.iter().enumerate() {
                        let p = Placement {
                            slot,
                            room,
                            faculty: gene_faculty[i],
                        };
                        if snapshot.is_admissible(course, &p) {
                            domain.push((si * rooms.len() + ri) as u32);
                        }
                    }
                }
            }
            domains.push(domain);
        }

        let mut conflict_pairs = Vec::new();
        for i in 0..genes.len() {
            for j in i + 1..genes.len() {
                if snapshot.courses_conflict(genes[i].course_id, genes[j].course_id) {
                    conflict_pairs.push((i, j));
                }
            }
        }

        let mut table = Self {
            genes,
            gene_faculty,
            slots,
            rooms,
            domains,
            conflict_pairs,
        };
        // the base placement always stays reachable
        if let Ok(encoded) = table.encode(base) {
            for (domain, value) in table.domains.iter_mut().zip(encoded) {
                if !domain.contains(&value) {
                    domain.push(value);
                }
            }
        }
        table
    }

    /// Restricts each listed session to its placement in `base`.
    pub fn pin(mut self, base: &Assignment, pinned: &BTreeSet<SessionKey>) -> Self {
        if pinned.is_empty() {
            return self;
        }
        if let Ok(encoded) = self.encode(base) {
            for (gene, value) in encoded.into_iter().enumerate() {
                if pinned.contains(&self.genes[gene]) {
                    self.domains[gene] = vec![value];
                }
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn genes(&self) -> &[SessionKey] {
        &self.genes
    }

    pub fn gene_faculty(&self, gene: usize) -> FacultyId {
        self.gene_faculty[gene]
    }

    pub fn domain(&self, gene: usize) -> &[u32] {
        &self.domains[gene]
    }

    pub fn conflict_pairs(&self) -> &[(usize, usize)] {
        &self.conflict_pairs
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn slot_index(&self, value: u32) -> usize {
        value as usize / self.rooms.len().max(1)
    }

    pub fn room_index(&self, value: u32) -> usize {
        value as usize % self.rooms.len().max(1)
    }

    pub fn placement(&self, gene: usize, value: u32) -> Placement {
        Placement {
            slot: self.slots[self.slot_index(value)],
            room: self.rooms[self.room_index(value)],
            faculty: self.gene_faculty[gene],
        }
    }

    pub fn encode(&self, assignment: &Assignment) -> Result<Vec<u32>> {
        let slot_pos: HashMap<TimeSlotId, usize> = self.slots.iter().enumerate().map(|(i, s)| (*s, i)).collect();
        let room_pos: HashMap<RoomId, usize> = self.rooms.iter().enumerate().map(|(i, r)| (*r, i)).collect();
        self.genes
            .iter()
            .map(|key| {
                let p = assignment
                    .get(key)
                    .ok_or_else(|| EngineError::Internal(format!("session {key} missing from encoded assignment")))?;
                let (Some(si), Some(ri)) = (slot_pos.get(&p.slot), room_pos.get(&p.room)) else {
                    return Err(EngineError::Internal(format!("session {key} placed outside the pair table")));
                };
                Ok((si * self.rooms.len() + ri) as u32)
            })
            .collect()
    }

    pub fn decode(&self, values: &[u32]) -> Assignment {
        values
            .iter()
            .enumerate()
            .map(|(gene, &value)| (self.genes[gene], self.placement(gene, value)))
            .collect()
    }
}
