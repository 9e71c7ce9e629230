//! Thought-atom tree.
//!
//! Level 0 holds one atom per recorded unit.  Whenever `F` atoms accumulate
//! un-grouped at level k, they are rolled up under a single level k+1 atom.
//! Atoms are only ever appended; an atom's content, range and children are
//! fixed at creation and its `parent` is written exactly once, when the
//! rollup above it is produced.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtomId(pub u64);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom-{}", self.0)
    }
}

/// Why [`AtomTree::push_leaf`] refused a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRejected {
    OutOfOrder { expected: u32 },
    /// No unit index follows `unit`.
    IndexExhausted { unit: u32 },
}

/// Inclusive range of unit indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRange {
    pub start: u32,
    pub end: u32,
}

impl UnitRange {
    pub fn single(unit: u32) -> Self {
        Self {
            start: unit,
            end: unit,
        }
    }

    /// Number of units covered.
    pub fn span(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, unit: u32) -> bool {
        (self.start..=self.end).contains(&unit)
    }

    /// Union of ranges that must tile contiguously, in order, with no gaps
    /// or overlaps.  `None` otherwise.
    pub fn tile(ranges: &[UnitRange]) -> Option<UnitRange> {
        let first = ranges.first()?;
        let mut end = first.end;
        for range in &ranges[1..] {
            if range.start != end.checked_add(1)? {
                return None;
            }
            end = range.end;
        }
        Some(UnitRange {
            start: first.start,
            end,
        })
    }
}

impl fmt::Display for UnitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "unit {}", self.start)
        } else {
            write!(f, "units {}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtAtom {
    pub id: AtomId,
    pub level: u32,
    /// Raw unit text at level 0, a summary above.
    pub content: String,
    pub unit_range: UnitRange,
    pub children: Vec<AtomId>,
    pub parent: Option<AtomId>,
    pub created_at: DateTime<Utc>,
}

impl ThoughtAtom {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// One piece of an assembled writing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSegment {
    pub atom_id: AtomId,
    pub level: u32,
    pub unit_range: UnitRange,
    pub content: String,
}

/// Context handed to the writer for one unit.  Segments are stored in
/// chronological order; `length` counts characters of [`render`].
///
/// [`render`]: AssembledContext::render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub unit_index: u32,
    pub budget: usize,
    pub length: usize,
    pub segments: Vec<ContextSegment>,
}

pub const SEGMENT_SEPARATOR: &str = "\n\n";

impl AssembledContext {
    pub fn empty(unit_index: u32, budget: usize) -> Self {
        Self {
            unit_index,
            budget,
            length: 0,
            segments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn render(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.content.as_str())
            .collect::<Vec<_>>()
            .join(SEGMENT_SEPARATOR)
    }

    pub fn atom_ids(&self) -> Vec<AtomId> {
        self.segments.iter().map(|segment| segment.atom_id).collect()
    }
}

/// Restore point for a partially applied `record_unit`.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    atom_count: usize,
    pending: Vec<Vec<AtomId>>,
    next_unit: Option<u32>,
    first_unit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtomTree {
    /// Indexed by `AtomId.0`.
    atoms: Vec<ThoughtAtom>,
    /// Per level, atoms not yet rolled up, oldest first.
    pending: Vec<Vec<AtomId>>,
    leaves: BTreeMap<u32, AtomId>,
    first_unit: Option<u32>,
    next_unit: Option<u32>,
}

impl AtomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn get(&self, id: AtomId) -> Option<&ThoughtAtom> {
        usize::try_from(id.0).ok().and_then(|idx| self.atoms.get(idx))
    }

    pub fn atoms(&self) -> &[ThoughtAtom] {
        &self.atoms
    }

    pub fn atoms_at_level(&self, level: u32) -> impl Iterator<Item = &ThoughtAtom> {
        self.atoms.iter().filter(move |atom| atom.level == level)
    }

    /// Highest level present, `None` when empty.
    pub fn top_level(&self) -> Option<u32> {
        self.atoms.iter().map(|atom| atom.level).max()
    }

    pub fn leaf(&self, unit: u32) -> Option<&ThoughtAtom> {
        self.leaves.get(&unit).and_then(|id| self.get(*id))
    }

    /// The unit `record_unit` will accept next, once a first unit exists.
    pub fn expected_unit(&self) -> Option<u32> {
        self.next_unit
    }

    pub fn last_unit(&self) -> Option<u32> {
        self.leaves.keys().next_back().copied()
    }

    /// Leaf for `unit` followed by each ancestor up to the root.
    pub fn path_to_root(&self, unit: u32) -> Vec<&ThoughtAtom> {
        let mut path = Vec::new();
        let mut cursor = self.leaf(unit);
        while let Some(atom) = cursor {
            path.push(atom);
            cursor = atom.parent.and_then(|id| self.get(id));
        }
        path
    }

    /// Atoms covering exactly `range`, finest first.
    pub fn find_by_range(&self, range: UnitRange) -> Vec<&ThoughtAtom> {
        self.atoms
            .iter()
            .filter(|atom| atom.unit_range == range)
            .collect()
    }

    pub fn pending_at(&self, level: u32) -> &[AtomId] {
        self.pending
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            atom_count: self.atoms.len(),
            pending: self.pending.clone(),
            next_unit: self.next_unit,
            first_unit: self.first_unit,
        }
    }

    /// Drop every atom created after `checkpoint` and undo the parent links
    /// they wrote.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        while self.atoms.len() > checkpoint.atom_count {
            let Some(atom) = self.atoms.pop() else { break };
            for child in &atom.children {
                if let Some(child) = self.atoms.get_mut(child.0 as usize) {
                    child.parent = None;
                }
            }
            if atom.is_leaf() {
                self.leaves.remove(&atom.unit_range.start);
            }
        }
        self.pending = checkpoint.pending;
        self.next_unit = checkpoint.next_unit;
        self.first_unit = checkpoint.first_unit;
    }

    /// Append the level-0 atom for `unit`.  Units must arrive contiguously.
    pub fn push_leaf(&mut self, unit: u32, text: impl Into<String>) -> Result<AtomId, LeafRejected> {
        if let Some(expected) = self.next_unit {
            if unit != expected {
                return Err(LeafRejected::OutOfOrder { expected });
            }
        }
        let next = unit.checked_add(1).ok_or(LeafRejected::IndexExhausted { unit })?;

        let id = self.append(ThoughtAtom {
            id: AtomId(self.atoms.len() as u64),
            level: 0,
            content: text.into(),
            unit_range: UnitRange::single(unit),
            children: Vec::new(),
            parent: None,
            created_at: Utc::now(),
        });
        self.leaves.insert(unit, id);
        self.first_unit.get_or_insert(unit);
        self.next_unit = Some(next);
        Ok(id)
    }

    /// Take the oldest full group at the lowest level that has one.
    pub fn take_full_group(&mut self, fanout: usize) -> Option<(u32, Vec<AtomId>)> {
        let level = self.pending.iter().position(|ids| ids.len() >= fanout)?;
        let group = self.pending[level].drain(..fanout).collect();
        Some((level as u32, group))
    }

    /// Create the parent of `children` (all at `child_level`).
    pub fn push_parent(
        &mut self,
        child_level: u32,
        children: Vec<AtomId>,
        summary: impl Into<String>,
    ) -> Option<AtomId> {
        let ranges: Vec<UnitRange> = children
            .iter()
            .map(|id| self.get(*id).map(|atom| atom.unit_range))
            .collect::<Option<_>>()?;
        let unit_range = UnitRange::tile(&ranges)?;

        let id = AtomId(self.atoms.len() as u64);
        for child in &children {
            if let Some(atom) = self.atoms.get_mut(child.0 as usize) {
                atom.parent = Some(id);
            }
        }
        Some(self.append(ThoughtAtom {
            id,
            level: child_level + 1,
            content: summary.into(),
            unit_range,
            children,
            parent: None,
            created_at: Utc::now(),
        }))
    }

    fn append(&mut self, atom: ThoughtAtom) -> AtomId {
        let id = atom.id;
        let level = atom.level as usize;
        if self.pending.len() <= level {
            self.pending.resize_with(level + 1, Vec::new);
        }
        self.pending[level].push(id);
        self.atoms.push(atom);
        id
    }

    /// The coarsest atom whose range ends exactly at `unit`.
    fn coarsest_ending_at(&self, unit: u32) -> Option<&ThoughtAtom> {
        let mut atom = self.leaf(unit)?;
        while let Some(parent) = atom.parent.and_then(|id| self.get(id)) {
            if parent.unit_range.end != unit {
                break;
            }
            atom = parent;
        }
        Some(atom)
    }

    /// Assemble the writing context for `unit_index`.
    ///
    /// Priority order is the last `window` raw units (most recent first),
    /// then the coarsest ancestor summaries covering everything older, walked
    /// right to left.  Selection stops at the first piece that would push
    /// the rendered length past `budget`, so the context never has a gap
    /// between covered units.
    pub fn assemble(&self, unit_index: u32, window: usize, budget: usize) -> AssembledContext {
        let mut context = AssembledContext::empty(unit_index, budget);
        let (Some(first), Some(last_recorded)) = (self.first_unit, self.last_unit()) else {
            return context;
        };
        if unit_index <= first {
            return context;
        }
        let last = last_recorded.min(unit_index - 1);

        let mut picked: Vec<&ThoughtAtom> = Vec::new();
        let mut length = 0usize;
        let mut admitted = 0usize;
        let mut admit = |atom: &ThoughtAtom| -> bool {
            let separator = if admitted == 0 {
                0
            } else {
                SEGMENT_SEPARATOR.chars().count()
            };
            let cost = atom.content.chars().count() + separator;
            if length + cost > budget {
                return false;
            }
            length += cost;
            admitted += 1;
            true
        };

        let mut cursor = Some(last);
        let mut raw_taken = 0usize;
        while let Some(unit) = cursor.filter(|unit| *unit >= first) {
            let atom = if raw_taken < window {
                raw_taken += 1;
                self.leaf(unit)
            } else {
                self.coarsest_ending_at(unit)
            };
            let Some(atom) = atom else { break };
            if !admit(atom) {
                break;
            }
            picked.push(atom);
            cursor = atom.unit_range.start.checked_sub(1);
        }

        picked.reverse();
        context.length = length;
        context.segments = picked
            .into_iter()
            .map(|atom| ContextSegment {
                atom_id: atom.id,
                level: atom.level,
                unit_range: atom.unit_range,
                content: atom.content.clone(),
            })
            .collect();
        context
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
