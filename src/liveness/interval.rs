// This module implements live ranges, use positions and live intervals, the primitives
// a linear-scan register allocator consumes. An interval's ranges are kept in a small
// vector in strictly increasing, pairwise disjoint order; liveness construction walks
// the method backwards, so new ranges are added at the front and touching ranges are
// merged instead of being left adjacent. Use positions live in chains owned by the
// LiveIntervals store and are addressed by UseChainId: splitting an interval hands the
// sibling the same chain id, so the chain is shared and never copied. Siblings form a
// flat chain through next_sibling. Precondition violations (intersecting an interval
// that already covers the other's start, splitting an already split interval) are
// programmer errors and panic.

//! Live ranges and live intervals.

use crate::bytecode::PrimitiveType;
use crate::graph::InstId;
use log::trace;
use smallvec::SmallVec;
use std::fmt;

/// Half-open lifetime interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    start: usize,
    end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start < end, "empty live range [{start}, {end})");
        Self { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn intersects_with(&self, other: &LiveRange) -> bool {
        (self.start >= other.start && self.start < other.end)
            || (other.start >= self.start && other.start < self.end)
    }

    pub fn is_before(&self, other: &LiveRange) -> bool {
        self.end <= other.start
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A use of a value by `user` at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsePosition {
    user: InstId,
    position: usize,
    /// The user captures the full interpreter state, so the value can be
    /// read from its spill slot there.
    requires_environment: bool,
}

impl UsePosition {
    pub fn user(&self) -> InstId {
        self.user
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn requires_environment(&self) -> bool {
        self.requires_environment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);

impl IntervalId {
    /// Unsplit intervals are created in SSA index order, so an SSA index
    /// doubles as the id of the value's first interval.
    pub(crate) fn from_index(index: usize) -> Self {
        IntervalId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UseChainId(u32);

/// Liveness record of one value, or one split piece of it.
#[derive(Debug, Clone)]
pub struct LiveInterval {
    ranges: SmallVec<[LiveRange; 4]>,
    uses: UseChainId,
    ty: PrimitiveType,
    next_sibling: Option<IntervalId>,
    register: Option<u32>,
}

impl LiveInterval {
    pub fn ranges(&self) -> &[LiveRange] {
        &self.ranges
    }

    pub fn first_range(&self) -> Option<&LiveRange> {
        self.ranges.first()
    }

    pub fn ty(&self) -> PrimitiveType {
        self.ty
    }

    pub fn use_chain(&self) -> UseChainId {
        self.uses
    }

    pub fn next_sibling(&self) -> Option<IntervalId> {
        self.next_sibling
    }

    pub fn register(&self) -> Option<u32> {
        self.register
    }

    pub fn set_register(&mut self, reg: u32) {
        self.register = Some(reg);
    }

    pub fn clear_register(&mut self) {
        self.register = None;
    }

    pub fn has_register(&self) -> bool {
        self.register.is_some()
    }

    /// Start of the first range. Panics on an interval with no ranges.
    pub fn start(&self) -> usize {
        match self.ranges.first() {
            Some(range) => range.start,
            None => panic!("live interval has no ranges"),
        }
    }

    /// End of the last range. Panics on an interval with no ranges.
    pub fn end(&self) -> usize {
        match self.ranges.last() {
            Some(range) => range.end,
            None => panic!("live interval has no ranges"),
        }
    }

    pub fn covers(&self, position: usize) -> bool {
        self.ranges
            .iter()
            .any(|range| position >= range.start && position < range.end)
    }

    pub fn is_dead_at(&self, position: usize) -> bool {
        self.end() <= position
    }

    /// First position covered by both intervals.
    ///
    /// Requires that this interval starts no later than `other` and does
    /// not cover `other`'s start.
    pub fn first_intersection_with(&self, other: &LiveInterval) -> Option<usize> {
        let other_start = other.start();
        assert!(
            !self.covers(other_start),
            "interval already covers {other_start}"
        );
        assert!(self.start() <= other_start, "interval starts after other");

        let mut mine = self.ranges.iter().position(|r| r.start >= other_start)?;
        let mut theirs = 0;
        loop {
            let (my_range, other_range) = (&self.ranges[mine], &other.ranges[theirs]);
            if my_range.intersects_with(other_range) {
                return Some(my_range.start.max(other_range.start));
            } else if my_range.is_before(other_range) {
                mine += 1;
                if mine == self.ranges.len() {
                    return None;
                }
            } else {
                debug_assert!(other_range.is_before(my_range));
                theirs += 1;
                if theirs == other.ranges.len() {
                    return None;
                }
            }
        }
    }

    pub fn starts_before(&self, other: &LiveInterval) -> bool {
        self.start() <= other.start()
    }

    pub fn starts_after(&self, other: &LiveInterval) -> bool {
        self.start() >= other.start()
    }

    /// Ranges strictly increasing and pairwise disjoint, with no two ranges
    /// touching.
    pub fn ranges_are_ordered(&self) -> bool {
        self.ranges.windows(2).all(|pair| pair[0].end < pair[1].start)
    }
}

/// Store of intervals and their use chains for one method.
#[derive(Debug, Clone, Default)]
pub struct LiveIntervals {
    intervals: Vec<LiveInterval>,
    use_chains: Vec<SmallVec<[UsePosition; 4]>>,
}

impl LiveIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty, unsplit interval with its own use chain.
    pub fn create(&mut self, ty: PrimitiveType) -> IntervalId {
        let uses = UseChainId(self.use_chains.len() as u32);
        self.use_chains.push(SmallVec::new());
        self.push(LiveInterval {
            ranges: SmallVec::new(),
            uses,
            ty,
            next_sibling: None,
            register: None,
        })
    }

    fn push(&mut self, interval: LiveInterval) -> IntervalId {
        let id = IntervalId(self.intervals.len() as u32);
        self.intervals.push(interval);
        id
    }

    pub fn get(&self, id: IntervalId) -> &LiveInterval {
        &self.intervals[id.index()]
    }

    pub fn get_mut(&mut self, id: IntervalId) -> &mut LiveInterval {
        &mut self.intervals[id.index()]
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IntervalId, &LiveInterval)> + '_ {
        self.intervals
            .iter()
            .enumerate()
            .map(|(index, interval)| (IntervalId(index as u32), interval))
    }

    /// Use positions of the interval, shared with all of its siblings,
    /// in ascending order.
    pub fn uses(&self, id: IntervalId) -> &[UsePosition] {
        &self.use_chains[self.get(id).uses.0 as usize]
    }

    /// Record a use by `user` at `position` inside the block spanning
    /// `[block_start, block_end)`.
    ///
    /// Uses must be added in non-increasing block order. Afterwards the
    /// first range starts at `block_start`.
    pub fn add_use(
        &mut self,
        id: IntervalId,
        user: InstId,
        position: usize,
        block_start: usize,
        block_end: usize,
        requires_environment: bool,
    ) {
        let interval = &mut self.intervals[id.index()];
        let ranges = &mut interval.ranges;
        match ranges.first().copied() {
            None => ranges.push(LiveRange::new(block_start, position)),
            Some(first) if first.start == block_start => {
                // Already live from the block start, through a later use.
                debug_assert!(position <= first.end);
            }
            Some(first) if first.start == block_end => {
                // Live into the next block: extend to cover this block.
                ranges[0].start = block_start;
            }
            Some(_) => ranges.insert(0, LiveRange::new(block_start, position)),
        }
        trace!("use of interval {} at {position}", id.index());

        let chain = &mut self.use_chains[interval.uses.0 as usize];
        let at = chain.partition_point(|u| u.position < position);
        chain.insert(
            at,
            UsePosition {
                user,
                position,
                requires_environment,
            },
        );
    }

    /// Make the interval live over `[start, end)`, merging with a first
    /// range that starts at `end`.
    pub fn add_range(&mut self, id: IntervalId, start: usize, end: usize) {
        let ranges = &mut self.intervals[id.index()].ranges;
        match ranges.first().copied() {
            Some(first) if first.start == end => ranges[0].start = start,
            Some(first) => {
                debug_assert!(end < first.start);
                ranges.insert(0, LiveRange::new(start, end));
            }
            None => ranges.push(LiveRange::new(start, end)),
        }
    }

    /// Make the interval live over a whole loop `[start, end)`, absorbing
    /// the ranges that lie inside it.
    pub fn add_loop_range(&mut self, id: IntervalId, start: usize, end: usize) {
        let ranges = &mut self.intervals[id.index()].ranges;
        assert!(!ranges.is_empty(), "loop range on an interval with no ranges");
        let inside = ranges.iter().take_while(|r| r.end < end).count();
        debug_assert!(ranges[..inside].iter().all(|r| start <= r.start));
        ranges.drain(..inside);
        match ranges.first_mut() {
            Some(first) => first.start = start,
            None => ranges.push(LiveRange::new(start, end)),
        }
    }

    /// Move the start of the first range to the definition at `from`.
    pub fn set_from(&mut self, id: IntervalId, from: usize) {
        let ranges = &mut self.intervals[id.index()].ranges;
        match ranges.first_mut() {
            Some(first) => first.start = from,
            None => panic!("definition of interval {} with no ranges", id.index()),
        }
    }

    /// First use at or after `position` whose user can only take the value
    /// in a register.
    pub fn first_register_use_after(&self, id: IntervalId, position: usize) -> Option<usize> {
        self.uses(id)
            .iter()
            .find(|u| u.position >= position && !u.requires_environment)
            .map(|u| u.position)
    }

    pub fn first_register_use(&self, id: IntervalId) -> Option<usize> {
        self.first_register_use_after(id, self.get(id).start())
    }

    /// Split an unsplit interval at `position`.
    ///
    /// The interval keeps `[start, position)` and the returned sibling takes
    /// everything from `position` on. Returns `None` when the interval is
    /// already dead at `position`.
    pub fn split_at(&mut self, id: IntervalId, position: usize) -> Option<IntervalId> {
        let interval = &self.intervals[id.index()];
        assert!(interval.next_sibling.is_none(), "interval already split");
        assert!(position > interval.start(), "split at or before the start");

        if interval.is_dead_at(position) {
            return None;
        }

        let index = interval
            .ranges
            .iter()
            .position(|r| position < r.end)?;
        let interval = &mut self.intervals[id.index()];
        let mut tail: SmallVec<[LiveRange; 4]> = interval.ranges.drain(index..).collect();

        if position > tail[0].start {
            // Inside a range: cut it in two.
            interval.ranges.push(LiveRange::new(tail[0].start, position));
            tail[0].start = position;
        } else {
            // In a hole: the chain simply ends before it.
            debug_assert!(index > 0);
        }

        let sibling = LiveInterval {
            ranges: tail,
            uses: interval.uses,
            ty: interval.ty,
            next_sibling: None,
            register: None,
        };
        let sibling = self.push(sibling);
        self.intervals[id.index()].next_sibling = Some(sibling);
        trace!("split interval {} at {position} into {}", id.index(), sibling.index());
        Some(sibling)
    }

    /// The interval and its chain of siblings.
    pub fn siblings(&self, id: IntervalId) -> impl Iterator<Item = IntervalId> + '_ {
        std::iter::successors(Some(id), move |&current| self.get(current).next_sibling)
    }

    /// `ranges: { [s, e) }, uses: { p }` rendering.
    pub fn display(&self, id: IntervalId) -> IntervalDisplay<'_> {
        IntervalDisplay {
            intervals: self,
            id,
        }
    }
}

pub struct IntervalDisplay<'a> {
    intervals: &'a LiveIntervals,
    id: IntervalId,
}

impl fmt::Display for IntervalDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ranges: { ")?;
        for range in self.intervals.get(self.id).ranges() {
            write!(f, "{range} ")?;
        }
        f.write_str("}, uses: { ")?;
        for use_pos in self.intervals.uses(self.id) {
            write!(f, "{} ", use_pos.position)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_with(ranges: &[(usize, usize)]) -> (LiveIntervals, IntervalId) {
        let mut store = LiveIntervals::new();
        let id = store.create(PrimitiveType::Int);
        for &(start, end) in ranges.iter().rev() {
            store.add_range(id, start, end);
        }
        (store, id)
    }

    fn pairs(interval: &LiveInterval) -> Vec<(usize, usize)> {
        interval.ranges().iter().map(|r| (r.start(), r.end())).collect()
    }

    #[test]
    fn test_add_use_policies() {
        let mut store = LiveIntervals::new();
        let id = store.create(PrimitiveType::Int);
        let user = InstId(0);

        // Block [20, 30): first range.
        store.add_use(id, user, 26, 20, 30, false);
        assert_eq!(pairs(store.get(id)), vec![(20, 26)]);

        // Earlier use in the same block: nothing to extend.
        store.add_use(id, user, 22, 20, 30, false);
        assert_eq!(pairs(store.get(id)), vec![(20, 26)]);

        // Block [10, 20) ends where the range starts: merge.
        store.add_use(id, user, 14, 10, 20, false);
        assert_eq!(pairs(store.get(id)), vec![(10, 26)]);

        // Block [0, 6) leaves a hole: prepend.
        store.add_use(id, user, 4, 0, 6, false);
        assert_eq!(pairs(store.get(id)), vec![(0, 4), (10, 26)]);

        let positions: Vec<_> = store.uses(id).iter().map(|u| u.position()).collect();
        assert_eq!(positions, vec![4, 14, 22, 26]);
    }

    #[test]
    fn test_add_loop_range_absorbs_inner_ranges() {
        let (mut store, id) = interval_with(&[(4, 6), (8, 10), (12, 30)]);
        store.add_loop_range(id, 2, 20);
        assert_eq!(pairs(store.get(id)), vec![(2, 30)]);

        let (mut store, id) = interval_with(&[(4, 6), (8, 10)]);
        store.add_loop_range(id, 2, 20);
        assert_eq!(pairs(store.get(id)), vec![(2, 20)]);
    }

    #[test]
    fn test_covers_and_dead() {
        let (store, id) = interval_with(&[(2, 6), (10, 14)]);
        let interval = store.get(id);
        assert!(interval.covers(2));
        assert!(!interval.covers(6));
        assert!(!interval.covers(8));
        assert!(interval.covers(13));
        assert!(!interval.is_dead_at(13));
        assert!(interval.is_dead_at(14));
    }

    #[test]
    fn test_first_intersection() {
        let mut store = LiveIntervals::new();
        let a = store.create(PrimitiveType::Int);
        store.add_range(a, 20, 30);
        store.add_range(a, 2, 8);
        let b = store.create(PrimitiveType::Int);
        store.add_range(b, 24, 40);
        store.add_range(b, 10, 16);

        assert_eq!(store.get(a).first_intersection_with(store.get(b)), Some(24));

        let c = store.create(PrimitiveType::Int);
        store.add_range(c, 10, 18);
        assert_eq!(store.get(a).first_intersection_with(store.get(c)), None);
    }

    #[test]
    #[should_panic]
    fn test_first_intersection_precondition() {
        let (mut store, a) = interval_with(&[(0, 10)]);
        let b = store.create(PrimitiveType::Int);
        store.add_range(b, 4, 8);
        store.get(a).first_intersection_with(store.get(b));
    }

    #[test]
    fn test_first_register_use_skips_environment_users() {
        let mut store = LiveIntervals::new();
        let id = store.create(PrimitiveType::Int);
        store.add_use(id, InstId(3), 12, 0, 20, false);
        store.add_use(id, InstId(2), 8, 0, 20, true);
        store.set_from(id, 4);

        assert_eq!(store.first_register_use_after(id, 5), Some(12));
        assert_eq!(store.first_register_use(id), Some(12));
        assert_eq!(store.first_register_use_after(id, 13), None);
    }

    #[test]
    fn test_split_inside_range() {
        let (mut store, id) = interval_with(&[(2, 10), (14, 20)]);
        let sibling = store.split_at(id, 6).unwrap();

        assert_eq!(pairs(store.get(id)), vec![(2, 6)]);
        assert_eq!(pairs(store.get(sibling)), vec![(6, 10), (14, 20)]);
        assert_eq!(store.get(id).next_sibling(), Some(sibling));
        assert_eq!(store.get(id).use_chain(), store.get(sibling).use_chain());
    }

    #[test]
    fn test_split_in_hole_and_dead() {
        let (mut store, id) = interval_with(&[(2, 10), (14, 20)]);
        let sibling = store.split_at(id, 12).unwrap();
        assert_eq!(pairs(store.get(id)), vec![(2, 10)]);
        assert_eq!(pairs(store.get(sibling)), vec![(14, 20)]);

        let (mut store, id) = interval_with(&[(2, 10)]);
        assert_eq!(store.split_at(id, 10), None);
        assert_eq!(store.get(id).next_sibling(), None);
    }

    #[test]
    fn test_sibling_chain_is_flat() {
        let (mut store, id) = interval_with(&[(0, 30)]);
        let second = store.split_at(id, 10).unwrap();
        let third = store.split_at(second, 20).unwrap();
        let chain: Vec<_> = store.siblings(id).collect();
        assert_eq!(chain, vec![id, second, third]);
    }

    #[test]
    fn test_display() {
        let mut store = LiveIntervals::new();
        let id = store.create(PrimitiveType::Int);
        store.add_use(id, InstId(1), 8, 4, 10, false);
        store.set_from(id, 6);
        assert_eq!(store.display(id).to_string(), "ranges: { [6, 8) }, uses: { 8 }");
    }
}
