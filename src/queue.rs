//! The playback queue: an ordered list of download units with a cursor.
//!
//! Insertion order is playback order. The cursor is either `None` or a valid
//! index, and keeps pointing at the same logical unit when units before it
//! are removed.

use std::{collections::HashMap, sync::Arc};

use crate::{
    item::MediaItem,
    unit::{DownloadUnit, UnitId},
};

/// Where to insert newly enqueued items.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum InsertAt {
    /// After the last unit.
    #[default]
    End,

    /// Immediately after the current unit, or at the end without one.
    AfterCurrent,
}

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    units: Vec<Arc<DownloadUnit>>,
    cursor: Option<usize>,
    next_id: u64,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `items` as new units and returns them in queue order.
    ///
    /// Does not start any download. The cursor keeps pointing at the same
    /// unit.
    pub fn append<I>(&mut self, items: I, at: InsertAt, save: bool) -> Vec<Arc<DownloadUnit>>
    where
        I: IntoIterator<Item = Arc<MediaItem>>,
    {
        let units: Vec<_> = items
            .into_iter()
            .map(|item| {
                self.next_id += 1;
                Arc::new(DownloadUnit::new(UnitId(self.next_id), item, save))
            })
            .collect();

        if units.is_empty() {
            return units;
        }

        let index = match (at, self.cursor) {
            (InsertAt::AfterCurrent, Some(cursor)) => cursor + 1,
            _ => self.units.len(),
        };
        self.units.splice(index..index, units.iter().cloned());

        debug!("enqueued {} units at position {index}", units.len());
        units
    }

    /// Removes the units at `indices` and returns them.
    ///
    /// Indices may come in any order; duplicates and indices out of range are
    /// ignored. Surviving units keep their relative order.
    pub fn remove_at(&mut self, indices: &[usize]) -> Vec<Arc<DownloadUnit>> {
        let mut indices: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&index| index < self.units.len())
            .collect();
        indices.sort_unstable();
        indices.dedup();

        // Removing from the back keeps the remaining indices valid.
        let mut removed: Vec<_> = indices
            .iter()
            .rev()
            .map(|&index| self.units.remove(index))
            .collect();
        removed.reverse();

        if let Some(cursor) = self.cursor {
            self.cursor = if indices.binary_search(&cursor).is_ok() {
                None
            } else {
                let shift = indices.partition_point(|&index| index < cursor);
                Some(cursor - shift)
            };
        }

        removed
    }

    /// Removes all units and resets the cursor.
    pub fn clear(&mut self) -> Vec<Arc<DownloadUnit>> {
        self.cursor = None;
        std::mem::take(&mut self.units)
    }

    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        self.cursor
    }

    #[must_use]
    pub fn current(&self) -> Option<&Arc<DownloadUnit>> {
        self.cursor.and_then(|cursor| self.units.get(cursor))
    }

    /// Moves the cursor. Returns `false` and leaves the cursor untouched when
    /// `index` is out of range.
    pub fn set_current(&mut self, index: Option<usize>) -> bool {
        match index {
            Some(index) if index >= self.units.len() => false,
            _ => {
                self.cursor = index;
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<DownloadUnit>> {
        self.units.get(index)
    }

    /// Position of the unit with `id`, if it is still queued.
    #[must_use]
    pub fn position(&self, id: UnitId) -> Option<usize> {
        self.units.iter().position(|unit| unit.id() == id)
    }

    /// Whether any queued unit refers to the item with `item_id`.
    #[must_use]
    pub fn contains_item(&self, item_id: &str) -> bool {
        self.units.iter().any(|unit| unit.item().id == item_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DownloadUnit>> {
        self.units.iter()
    }

    /// Returns a copy of the queue. The units are shared, the order is not.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<DownloadUnit>> {
        self.units.clone()
    }

    /// Returns the most recently enqueued distinct units, newest first.
    ///
    /// Units are distinct by item id; of several units for the same item,
    /// the most recently enqueued one is returned.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Arc<DownloadUnit>> {
        let mut latest: HashMap<&str, &Arc<DownloadUnit>> = HashMap::new();
        for unit in &self.units {
            latest
                .entry(unit.item().id.as_str())
                .and_modify(|existing| {
                    if unit.id() > existing.id() {
                        *existing = unit;
                    }
                })
                .or_insert(unit);
        }

        let mut recent: Vec<_> = latest.into_values().cloned().collect();
        recent.sort_unstable_by(|a, b| b.id().cmp(&a.id()));
        recent.truncate(limit);
        recent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(ids: &[&str]) -> Vec<Arc<MediaItem>> {
        ids.iter()
            .map(|id| Arc::new(MediaItem::new(*id, id.to_uppercase())))
            .collect()
    }

    fn ids(queue: &PlaybackQueue) -> Vec<String> {
        queue.iter().map(|unit| unit.item().id.clone()).collect()
    }

    #[test]
    fn removes_unordered_indices() {
        let mut queue = PlaybackQueue::new();
        queue.append(items(&["a", "b", "c", "d", "e"]), InsertAt::End, false);

        let removed = queue.remove_at(&[4, 1, 3]);
        assert_eq!(ids(&queue), ["a", "c"]);

        let removed: Vec<_> = removed.iter().map(|unit| unit.item().id.as_str()).collect();
        assert_eq!(removed, ["b", "d", "e"]);
    }

    #[test]
    fn ignores_stale_indices() {
        let mut queue = PlaybackQueue::new();
        queue.append(items(&["a", "b", "c"]), InsertAt::End, false);

        let removed = queue.remove_at(&[7, 1, 1]);
        assert_eq!(removed.len(), 1);
        assert_eq!(ids(&queue), ["a", "c"]);
    }

    #[test]
    fn cursor_follows_its_unit() {
        let mut queue = PlaybackQueue::new();
        queue.append(items(&["a", "b", "c", "d", "e"]), InsertAt::End, false);
        assert!(queue.set_current(Some(3)));

        queue.remove_at(&[0, 2, 4]);
        assert_eq!(queue.current_index(), Some(1));
        assert_eq!(queue.current().unwrap().item().id, "d");

        queue.remove_at(&[1]);
        assert_eq!(queue.current_index(), None);
        assert_eq!(ids(&queue), ["b"]);
    }

    #[test]
    fn inserts_after_current() {
        let mut queue = PlaybackQueue::new();
        queue.append(items(&["a", "b", "c"]), InsertAt::End, false);

        // Without a cursor, "after current" means at the end.
        queue.append(items(&["x"]), InsertAt::AfterCurrent, false);
        assert_eq!(ids(&queue), ["a", "b", "c", "x"]);

        queue.set_current(Some(0));
        queue.append(items(&["y", "z"]), InsertAt::AfterCurrent, false);
        assert_eq!(ids(&queue), ["a", "y", "z", "b", "c", "x"]);
        assert_eq!(queue.current_index(), Some(0));
    }

    #[test]
    fn empty_append_is_noop() {
        let mut queue = PlaybackQueue::new();
        assert!(queue.append(Vec::new(), InsertAt::End, false).is_empty());
        assert!(queue.is_empty());
        assert_eq!(queue.current_index(), None);
    }

    #[test]
    fn rejects_cursor_out_of_range() {
        let mut queue = PlaybackQueue::new();
        assert!(!queue.set_current(Some(0)));
        assert!(queue.set_current(None));
    }

    #[test]
    fn recent_is_distinct_and_newest_first() {
        let mut queue = PlaybackQueue::new();
        queue.append(items(&["a", "a", "a"]), InsertAt::End, false);
        assert_eq!(queue.recent(10).len(), 1);

        queue.append(items(&["b", "a", "c"]), InsertAt::End, false);
        let recent = queue.recent(10);
        let recent_ids: Vec<_> = recent.iter().map(|unit| unit.item().id.as_str()).collect();
        assert_eq!(recent_ids, ["c", "a", "b"]);

        // The most recent unit for "a" wins.
        assert_eq!(recent[1].id(), UnitId(5));

        assert_eq!(queue.recent(2).len(), 2);
        assert!(queue.recent(0).is_empty());
    }

    #[test]
    fn clear_resets_cursor() {
        let mut queue = PlaybackQueue::new();
        queue.append(items(&["a", "b"]), InsertAt::End, false);
        queue.set_current(Some(1));

        assert_eq!(queue.clear().len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.current_index(), None);
    }
}
