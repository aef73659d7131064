//! Double-buffered per-element caches for structured nodes.
//!
//! Each element owns two slots and an active index. The first time an element
//! is dirtied within a touch episode its active index flips, so recomputation
//! writes into the spare slot while the committed result stays intact.
//! `restore` flips changed elements back; `keep` only clears the flags.

/// Active slot after an element is dirtied. Flips only when this is the first
/// change of the episode.
pub fn flipped(active: usize, episode_started: bool) -> usize {
    if episode_started {
        active
    } else {
        1 - active
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    slots: [T; 2],
    active: usize,
    dirty: bool,
    changed: bool,
}

/// Two-slot cache per element, keyed by a stable element index.
#[derive(Debug, Clone)]
pub struct BufferedCache<T> {
    entries: Vec<Entry<T>>,
    fill: T,
}

impl<T: Clone> BufferedCache<T> {
    /// All elements start dirty so the first evaluation fills them.
    pub fn new(len: usize, fill: T) -> Self {
        let mut cache = Self {
            entries: Vec::new(),
            fill,
        };
        cache.resize(len);
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resize after a structural change. Every element, old or new, is
    /// marked dirty because element ids may now refer to different entities.
    pub fn resize(&mut self, len: usize) {
        let fill = self.fill.clone();
        self.entries.resize_with(len, || Entry {
            slots: [fill.clone(), fill.clone()],
            active: 0,
            dirty: true,
            changed: false,
        });
        self.mark_all_dirty();
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.entries[index].dirty
    }

    pub fn any_dirty(&self) -> bool {
        self.entries.iter().any(|e| e.dirty)
    }

    /// Index of the slot currently read by `active`.
    pub fn active_slot(&self, index: usize) -> usize {
        self.entries[index].active
    }

    /// Flag one element for recomputation. Returns true if it was clean.
    pub fn mark_dirty(&mut self, index: usize) -> bool {
        let entry = &mut self.entries[index];
        if entry.dirty {
            return false;
        }
        entry.dirty = true;
        entry.active = flipped(entry.active, entry.changed);
        entry.changed = true;
        true
    }

    pub fn mark_all_dirty(&mut self) {
        for index in 0..self.entries.len() {
            self.mark_dirty(index);
        }
    }

    pub fn active(&self, index: usize) -> &T {
        let entry = &self.entries[index];
        &entry.slots[entry.active]
    }

    /// Write a freshly computed value into the active slot and mark it clean.
    pub fn store(&mut self, index: usize, value: T) {
        let entry = &mut self.entries[index];
        entry.slots[entry.active] = value;
        entry.dirty = false;
    }

    /// Commit the episode.
    pub fn keep(&mut self) {
        for entry in &mut self.entries {
            entry.dirty = false;
            entry.changed = false;
        }
    }

    /// Roll back the episode, reactivating the pre-touch slots.
    pub fn restore(&mut self) {
        for entry in &mut self.entries {
            if entry.changed {
                entry.active = 1 - entry.active;
            }
            entry.dirty = false;
            entry.changed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluated(len: usize) -> BufferedCache<f64> {
        let mut cache = BufferedCache::new(len, 0.0);
        for i in 0..len {
            cache.store(i, i as f64);
        }
        cache.keep();
        cache
    }

    #[test]
    fn test_flip_is_pure() {
        assert_eq!(flipped(0, false), 1);
        assert_eq!(flipped(1, false), 0);
        assert_eq!(flipped(1, true), 1);
    }

    #[test]
    fn test_buffer_flips_once_per_episode() {
        let mut cache = evaluated(3);
        let before = cache.active_slot(1);

        assert!(cache.mark_dirty(1));
        assert!(!cache.mark_dirty(1));
        assert_ne!(cache.active_slot(1), before);

        // recomputed, then dirtied again by a second path in the same episode
        cache.store(1, 42.0);
        assert!(cache.mark_dirty(1));
        assert_ne!(cache.active_slot(1), before, "second dirtying must not flip back");
    }

    #[test]
    fn test_restore_reactivates_committed_slot() {
        let mut cache = evaluated(3);
        cache.mark_dirty(2);
        cache.store(2, 99.0);
        assert_eq!(*cache.active(2), 99.0);

        cache.restore();
        assert_eq!(*cache.active(2), 2.0);
        assert!(!cache.any_dirty());
    }

    #[test]
    fn test_keep_commits_new_slot() {
        let mut cache = evaluated(2);
        cache.mark_dirty(0);
        cache.store(0, -1.0);
        cache.keep();
        assert_eq!(*cache.active(0), -1.0);

        // a following rejected episode returns to the committed value
        cache.mark_dirty(0);
        cache.store(0, 7.0);
        cache.restore();
        assert_eq!(*cache.active(0), -1.0);
    }

    #[test]
    fn test_resize_marks_everything_dirty() {
        let mut cache = evaluated(2);
        cache.resize(4);
        assert_eq!(cache.len(), 4);
        assert!((0..4).all(|i| cache.is_dirty(i)));
    }
}
