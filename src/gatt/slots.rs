/// Generation-checked key of a [`Slots`] entry. A key outlives its entry, but
/// it never resolves to a different entry that later reuses the same slot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(super) struct Key {
    idx: u16,
    gen: u32,
}

impl Key {
    /// Returns the slot index.
    #[inline(always)]
    #[must_use]
    pub const fn idx(self) -> usize {
        self.idx as usize
    }
}

/// Fixed-capacity slot arena. Insertion always takes the lowest free slot,
/// which keeps indices dense.
#[derive(Debug)]
pub(super) struct Slots<T> {
    v: Vec<Slot<T>>,
    cap: usize,
}

#[derive(Debug)]
struct Slot<T> {
    gen: u32,
    val: Option<T>,
}

impl<T> Slots<T> {
    /// Creates an empty arena that holds at most `cap` entries.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        debug_assert!(cap <= usize::from(u16::MAX));
        Self {
            v: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Inserts a value produced by `f` into the lowest free slot. Returns
    /// [`None`] if the arena is full.
    pub fn insert_with(&mut self, f: impl FnOnce(Key) -> T) -> Option<Key> {
        let i = (self.v.iter().position(|s| s.val.is_none())).or_else(|| {
            (self.v.len() < self.cap).then(|| {
                self.v.push(Slot { gen: 0, val: None });
                self.v.len() - 1
            })
        })?;
        let s = &mut self.v[i];
        #[allow(clippy::cast_possible_truncation)]
        let k = Key {
            idx: i as u16,
            gen: s.gen,
        };
        s.val = Some(f(k));
        Some(k)
    }

    /// Returns a reference to the entry for key `k`.
    #[inline]
    #[must_use]
    pub fn get(&self, k: Key) -> Option<&T> {
        (self.v.get(k.idx()))
            .filter(|s| s.gen == k.gen)
            .and_then(|s| s.val.as_ref())
    }

    /// Returns a mutable reference to the entry for key `k`.
    #[inline]
    pub fn get_mut(&mut self, k: Key) -> Option<&mut T> {
        (self.v.get_mut(k.idx()))
            .filter(|s| s.gen == k.gen)
            .and_then(|s| s.val.as_mut())
    }

    /// Returns the key of the occupied slot at index `i`.
    #[inline]
    #[must_use]
    pub fn key_at(&self, i: usize) -> Option<Key> {
        let s = self.v.get(i)?;
        #[allow(clippy::cast_possible_truncation)]
        s.val.as_ref().map(|_| Key {
            idx: i as u16,
            gen: s.gen,
        })
    }

    /// Removes the entry for key `k`, invalidating all copies of the key.
    pub fn remove(&mut self, k: Key) -> Option<T> {
        let s = self.v.get_mut(k.idx()).filter(|s| s.gen == k.gen)?;
        let v = s.val.take()?;
        s.gen = s.gen.wrapping_add(1);
        Some(v)
    }

    /// Returns an iterator over all occupied entries.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        self.v.iter().enumerate().filter_map(|(i, s)| {
            #[allow(clippy::cast_possible_truncation)]
            s.val.as_ref().map(|v| {
                let k = Key {
                    idx: i as u16,
                    gen: s.gen,
                };
                (k, v)
            })
        })
    }

    /// Returns the keys of all entries matching the predicate.
    #[must_use]
    pub fn keys_where(&self, mut f: impl FnMut(&T) -> bool) -> Vec<Key> {
        (self.iter().filter(|&(_, v)| f(v)))
            .map(|(k, _)| k)
            .collect()
    }

    /// Returns the number of occupied entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.v.iter().filter(|s| s.val.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free() {
        let mut s = Slots::with_capacity(2);
        let a = s.insert_with(|_| 'a').unwrap();
        let b = s.insert_with(|_| 'b').unwrap();
        assert_eq!((a.idx(), b.idx()), (0, 1));
        assert!(s.insert_with(|_| 'c').is_none());

        assert_eq!(s.remove(a), Some('a'));
        assert_eq!(s.get(a), None);
        assert_eq!(s.remove(a), None);
        let c = s.insert_with(|_| 'c').unwrap();
        assert_eq!(c.idx(), 0);
        assert_ne!(a, c);
        assert_eq!(s.get(a), None);
        assert_eq!(s.get(c), Some(&'c'));
        assert_eq!(s.key_at(0), Some(c));
        assert_eq!(s.len(), 2);
    }
}
