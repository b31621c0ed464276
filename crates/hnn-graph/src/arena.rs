//! Reference-counted arena with stable typed indices.
//!
//! Graph nodes (bundles, feature elements, mixtures, layers, gradient
//! buffers) live in arenas and refer to each other by id. The use-count of
//! an entry changes only through [`Arena::acquire`] and [`Arena::release`].

use std::fmt;
use std::marker::PhantomData;

use hnn_core::{HnnError, HnnResult};

/// Typed index into an [`Arena`].
pub trait ArenaId: Copy + Eq + fmt::Debug {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl ArenaId for $name {
            fn from_index(index: usize) -> Self {
                Self(index)
            }

            fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Tensor bundle id.
    BundleId,
    "bundle"
);
arena_id!(
    /// Feature element id.
    ElemId,
    "elem"
);
arena_id!(
    /// Feature mixture id.
    MixId,
    "mix"
);
arena_id!(
    /// Layer id.
    LayerId,
    "layer"
);
arena_id!(
    /// Gradient buffer id.
    BufferId,
    "buffer"
);

#[derive(Debug)]
struct Entry<T> {
    value: T,
    uses: usize,
}

/// Slot storage; freed slots are never reused so ids stay unambiguous.
#[derive(Debug)]
pub struct Arena<I, T> {
    slots: Vec<Option<Entry<T>>>,
    _id: PhantomData<I>,
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ArenaId, T> Arena<I, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            _id: PhantomData,
        }
    }

    /// Store a value with a use-count of zero.
    pub fn insert(&mut self, value: T) -> I {
        self.slots.push(Some(Entry { value, uses: 0 }));
        I::from_index(self.slots.len() - 1)
    }

    pub fn get(&self, id: I) -> Option<&T> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .map(|e| &mut e.value)
    }

    /// Like [`Arena::get`], but a dangling id is an internal error.
    pub fn try_get(&self, id: I) -> HnnResult<&T> {
        self.get(id)
            .ok_or_else(|| HnnError::Internal(format!("dangling id {:?}", id)))
    }

    pub fn try_get_mut(&mut self, id: I) -> HnnResult<&mut T> {
        self.get_mut(id)
            .ok_or_else(|| HnnError::Internal(format!("dangling id {:?}", id)))
    }

    pub fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    /// Record one more user of `id` and return the new use-count.
    pub fn acquire(&mut self, id: I) -> HnnResult<usize> {
        let entry = self
            .slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or_else(|| HnnError::Internal(format!("acquire of freed {:?}", id)))?;
        entry.uses += 1;
        Ok(entry.uses)
    }

    /// Drop one user of `id`. The value is removed and returned when the
    /// use-count reaches zero.
    pub fn release(&mut self, id: I) -> HnnResult<Option<T>> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or_else(|| HnnError::Internal(format!("release of unknown {:?}", id)))?;
        let entry = slot
            .as_mut()
            .ok_or_else(|| HnnError::Internal(format!("release of freed {:?}", id)))?;
        if entry.uses == 0 {
            return Err(HnnError::Internal(format!(
                "use-count underflow on {:?}",
                id
            )));
        }
        entry.uses -= 1;
        if entry.uses == 0 {
            Ok(slot.take().map(|e| e.value))
        } else {
            Ok(None)
        }
    }

    /// Current use-count; zero for freed ids.
    pub fn uses(&self, id: I) -> usize {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|e| e.uses)
            .unwrap_or(0)
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (I::from_index(i), &e.value)))
    }

    pub fn ids(&self) -> Vec<I> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
