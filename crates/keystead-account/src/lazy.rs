//! Create-on-first-use cells for sub-store handles.

use std::{
    convert::Infallible,
    sync::{Mutex, OnceLock, PoisonError},
};

/// A value constructed at most once, on first access, by whichever caller
/// gets there first.
///
/// Reads after initialization take no lock. The init lock is per cell, so a
/// constructor may itself initialize other cells (the recipient store
/// opening the database, for instance) without deadlocking.
///
/// # Invariants
///
/// The constructor passed to [`Self::get_or_try_init`] runs at most once
/// successfully. A failed constructor leaves the cell empty and the next
/// caller retries.
#[derive(Debug)]
pub struct LazyCell<T> {
    value: OnceLock<T>,
    init: Mutex<()>,
}

impl<T> Default for LazyCell<T> {
    fn default() -> Self {
        Self { value: OnceLock::new(), init: Mutex::new(()) }
    }
}

impl<T> LazyCell<T> {
    /// Empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// The value, if already constructed.
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// The value, constructing it with `init` if the cell is empty.
    ///
    /// Concurrent callers on an empty cell serialize on the cell's init
    /// lock; losers of the race observe the winner's value and never run
    /// `init`.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let value = init()?;
        Ok(self.value.get_or_init(|| value))
    }

    /// The value, constructing it with an infallible `init`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        match self.get_or_try_init(|| Ok::<_, Infallible>(init())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Remove the value, leaving the cell empty.
    pub fn take(&mut self) -> Option<T> {
        self.value.take()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    #[test]
    fn constructor_runs_once_under_contention() {
        let cell = Arc::new(LazyCell::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    *cell
                        .get_or_try_init(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ()>(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_init_leaves_cell_empty() {
        let cell = LazyCell::<u8>::new();
        assert_eq!(cell.get_or_try_init(|| Err("boom")), Err("boom"));
        assert!(cell.get().is_none());
        assert_eq!(cell.get_or_try_init(|| Ok::<_, ()>(7)), Ok(&7));
    }

    #[test]
    fn nested_init_of_another_cell() {
        let outer = LazyCell::<u32>::new();
        let inner = LazyCell::<u32>::new();

        let value = outer
            .get_or_try_init(|| inner.get_or_try_init(|| Ok::<_, ()>(5)).map(|v| v + 1))
            .unwrap();

        assert_eq!(*value, 6);
        assert_eq!(inner.get(), Some(&5));
    }

    #[test]
    fn take_empties_cell() {
        let mut cell = LazyCell::new();
        cell.get_or_try_init(|| Ok::<_, ()>(String::from("db"))).unwrap();
        assert_eq!(cell.take().as_deref(), Some("db"));
        assert!(cell.get().is_none());
    }
}
