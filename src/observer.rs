use slab::Slab;
use std::fmt;

/// Identifies a registered observer so that it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken {
    key: usize,
    generation: u64,
}

type Callback<T> = Box<dyn FnMut(&T) + Send>;

/// Callbacks invoked on the owning actor whenever a value changes.
pub(crate) struct ObserverHolder<T> {
    observers: Slab<(u64, Callback<T>)>,
    generation: u64,
}

impl<T> Default for ObserverHolder<T> {
    fn default() -> Self {
        Self {
            observers: Slab::new(),
            generation: 0,
        }
    }
}

impl<T> fmt::Debug for ObserverHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHolder")
            .field("len", &self.observers.len())
            .finish()
    }
}

impl<T> ObserverHolder<T> {
    pub(crate) fn add(&mut self, callback: Callback<T>) -> ObserverToken {
        self.generation += 1;
        let key = self.observers.insert((self.generation, callback));
        ObserverToken {
            key,
            generation: self.generation,
        }
    }

    /// Returns `false` if the token was already removed.
    pub(crate) fn remove(&mut self, token: ObserverToken) -> bool {
        // slab keys are reused, so a stale token must not hit a newer observer
        match self.observers.get(token.key) {
            Some((generation, _)) if *generation == token.generation => {
                self.observers.remove(token.key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn notify(&mut self, value: &T) {
        for (_, (_, callback)) in self.observers.iter_mut() {
            callback(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn removed_observers_stop_firing() {
        let mut holder = ObserverHolder::<u32>::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let token = {
            let hits = hits.clone();
            holder.add(Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
        };

        holder.notify(&1);
        assert!(holder.remove(token));
        holder.notify(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!holder.remove(token));
    }

    #[test]
    fn stale_token_does_not_remove_reused_slot() {
        let mut holder = ObserverHolder::<u32>::default();
        let first = holder.add(Box::new(|_| {}));
        assert!(holder.remove(first));

        let second = holder.add(Box::new(|_| {}));
        assert!(!holder.remove(first));
        assert!(holder.remove(second));
    }
}
