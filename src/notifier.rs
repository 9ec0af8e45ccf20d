use std::rc::Rc;

/// Callback attached to one direction of a registered handle.
pub type Callback = Rc<dyn Fn()>;

/// Binds one registered handle to at most one read callback and one
/// write callback.
///
/// A notifier is embedded in whichever socket abstraction owns the
/// handle and lives in the loop's slot table from `add` until `remove`.
/// The closures replace the context-pointer pattern of classic reactor
/// APIs: whatever state the callback needs, it captures.
#[derive(Default)]
pub struct EventNotifier {
    pub(crate) read_callback: Option<Callback>,
    pub(crate) write_callback: Option<Callback>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_callback<F>(&mut self, callback: F)
    where
        F: Fn() + 'static,
    {
        self.read_callback = Some(Rc::new(callback));
    }

    pub fn set_write_callback<F>(&mut self, callback: F)
    where
        F: Fn() + 'static,
    {
        self.write_callback = Some(Rc::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_callbacks_are_optional() {
        let notifier = EventNotifier::new();
        assert!(notifier.read_callback.is_none());
        assert!(notifier.write_callback.is_none());
    }

    #[test]
    fn test_set_callbacks() {
        let fired = Rc::new(Cell::new(0));
        let mut notifier = EventNotifier::new();

        let fired_clone = fired.clone();
        notifier.set_read_callback(move || {
            fired_clone.set(fired_clone.get() + 1);
        });

        let callback = notifier.read_callback.clone().unwrap();
        callback();
        callback();
        assert_eq!(fired.get(), 2);
        assert!(notifier.write_callback.is_none());
    }
}
