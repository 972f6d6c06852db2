//! Subscriptions
//!
//! A subscriber is a callback attached to one name. It is called with the
//! current value when it subscribes, then once per transaction in which
//! that name's committed value changed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::value::Value;

/// Identifier of one subscribed callback.
///
/// Ids are issued per engine and never reused, so an id can't collide
/// with a live subscriber regardless of subscribe/unsubscribe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// Callback invoked with a name's new value.
pub type Callback = Rc<dyn Fn(&Value)>;

/// A callback and its identity.
pub(crate) struct Subscriber {
    id: SubscriberId,
    callback: Callback,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// Per-name ordered subscriber lists.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    by_name: HashMap<Rc<str>, Vec<Subscriber>>,
}

impl SubscriptionRegistry {
    pub fn subscribe(&mut self, name: Rc<str>, callback: Callback) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.by_name
            .entry(name)
            .or_default()
            .push(Subscriber { id, callback });
        id
    }

    /// Remove exactly the subscriber `id`. Returns whether it was present.
    pub fn unsubscribe(&mut self, name: &str, id: SubscriberId) -> bool {
        let Some(subscribers) = self.by_name.get_mut(name) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id() != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.by_name.remove(name);
        }
        removed
    }

    /// Snapshot of the callbacks for `name`, in subscription order.
    pub fn callbacks(&self, name: &str) -> Vec<Callback> {
        self.by_name
            .get(name)
            .map(|subs| subs.iter().map(|s| Rc::clone(&s.callback)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.by_name.get(name).map_or(0, Vec::len)
    }
}

/// Handle to a subscribed callback.
///
/// Dropping the handle unsubscribes the callback. Use
/// [`Subscription::detach`] to keep it for the engine's lifetime.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    registry: Weak<RefCell<SubscriptionRegistry>>,
    name: Rc<str>,
    id: SubscriberId,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(
        registry: Weak<RefCell<SubscriptionRegistry>>,
        name: Rc<str>,
        id: SubscriberId,
    ) -> Self {
        Self {
            registry,
            name,
            id,
            active: true,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the callback subscribed without holding the handle.
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.try_borrow_mut() {
                registry.unsubscribe(&self.name, self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, Callback) {
        let count = Rc::new(Cell::new(0));
        let count_clone = Rc::clone(&count);
        (count, Rc::new(move |_: &Value| count_clone.set(count_clone.get() + 1)))
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let mut registry = SubscriptionRegistry::default();
        let id1 = registry.subscribe(Rc::from("a"), counter().1);
        let id2 = registry.subscribe(Rc::from("a"), counter().1);
        let id3 = registry.subscribe(Rc::from("b"), counter().1);

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn out_of_order_unsubscribe_removes_exactly_one() {
        let mut registry = SubscriptionRegistry::default();
        let (first_count, first) = counter();
        let (second_count, second) = counter();
        let (third_count, third) = counter();

        let first_id = registry.subscribe(Rc::from("x"), first);
        let second_id = registry.subscribe(Rc::from("x"), second);
        assert!(registry.unsubscribe("x", first_id));
        let third_id = registry.subscribe(Rc::from("x"), third);

        assert_ne!(third_id, second_id);
        assert!(!registry.unsubscribe("x", first_id));

        for callback in registry.callbacks("x") {
            callback(&Value::Null);
        }
        assert_eq!(first_count.get(), 0);
        assert_eq!(second_count.get(), 1);
        assert_eq!(third_count.get(), 1);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let registry = Rc::new(RefCell::new(SubscriptionRegistry::default()));
        let id = registry
            .borrow_mut()
            .subscribe(Rc::from("x"), counter().1);
        let handle = Subscription::new(Rc::downgrade(&registry), Rc::from("x"), id);

        assert_eq!(registry.borrow().count("x"), 1);
        drop(handle);
        assert_eq!(registry.borrow().count("x"), 0);
    }

    #[test]
    fn detached_handle_keeps_callback() {
        let registry = Rc::new(RefCell::new(SubscriptionRegistry::default()));
        let id = registry
            .borrow_mut()
            .subscribe(Rc::from("x"), counter().1);
        Subscription::new(Rc::downgrade(&registry), Rc::from("x"), id).detach();

        assert_eq!(registry.borrow().count("x"), 1);
    }
}
