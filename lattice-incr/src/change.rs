//! Change Detection
//!
//! After a node computes, its new value is compared with the committed one.
//! An unchanged value keeps its dependents clean and produces no
//! notification for the transaction; the new reference is still stored.
//!
//! Two policies exist:
//!
//! - [`EqualityPolicy::Reference`]: [`Value::same_ref`]. A freshly
//!   allocated list or map always counts as changed.
//! - [`EqualityPolicy::Deep`]: recursive structural comparison. Pairs of
//!   composites already under comparison are treated as equal, so
//!   self-referential structures terminate.

use std::collections::HashSet;
use std::rc::Rc;

use crate::value::Value;

/// How two values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EqualityPolicy {
    #[default]
    Reference,
    Deep,
}

/// Decides whether a computed value differs from the committed one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    policy: EqualityPolicy,
}

impl ChangeDetector {
    pub fn new(policy: EqualityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EqualityPolicy {
        self.policy
    }

    /// A node that has never held a value always changes.
    pub fn changed(&self, old: Option<&Value>, new: &Value) -> bool {
        match old {
            None => true,
            Some(old) => !self.equal(old, new),
        }
    }

    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        match self.policy {
            EqualityPolicy::Reference => a.same_ref(b),
            EqualityPolicy::Deep => deep_equal(a, b),
        }
    }
}

/// Structural equality that tolerates cycles.
///
/// Maps compare without regard to key order.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    DeepEq::default().eq(a, b)
}

#[derive(Default)]
struct DeepEq {
    /// Composite pairs already under comparison.
    seen: HashSet<(usize, usize)>,
}

impl DeepEq {
    fn eq(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(x), Value::List(y)) => {
                if Rc::ptr_eq(x, y) || !self.enter(a, b) {
                    return true;
                }
                let xs = x.borrow();
                let ys = y.borrow();
                xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(l, r)| self.eq(l, r))
            }
            (Value::Map(x), Value::Map(y)) => {
                if Rc::ptr_eq(x, y) || !self.enter(a, b) {
                    return true;
                }
                let xs = x.borrow();
                let ys = y.borrow();
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .all(|(key, l)| ys.get(key).is_some_and(|r| self.eq(l, r)))
            }
            _ => a.same_ref(b),
        }
    }

    /// Returns `false` if the pair was already entered.
    fn enter(&mut self, a: &Value, b: &Value) -> bool {
        match (a.addr(), b.addr()) {
            (Some(x), Some(y)) => self.seen.insert((x, y)),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_policy_flags_fresh_composites() {
        let detector = ChangeDetector::default();
        let old = Value::list([1, 2]);

        assert!(detector.changed(Some(&old), &Value::list([1, 2])));
        assert!(!detector.changed(Some(&old), &old.clone()));
        assert!(!detector.changed(Some(&Value::from(1)), &Value::from(1)));
        assert!(detector.changed(None, &Value::Null));
    }

    #[test]
    fn deep_policy_compares_structure() {
        let detector = ChangeDetector::new(EqualityPolicy::Deep);
        let old = Value::map([("a", Value::list([1, 2])), ("b", Value::from("x"))]);
        let same = Value::map([("b", Value::from("x")), ("a", Value::list([1, 2]))]);
        let different = Value::map([("a", Value::list([1, 3])), ("b", Value::from("x"))]);

        assert!(!detector.changed(Some(&old), &same));
        assert!(detector.changed(Some(&old), &different));
    }

    #[test]
    fn deep_equality_terminates_on_self_reference() {
        let a = Value::map([("n", 1)]);
        a.insert("me", a.clone());
        let b = Value::map([("n", 1)]);
        b.insert("me", b.clone());

        assert!(deep_equal(&a, &b));
        assert!(deep_equal(&a, &a));
    }

    #[test]
    fn deep_equality_terminates_on_mutual_cycles() {
        let a = Value::list([0]);
        let b = Value::list([0]);
        a.push(b.clone());
        b.push(a.clone());

        let c = Value::list([0]);
        let d = Value::list([0]);
        c.push(d.clone());
        d.push(c.clone());

        assert!(deep_equal(&a, &c));

        let e = Value::list([1]);
        e.push(e.clone());
        assert!(!deep_equal(&a, &e));
    }

    #[test]
    fn in_place_mutation_is_invisible() {
        let detector = ChangeDetector::new(EqualityPolicy::Deep);
        let value = Value::list([1]);
        let alias = value.clone();
        value.push(2);

        assert!(!detector.changed(Some(&alias), &value));
    }
}
