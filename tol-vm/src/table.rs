//! Tables: a dense array part plus an ordered hash part.
//!
//! Iteration is deterministic by construction. Keys traverse in a fixed
//! total order: string keys sorted lexicographically, then numeric keys
//! ascending (the dense array part merges into this zone), then booleans,
//! then addresses, then identity-bearing values ordered by their per-VM
//! creation id. Native hash-map iteration order is never observable.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

use tol_types::{Address, Uint256};

use crate::value::Value;

/// Totally ordered canonical form of a table key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableKey {
    /// String keys, lexicographic by bytes.
    Str(Rc<str>),
    /// Numeric keys, ascending.
    Number(Uint256),
    /// Boolean keys, `false` before `true`.
    Bool(bool),
    /// Address keys, byte order.
    Address(Address),
    /// Tables, functions and userdata, by creation id.
    Obj(u64),
}

impl TableKey {
    /// Canonicalize a value into a key. `None` for nil, which is not a
    /// valid key.
    pub fn from_value(value: &Value) -> Option<TableKey> {
        Some(match value {
            Value::Nil => return None,
            Value::Bool(b) => TableKey::Bool(*b),
            Value::Number(n) => TableKey::Number(*n),
            Value::Str(s) => TableKey::Str(s.clone()),
            Value::Address(a) => TableKey::Address(*a),
            Value::Table(t) => TableKey::Obj(t.borrow().id),
            Value::Function(f) => TableKey::Obj(f.id),
            Value::Host(h) => TableKey::Obj(h.id),
            Value::UserData(u) => TableKey::Obj(u.id),
        })
    }
}

/// A table value: array part, hash part, optional metatable.
#[derive(Debug, Default)]
pub struct Table {
    /// Creation id; the deterministic identity of the table.
    pub id: u64,
    array: Vec<Value>,
    hash: BTreeMap<TableKey, Value>,
    /// Original key values of identity-keyed entries, so iteration can
    /// hand the real key back to scripts.
    obj_keys: BTreeMap<u64, Value>,
    /// Operator and access hooks.
    pub metatable: Option<Rc<RefCell<Table>>>,
}

impl Table {
    /// Fresh empty table with the given creation id.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            array: Vec::new(),
            hash: BTreeMap::new(),
            obj_keys: BTreeMap::new(),
            metatable: None,
        }
    }

    /// The array-part boundary: `t[n] ~= nil and t[n+1] == nil`.
    pub fn len(&self) -> usize {
        self.array.len()
    }

    /// Whether both parts are empty.
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Raw read, no metamethods.
    pub fn get(&self, key: &Value) -> Value {
        let Some(key) = TableKey::from_value(key) else {
            return Value::Nil;
        };
        self.get_key(&key)
    }

    /// Raw read by canonical key.
    pub fn get_key(&self, key: &TableKey) -> Value {
        if let TableKey::Number(n) = key {
            if let Some(index) = array_index(n, self.array.len()) {
                return self.array[index - 1].clone();
            }
        }
        self.hash.get(key).cloned().unwrap_or(Value::Nil)
    }

    /// Convenience string-keyed read.
    pub fn get_str(&self, key: &str) -> Value {
        self.hash
            .get(&TableKey::Str(Rc::from(key)))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    /// Raw write, no metamethods. Setting a key to nil removes it. The
    /// array part stays dense: appending migrates successor keys in from
    /// the hash part, and punching a hole moves the tail out.
    pub fn set(&mut self, key: &Value, value: Value) -> Result<(), &'static str> {
        let Some(canonical) = TableKey::from_value(key) else {
            return Err("table index is nil");
        };
        self.set_with_key(canonical, key, value);
        Ok(())
    }

    /// Raw write with a pre-computed canonical key. Callers that may hold
    /// this table inside `original` (a table used as its own key) must
    /// canonicalize before borrowing the cell, then come through here.
    pub fn set_with_key(&mut self, canonical: TableKey, original: &Value, value: Value) {
        if let TableKey::Obj(id) = &canonical {
            if value.is_nil() {
                self.obj_keys.remove(id);
            } else {
                self.obj_keys.insert(*id, original.clone());
            }
        }
        self.set_key(canonical, value);
    }

    /// Raw write by canonical key.
    pub fn set_key(&mut self, key: TableKey, value: Value) {
        if let TableKey::Number(n) = &key {
            let len = self.array.len();
            if let Some(index) = array_index(n, len) {
                if value.is_nil() {
                    // Keep the array dense: move the tail to the hash.
                    let tail: Vec<Value> = self.array.drain(index - 1..).collect();
                    for (offset, item) in tail.into_iter().enumerate().skip(1) {
                        let slot = Uint256::from_u64((index + offset) as u64);
                        self.hash.insert(TableKey::Number(slot), item);
                    }
                } else {
                    self.array[index - 1] = value;
                }
                return;
            }
            if !value.is_nil() && *n == Uint256::from_u64(len as u64 + 1) {
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }
        if value.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, value);
        }
    }

    /// Convenience string-keyed write.
    pub fn set_str(&mut self, key: &str, value: Value) {
        self.set_key(TableKey::Str(Rc::from(key)), value);
    }

    /// Append at the boundary.
    pub fn push(&mut self, value: Value) {
        if value.is_nil() {
            return;
        }
        self.array.push(value);
        self.migrate_from_hash();
    }

    fn migrate_from_hash(&mut self) {
        loop {
            let next = TableKey::Number(Uint256::from_u64(self.array.len() as u64 + 1));
            match self.hash.remove(&next) {
                Some(value) => self.array.push(value),
                None => return,
            }
        }
    }

    /// Insert at a 1-based position, shifting successors up.
    pub fn insert_at(&mut self, pos: usize, value: Value) {
        if pos >= 1 && pos <= self.array.len() + 1 {
            self.array.insert(pos - 1, value);
            self.migrate_from_hash();
        }
    }

    /// Remove a 1-based position, shifting successors down; returns the
    /// removed value.
    pub fn remove_at(&mut self, pos: usize) -> Value {
        if pos >= 1 && pos <= self.array.len() {
            self.array.remove(pos - 1)
        } else {
            Value::Nil
        }
    }

    /// Direct access to the array part, for library functions.
    pub fn array(&self) -> &[Value] {
        &self.array
    }

    /// Mutable access to the array part, for `table.sort`.
    pub fn array_mut(&mut self) -> &mut Vec<Value> {
        &mut self.array
    }

    /// Deterministic successor in the mandated iteration order; `None`
    /// when iteration is done. `key` of `None` starts the traversal.
    pub fn next_key(&self, key: Option<&TableKey>) -> Option<(TableKey, Value)> {
        // Candidate from the hash part: smallest key strictly above.
        let hash_next = match key {
            None => self.hash.iter().next(),
            Some(k) => self
                .hash
                .range((Bound::Excluded(k.clone()), Bound::Unbounded))
                .next(),
        };
        // Candidate from the array part, which occupies the numeric zone.
        let array_next: Option<u64> = match key {
            None | Some(TableKey::Str(_)) => {
                if self.array.is_empty() {
                    None
                } else {
                    Some(1)
                }
            }
            Some(TableKey::Number(n)) => {
                let succ = n.wrapping_add(Uint256::ONE);
                match succ.to_u64() {
                    Some(i) if i >= 1 && i <= self.array.len() as u64 && !succ.is_zero() => {
                        Some(i)
                    }
                    _ => None,
                }
            }
            Some(_) => None,
        };
        match (hash_next, array_next) {
            (None, None) => None,
            (Some((hk, hv)), None) => Some((hk.clone(), hv.clone())),
            (None, Some(i)) => Some((
                TableKey::Number(Uint256::from_u64(i)),
                self.array[i as usize - 1].clone(),
            )),
            (Some((hk, hv)), Some(i)) => {
                let ak = TableKey::Number(Uint256::from_u64(i));
                if ak < *hk {
                    Some((ak, self.array[i as usize - 1].clone()))
                } else {
                    Some((hk.clone(), hv.clone()))
                }
            }
        }
    }

    /// Key back to a value, for handing to scripts.
    pub fn key_value(&self, key: &TableKey) -> Value {
        match key {
            TableKey::Str(s) => Value::Str(s.clone()),
            TableKey::Number(n) => Value::Number(*n),
            TableKey::Bool(b) => Value::Bool(*b),
            TableKey::Address(a) => Value::Address(*a),
            TableKey::Obj(id) => self.obj_keys.get(id).cloned().unwrap_or(Value::Nil),
        }
    }

    /// Deterministic successor as script-facing values; the entry point
    /// behind `next` and `pairs`.
    pub fn next_pair(&self, key: &Value) -> Option<(Value, Value)> {
        let cursor = TableKey::from_value(key);
        let (k, v) = self.next_key(cursor.as_ref())?;
        Some((self.key_value(&k), v))
    }
}

fn array_index(n: &Uint256, len: usize) -> Option<usize> {
    let i = n.to_u64()?;
    if i >= 1 && i <= len as u64 {
        Some(i as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: u64) -> Value {
        Value::number(n)
    }

    fn s(v: &str) -> Value {
        Value::from_string(v)
    }

    #[test]
    fn array_part_stays_dense() {
        let mut t = Table::new(1);
        t.set(&num(1), s("a")).unwrap();
        t.set(&num(2), s("b")).unwrap();
        t.set(&num(3), s("c")).unwrap();
        assert_eq!(t.len(), 3);
        // Punch a hole: tail moves to the hash, boundary shrinks.
        t.set(&num(2), Value::Nil).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&num(3)).display_string(), "c");
        // Filling the hole merges the tail back.
        t.set(&num(2), s("b2")).unwrap();
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn setting_nil_removes_hash_keys() {
        let mut t = Table::new(1);
        t.set(&s("k"), num(7)).unwrap();
        assert!(!t.get(&s("k")).is_nil());
        t.set(&s("k"), Value::Nil).unwrap();
        assert!(t.get(&s("k")).is_nil());
    }

    #[test]
    fn nil_key_is_rejected() {
        let mut t = Table::new(1);
        assert!(t.set(&Value::Nil, num(1)).is_err());
    }

    #[test]
    fn iteration_is_strings_then_numbers_then_rest() {
        let mut t = Table::new(1);
        t.set(&num(1), s("one")).unwrap();
        t.set(&num(10), s("ten")).unwrap();
        t.set(&s("b"), num(2)).unwrap();
        t.set(&s("a"), num(1)).unwrap();
        t.set(&s("c"), num(3)).unwrap();
        t.set(&Value::Bool(true), s("yes")).unwrap();

        let mut keys = Vec::new();
        let mut cursor = None;
        while let Some((k, _)) = t.next_key(cursor.as_ref()) {
            keys.push(k.clone());
            cursor = Some(k);
        }
        assert_eq!(
            keys,
            vec![
                TableKey::Str(Rc::from("a")),
                TableKey::Str(Rc::from("b")),
                TableKey::Str(Rc::from("c")),
                TableKey::Number(Uint256::from_u64(1)),
                TableKey::Number(Uint256::from_u64(10)),
                TableKey::Bool(true),
            ]
        );
    }

    #[test]
    fn string_keys_sort_lexicographically() {
        let mut t = Table::new(1);
        for k in ["b", "a", "c"] {
            t.set(&s(k), num(1)).unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some((k, _)) = t.next_key(cursor.as_ref()) {
            if let TableKey::Str(st) = &k {
                seen.push(st.to_string());
            }
            cursor = Some(k);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn numeric_zone_merges_array_and_hash() {
        let mut t = Table::new(1);
        t.push(num(100)); // index 1
        t.push(num(200)); // index 2
        t.set(&num(10), s("sparse")).unwrap();
        t.set(&num(0), s("zero")).unwrap();

        let mut order = Vec::new();
        let mut cursor = None;
        while let Some((k, _)) = t.next_key(cursor.as_ref()) {
            if let TableKey::Number(n) = &k {
                order.push(n.to_string());
            }
            cursor = Some(k);
        }
        assert_eq!(order, vec!["0", "1", "2", "10"]);
    }

    #[test]
    fn append_migrates_pending_hash_entries() {
        let mut t = Table::new(1);
        t.set(&num(2), s("b")).unwrap(); // parks in the hash
        t.set(&num(3), s("c")).unwrap();
        assert_eq!(t.len(), 0);
        t.set(&num(1), s("a")).unwrap(); // unlocks 2 and 3
        assert_eq!(t.len(), 3);
    }
}
