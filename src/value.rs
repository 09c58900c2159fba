use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

const MAX_NESTING: usize = 128;

/// How far a class reference was trusted when it was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    /// A primitive or standard collection constructor.
    Builtin,
    /// A record from the engine's own namespaces.
    Friendly,
    /// Anything else, kept as an inert record.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassRef {
    pub module: String,
    pub name: String,
    pub trust: Trust,
}

impl ClassRef {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub fn is(&self, module_prefix: &str, name: &str) -> bool {
        self.name == name && self.module.starts_with(module_prefix)
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// A reconstructed instance. Engine records and placeholders share this shape:
/// constructor arguments, attribute state, and whatever the stream appended or
/// assigned into it.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: Rc<ClassRef>,
    pub args: Vec<Value>,
    pub kwargs: Vec<(Value, Value)>,
    pub attrs: Vec<(String, Value)>,
    /// Non-mapping state handed to BUILD.
    pub state: Option<Value>,
    pub items: Vec<Value>,
    pub entries: Vec<(Value, Value)>,
}

impl Object {
    pub fn new(class: Rc<ClassRef>, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Self {
        Self {
            class,
            args,
            kwargs,
            attrs: Vec::new(),
            state: None,
            items: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set_attr(&mut self, key: String, value: Value) {
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn set_item(&mut self, key: Value, value: Value) {
        match key {
            Value::Str(s) => self.set_attr(s, value),
            other => self.entries.push((other, value)),
        }
    }

    /// Applies BUILD state: a mapping, a `(state, slotstate)` pair, or an opaque blob.
    pub fn set_state(&mut self, state: Value) {
        if let Value::Tuple(pair) = &state {
            if pair.len() == 2 && pair.iter().all(|v| v.is_none() || v.as_dict().is_some()) {
                for part in pair.iter() {
                    self.merge_mapping(part);
                }
                return;
            }
        }
        if state.as_dict().is_some() {
            self.merge_mapping(&state);
        } else if !state.is_none() {
            self.state = Some(state);
        }
    }

    fn merge_mapping(&mut self, mapping: &Value) {
        let Some(dict) = mapping.as_dict() else {
            return;
        };
        for (k, v) in dict.borrow().iter() {
            match k {
                Value::Str(name) => self.set_attr(name.clone(), v.clone()),
                other => self.entries.push((other.clone(), v.clone())),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Little-endian two's complement integer too wide for `i64`.
    Long(Vec<u8>),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Rc<Vec<Value>>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Set(Rc<RefCell<Vec<Value>>>),
    FrozenSet(Rc<Vec<Value>>),
    Class(Rc<ClassRef>),
    Object(Rc<RefCell<Object>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn set(items: Vec<Value>) -> Self {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn object(object: Object) -> Self {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Long(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(..) => "complex",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Class(_) => "class",
            Value::Object(_) => "object",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Rc<RefCell<Vec<(Value, Value)>>>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<RefCell<Object>>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Python truthiness for the scalar and container cases the loader reads.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Long(bytes) => bytes.iter().any(|b| *b != 0),
            Value::Float(f) => *f != 0.0,
            Value::Complex(re, im) => *re != 0.0 || *im != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::FrozenSet(s) => !s.is_empty(),
            Value::Class(_) | Value::Object(_) => true,
        }
    }

    /// Elements of any sequence-like value, including list-like placeholders.
    pub fn elements(&self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(t) => Some(t.as_ref().clone()),
            Value::List(l) => Some(l.borrow().clone()),
            Value::Set(s) => Some(s.borrow().clone()),
            Value::FrozenSet(s) => Some(s.as_ref().clone()),
            Value::Object(o) => {
                // Follow opaque state through nested records, stopping at a revisit.
                let mut seen = HashSet::new();
                let mut current = o.clone();
                loop {
                    if !seen.insert(Rc::as_ptr(&current)) {
                        return None;
                    }
                    let next = {
                        let obj = current.borrow();
                        if !obj.items.is_empty() {
                            return Some(obj.items.clone());
                        }
                        match &obj.state {
                            Some(Value::Object(inner)) => inner.clone(),
                            Some(other) => return other.elements(),
                            None => return None,
                        }
                    };
                    current = next;
                }
            }
            _ => None,
        }
    }

    /// Identity of a scalar dict key, for indexed lookups.
    pub fn dict_key(&self) -> Option<DictKey> {
        match self {
            Value::None => Some(DictKey::None),
            Value::Bool(b) => Some(DictKey::Bool(*b)),
            Value::Int(i) => Some(DictKey::Int(*i)),
            Value::Str(s) => Some(DictKey::Str(s.clone())),
            Value::Bytes(b) => Some(DictKey::Bytes(b.clone())),
            _ => None,
        }
    }

    /// Key/value pairs of a dict, or of a placeholder that was filled like one.
    pub fn pairs(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(d) => Some(d.borrow().clone()),
            Value::Object(o) => {
                let o = o.borrow();
                let mut out: Vec<(Value, Value)> = o
                    .attrs
                    .iter()
                    .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
                    .collect();
                out.extend(o.entries.iter().cloned());
                Some(out)
            }
            _ => None,
        }
    }

    /// Plain-data view for dumps and diagnostics. Shared objects already on the
    /// current path render as a reference marker instead of recursing.
    pub fn to_json(&self) -> serde_json::Value {
        let mut path = HashSet::new();
        self.to_json_inner(&mut path, 0)
    }

    fn to_json_inner(&self, path: &mut HashSet<usize>, depth: usize) -> serde_json::Value {
        use serde_json::{json, Value as J};
        if depth > MAX_NESTING {
            return J::String("...".into());
        }
        let depth = depth + 1;
        let seq = |items: &[Value], path: &mut HashSet<usize>| {
            J::Array(items.iter().map(|v| v.to_json_inner(path, depth)).collect())
        };
        match self {
            Value::None => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => json!(i),
            Value::Long(bytes) => json!({ "long": bytes }),
            Value::Float(f) => json!(f),
            Value::Complex(re, im) => json!({ "complex": [re, im] }),
            Value::Str(s) => J::String(s.clone()),
            Value::Bytes(b) => json!({ "bytes": String::from_utf8_lossy(b) }),
            Value::Tuple(t) => seq(&t[..], path),
            Value::List(l) => seq(&l.borrow()[..], path),
            Value::Set(s) => seq(&s.borrow()[..], path),
            Value::FrozenSet(s) => seq(&s[..], path),
            Value::Dict(d) => J::Array(
                d.borrow()
                    .iter()
                    .map(|(k, v)| J::Array(vec![k.to_json_inner(path, depth), v.to_json_inner(path, depth)]))
                    .collect(),
            ),
            Value::Class(c) => json!({ "class": c.qualified() }),
            Value::Object(o) => {
                let key = Rc::as_ptr(o) as usize;
                if !path.insert(key) {
                    return json!({ "ref": o.borrow().class.qualified() });
                }
                let o = o.borrow();
                let mut map = serde_json::Map::new();
                map.insert("class".into(), J::String(o.class.qualified()));
                if o.class.trust == Trust::Placeholder {
                    map.insert("placeholder".into(), J::Bool(true));
                }
                if !o.args.is_empty() {
                    map.insert("args".into(), seq(&o.args[..], path));
                }
                for (k, v) in &o.attrs {
                    map.insert(k.clone(), v.to_json_inner(path, depth));
                }
                if let Some(state) = &o.state {
                    map.insert("state".into(), state.to_json_inner(path, depth));
                }
                if !o.items.is_empty() {
                    map.insert("items".into(), seq(&o.items[..], path));
                }
                path.remove(&key);
                J::Object(map)
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_at(other, 0)
    }
}

impl Value {
    /// Structural equality that gives up (unequal) past `MAX_NESTING`, so
    /// containers that hold themselves still compare.
    fn eq_at(&self, other: &Self, depth: usize) -> bool {
        if depth > MAX_NESTING {
            return false;
        }
        let depth = depth + 1;
        let seq = |a: &[Value], b: &[Value]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_at(y, depth))
        };
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Complex(a, b), Value::Complex(c, d)) => a == c && b == d,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b) || seq(a, b),
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => {
                Rc::ptr_eq(a, b) || seq(&a.borrow(), &b.borrow())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                Rc::ptr_eq(a, b) || {
                    let (a, b) = (a.borrow(), b.borrow());
                    a.len() == b.len()
                        && a.iter()
                            .zip(b.iter())
                            .all(|((ka, va), (kb, vb))| ka.eq_at(kb, depth) && va.eq_at(vb, depth))
                }
            }
            (Value::FrozenSet(a), Value::FrozenSet(b)) => Rc::ptr_eq(a, b) || seq(a, b),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> Rc<ClassRef> {
        Rc::new(ClassRef {
            module: "store".into(),
            name: name.into(),
            trust: Trust::Friendly,
        })
    }

    #[test]
    fn test_state_pair_merges_both_halves() {
        let mut o = Object::new(class("Thing"), vec![], vec![]);
        let state = Value::tuple(vec![
            Value::dict(vec![(Value::Str("a".into()), Value::Int(1))]),
            Value::dict(vec![(Value::Str("b".into()), Value::Int(2))]),
        ]);
        o.set_state(state);
        assert_eq!(o.get("a"), Some(&Value::Int(1)));
        assert_eq!(o.get("b"), Some(&Value::Int(2)));
        assert!(o.state.is_none());
    }

    #[test]
    fn test_opaque_state_is_kept() {
        let mut o = Object::new(class("Thing"), vec![], vec![]);
        o.set_state(Value::tuple(vec![Value::Int(1), Value::Str("x".into())]));
        assert!(o.attrs.is_empty());
        assert_eq!(
            o.state,
            Some(Value::tuple(vec![Value::Int(1), Value::Str("x".into())]))
        );
    }

    #[test]
    fn test_self_reference_does_not_recurse() {
        let obj = Value::object(Object::new(class("Loop"), vec![], vec![]));
        if let Value::Object(o) = &obj {
            o.borrow_mut().set_attr("me".into(), obj.clone());
        }
        let json = obj.to_json();
        assert_eq!(json["me"]["ref"], "store.Loop");
    }

    #[test]
    fn test_self_built_record_has_no_elements() {
        let obj = Value::object(Object::new(class("Loop"), vec![], vec![]));
        if let Value::Object(o) = &obj {
            o.borrow_mut().state = Some(obj.clone());
        }
        assert_eq!(obj.elements(), None);

        let inner = Value::object(Object::new(class("Inner"), vec![], vec![]));
        let outer = Value::object(Object::new(class("Outer"), vec![], vec![]));
        if let (Value::Object(i), Value::Object(o)) = (&inner, &outer) {
            i.borrow_mut().state = Some(outer.clone());
            o.borrow_mut().state = Some(inner.clone());
        }
        assert_eq!(outer.elements(), None);
    }

    #[test]
    fn test_state_chain_reaches_tuple() {
        let inner = Value::object(Object::new(class("Inner"), vec![], vec![]));
        if let Value::Object(i) = &inner {
            i.borrow_mut().state = Some(Value::tuple(vec![Value::Int(7)]));
        }
        let outer = Value::object(Object::new(class("Outer"), vec![], vec![]));
        if let Value::Object(o) = &outer {
            o.borrow_mut().state = Some(inner.clone());
        }
        assert_eq!(outer.elements(), Some(vec![Value::Int(7)]));
    }

    #[test]
    fn test_self_containing_lists_compare_without_overflow() {
        let make = || {
            let list = Value::list(vec![]);
            if let Value::List(l) = &list {
                l.borrow_mut().push(list.clone());
            }
            list
        };
        let (a, b) = (make(), make());
        assert!(a == a.clone());
        assert!(a != b);
    }

    #[test]
    fn test_self_containing_list_is_cut_off() {
        let list = Value::list(vec![]);
        if let Value::List(l) = &list {
            l.borrow_mut().push(list.clone());
        }
        let json = list.to_json();
        assert!(json.to_string().contains("..."));
    }
}
