use crate::value::{ClassRef, Trust, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// Constructors the deserializer is willing to run. None of them touch the
/// host; each builds plain data from its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constructor {
    List,
    Dict,
    DefaultDict,
    Set,
    FrozenSet,
    Tuple,
    Bytes,
    Str,
    Int,
    Float,
    Bool,
    Complex,
    /// `object`, `slice`, `range`, `type`: allowed but kept as inert records.
    Inert,
    /// `copy_reg._reconstructor(cls, base, state)`.
    Reconstructor,
    /// `_codecs.encode(text, encoding)`, how protocol 2 writes bytes from Python 3.
    CodecsEncode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Unknown classes become placeholder records.
    Substitute,
    /// Anything but primitive containers and scalars is refused.
    Strict,
}

/// How protocol 0-2 byte strings are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMode {
    Utf8,
    Bytes,
}

#[derive(Debug)]
pub enum Resolution {
    Class(Rc<ClassRef>),
    /// A placeholder standing in for a class outside the allow-list.
    Substituted(Rc<ClassRef>),
    Value(Value),
    Refused,
}

#[derive(Debug, Clone)]
pub struct AllowList {
    constructors: HashMap<(String, String), Constructor>,
    friendly: Vec<String>,
    policy: Policy,
    string_mode: StringMode,
}

const BUILTIN_MODULES: [&str; 2] = ["builtins", "__builtin__"];

const PRIMITIVES: [(&str, Constructor); 12] = [
    ("dict", Constructor::Dict),
    ("list", Constructor::List),
    ("tuple", Constructor::Tuple),
    ("set", Constructor::Set),
    ("frozenset", Constructor::FrozenSet),
    ("bytes", Constructor::Bytes),
    ("bytearray", Constructor::Bytes),
    ("str", Constructor::Str),
    ("int", Constructor::Int),
    ("float", Constructor::Float),
    ("bool", Constructor::Bool),
    ("complex", Constructor::Complex),
];

impl Default for AllowList {
    fn default() -> Self {
        let mut list = Self::primitives_only();
        list.policy = Policy::Substitute;
        list.string_mode = StringMode::Utf8;
        for module in BUILTIN_MODULES {
            for name in ["object", "slice", "range", "type"] {
                list.allow(module, name, Constructor::Inert);
            }
            list.allow(module, "unicode", Constructor::Str);
            list.allow(module, "long", Constructor::Int);
        }
        for module in ["collections", "collections.abc"] {
            list.allow(module, "OrderedDict", Constructor::Dict);
            list.allow(module, "defaultdict", Constructor::DefaultDict);
            list.allow(module, "deque", Constructor::List);
        }
        for module in ["copy_reg", "copyreg"] {
            list.allow(module, "_reconstructor", Constructor::Reconstructor);
        }
        list.allow("_codecs", "encode", Constructor::CodecsEncode);
        for module in ["renpy.revertable", "renpy.python"] {
            list.allow(module, "RevertableList", Constructor::List);
            list.allow(module, "RevertableDict", Constructor::Dict);
            list.allow(module, "RevertableSet", Constructor::Set);
        }
        list.friendly = vec!["renpy".to_string(), "store".to_string()];
        list
    }
}

impl AllowList {
    /// For payloads that should only ever hold plain data, such as archive indexes.
    pub fn primitives_only() -> Self {
        let mut list = Self {
            constructors: HashMap::new(),
            friendly: Vec::new(),
            policy: Policy::Strict,
            string_mode: StringMode::Bytes,
        };
        for module in BUILTIN_MODULES {
            for (name, ctor) in PRIMITIVES {
                list.allow(module, name, ctor);
            }
        }
        list
    }

    pub fn allow(&mut self, module: &str, name: &str, ctor: Constructor) {
        self.constructors
            .insert((module.to_string(), name.to_string()), ctor);
    }

    pub fn with_string_mode(mut self, mode: StringMode) -> Self {
        self.string_mode = mode;
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn string_mode(&self) -> StringMode {
        self.string_mode
    }

    pub fn constructor(&self, class: &ClassRef) -> Option<Constructor> {
        if class.trust != Trust::Builtin {
            return None;
        }
        self.constructors
            .get(&(class.module.clone(), class.name.clone()))
            .copied()
    }

    fn is_friendly(&self, module: &str) -> bool {
        self.friendly.iter().any(|ns| {
            module == ns
                || module
                    .strip_prefix(ns.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    pub fn resolve(&self, module: &str, name: &str) -> Resolution {
        let class = |trust| {
            Rc::new(ClassRef {
                module: module.to_string(),
                name: name.to_string(),
                trust,
            })
        };
        if BUILTIN_MODULES.contains(&module) {
            match name {
                "True" => return Resolution::Value(Value::Bool(true)),
                "False" => return Resolution::Value(Value::Bool(false)),
                "None" => return Resolution::Value(Value::None),
                _ => {}
            }
        }
        if self
            .constructors
            .contains_key(&(module.to_string(), name.to_string()))
        {
            return Resolution::Class(class(Trust::Builtin));
        }
        if self.is_friendly(module) {
            return Resolution::Class(class(Trust::Friendly));
        }
        match self.policy {
            Policy::Substitute => Resolution::Substituted(class(Trust::Placeholder)),
            Policy::Strict => Resolution::Refused,
        }
    }
}
