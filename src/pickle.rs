//! Pickle opcode interpreter.
//!
//! Reconstructs a [`Value`] graph from protocol 0-5 streams without running any
//! host code: class references resolve through an [`AllowList`] to data
//! constructors or inert records, never to live types.

use crate::allowlist::{AllowList, Constructor, Policy, Resolution, StringMode};
use crate::error::{Error, Result};
use crate::types::Metadata;
use crate::value::{ClassRef, DictKey, Object, Trust, Value};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use winnow::binary::{be_f64, le_i32, le_u16, le_u32, le_u64, u8 as byte};
use winnow::error::ContextError;
use winnow::token::{take, take_till};
use winnow::Parser;

const HIGHEST_PROTOCOL: u8 = 5;

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;

    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;

    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

struct Reader<'i> {
    input: &'i [u8],
    len: usize,
}

impl<'i> Reader<'i> {
    fn new(input: &'i [u8]) -> Self {
        Self {
            input,
            len: input.len(),
        }
    }

    fn offset(&self) -> usize {
        self.len - self.input.len()
    }

    fn truncated(&self, what: &str) -> Error {
        Error::unpickling(self.offset(), format!("stream truncated reading {}", what))
    }

    fn byte(&mut self) -> Result<u8> {
        byte.parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("opcode argument"))
    }

    fn u16(&mut self) -> Result<u16> {
        le_u16
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("u16"))
    }

    fn u32(&mut self) -> Result<u32> {
        le_u32
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("u32"))
    }

    fn i32(&mut self) -> Result<i32> {
        le_i32
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("i32"))
    }

    fn u64(&mut self) -> Result<u64> {
        le_u64
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("u64"))
    }

    fn f64(&mut self) -> Result<f64> {
        be_f64
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("float"))
    }

    fn bytes(&mut self, n: u64) -> Result<&'i [u8]> {
        if n > self.input.len() as u64 {
            return Err(self.truncated(&format!("{} bytes", n)));
        }
        take(n as usize)
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("bytes"))
    }

    /// A newline-terminated argument of the text opcodes.
    fn line(&mut self) -> Result<&'i [u8]> {
        let text = take_till(0.., b'\n')
            .parse_next(&mut self.input)
            .map_err(|_: ContextError| self.truncated("line"))?;
        if self.input.is_empty() {
            return Err(self.truncated("line terminator"));
        }
        self.input = &self.input[1..];
        Ok(text)
    }

    fn line_str(&mut self) -> Result<String> {
        let at = self.offset();
        let raw = self.line()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::unpickling(at, "text argument is not UTF-8"))
    }
}

pub struct Unpickler<'a, 'i> {
    reader: Reader<'i>,
    allow: &'a AllowList,
    stack: Vec<Value>,
    metastack: Vec<Vec<Value>>,
    memo: HashMap<usize, Value>,
    warned: HashSet<(String, String)>,
    /// Scalar-key positions of every dict filled by SETITEM(S), keyed by the
    /// dict's address. The `Rc` keeps that address from being reused.
    dict_index: HashMap<usize, (DictRef, HashMap<DictKey, usize>)>,
}

type DictRef = Rc<std::cell::RefCell<Vec<(Value, Value)>>>;

impl<'a, 'i> Unpickler<'a, 'i> {
    pub fn new(input: &'i [u8], allow: &'a AllowList) -> Self {
        Self {
            reader: Reader::new(input),
            allow,
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
            warned: HashSet::new(),
            dict_index: HashMap::new(),
        }
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::unpickling(self.reader.offset(), message)
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| self.err("stack underflow"))
    }

    fn top(&self) -> Result<&Value> {
        self.stack.last().ok_or_else(|| self.err("stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let outer = self
            .metastack
            .pop()
            .ok_or_else(|| self.err("mark not found"))?;
        Ok(std::mem::replace(&mut self.stack, outer))
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn load(mut self) -> Result<Value> {
        loop {
            let at = self.reader.offset();
            let opcode = byte
                .parse_next(&mut self.reader.input)
                .map_err(|_: ContextError| Error::unpickling(at, "stream ended before STOP"))?;
            if opcode == op::STOP {
                let value = self.pop()?;
                if !self.stack.is_empty() || !self.metastack.is_empty() {
                    tracing::debug!(left = self.stack.len(), "values left on stack at STOP");
                }
                return Ok(value);
            }
            self.dispatch(opcode)
                .map_err(|e| match e {
                    Error::Unpickling { message, .. } => Error::unpickling(
                        at,
                        format!("opcode 0x{:02x}: {}", opcode, message),
                    ),
                    other => other,
                })?;
        }
    }

    fn dispatch(&mut self, opcode: u8) -> Result<()> {
        match opcode {
            op::PROTO => {
                let proto = self.reader.byte()?;
                if proto > HIGHEST_PROTOCOL {
                    return Err(self.err(format!("unsupported protocol {}", proto)));
                }
            }
            op::FRAME => {
                self.reader.u64()?;
            }
            op::MARK => {
                let outer = std::mem::take(&mut self.stack);
                self.metastack.push(outer);
            }
            op::POP => {
                if self.stack.is_empty() {
                    self.pop_mark()?;
                } else {
                    self.pop()?;
                }
            }
            op::POP_MARK => {
                self.pop_mark()?;
            }
            op::DUP => {
                let top = self.top()?.clone();
                self.push(top);
            }

            op::NONE => self.push(Value::None),
            op::NEWTRUE => self.push(Value::Bool(true)),
            op::NEWFALSE => self.push(Value::Bool(false)),
            op::INT => {
                let text = self.reader.line_str()?;
                let value = match text.as_str() {
                    "00" => Value::Bool(false),
                    "01" => Value::Bool(true),
                    t => Value::Int(self.parse_int(t)?),
                };
                self.push(value);
            }
            op::LONG => {
                let text = self.reader.line_str()?;
                let value = self.parse_int(text.trim_end_matches('L'))?;
                self.push(Value::Int(value));
            }
            op::BININT => {
                let v = self.reader.i32()?;
                self.push(Value::Int(v as i64));
            }
            op::BININT1 => {
                let v = self.reader.byte()?;
                self.push(Value::Int(v as i64));
            }
            op::BININT2 => {
                let v = self.reader.u16()?;
                self.push(Value::Int(v as i64));
            }
            op::LONG1 => {
                let n = self.reader.byte()? as u64;
                let raw = self.reader.bytes(n)?;
                self.push(decode_long(raw));
            }
            op::LONG4 => {
                let n = self.reader.i32()?;
                if n < 0 {
                    return Err(self.err("negative LONG4 length"));
                }
                let raw = self.reader.bytes(n as u64)?;
                self.push(decode_long(raw));
            }
            op::FLOAT => {
                let text = self.reader.line_str()?;
                let v = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| self.err(format!("invalid float {:?}", text)))?;
                self.push(Value::Float(v));
            }
            op::BINFLOAT => {
                let v = self.reader.f64()?;
                self.push(Value::Float(v));
            }

            op::STRING => {
                let text = self.reader.line()?;
                let raw = unquote(text).ok_or_else(|| self.err("malformed STRING argument"))?;
                let value = self.byte_string(raw);
                self.push(value);
            }
            op::BINSTRING => {
                let n = self.reader.i32()?;
                if n < 0 {
                    return Err(self.err("negative BINSTRING length"));
                }
                let raw = self.reader.bytes(n as u64)?.to_vec();
                let value = self.byte_string(raw);
                self.push(value);
            }
            op::SHORT_BINSTRING => {
                let n = self.reader.byte()? as u64;
                let raw = self.reader.bytes(n)?.to_vec();
                let value = self.byte_string(raw);
                self.push(value);
            }
            op::UNICODE => {
                let text = self.reader.line()?;
                self.push(Value::Str(raw_unicode_unescape(text)));
            }
            op::BINUNICODE => {
                let n = self.reader.u32()? as u64;
                let raw = self.reader.bytes(n)?;
                self.push(Value::Str(String::from_utf8_lossy(raw).into_owned()));
            }
            op::SHORT_BINUNICODE => {
                let n = self.reader.byte()? as u64;
                let raw = self.reader.bytes(n)?;
                self.push(Value::Str(String::from_utf8_lossy(raw).into_owned()));
            }
            op::BINUNICODE8 => {
                let n = self.reader.u64()?;
                let raw = self.reader.bytes(n)?;
                self.push(Value::Str(String::from_utf8_lossy(raw).into_owned()));
            }
            op::BINBYTES => {
                let n = self.reader.u32()? as u64;
                let raw = self.reader.bytes(n)?;
                self.push(Value::Bytes(raw.to_vec()));
            }
            op::SHORT_BINBYTES => {
                let n = self.reader.byte()? as u64;
                let raw = self.reader.bytes(n)?;
                self.push(Value::Bytes(raw.to_vec()));
            }
            op::BINBYTES8 | op::BYTEARRAY8 => {
                let n = self.reader.u64()?;
                let raw = self.reader.bytes(n)?;
                self.push(Value::Bytes(raw.to_vec()));
            }

            op::EMPTY_TUPLE => self.push(Value::tuple(Vec::new())),
            op::TUPLE => {
                let items = self.pop_mark()?;
                self.push(Value::tuple(items));
            }
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                let n = (opcode - op::TUPLE1 + 1) as usize;
                if self.stack.len() < n {
                    return Err(self.err("stack underflow"));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.push(Value::tuple(items));
            }
            op::EMPTY_LIST => self.push(Value::list(Vec::new())),
            op::LIST => {
                let items = self.pop_mark()?;
                self.push(Value::list(items));
            }
            op::EMPTY_DICT => self.push(Value::dict(Vec::new())),
            op::DICT => {
                let items = self.pop_mark()?;
                let pairs = self.pairs_from(items)?;
                self.push(Value::dict(pairs));
            }
            op::EMPTY_SET => self.push(Value::set(Vec::new())),
            op::FROZENSET => {
                let items = self.pop_mark()?;
                self.push(Value::FrozenSet(Rc::new(items)));
            }

            op::APPEND => {
                let value = self.pop()?;
                self.append_into(vec![value])?;
            }
            op::APPENDS => {
                let items = self.pop_mark()?;
                self.append_into(items)?;
            }
            op::ADDITEMS => {
                let items = self.pop_mark()?;
                self.append_into(items)?;
            }
            op::SETITEM => {
                let value = self.pop()?;
                let key = self.pop()?;
                self.set_items(vec![(key, value)])?;
            }
            op::SETITEMS => {
                let items = self.pop_mark()?;
                let pairs = self.pairs_from(items)?;
                self.set_items(pairs)?;
            }

            op::GET => {
                let text = self.reader.line_str()?;
                let idx = self.parse_index(&text)?;
                self.memo_get(idx)?;
            }
            op::BINGET => {
                let idx = self.reader.byte()? as usize;
                self.memo_get(idx)?;
            }
            op::LONG_BINGET => {
                let idx = self.reader.u32()? as usize;
                self.memo_get(idx)?;
            }
            op::PUT => {
                let text = self.reader.line_str()?;
                let idx = self.parse_index(&text)?;
                self.memo_put(idx)?;
            }
            op::BINPUT => {
                let idx = self.reader.byte()? as usize;
                self.memo_put(idx)?;
            }
            op::LONG_BINPUT => {
                let idx = self.reader.u32()? as usize;
                self.memo_put(idx)?;
            }
            op::MEMOIZE => {
                let idx = self.memo.len();
                self.memo_put(idx)?;
            }

            op::GLOBAL => {
                let module = self.reader.line_str()?;
                let name = self.reader.line_str()?;
                let value = self.find_class(&module, &name)?;
                self.push(value);
            }
            op::STACK_GLOBAL => {
                let name = self.pop()?;
                let module = self.pop()?;
                let (Some(module), Some(name)) = (module.as_str(), name.as_str()) else {
                    return Err(self.err("STACK_GLOBAL expects two strings"));
                };
                let value = self.find_class(module, name)?;
                self.push(value);
            }
            op::REDUCE => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let args = self.args_of(args)?;
                let value = self.call(callable, args, Vec::new())?;
                self.push(value);
            }
            op::NEWOBJ => {
                let args = self.pop()?;
                let class = self.pop()?;
                let args = self.args_of(args)?;
                let value = self.call(class, args, Vec::new())?;
                self.push(value);
            }
            op::NEWOBJ_EX => {
                let kwargs = self.pop()?;
                let args = self.pop()?;
                let class = self.pop()?;
                let args = self.args_of(args)?;
                let kwargs = kwargs
                    .pairs()
                    .ok_or_else(|| self.err("NEWOBJ_EX keyword arguments are not a dict"))?;
                let value = self.call(class, args, kwargs)?;
                self.push(value);
            }
            op::OBJ => {
                let mut items = self.pop_mark()?;
                if items.is_empty() {
                    return Err(self.err("OBJ without a class"));
                }
                let class = items.remove(0);
                let value = self.call(class, items, Vec::new())?;
                self.push(value);
            }
            op::INST => {
                let module = self.reader.line_str()?;
                let name = self.reader.line_str()?;
                let args = self.pop_mark()?;
                let class = self.find_class(&module, &name)?;
                let value = self.call(class, args, Vec::new())?;
                self.push(value);
            }
            op::BUILD => {
                let state = self.pop()?;
                self.build(state)?;
            }

            op::PERSID | op::BINPERSID => {
                return Err(self.err("persistent IDs are not supported"));
            }
            op::EXT1 | op::EXT2 | op::EXT4 => {
                return Err(self.err("extension registry codes are not supported"));
            }
            op::NEXT_BUFFER | op::READONLY_BUFFER => {
                return Err(self.err("out-of-band buffers are not supported"));
            }
            other => {
                return Err(self.err(format!("unknown opcode 0x{:02x}", other)));
            }
        }
        Ok(())
    }

    fn parse_int(&self, text: &str) -> Result<i64> {
        text.trim()
            .parse::<i64>()
            .map_err(|_| self.err(format!("integer literal {:?} out of range", text)))
    }

    fn parse_index(&self, text: &str) -> Result<usize> {
        text.trim()
            .parse::<usize>()
            .map_err(|_| self.err(format!("invalid memo index {:?}", text)))
    }

    fn byte_string(&self, raw: Vec<u8>) -> Value {
        match self.allow.string_mode() {
            StringMode::Utf8 => Value::Str(String::from_utf8_lossy(&raw).into_owned()),
            StringMode::Bytes => Value::Bytes(raw),
        }
    }

    fn memo_get(&mut self, idx: usize) -> Result<()> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| self.err(format!("memo entry {} not found", idx)))?;
        self.push(value);
        Ok(())
    }

    fn memo_put(&mut self, idx: usize) -> Result<()> {
        let value = self.top()?.clone();
        self.memo.insert(idx, value);
        Ok(())
    }

    fn pairs_from(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
        if items.len() % 2 != 0 {
            return Err(self.err("odd number of items for a mapping"));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Ok(pairs)
    }

    fn args_of(&self, args: Value) -> Result<Vec<Value>> {
        match args {
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            Value::None => Ok(Vec::new()),
            other => Err(self.err(format!(
                "call arguments must be a tuple, got {}",
                other.type_name()
            ))),
        }
    }

    fn append_into(&mut self, items: Vec<Value>) -> Result<()> {
        let target = self.top()?.clone();
        match target {
            Value::List(list) => list.borrow_mut().extend(items),
            Value::Set(set) => set.borrow_mut().extend(items),
            Value::Object(obj) => obj.borrow_mut().items.extend(items),
            other => {
                return Err(self.err(format!("cannot append to {}", other.type_name())));
            }
        }
        Ok(())
    }

    fn set_items(&mut self, pairs: Vec<(Value, Value)>) -> Result<()> {
        let target = self.top()?.clone();
        match target {
            Value::Dict(dict) => {
                let (_, index) = self
                    .dict_index
                    .entry(Rc::as_ptr(&dict) as usize)
                    .or_insert_with(|| {
                        let index = dict
                            .borrow()
                            .iter()
                            .enumerate()
                            .filter_map(|(i, (k, _))| Some((k.dict_key()?, i)))
                            .collect();
                        (dict.clone(), index)
                    });
                let mut entries = dict.borrow_mut();
                for (k, v) in pairs {
                    match k.dict_key() {
                        Some(key) => match index.get(&key).copied() {
                            Some(i) if i < entries.len() => entries[i].1 = v,
                            _ => {
                                index.insert(key, entries.len());
                                entries.push((k, v));
                            }
                        },
                        None => match entries.iter_mut().find(|(existing, _)| *existing == k) {
                            Some(slot) => slot.1 = v,
                            None => entries.push((k, v)),
                        },
                    }
                }
            }
            Value::Object(obj) => {
                let mut obj = obj.borrow_mut();
                for (k, v) in pairs {
                    obj.set_item(k, v);
                }
            }
            other => {
                return Err(self.err(format!("cannot assign items into {}", other.type_name())));
            }
        }
        Ok(())
    }

    fn build(&mut self, state: Value) -> Result<()> {
        let target = self.top()?.clone();
        match target {
            Value::Object(obj) => obj.borrow_mut().set_state(state),
            // Attribute state on a container subclass has nowhere to live.
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {}
            other => {
                return Err(self.err(format!("cannot BUILD into {}", other.type_name())));
            }
        }
        Ok(())
    }

    fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        match self.allow.resolve(module, name) {
            Resolution::Class(class) => Ok(Value::Class(class)),
            Resolution::Value(value) => Ok(value),
            Resolution::Substituted(class) => {
                if self.warned.insert((module.to_string(), name.to_string())) {
                    tracing::warn!(
                        class = %class,
                        "unknown class outside the allow-list, substituting a placeholder record"
                    );
                }
                Ok(Value::Class(class))
            }
            Resolution::Refused => Err(self.err(format!(
                "refusing to unpickle non-primitive class {}.{}",
                module, name
            ))),
        }
    }

    fn call(&self, callable: Value, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
        let Value::Class(class) = callable else {
            return Err(self.err(format!("{} is not callable", callable.type_name())));
        };
        match self.allow.constructor(&class) {
            Some(ctor) => self.construct(ctor, &class, args, kwargs),
            None if self.allow.policy() == Policy::Strict && class.trust != Trust::Builtin => {
                Err(self.err(format!("refusing to construct {}", class)))
            }
            None => Ok(Value::object(Object::new(class, args, kwargs))),
        }
    }

    fn construct(
        &self,
        ctor: Constructor,
        class: &Rc<ClassRef>,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    ) -> Result<Value> {
        let first = args.first();
        let elements = |v: Option<&Value>| -> Result<Vec<Value>> {
            match v {
                None => Ok(Vec::new()),
                Some(v) => v
                    .elements()
                    .ok_or_else(|| self.err(format!("{} expects an iterable", class))),
            }
        };
        let value = match ctor {
            Constructor::List => Value::list(elements(first)?),
            Constructor::Tuple => Value::tuple(elements(first)?),
            Constructor::Set => Value::set(elements(first)?),
            Constructor::FrozenSet => Value::FrozenSet(Rc::new(elements(first)?)),
            Constructor::Dict | Constructor::DefaultDict => {
                let source = if ctor == Constructor::DefaultDict {
                    args.get(1)
                } else {
                    first
                };
                let mut pairs = match source {
                    None => Vec::new(),
                    Some(v) => self.mapping_pairs(v)?,
                };
                pairs.extend(kwargs);
                Value::dict(pairs)
            }
            Constructor::Bytes => match first {
                None => Value::Bytes(Vec::new()),
                Some(Value::Bytes(b)) => Value::Bytes(b.clone()),
                Some(Value::Str(s)) => Value::Bytes(encode_latin1(s).ok_or_else(|| {
                    self.err("bytes() text argument is not latin-1")
                })?),
                Some(other) => {
                    let items = elements(Some(other))?;
                    let bytes = items
                        .iter()
                        .map(|v| v.as_int().and_then(|i| u8::try_from(i).ok()))
                        .collect::<Option<Vec<u8>>>()
                        .ok_or_else(|| self.err("bytes() expects integers in 0..256"))?;
                    Value::Bytes(bytes)
                }
            },
            Constructor::Str => match first {
                None => Value::Str(String::new()),
                Some(Value::Str(s)) => Value::Str(s.clone()),
                Some(Value::Bytes(b)) => Value::Str(String::from_utf8_lossy(b).into_owned()),
                Some(other) => return Err(self.err(format!("str() of {}", other.type_name()))),
            },
            Constructor::Int => match first {
                None => Value::Int(0),
                Some(v @ (Value::Int(_) | Value::Long(_))) => v.clone(),
                Some(Value::Bool(b)) => Value::Int(*b as i64),
                Some(Value::Float(f)) => Value::Int(
                    float_to_int(*f).ok_or_else(|| self.err(format!("int() of out-of-range float {}", f)))?,
                ),
                Some(Value::Str(s)) => Value::Int(self.parse_int(s)?),
                Some(other) => return Err(self.err(format!("int() of {}", other.type_name()))),
            },
            Constructor::Float => match first {
                None => Value::Float(0.0),
                Some(Value::Float(f)) => Value::Float(*f),
                Some(Value::Int(i)) => Value::Float(*i as f64),
                Some(Value::Str(s)) => Value::Float(
                    s.trim()
                        .parse()
                        .map_err(|_| self.err(format!("invalid float {:?}", s)))?,
                ),
                Some(other) => return Err(self.err(format!("float() of {}", other.type_name()))),
            },
            Constructor::Bool => Value::Bool(first.is_some_and(|v| v.truthy())),
            Constructor::Complex => {
                let part = |v: Option<&Value>| match v {
                    Some(Value::Float(f)) => *f,
                    Some(Value::Int(i)) => *i as f64,
                    _ => 0.0,
                };
                Value::Complex(part(first), part(args.get(1)))
            }
            Constructor::Inert => Value::object(Object::new(class.clone(), args, kwargs)),
            Constructor::Reconstructor => {
                let mut args = args.into_iter();
                let (Some(cls), Some(_base)) = (args.next(), args.next()) else {
                    return Err(self.err("_reconstructor expects (cls, base, state)"));
                };
                let state = args.next().unwrap_or(Value::None);
                let value = self.call(cls, Vec::new(), Vec::new())?;
                if !state.is_none() {
                    self.fill(&value, state)?;
                }
                value
            }
            Constructor::CodecsEncode => {
                let Some(Value::Str(text)) = first else {
                    return Err(self.err("_codecs.encode expects a string"));
                };
                let encoding = args.get(1).and_then(|v| v.as_str()).unwrap_or("utf-8");
                let bytes = match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
                    "latin1" | "latin-1" | "iso-8859-1" => encode_latin1(text)
                        .ok_or_else(|| self.err("text is not representable in latin-1"))?,
                    "utf-8" | "utf8" => text.as_bytes().to_vec(),
                    other => return Err(self.err(format!("unsupported encoding {}", other))),
                };
                Value::Bytes(bytes)
            }
        };
        Ok(value)
    }

    fn mapping_pairs(&self, source: &Value) -> Result<Vec<(Value, Value)>> {
        if let Some(pairs) = source.pairs() {
            return Ok(pairs);
        }
        let items = source
            .elements()
            .ok_or_else(|| self.err("dict() expects a mapping or pairs"))?;
        items
            .into_iter()
            .map(|item| match item.elements().as_deref() {
                Some([k, v]) => Ok((k.clone(), v.clone())),
                _ => Err(self.err("dict() sequence element is not a pair")),
            })
            .collect()
    }

    /// Hands reconstructor state to the freshly built base value.
    fn fill(&self, target: &Value, state: Value) -> Result<()> {
        match target {
            Value::List(list) => list.borrow_mut().extend(
                state
                    .elements()
                    .ok_or_else(|| self.err("list state is not iterable"))?,
            ),
            Value::Set(set) => set.borrow_mut().extend(
                state
                    .elements()
                    .ok_or_else(|| self.err("set state is not iterable"))?,
            ),
            Value::Dict(dict) => dict.borrow_mut().extend(self.mapping_pairs(&state)?),
            Value::Object(obj) => obj.borrow_mut().args.push(state),
            _ => {}
        }
        Ok(())
    }
}

fn decode_long(raw: &[u8]) -> Value {
    if raw.is_empty() {
        return Value::Int(0);
    }
    if raw.len() > 8 {
        return Value::Long(raw.to_vec());
    }
    let negative = raw[raw.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..raw.len()].copy_from_slice(raw);
    Value::Int(i64::from_le_bytes(buf))
}

fn encode_latin1(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(c as u32).ok()).collect()
}

/// Undoes the `repr()` quoting protocol 0 uses for byte strings.
fn unquote(text: &[u8]) -> Option<Vec<u8>> {
    let text = text.strip_suffix(b"\r").unwrap_or(text);
    let quote = *text.first()?;
    if !(quote == b'\'' || quote == b'"') || text.len() < 2 || text[text.len() - 1] != quote {
        return None;
    }
    let body = &text[1..text.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        i += 1;
        if c != b'\\' {
            out.push(c);
            continue;
        }
        let esc = *body.get(i)?;
        i += 1;
        match esc {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'x' => {
                let hex = std::str::from_utf8(body.get(i..i + 2)?).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut v = (esc - b'0') as u32;
                for _ in 0..2 {
                    match body.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            v = v * 8 + (d - b'0') as u32;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push(v as u8);
            }
            other => {
                if !matches!(other, b'\\' | b'\'' | b'"') {
                    out.push(b'\\');
                }
                out.push(other);
            }
        }
    }
    Some(out)
}

/// Decodes the `raw-unicode-escape` text of the UNICODE opcode.
fn raw_unicode_unescape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() && (raw[i + 1] == b'u' || raw[i + 1] == b'U') {
            let width = if raw[i + 1] == b'u' { 4 } else { 8 };
            let decoded = raw
                .get(i + 2..i + 2 + width)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .and_then(char::from_u32);
            if let Some(c) = decoded {
                out.push(c);
                i += 2 + width;
                continue;
            }
        }
        out.push(raw[i] as char);
        i += 1;
    }
    out
}

pub fn loads(bytes: &[u8], allow: &AllowList) -> Result<Value> {
    Unpickler::new(bytes, allow).load()
}

/// Decodes a compiled script payload: the pickled pair `(data, statements)`.
/// `int(f)` for floats that fit in an `i64`.
fn float_to_int(f: f64) -> Option<i64> {
    let t = f.trunc();
    // i64::MAX is not representable as f64; 2^63 is the exclusive bound.
    (t.is_finite() && t >= i64::MIN as f64 && t < -(i64::MIN as f64)).then(|| t as i64)
}

pub fn deserialize(bytes: &[u8], allow: &AllowList) -> Result<(Metadata, Value)> {
    let root = loads(bytes, allow)?;
    let parts = match &root {
        Value::Tuple(items) if items.len() == 2 => items.clone(),
        other => {
            return Err(Error::shape(format!(
                "payload is a {}, expected a (data, statements) pair",
                other.type_name()
            )));
        }
    };
    let metadata = Metadata::from_value(&parts[0]);
    Ok((metadata, parts[1].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dump, Py};

    fn load(bytes: &[u8]) -> Result<Value> {
        loads(bytes, &AllowList::default())
    }

    #[test]
    fn test_scalars_and_containers() {
        let py = Py::Tuple(vec![
            Py::Int(7),
            Py::Int(-300_000),
            Py::Int(1 << 40),
            Py::Str("héllo".into()),
            Py::Bool(true),
            Py::None,
            Py::List(vec![Py::Int(1), Py::Int(2)]),
            Py::Dict(vec![(Py::Str("k".into()), Py::Str("v".into()))]),
        ]);
        let value = load(&dump(&py)).unwrap();
        let items = value.elements().unwrap();
        assert_eq!(items[0], Value::Int(7));
        assert_eq!(items[1], Value::Int(-300_000));
        assert_eq!(items[2], Value::Int(1 << 40));
        assert_eq!(items[3], Value::Str("héllo".into()));
        assert_eq!(items[4], Value::Bool(true));
        assert_eq!(items[5], Value::None);
        assert_eq!(items[6], Value::list(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(
            items[7].pairs().unwrap(),
            vec![(Value::Str("k".into()), Value::Str("v".into()))]
        );
    }

    #[test]
    fn test_protocol_zero_text_opcodes() {
        // (I42\nS'a\\nb'\nVcaf\\u00e9\nF1.5\ntp0\n.
        let stream = b"(I42\nS'a\\nb'\nVcaf\\u00e9\nF1.5\ntp0\n.";
        let value = load(stream).unwrap();
        let items = value.elements().unwrap();
        assert_eq!(items[0], Value::Int(42));
        assert_eq!(items[1], Value::Str("a\nb".into()));
        assert_eq!(items[2], Value::Str("café".into()));
        assert_eq!(items[3], Value::Float(1.5));
    }

    #[test]
    fn test_memo_shares_objects() {
        // ]q\x00(h\x00h\x00e.  -- a list that contains itself twice
        let stream = b"]q\x00(h\x00h\x00e.";
        let value = load(stream).unwrap();
        let Value::List(list) = &value else {
            panic!("expected list");
        };
        let inner = list.borrow();
        assert_eq!(inner.len(), 2);
        assert!(matches!(&inner[0], Value::List(l) if Rc::ptr_eq(l, list)));
    }

    #[test]
    fn test_friendly_object_state() {
        let py = Py::obj(
            "renpy.ast",
            "Pass",
            vec![],
            vec![("filename", Py::Str("game/a.rpy".into())), ("linenumber", Py::Int(3))],
        );
        let value = load(&dump(&py)).unwrap();
        let obj = value.as_object().unwrap().borrow();
        assert_eq!(obj.class.qualified(), "renpy.ast.Pass");
        assert_eq!(obj.class.trust, Trust::Friendly);
        assert_eq!(obj.get("linenumber"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_forbidden_class_becomes_placeholder() {
        // cos\nsystem\n(S'echo pwned'\ntR.
        let stream = b"cos\nsystem\n(S'echo pwned'\ntR.";
        let value = load(stream).unwrap();
        let obj = value.as_object().unwrap().borrow();
        assert_eq!(obj.class.qualified(), "os.system");
        assert_eq!(obj.class.trust, Trust::Placeholder);
        assert_eq!(obj.args, vec![Value::Str("echo pwned".into())]);
    }

    #[test]
    fn test_placeholder_supports_reconstruction_protocols() {
        // NEWOBJ with args, APPENDS, SETITEM and an opaque BUILD state.
        let mut stream = b"\x80\x02cgame.helpers\nBag\nK\x01\x85\x81".to_vec();
        stream.extend_from_slice(b"(K\x02K\x03e");
        stream.extend_from_slice(b"K\x04X\x01\x00\x00\x00vs");
        stream.extend_from_slice(b"X\x04\x00\x00\x00blobb.");
        let value = load(&stream).unwrap();
        let obj = value.as_object().unwrap().borrow();
        assert_eq!(obj.class.qualified(), "game.helpers.Bag");
        assert_eq!(obj.args, vec![Value::Int(1)]);
        assert_eq!(obj.items, vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(obj.entries, vec![(Value::Int(4), Value::Str("v".into()))]);
        assert_eq!(obj.state, Some(Value::Str("blob".into())));
    }

    #[test]
    fn test_strict_mode_refuses_classes() {
        let stream = b"cos\nsystem\n(S'echo pwned'\ntR.";
        let err = loads(stream, &AllowList::primitives_only()).unwrap_err();
        assert!(
            matches!(&err, Error::Unpickling { message, .. } if message.contains("os.system")),
            "{err:?}"
        );
    }

    #[test]
    fn test_strict_mode_keeps_byte_strings() {
        let stream = b"U\x03abcq\x00.";
        let value = loads(stream, &AllowList::primitives_only()).unwrap();
        assert_eq!(value, Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn test_ordered_dict_and_codecs() {
        let mut stream = b"\x80\x02ccollections\nOrderedDict\n)R".to_vec();
        stream.extend_from_slice(b"X\x01\x00\x00\x00a");
        stream.extend_from_slice(b"c_codecs\nencode\nX\x02\x00\x00\x00\xc3\xbfX\x06\x00\x00\x00latin1\x86R");
        stream.extend_from_slice(b"s.");
        let value = load(&stream).unwrap();
        let pairs = value.pairs().unwrap();
        assert_eq!(pairs[0].0, Value::Str("a".into()));
        assert_eq!(pairs[0].1, Value::Bytes(vec![0xff]));
    }

    #[test]
    fn test_truncated_stream() {
        let bytes = dump(&Py::Str("a string long enough".into()));
        let err = load(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");

        let err = load(b"(K\x01").unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_malformed_streams() {
        for stream in [&b"t."[..], b"0.", b"h\x05.", b"\xff.", b"\x80\x09N.", b"Q."] {
            let err = load(stream).unwrap_err();
            assert!(matches!(err, Error::Unpickling { .. }), "{stream:?}: {err:?}");
        }
    }

    #[test]
    fn test_repeated_dict_keys_keep_last_value() {
        let scalar = dump(&Py::Dict(vec![
            (Py::s("a"), Py::Int(1)),
            (Py::s("b"), Py::Int(2)),
            (Py::s("a"), Py::Int(3)),
        ]));
        assert_eq!(
            load(&scalar).unwrap(),
            Value::dict(vec![
                (Value::Str("a".into()), Value::Int(3)),
                (Value::Str("b".into()), Value::Int(2)),
            ])
        );

        let pair = || Py::Tuple(vec![Py::Int(1), Py::Int(2)]);
        let tuples = dump(&Py::Dict(vec![(pair(), Py::s("x")), (pair(), Py::s("y"))]));
        let Value::Dict(d) = load(&tuples).unwrap() else {
            panic!("expected dict");
        };
        assert_eq!(d.borrow().len(), 1);
        assert_eq!(d.borrow()[0].1, Value::Str("y".into()));
    }

    #[test]
    fn test_many_dict_items() {
        let pairs = (0..5000).map(|i| (Py::Int(i), Py::Int(i * 2))).collect();
        let Value::Dict(d) = load(&dump(&Py::Dict(pairs))).unwrap() else {
            panic!("expected dict");
        };
        assert_eq!(d.borrow().len(), 5000);
        assert_eq!(d.borrow()[4999], (Value::Int(4999), Value::Int(9998)));
    }

    #[test]
    fn test_int_of_float() {
        let int_of = |f: f64| {
            let mut bytes = b"\x80\x02c__builtin__\nint\nG".to_vec();
            bytes.extend_from_slice(&f.to_be_bytes());
            bytes.extend_from_slice(b"\x85R.");
            load(&bytes)
        };
        assert_eq!(int_of(-7.9).unwrap(), Value::Int(-7));
        for bad in [1e300, f64::NAN, f64::INFINITY, 9.3e18] {
            let err = int_of(bad).unwrap_err();
            assert!(matches!(err, Error::Unpickling { .. }), "{bad}: {err:?}");
        }
    }

    #[test]
    fn test_long_opcodes() {
        assert_eq!(load(b"\x8a\x00.").unwrap(), Value::Int(0));
        assert_eq!(load(b"\x8a\x01\xff.").unwrap(), Value::Int(-1));
        assert_eq!(load(b"\x8a\x02\x00\x01.").unwrap(), Value::Int(256));
        assert_eq!(load(b"L12345L\n.").unwrap(), Value::Int(12345));
        assert!(matches!(
            load(b"\x8a\x09\x01\x00\x00\x00\x00\x00\x00\x00\x01.").unwrap(),
            Value::Long(_)
        ));
    }

    #[test]
    fn test_deserialize_splits_metadata() {
        let py = Py::Tuple(vec![
            Py::Dict(vec![
                (Py::Str("version".into()), Py::Int(5_003_000)),
                (Py::Str("key".into()), Py::Str("unlocked".into())),
            ]),
            Py::List(vec![]),
        ]);
        let (meta, root) = deserialize(&dump(&py), &AllowList::default()).unwrap();
        assert_eq!(meta.version, Some(5_003_000));
        assert_eq!(meta.key.as_deref(), Some("unlocked"));
        assert_eq!(root, Value::list(vec![]));

        let err = deserialize(&dump(&Py::Int(1)), &AllowList::default()).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }
}
