//! Builders for compiled-script fixtures: a tiny protocol 2 pickler plus the
//! container framing around it.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

pub const FIXTURE_FILE: &str = "game/script.rpy";

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// An RPC2 file holding each payload compressed in its own slot.
pub fn multi_slot(slots: &[(u32, &[u8])]) -> Vec<u8> {
    let blobs: Vec<(u32, Vec<u8>)> = slots.iter().map(|(s, d)| (*s, zlib(d))).collect();
    let mut out = crate::container::RPYC2_HEADER.to_vec();
    let mut offset = out.len() + 12 * (blobs.len() + 1);
    for (slot, blob) in &blobs {
        for v in [*slot, offset as u32, blob.len() as u32] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        offset += blob.len();
    }
    out.extend_from_slice(&[0u8; 12]);
    for (_, blob) in &blobs {
        out.extend_from_slice(blob);
    }
    out
}

#[derive(Debug, Clone)]
pub enum Py {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Py>),
    List(Vec<Py>),
    Dict(Vec<(Py, Py)>),
    Obj {
        module: String,
        name: String,
        args: Vec<Py>,
        state: Option<Box<Py>>,
        /// Memo slot stored between construction and BUILD.
        memo: Option<u8>,
    },
    /// A memo reference to an earlier value.
    Get(u8),
}

impl Py {
    pub fn s(text: &str) -> Py {
        Py::Str(text.to_string())
    }

    /// An instance whose BUILD state is a dict of `fields`.
    pub fn obj(module: &str, name: &str, args: Vec<Py>, fields: Vec<(&str, Py)>) -> Py {
        let state = (!fields.is_empty()).then(|| {
            Box::new(Py::Dict(
                fields.into_iter().map(|(k, v)| (Py::s(k), v)).collect(),
            ))
        });
        Py::Obj {
            module: module.to_string(),
            name: name.to_string(),
            args,
            state,
            memo: None,
        }
    }

    pub fn obj_with_state(module: &str, name: &str, args: Vec<Py>, state: Py) -> Py {
        Py::Obj {
            module: module.to_string(),
            name: name.to_string(),
            args,
            state: Some(Box::new(state)),
            memo: None,
        }
    }

    /// Stores an instance in memo `slot` before its state is applied, so the
    /// state can refer back to it with [`Py::Get`].
    pub fn memoized(self, slot: u8) -> Py {
        match self {
            Py::Obj {
                module,
                name,
                args,
                state,
                ..
            } => Py::Obj {
                module,
                name,
                args,
                state,
                memo: Some(slot),
            },
            other => other,
        }
    }
}

pub fn dump(py: &Py) -> Vec<u8> {
    let mut out = vec![0x80, 2];
    write(py, &mut out);
    out.push(b'.');
    out
}

fn write(py: &Py, out: &mut Vec<u8>) {
    match py {
        Py::None => out.push(b'N'),
        Py::Bool(true) => out.push(0x88),
        Py::Bool(false) => out.push(0x89),
        Py::Int(v) => write_int(*v, out),
        Py::Str(s) => {
            out.push(b'X');
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Py::Bytes(b) => {
            out.push(b'B');
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        Py::Tuple(items) if items.is_empty() => out.push(b')'),
        Py::Tuple(items) => {
            out.push(b'(');
            items.iter().for_each(|i| write(i, out));
            out.push(b't');
        }
        Py::List(items) => {
            out.push(b']');
            if !items.is_empty() {
                out.push(b'(');
                items.iter().for_each(|i| write(i, out));
                out.push(b'e');
            }
        }
        Py::Dict(pairs) => {
            out.push(b'}');
            if !pairs.is_empty() {
                out.push(b'(');
                for (k, v) in pairs {
                    write(k, out);
                    write(v, out);
                }
                out.push(b'u');
            }
        }
        Py::Get(slot) => out.extend_from_slice(&[b'h', *slot]),
        Py::Obj {
            module,
            name,
            args,
            state,
            memo,
        } => {
            out.push(b'c');
            out.extend_from_slice(module.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
            write(&Py::Tuple(args.clone()), out);
            out.push(0x81);
            if let Some(slot) = memo {
                out.extend_from_slice(&[b'q', *slot]);
            }
            if let Some(state) = state {
                write(state, out);
                out.push(b'b');
            }
        }
    }
}

fn write_int(v: i64, out: &mut Vec<u8>) {
    if (0..256).contains(&v) {
        out.extend_from_slice(&[b'K', v as u8]);
    } else if (0..65536).contains(&v) {
        out.push(b'M');
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if i32::try_from(v).is_ok() {
        out.push(b'J');
        out.extend_from_slice(&(v as i32).to_le_bytes());
    } else {
        let mut bytes = v.to_le_bytes().to_vec();
        while bytes.len() > 1 {
            let last = bytes[bytes.len() - 1];
            let sign = bytes[bytes.len() - 2] & 0x80;
            if (last == 0 && sign == 0) || (last == 0xff && sign != 0) {
                bytes.pop();
            } else {
                break;
            }
        }
        out.extend_from_slice(&[0x8a, bytes.len() as u8]);
        out.extend_from_slice(&bytes);
    }
}

/// A `renpy.ast` statement node at `line` of the fixture file.
pub fn node(kind: &str, line: i64, mut fields: Vec<(&str, Py)>) -> Py {
    fields.push(("filename", Py::s(FIXTURE_FILE)));
    fields.push(("linenumber", Py::Int(line)));
    Py::obj("renpy.ast", kind, vec![], fields)
}

pub fn expr(code: &str) -> Py {
    Py::obj(
        "renpy.ast",
        "PyExpr",
        vec![Py::s(code), Py::s(FIXTURE_FILE), Py::Int(1)],
        vec![],
    )
}

pub fn pycode(source: &str) -> Py {
    Py::obj_with_state(
        "renpy.ast",
        "PyCode",
        vec![],
        Py::Tuple(vec![
            Py::Int(1),
            expr(source),
            Py::Tuple(vec![Py::s(FIXTURE_FILE), Py::Int(1)]),
            Py::s("exec"),
            Py::Int(3),
        ]),
    )
}

pub fn say(line: i64, who: Option<&str>, what: &str) -> Py {
    node(
        "Say",
        line,
        vec![
            ("who", who.map(Py::s).unwrap_or(Py::None)),
            ("what", Py::s(what)),
            ("with_", Py::None),
            ("interact", Py::Bool(true)),
            ("attributes", Py::None),
        ],
    )
}

pub fn label(line: i64, name: &str, block: Vec<Py>) -> Py {
    node(
        "Label",
        line,
        vec![
            ("name", Py::s(name)),
            ("block", Py::List(block)),
            ("parameters", Py::None),
            ("hide", Py::Bool(false)),
        ],
    )
}

/// The pickled `(data, statements)` pair the engine writes.
pub fn payload(stmts: Vec<Py>) -> Vec<u8> {
    dump(&Py::Tuple(vec![
        Py::Dict(vec![
            (Py::s("version"), Py::Int(5_003_000)),
            (Py::s("key"), Py::s("unlocked")),
        ]),
        Py::List(stmts),
    ]))
}

/// A complete RPC2 file with `stmts` in slot 1.
pub fn rpyc(stmts: Vec<Py>) -> Vec<u8> {
    multi_slot(&[(1, payload(stmts).as_slice())])
}
