//! RPA-3.0 archives: index parsing and path-safe extraction.

use crate::allowlist::{AllowList, StringMode};
use crate::container::inflate;
use crate::error::{Error, Result};
use crate::pickle::loads;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use winnow::error::ContextError;
use winnow::token::{literal, take_while};
use winnow::Parser;

pub const RPA3_MAGIC: &[u8] = b"RPA-3.0 ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub offset: u64,
    pub length: u64,
    /// Bytes the engine serves ahead of the stored data.
    pub prefix: Vec<u8>,
}

#[derive(Debug)]
pub struct Archive {
    data: Vec<u8>,
    index: BTreeMap<String, Vec<ArchiveEntry>>,
}

fn hex_field(input: &mut &[u8]) -> std::result::Result<u64, ContextError> {
    let digits = take_while(1.., |b: u8| b.is_ascii_hexdigit()).parse_next(input)?;
    let text = std::str::from_utf8(digits).map_err(|_| ContextError::new())?;
    u64::from_str_radix(text, 16).map_err(|_| ContextError::new())
}

/// `RPA-3.0 <index offset> <key>\n`
fn parse_header(data: &[u8]) -> Result<(u64, u64)> {
    let mut input = data;
    let (_, offset, _, key, _) = (
        literal(RPA3_MAGIC),
        hex_field,
        literal(&b" "[..]),
        hex_field,
        literal(&b"\n"[..]),
    )
        .parse_next(&mut input)
        .map_err(|_: ContextError| Error::Format("not an RPA-3.0 archive header".into()))?;
    Ok((offset, key))
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::Str(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

fn prefix_of(name: &str, v: Option<&Value>) -> Result<Vec<u8>> {
    match v {
        Some(Value::Bytes(b)) => Ok(b.clone()),
        // Text prefixes were written as latin-1.
        Some(Value::Str(s)) => s
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| {
                    Error::shape(format!("prefix for {} has non-latin-1 character {:?}", name, c))
                })
            })
            .collect(),
        _ => Ok(Vec::new()),
    }
}

fn parse_index(value: &Value, key: u64) -> Result<BTreeMap<String, Vec<ArchiveEntry>>> {
    let pairs = value
        .pairs()
        .ok_or_else(|| Error::shape(format!("archive index is a {}", value.type_name())))?;
    let mut index = BTreeMap::new();
    for (name, entries) in pairs {
        let name = text_of(&name)
            .ok_or_else(|| Error::shape(format!("archive entry name is a {}", name.type_name())))?;
        let mut parsed = Vec::new();
        for entry in entries
            .elements()
            .ok_or_else(|| Error::shape(format!("entries for {} are not a list", name)))?
        {
            let fields = entry
                .elements()
                .ok_or_else(|| Error::shape(format!("entry for {} is not a tuple", name)))?;
            let number = |i: usize| {
                fields
                    .get(i)
                    .and_then(|v| v.as_int())
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| Error::shape(format!("entry for {} has a bad field {}", name, i)))
            };
            parsed.push(ArchiveEntry {
                offset: number(0)? ^ key,
                length: number(1)? ^ key,
                prefix: prefix_of(&name, fields.get(2))?,
            });
        }
        index.insert(name, parsed);
    }
    Ok(index)
}

impl Archive {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let (offset, key) = parse_header(&data)?;
        let start = usize::try_from(offset)
            .ok()
            .filter(|&o| o <= data.len())
            .ok_or_else(|| Error::Format(format!("index offset {} beyond end of archive", offset)))?;
        let raw = inflate(&data[start..])?;
        let allow = AllowList::primitives_only().with_string_mode(StringMode::Bytes);
        let index = parse_index(&loads(&raw, &allow)?, key)?;
        tracing::debug!(files = index.len(), "read archive index");
        Ok(Self { data, index })
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::parse(fs::read(path)?)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let entries = self
            .index
            .get(name)
            .ok_or_else(|| Error::Format(format!("{} is not in the archive", name)))?;
        let mut out = Vec::new();
        for entry in entries {
            let range = usize::try_from(entry.offset)
                .ok()
                .zip(usize::try_from(entry.length).ok())
                .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                .filter(|r| r.end <= self.data.len())
                .ok_or_else(|| {
                    Error::Format(format!(
                        "{} spans {}+{} beyond end of archive",
                        name, entry.offset, entry.length
                    ))
                })?;
            out.extend_from_slice(&entry.prefix);
            out.extend_from_slice(&self.data[range]);
        }
        Ok(out)
    }

    /// Writes every member under `root`, skipping names that would escape it.
    pub fn extract_all(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for name in self.index.keys() {
            let dest = match safe_join(root, name) {
                Ok(dest) => dest,
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "skipping archive member");
                    continue;
                }
            };
            let data = self.read(name)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, data)?;
            tracing::info!(path = %dest.display(), "extracted");
            written.push(dest);
        }
        Ok(written)
    }
}

/// Joins an archive member name under `root`, refusing absolute names and
/// `..` components that climb above it.
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::PathSafety(PathBuf::from(name)));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathSafety(PathBuf::from(name)));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::PathSafety(PathBuf::from(name)));
    }
    Ok(parts.into_iter().fold(root.to_path_buf(), |p, part| p.join(part)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dump, zlib, Py};

    fn archive(files: &[(&str, &[u8])], key: u64) -> Vec<u8> {
        let header_len = 34;
        let mut body = Vec::new();
        let mut index = Vec::new();
        for (name, data) in files {
            let offset = (header_len + body.len()) as u64;
            index.push((
                Py::s(name),
                Py::List(vec![Py::Tuple(vec![
                    Py::Int((offset ^ key) as i64),
                    Py::Int((data.len() as u64 ^ key) as i64),
                    Py::Bytes(vec![]),
                ])]),
            ));
            body.extend_from_slice(data);
        }
        let index_offset = (header_len + body.len()) as u64;
        let mut out = format!("RPA-3.0 {:016x} {:08x}\n", index_offset, key).into_bytes();
        assert_eq!(out.len(), header_len);
        out.extend_from_slice(&body);
        out.extend_from_slice(&zlib(&dump(&Py::Dict(index))));
        out
    }

    #[test]
    fn test_read_members() {
        let data = archive(
            &[("script.rpyc", &b"compiled"[..]), ("images/bg.png", &b"png!"[..])],
            0x42424242,
        );
        let archive = Archive::parse(data).unwrap();
        assert_eq!(
            archive.names().collect::<Vec<_>>(),
            vec!["images/bg.png", "script.rpyc"]
        );
        assert_eq!(archive.read("script.rpyc").unwrap(), b"compiled");
        assert_eq!(archive.read("images/bg.png").unwrap(), b"png!");
        assert!(matches!(archive.read("missing"), Err(Error::Format(_))));
    }

    #[test]
    fn test_text_prefix_is_latin_1() {
        let entry = |prefix: &str| {
            Value::dict(vec![(
                Value::Str("a.txt".into()),
                Value::list(vec![Value::tuple(vec![
                    Value::Int(0),
                    Value::Int(1),
                    Value::Str(prefix.into()),
                ])]),
            )])
        };
        let index = parse_index(&entry("\u{e9}x"), 0).unwrap();
        assert_eq!(index["a.txt"][0].prefix, vec![0xe9, b'x']);

        let err = parse_index(&entry("\u{263a}"), 0).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_bad_header() {
        let err = Archive::parse(b"RPA-2.0 00 00\n".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err:?}");
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/out");
        assert_eq!(
            safe_join(root, "a/./b/../c.txt").unwrap(),
            PathBuf::from("/out/a/c.txt")
        );
        for bad in ["../evil", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(safe_join(root, bad), Err(Error::PathSafety(_))),
                "{bad} should be refused"
            );
        }
    }

    #[test]
    fn test_extract_all_skips_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let data = archive(&[("game/a.txt", &b"A"[..]), ("../escape.txt", &b"X"[..])], 0);
        let written = Archive::parse(data)
            .unwrap()
            .extract_all(dir.path())
            .unwrap();
        assert_eq!(written, vec![dir.path().join("game").join("a.txt")]);
        assert_eq!(fs::read(dir.path().join("game/a.txt")).unwrap(), b"A");
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }
}
