//! Translation template extraction and in-place dialogue rewriting.

use crate::ast::{walk, walk_mut, Node, Say};
use crate::error::Result;
use crate::types::ExtractStats;
use crate::unparser::Unparser;
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogueTranslation {
    pub identifier: String,
    /// Compiled file the line was found in.
    pub file: String,
    pub line: usize,
    pub who: Option<String>,
    pub what: String,
    /// The say statement as rendered, shown as a comment in templates.
    pub code: String,
}

/// A menu choice to translate. Strings declared by user statements are only
/// known to a running engine and are not collected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StringTranslation {
    pub file: String,
    pub line: usize,
    pub text: String,
}

/// How the `new` side of a template entry is filled.
#[derive(Clone, Copy)]
pub enum Fill<'f> {
    Empty,
    Copy,
    Filter(&'f dyn Fn(&str) -> String),
}

impl Fill<'_> {
    fn apply(&self, text: &str) -> String {
        match self {
            Fill::Empty => String::new(),
            Fill::Copy => text.to_string(),
            Fill::Filter(f) => f(text),
        }
    }
}

#[derive(Default)]
pub struct TranslationExtractor {
    label: Option<String>,
    pending_identifier: Option<String>,
    identifiers: HashSet<String>,
    seen_strings: HashSet<String>,
    dialogues: Vec<DialogueTranslation>,
    strings: Vec<StringTranslation>,
    unparser: Unparser,
}

impl TranslationExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract_file(&mut self, file: &str, nodes: &[Node]) {
        walk(nodes, &mut |node| self.visit(file, node));
    }

    pub fn dialogues(&self) -> &[DialogueTranslation] {
        &self.dialogues
    }

    pub fn strings(&self) -> &[StringTranslation] {
        &self.strings
    }

    pub fn into_parts(self) -> (Vec<DialogueTranslation>, Vec<StringTranslation>) {
        (self.dialogues, self.strings)
    }

    fn visit(&mut self, file: &str, node: &Node) {
        match node {
            Node::Label(label) => {
                if !label.hide && !label.name.starts_with('_') {
                    self.label = Some(label.name.clone());
                }
            }
            Node::Translate(t) if t.language.is_none() => {
                self.pending_identifier = Some(t.identifier.clone());
            }
            Node::Say(say) => {
                let pending = self.pending_identifier.take();
                self.dialogue(file, say, pending);
            }
            Node::TranslateSay(t) if t.language.is_none() => {
                self.pending_identifier = None;
                self.dialogue(file, &t.say, t.say.identifier.clone());
            }
            Node::Menu(_) => {
                for (line, text) in node.strings() {
                    if self.seen_strings.insert(text.to_string()) {
                        self.strings.push(StringTranslation {
                            file: file.to_string(),
                            line,
                            text: text.to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn dialogue(&mut self, file: &str, say: &Say, known: Option<String>) {
        if say.what.is_empty() {
            return;
        }
        let mut plain = say.clone();
        plain.explicit_identifier = false;
        let code = self.unparser.say(&plain, false);

        let explicit = say
            .identifier
            .clone()
            .filter(|_| say.explicit_identifier)
            .or(known)
            .filter(|id| !self.identifiers.contains(id));
        let identifier = match explicit {
            Some(id) => id,
            None => {
                let digest = Md5::digest(format!("{}\r\n", code).as_bytes());
                let digest = format!("{:x}", digest);
                unique_identifier(self.label.as_deref(), &digest[..8], &self.identifiers)
            }
        };
        self.identifiers.insert(identifier.clone());
        self.dialogues.push(DialogueTranslation {
            identifier,
            file: file.to_string(),
            line: say.meta.loc.line,
            who: say.who.clone(),
            what: say.what.clone(),
            code,
        });
    }
}

/// `label_digest`, with `_1`, `_2`... appended until it is unused.
pub fn unique_identifier(label: Option<&str>, digest: &str, taken: &HashSet<String>) -> String {
    let base = match label {
        Some(label) => format!("{}_{}", label.replace('.', "_"), digest),
        None => digest.to_string(),
    };
    let mut candidate = base.clone();
    let mut i = 0;
    while taken.contains(&candidate) {
        i += 1;
        candidate = format!("{}_{}", base, i);
    }
    candidate
}

/// Escapes text for a double-quoted template string.
pub fn quote_unicode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            _ => out.push(c),
        }
    }
    out
}

/// Source file name a translation file for `compiled` should use.
pub fn translation_file_name(compiled: &str) -> String {
    let base = Path::new(compiled)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| compiled.to_string());
    for ext in [".rpymc", ".rpyc", ".rpym"] {
        if let Some(stem) = base.strip_suffix(ext) {
            return format!("{}.rpy", stem);
        }
    }
    base
}

fn source_name(compiled: &str) -> &str {
    compiled
        .strip_suffix('c')
        .filter(|_| compiled.ends_with(".rpyc") || compiled.ends_with(".rpymc"))
        .unwrap_or(compiled)
}

pub fn dialogue_template(language: &str, items: &[DialogueTranslation], fill: Fill<'_>) -> String {
    let mut out = String::new();
    for item in items {
        out.push_str(&format!("# {}:{}\n", source_name(&item.file), item.line));
        out.push_str(&format!("translate {} {}:\n\n", language, item.identifier));
        out.push_str(&format!("    # {}\n", item.code));
        let new = quote_unicode(&fill.apply(&item.what));
        match &item.who {
            Some(who) => out.push_str(&format!("    {} \"{}\"\n\n", who, new)),
            None => out.push_str(&format!("    \"{}\"\n\n", new)),
        }
    }
    out
}

pub fn strings_template(language: &str, items: &[StringTranslation], fill: Fill<'_>) -> String {
    let mut out = format!("translate {} strings:\n\n", language);
    for item in items {
        out.push_str(&format!("    # {}:{}\n", source_name(&item.file), item.line));
        out.push_str(&format!("    old \"{}\"\n", quote_unicode(&item.text)));
        out.push_str(&format!(
            "    new \"{}\"\n\n",
            quote_unicode(&fill.apply(&item.text))
        ));
    }
    out
}

/// Replaces say text and menu captions in place; `f` returns `None` to keep
/// a string. Returns how many strings changed.
pub fn rewrite_dialogue(nodes: &mut [Node], mut f: impl FnMut(&str) -> Option<String>) -> usize {
    let mut changed = 0;
    let mut replace = |text: &mut String| {
        if text.is_empty() {
            return;
        }
        if let Some(new) = f(text.as_str()) {
            if new != *text {
                *text = new;
                changed += 1;
            }
        }
    };
    walk_mut(nodes, &mut |node| match node {
        Node::Say(say) => replace(&mut say.what),
        Node::TranslateSay(t) => replace(&mut t.say.what),
        Node::Menu(menu) => menu
            .items
            .iter_mut()
            .for_each(|item| replace(&mut item.label)),
        _ => {}
    });
    changed
}

/// Writes `tl/<language>/` templates for every compiled script under `game_dir`.
#[cfg(not(target_arch = "wasm32"))]
pub fn extract_translations(
    game_dir: &Path,
    output_dir: &Path,
    language: &str,
    fill: Fill<'_>,
) -> Result<ExtractStats> {
    use walkdir::WalkDir;

    let tl_dir = output_dir.join("tl").join(language);
    fs::create_dir_all(&tl_dir)?;

    let mut files: Vec<_> = WalkDir::new(game_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && crate::is_compiled_script(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut stats = ExtractStats::default();
    let mut extractor = TranslationExtractor::new();
    for path in &files {
        let rel = path.strip_prefix(game_dir).unwrap_or(path);
        let rel = rel.to_string_lossy().replace('\\', "/");
        let loaded = fs::read(path)
            .map_err(crate::Error::from)
            .and_then(|bytes| crate::load_bytes(&bytes, &crate::DecompileOptions::default()));
        match loaded {
            Ok((_, nodes)) => {
                tracing::info!(file = %rel, "extracting translations");
                extractor.extract_file(&rel, &nodes);
                stats.files += 1;
            }
            Err(e) => tracing::error!(file = %rel, error = %e, "failed to load compiled script"),
        }
    }

    let (dialogues, strings) = extractor.into_parts();
    stats.dialogue = dialogues.len();
    stats.strings = strings.len();

    let mut by_file: BTreeMap<String, Vec<DialogueTranslation>> = BTreeMap::new();
    for d in dialogues {
        by_file.entry(translation_file_name(&d.file)).or_default().push(d);
    }
    for (name, items) in by_file {
        let path = tl_dir.join(&name);
        fs::write(&path, dialogue_template(language, &items, fill))?;
        tracing::info!(path = %path.display(), count = items.len(), "wrote dialogue translations");
        stats.written.push(path);
    }
    if !strings.is_empty() {
        let path = tl_dir.join("strings.rpy");
        fs::write(&path, strings_template(language, &strings, fill))?;
        stats.written.push(path);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Label, Loc, Menu, MenuItem, Meta, Translate};
    use pretty_assertions::assert_eq;

    fn meta(line: usize) -> Meta {
        Meta {
            loc: Loc {
                file: "game/script.rpy".into(),
                line,
            },
            ..Meta::default()
        }
    }

    fn say(line: usize, who: Option<&str>, what: &str) -> Say {
        Say {
            meta: meta(line),
            who: who.map(String::from),
            what: what.into(),
            with_: None,
            interact: true,
            attributes: vec![],
            temporary_attributes: vec![],
            arguments: None,
            identifier: None,
            explicit_identifier: false,
        }
    }

    fn label(name: &str, block: Vec<Node>) -> Node {
        Node::Label(Label {
            meta: meta(1),
            name: name.into(),
            parameters: None,
            block,
            hide: false,
        })
    }

    fn md5_prefix(text: &str) -> String {
        format!("{:x}", Md5::digest(format!("{}\r\n", text).as_bytes()))[..8].to_string()
    }

    #[test]
    fn test_identifiers_hash_rendered_say() {
        let nodes = vec![label(
            "chapter.one",
            vec![
                Node::Say(say(2, Some("e"), "Hello")),
                Node::Say(say(3, Some("e"), "Hello")),
            ],
        )];
        let mut ex = TranslationExtractor::new();
        ex.extract_file("script.rpyc", &nodes);
        let digest = md5_prefix("e \"Hello\"");
        let ids: Vec<_> = ex.dialogues().iter().map(|d| d.identifier.clone()).collect();
        assert_eq!(
            ids,
            vec![
                format!("chapter_one_{}", digest),
                format!("chapter_one_{}_1", digest)
            ]
        );
        assert_eq!(ex.dialogues()[0].code, "e \"Hello\"");
    }

    #[test]
    fn test_hidden_and_private_labels_do_not_scope() {
        let nodes = vec![
            label("start", vec![]),
            label("_private", vec![Node::Say(say(2, None, "Hi"))]),
        ];
        let mut ex = TranslationExtractor::new();
        ex.extract_file("script.rpyc", &nodes);
        assert!(ex.dialogues()[0].identifier.starts_with("start_"));
    }

    #[test]
    fn test_explicit_and_wrapper_identifiers() {
        let mut explicit = say(2, None, "One");
        explicit.identifier = Some("my_line".into());
        explicit.explicit_identifier = true;
        let nodes = vec![
            Node::Say(explicit),
            Node::Translate(Translate {
                meta: meta(3),
                identifier: "start_abcdef12".into(),
                language: None,
                block: vec![Node::Say(say(3, None, "Two"))],
                alternate: None,
            }),
        ];
        let mut ex = TranslationExtractor::new();
        ex.extract_file("script.rpyc", &nodes);
        let ids: Vec<_> = ex.dialogues().iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, vec!["my_line", "start_abcdef12"]);
    }

    #[test]
    fn test_menu_strings_deduplicated() {
        let item = |label: &str, line| MenuItem {
            label: label.into(),
            condition: Expr::new("True"),
            block: Some(vec![Node::Say(say(line, None, "x"))]),
        };
        let menu = |line| {
            Node::Menu(Menu {
                meta: meta(line),
                items: vec![item("Yes", line + 2), item("No", line + 4)],
                item_arguments: vec![None, None],
                set: None,
                with_: None,
                arguments: None,
            })
        };
        let mut ex = TranslationExtractor::new();
        ex.extract_file("script.rpyc", &[menu(10), menu(20)]);
        let strings: Vec<_> = ex.strings().iter().map(|s| (s.line, s.text.as_str())).collect();
        assert_eq!(strings, vec![(11, "Yes"), (13, "No")]);
    }

    #[test]
    fn test_templates() {
        let d = DialogueTranslation {
            identifier: "start_0011aabb".into(),
            file: "script.rpyc".into(),
            line: 4,
            who: Some("e".into()),
            what: "Hi \"there\"".into(),
            code: "e \"Hi \\\"there\\\"\"".into(),
        };
        assert_eq!(
            dialogue_template("french", std::slice::from_ref(&d), Fill::Empty),
            "# script.rpy:4\ntranslate french start_0011aabb:\n\n    # e \"Hi \\\"there\\\"\"\n    e \"\"\n\n"
        );
        let upper = |s: &str| s.to_uppercase();
        let s = StringTranslation {
            file: "script.rpyc".into(),
            line: 7,
            text: "Yes".into(),
        };
        assert_eq!(
            strings_template("french", &[s], Fill::Filter(&upper)),
            "translate french strings:\n\n    # script.rpy:7\n    old \"Yes\"\n    new \"YES\"\n\n"
        );
    }

    #[test]
    fn test_translation_file_name() {
        assert_eq!(translation_file_name("game/script.rpyc"), "script.rpy");
        assert_eq!(translation_file_name("lib.rpymc"), "lib.rpy");
        assert_eq!(translation_file_name("notes.rpy"), "notes.rpy");
    }

    #[test]
    fn test_rewrite_dialogue() {
        let mut nodes = vec![label(
            "start",
            vec![
                Node::Say(say(2, None, "Hello")),
                Node::Say(say(3, None, "Bye")),
            ],
        )];
        let changed = rewrite_dialogue(&mut nodes, |t| (t == "Hello").then(|| "Bonjour".to_string()));
        assert_eq!(changed, 1);
        let Node::Label(l) = &nodes[0] else {
            panic!("expected label");
        };
        assert!(matches!(&l.block[0], Node::Say(s) if s.what == "Bonjour"));
        assert!(matches!(&l.block[1], Node::Say(s) if s.what == "Bye"));
    }
}
