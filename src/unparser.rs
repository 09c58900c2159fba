//! Renders statement trees back into script source.

use crate::ast::*;
use crate::atl::AtlBlock;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Indents every non-blank line of `text` by `width` spaces.
pub fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `$ code` for a single line, otherwise a `python:` block.
pub(crate) fn python_block(code: &Expr, force_block: bool, width: usize) -> String {
    let source = code.code.trim_end_matches('\n');
    if !force_block && !source.contains('\n') {
        return format!("$ {}", source.trim());
    }
    format!("python:\n{}", indent(source, width))
}

/// Quotes dialogue the way the engine's own template generator does.
pub fn encode_say_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut prev = None;
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            ' ' if prev == Some(' ') => out.push_str("\\ "),
            _ => out.push(c),
        }
        prev = Some(c);
    }
    out.push('"');
    out
}

/// The store name without its `store.` prefix; `None` for the default store.
fn store_name(store: &str) -> Option<&str> {
    match store {
        "" | "store" => None,
        other => Some(other.strip_prefix("store.").unwrap_or(other)),
    }
}

fn qualified(store: &str, name: &str) -> String {
    match store_name(store) {
        Some(s) => format!("{}.{}", s, name),
        None => name.to_string(),
    }
}

fn unsupported(node: &Node) -> Error {
    let loc = node.loc();
    Error::unsupported(node.kind(), &loc.file, loc.line)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnparseOptions {
    /// Spaces per indentation level.
    pub indent: usize,
}

impl Default for UnparseOptions {
    fn default() -> Self {
        Self { indent: 4 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Unparser {
    options: UnparseOptions,
}

impl Unparser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: UnparseOptions) -> Self {
        Self { options }
    }

    fn width(&self) -> usize {
        self.options.indent
    }

    /// Renders a statement sequence, folding desugared statement groups.
    pub fn render(&self, nodes: &[Node]) -> Result<String> {
        self.sequence(nodes, false)
    }

    /// Like [`Unparser::render`], for the top level of a whole file.
    pub fn render_file(&self, nodes: &[Node]) -> Result<String> {
        self.sequence(nodes, true)
    }

    /// Applies `hook` to every node, then renders the file.
    pub fn render_rewritten(
        &self,
        nodes: &mut [Node],
        mut hook: impl FnMut(&mut Node),
    ) -> Result<String> {
        walk_mut(nodes, &mut hook);
        self.render_file(nodes)
    }

    fn sequence(&self, nodes: &[Node], top_level: bool) -> Result<String> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < nodes.len() {
            let (text, used) = self.fold(nodes, i, top_level)?;
            if !text.is_empty() {
                out.push(text);
            }
            i += used;
        }
        Ok(out.join("\n"))
    }

    /// Renders the statement group starting at `nodes[i]`, returning the
    /// text and how many nodes it consumed.
    fn fold(&self, nodes: &[Node], i: usize, top_level: bool) -> Result<(String, usize)> {
        let next = nodes.get(i + 1);
        let after = nodes.get(i + 2);
        match (&nodes[i], next, after) {
            (Node::Say(say), Some(Node::Menu(menu)), _) if !say.interact => {
                Ok((self.menu(menu, None, Some(self.say(say, true)))?, 2))
            }
            (Node::Label(label), Some(caption), Some(Node::Menu(menu)))
                if label.block.is_empty()
                    && owns_menu(label, menu)
                    && self.caption(caption).is_some() =>
            {
                Ok((self.menu(menu, Some(&label.name), self.caption(caption))?, 3))
            }
            (Node::Label(label), Some(Node::Menu(menu)), _)
                if label.block.is_empty() && owns_menu(label, menu) =>
            {
                Ok((self.menu(menu, Some(&label.name), None)?, 2))
            }
            (Node::With(with), _, _) if with.is_paired_opener() => {
                let paired = with.paired.as_ref().map(|p| p.code.trim());
                match (next, after) {
                    (Some(stmt), Some(Node::With(close)))
                        if !matches!(stmt, Node::With(_))
                            && close.expr.as_ref().map(|e| e.code.trim()) == paired =>
                    {
                        let text = self.render_node(stmt)?;
                        let transition = paired.unwrap_or_default();
                        Ok((attach_with(&text, transition), 3))
                    }
                    _ => Err(unsupported(&nodes[i])),
                }
            }
            (Node::Call(call), Some(Node::Label(label)), after) if label.block.is_empty() => {
                let used = if matches!(after, Some(Node::Pass(_))) { 3 } else { 2 };
                Ok((self.call(call, Some(&label.name)), used))
            }
            (Node::Call(call), Some(Node::Pass(pass)), _)
                if pass.meta.loc.line == call.meta.loc.line =>
            {
                Ok((self.call(call, None), 2))
            }
            (Node::Return(ret), None, _)
                if top_level && nodes.len() > 1 && ret.expression.is_none() =>
            {
                Ok((String::new(), 1))
            }
            (Node::TranslateString(first), _, _) => {
                let run = nodes[i..]
                    .iter()
                    .take_while(|n| {
                        matches!(n, Node::TranslateString(t) if t.language == first.language)
                    })
                    .filter_map(|n| match n {
                        Node::TranslateString(t) => Some(t),
                        _ => None,
                    })
                    .collect::<Vec<_>>();
                Ok((self.translate_strings(&run), run.len()))
            }
            (node, _, _) => Ok((self.render_node(node)?, 1)),
        }
    }

    fn caption(&self, node: &Node) -> Option<String> {
        match node {
            Node::Say(say) if !say.interact => Some(self.say(say, true)),
            Node::UserStatement(stmt) => Some(self.user_statement(stmt)),
            _ => None,
        }
    }

    fn block(&self, header: &str, nodes: &[Node]) -> Result<String> {
        let body = if nodes.is_empty() {
            "pass".to_string()
        } else {
            self.render(nodes)?
        };
        Ok(format!("{}:\n{}", header, indent(&body, self.width())))
    }

    fn with_atl(&self, header: String, atl: Option<&AtlBlock>) -> String {
        match atl {
            Some(atl) => format!("{}:\n{}", header, indent(&atl.render(self.width()), self.width())),
            None => header,
        }
    }

    /// Renders one node on its own, without looking at its neighbours.
    pub fn render_node(&self, node: &Node) -> Result<String> {
        let text = match node {
            Node::Say(say) => self.say(say, false),
            Node::Label(label) => {
                let mut header = format!("label {}", label.name);
                if let Some(p) = &label.parameters {
                    header.push_str(&p.render());
                }
                if label.hide {
                    header.push_str(" hide");
                }
                self.block(&header, &label.block)?
            }
            Node::Python(p) => self.python(p, false, false),
            Node::EarlyPython(p) => self.python(p, true, true),
            Node::Image(image) => self.image(image),
            Node::Transform(t) => {
                let mut header = format!("transform {}", qualified(&t.store, &t.varname));
                if let Some(p) = &t.parameters {
                    header.push_str(&p.render());
                }
                let atl = t.atl.clone().unwrap_or_default();
                self.with_atl(header, Some(&atl))
            }
            Node::Show(show) => self.with_atl(
                format!("show {}", imspec(&show.imspec)),
                show.atl.as_ref(),
            ),
            Node::ShowLayer(stmt) => {
                let layer = match &stmt.layer {
                    Some(layer) => layer.as_str(),
                    None => {
                        tracing::warn!(location = %stmt.meta.loc, "show layer without a layer name, using master");
                        "master"
                    }
                };
                self.layer_statement(format!("show layer {}", layer), stmt)
            }
            Node::Camera(stmt) => {
                let header = match &stmt.layer {
                    Some(layer) => format!("camera {}", layer),
                    None => "camera".to_string(),
                };
                self.layer_statement(header, stmt)
            }
            Node::Scene(scene) => {
                let header = match (&scene.imspec, &scene.layer) {
                    (Some(spec), _) => format!("scene {}", imspec(spec)),
                    (None, Some(layer)) => format!("scene onlayer {}", layer),
                    (None, None) => "scene".to_string(),
                };
                self.with_atl(header, scene.atl.as_ref())
            }
            Node::Hide(hide) => {
                let mut text = match &hide.imspec.expression {
                    Some(e) => format!("hide expression {}", e),
                    None => format!("hide {}", hide.imspec.name.join(" ")),
                };
                if let Some(layer) = &hide.imspec.layer {
                    text.push_str(&format!(" onlayer {}", layer));
                }
                text
            }
            Node::With(with) => {
                if with.is_paired_opener() {
                    return Err(unsupported(node));
                }
                match &with.expr {
                    Some(e) => format!("with {}", e),
                    None => "with None".to_string(),
                }
            }
            Node::Call(call) => self.call(call, None),
            Node::Return(ret) => match &ret.expression {
                Some(e) => format!("return {}", e),
                None => "return".to_string(),
            },
            Node::Menu(menu) => self.menu(menu, None, None)?,
            Node::Jump(jump) => {
                if jump.expression {
                    format!("jump expression {}", jump.target)
                } else {
                    format!("jump {}", jump.target)
                }
            }
            Node::Pass(_) => "pass".to_string(),
            Node::While(w) => self.block(&format!("while {}", w.condition), &w.block)?,
            Node::If(stmt) => self.if_chain(stmt)?,
            Node::UserStatement(stmt) => self.user_statement(stmt),
            Node::Define(d) => self.define(d, 0),
            Node::Default(d) => format!("default {} = {}", qualified(&d.store, &d.varname), d.code),
            Node::Screen(s) => s.screen.render(self.width()),
            Node::Translate(t) => match &t.language {
                None => self.render(&t.block)?,
                Some(language) => {
                    let mut header = format!("translate {} {}", language, t.identifier);
                    if let Some(alt) = &t.alternate {
                        header.push_str(&format!(" alternate {}", alt));
                    }
                    self.block(&header, &t.block)?
                }
            },
            Node::EndTranslate(_) => String::new(),
            Node::TranslateString(t) => self.translate_strings(&[t]),
            Node::TranslateBlock(t) => self.translate_block(t)?,
            Node::TranslateSay(t) => match &t.language {
                None => self.say(&t.say, false),
                Some(language) => {
                    let header = format!(
                        "translate {} {}:",
                        language,
                        t.say.identifier.as_deref().unwrap_or_default()
                    );
                    let mut say = t.say.clone();
                    say.explicit_identifier = false;
                    format!("{}\n{}", header, indent(&self.say(&say, false), self.width()))
                }
            },
            Node::Style(style) => self.style(style),
            Node::Testcase(t) => {
                if t.has_body {
                    return Err(unsupported(node));
                }
                format!("testcase {}:\n{}", t.label, indent("pass", self.width()))
            }
            Node::Init(init) => self.init(init)?,
            Node::Unknown(_) => return Err(unsupported(node)),
        };
        Ok(text)
    }

    /// One say line; `caption` drops the `nointeract` a menu caption compiles to.
    pub fn say(&self, say: &Say, caption: bool) -> String {
        let mut parts = Vec::new();
        if let Some(who) = &say.who {
            parts.push(who.clone());
        }
        parts.extend(say.attributes.iter().cloned());
        if !say.temporary_attributes.is_empty() {
            parts.push("@".to_string());
            parts.extend(say.temporary_attributes.iter().cloned());
        }
        parts.push(encode_say_string(&say.what));
        if !say.interact && !caption {
            parts.push("nointeract".to_string());
        }
        if let Some(with) = &say.with_ {
            parts.push(format!("with {}", with));
        }
        if say.explicit_identifier {
            if let Some(id) = &say.identifier {
                parts.push(format!("id {}", id));
            }
        }
        if let Some(args) = &say.arguments {
            parts.push(args.render());
        }
        parts.join(" ")
    }

    fn python(&self, p: &Python, early: bool, force_block: bool) -> String {
        let store = store_name(&p.store);
        if !early && store.is_none() && !p.hide {
            return python_block(&p.code, force_block, self.width());
        }
        let mut header = "python".to_string();
        if early {
            header.push_str(" early");
        }
        if p.hide {
            header.push_str(" hide");
        }
        if let Some(store) = store {
            header.push_str(&format!(" in {}", store));
        }
        let source = p.code.code.trim_end_matches('\n');
        format!("{}:\n{}", header, indent(source, self.width()))
    }

    fn image(&self, image: &Image) -> String {
        let header = format!("image {}", image.name.join(" "));
        match &image.code {
            Some(code) => format!("{} = {}", header, code),
            None => {
                let atl = image.atl.clone().unwrap_or_default();
                self.with_atl(header, Some(&atl))
            }
        }
    }

    fn layer_statement(&self, mut header: String, stmt: &LayerStatement) -> String {
        if !stmt.at_list.is_empty() {
            header.push_str(&format!(" at {}", join_exprs(&stmt.at_list)));
        }
        self.with_atl(header, stmt.atl.as_ref())
    }

    fn call(&self, call: &Call, from: Option<&str>) -> String {
        let mut text = if call.expression {
            format!("call expression {}", call.label)
        } else {
            format!("call {}", call.label)
        };
        if let Some(args) = &call.arguments {
            if call.expression {
                text.push_str(" pass ");
            }
            text.push_str(&args.render());
        }
        if let Some(from) = from {
            text.push_str(&format!(" from {}", from));
        }
        text
    }

    fn menu(&self, menu: &Menu, label: Option<&str>, caption: Option<String>) -> Result<String> {
        let mut header = "menu".to_string();
        if let Some(label) = label {
            header.push(' ');
            header.push_str(label);
        }
        if let Some(args) = &menu.arguments {
            header.push_str(&args.render());
        }
        let mut lines = Vec::new();
        if let Some(with) = &menu.with_ {
            lines.push(format!("with {}", with));
        }
        if let Some(set) = &menu.set {
            lines.push(format!("set {}", set));
        }
        lines.extend(caption);
        for (item, args) in menu.items.iter().zip(&menu.item_arguments) {
            let mut choice = encode_say_string(&item.label);
            if let Some(args) = args {
                choice.push_str(&args.render());
            }
            if !item.condition.is_true() {
                choice.push_str(&format!(" if {}", item.condition));
            }
            match &item.block {
                Some(block) => lines.push(self.block(&choice, block)?),
                None => lines.push(choice),
            }
        }
        if lines.is_empty() {
            lines.push("pass".to_string());
        }
        Ok(format!("{}:\n{}", header, indent(&lines.join("\n"), self.width())))
    }

    fn if_chain(&self, stmt: &If) -> Result<String> {
        let mut out = Vec::new();
        let last = stmt.entries.len().saturating_sub(1);
        for (i, entry) in stmt.entries.iter().enumerate() {
            let header = if i == 0 {
                format!("if {}", entry.condition)
            } else if i == last && entry.condition.is_true() {
                "else".to_string()
            } else {
                format!("elif {}", entry.condition)
            };
            out.push(self.block(&header, &entry.block)?);
        }
        Ok(out.join("\n"))
    }

    fn user_statement(&self, stmt: &UserStatement) -> String {
        let mut out = stmt.line.clone();
        let nested = user_lines(&stmt.block, self.width());
        if !nested.is_empty() {
            out.push_str(":\n");
            out.push_str(&indent(&nested, self.width()));
        }
        out
    }

    fn define(&self, d: &Define, priority: i64) -> String {
        let mut text = "define".to_string();
        if priority != 0 {
            text.push_str(&format!(" {}", priority));
        }
        text.push(' ');
        text.push_str(&qualified(&d.store, &d.varname));
        if let Some(index) = &d.index {
            text.push_str(&format!("[{}]", index));
        }
        format!("{} {} {}", text, d.operator, d.code)
    }

    fn translate_strings(&self, run: &[&TranslateString]) -> String {
        let language = run
            .first()
            .and_then(|t| t.language.as_deref())
            .unwrap_or("None");
        let pairs = run
            .iter()
            .map(|t| {
                format!(
                    "old {}\nnew {}",
                    encode_say_string(&t.old),
                    encode_say_string(&t.new)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("translate {} strings:\n{}", language, indent(&pairs, self.width()))
    }

    fn translate_block(&self, t: &TranslateBlock) -> Result<String> {
        let Some(language) = &t.language else {
            return self.render(&t.block);
        };
        let mut out = Vec::new();
        for node in &t.block {
            let text = match node {
                Node::Python(p) | Node::EarlyPython(p) => self.python(p, false, true),
                other => self.render_node(other)?,
            };
            if !text.is_empty() {
                out.push(format!("translate {} {}", language, text));
            }
        }
        Ok(out.join("\n"))
    }

    fn style(&self, style: &Style) -> String {
        let mut header = format!("style {}", style.name);
        if let Some(parent) = &style.parent {
            header.push_str(&format!(" is {}", parent));
        }
        let mut entries = Vec::new();
        if style.clear {
            entries.push("clear".to_string());
        }
        if let Some(take) = &style.take {
            entries.push(format!("take {}", take));
        }
        entries.extend(style.delattr.iter().map(|d| format!("del {}", d)));
        if let Some(variant) = &style.variant {
            entries.push(format!("variant {}", variant));
        }
        entries.extend(style.properties.iter().map(|(k, v)| format!("{} {}", k, v)));
        match entries.len() {
            0 => header,
            1 | 2 => format!("{} {}", header, entries.join(" ")),
            _ => format!("{}:\n{}", header, indent(&entries.join("\n"), self.width())),
        }
    }

    fn init(&self, init: &Init) -> Result<String> {
        let prefix = if init.priority == 0 {
            "init".to_string()
        } else {
            format!("init {}", init.priority)
        };
        if let [only] = init.block.as_slice() {
            match (only, init.priority) {
                (Node::Python(p), _) => {
                    return Ok(format!("{} {}", prefix, self.python(p, false, true)));
                }
                (Node::EarlyPython(p), _) => {
                    return Ok(format!("{} {}", prefix, self.python(p, true, true)));
                }
                (Node::Screen(_), -500) | (Node::Image(_), 500) => return self.render_node(only),
                (Node::Define(d), priority) => return Ok(self.define(d, priority)),
                (Node::Default(_) | Node::Transform(_) | Node::Style(_), 0) => {
                    return self.render_node(only);
                }
                _ => {}
            }
        }
        if init.block.is_empty() {
            return Ok(format!("{}:\n{}", prefix, indent("pass", self.width())));
        }
        if init.priority == 0 && init.block.iter().all(|n| matches!(n, Node::TranslateString(_))) {
            return self.render(&init.block);
        }
        let inner = self.render(&init.block)?;
        if !inner.contains('\n') {
            return Ok(format!("{} {}", prefix, inner));
        }
        Ok(format!("{}:\n{}", prefix, indent(&inner, self.width())))
    }
}

fn owns_menu(label: &Label, menu: &Menu) -> bool {
    match &menu.meta.statement_start {
        None => true,
        Some(link) => link.kind == "Label" && link.label.as_deref() == Some(label.name.as_str()),
    }
}

/// Appends ` with transition` to the statement's first line, before any block colon.
fn attach_with(text: &str, transition: &str) -> String {
    let (first, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, Some(rest)),
        None => (text, None),
    };
    let first = match first.strip_suffix(':') {
        Some(head) => format!("{} with {}:", head, transition),
        None => format!("{} with {}", first, transition),
    };
    match rest {
        Some(rest) => format!("{}\n{}", first, rest),
        None => first,
    }
}

fn join_exprs(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(|e| e.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn imspec(spec: &ImSpec) -> String {
    let mut parts = vec![match &spec.expression {
        Some(e) => format!("expression {}", e),
        None => spec.name.join(" "),
    }];
    if let Some(tag) = &spec.tag {
        parts.push(format!("as {}", tag));
    }
    if !spec.at_list.is_empty() {
        parts.push(format!("at {}", join_exprs(&spec.at_list)));
    }
    if let Some(layer) = &spec.layer {
        parts.push(format!("onlayer {}", layer));
    }
    if let Some(zorder) = &spec.zorder {
        parts.push(format!("zorder {}", zorder));
    }
    if !spec.behind.is_empty() {
        parts.push(format!("behind {}", spec.behind.join(", ")));
    }
    parts.join(" ")
}

fn user_lines(lines: &[UserLine], width: usize) -> String {
    lines
        .iter()
        .map(|l| {
            if l.block.is_empty() {
                l.text.clone()
            } else {
                format!("{}\n{}", l.text, indent(&user_lines(&l.block, width), width))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
