use crate::atl::AtlBlock;
use crate::screen::ScreenDef;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Loc {
    pub file: String,
    pub line: usize,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Summary of a node referenced through `next` or `statement_start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLink {
    pub kind: String,
    pub loc: Loc,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Meta {
    pub loc: Loc,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<NodeLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_start: Option<NodeLink>,
}

/// Embedded script code, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expr {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<Loc>,
}

impl Expr {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            loc: None,
        }
    }

    /// The literal condition the compiler uses for `else` branches.
    pub fn is_true(&self) -> bool {
        self.code.trim() == "True"
    }

    pub fn is_none_literal(&self) -> bool {
        self.code.trim() == "None"
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    PositionalOnly,
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Parameters {
    pub params: Vec<Parameter>,
}

impl Parameters {
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        let with_default = |p: &Parameter| match &p.default {
            Some(d) => format!("{}={}", p.name, d),
            None => p.name.clone(),
        };
        let mut saw_posonly = false;
        let mut saw_star = false;
        for p in &self.params {
            if saw_posonly && p.kind != ParamKind::PositionalOnly {
                out.push("/".to_string());
                saw_posonly = false;
            }
            match p.kind {
                ParamKind::PositionalOnly => {
                    saw_posonly = true;
                    out.push(with_default(p));
                }
                ParamKind::PositionalOrKeyword => out.push(with_default(p)),
                ParamKind::VarPositional => {
                    saw_star = true;
                    out.push(format!("*{}", p.name));
                }
                ParamKind::KeywordOnly => {
                    if !saw_star {
                        saw_star = true;
                        out.push("*".to_string());
                    }
                    out.push(with_default(p));
                }
                ParamKind::VarKeyword => out.push(format!("**{}", p.name)),
            }
        }
        if saw_posonly {
            out.push("/".to_string());
        }
        format!("({})", out.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Plain,
    Starred,
    DoubleStarred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Argument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: String,
    pub kind: ArgKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Arguments {
    pub args: Vec<Argument>,
}

impl Arguments {
    pub fn render(&self) -> String {
        let parts: Vec<String> = self
            .args
            .iter()
            .map(|a| match (a.kind, &a.name) {
                (ArgKind::Starred, _) => format!("*{}", a.value),
                (ArgKind::DoubleStarred, _) => format!("**{}", a.value),
                (ArgKind::Plain, Some(name)) => format!("{}={}", name, a.value),
                (ArgKind::Plain, None) => a.value.clone(),
            })
            .collect();
        format!("({})", parts.join(", "))
    }
}

/// Image specifier shared by show, scene and hide.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ImSpec {
    pub name: Vec<String>,
    pub expression: Option<Expr>,
    pub tag: Option<String>,
    pub at_list: Vec<Expr>,
    pub layer: Option<String>,
    pub zorder: Option<Expr>,
    pub behind: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Say {
    pub meta: Meta,
    pub who: Option<String>,
    pub what: String,
    pub with_: Option<Expr>,
    pub interact: bool,
    pub attributes: Vec<String>,
    pub temporary_attributes: Vec<String>,
    pub arguments: Option<Arguments>,
    pub identifier: Option<String>,
    pub explicit_identifier: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Label {
    pub meta: Meta,
    pub name: String,
    pub parameters: Option<Parameters>,
    pub block: Vec<Node>,
    pub hide: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Python {
    pub meta: Meta,
    pub code: Expr,
    pub store: String,
    pub hide: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Image {
    pub meta: Meta,
    pub name: Vec<String>,
    pub code: Option<Expr>,
    pub atl: Option<AtlBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transform {
    pub meta: Meta,
    pub varname: String,
    pub store: String,
    pub parameters: Option<Parameters>,
    pub atl: Option<AtlBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Show {
    pub meta: Meta,
    pub imspec: ImSpec,
    pub atl: Option<AtlBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scene {
    pub meta: Meta,
    pub imspec: Option<ImSpec>,
    pub layer: Option<String>,
    pub atl: Option<AtlBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hide {
    pub meta: Meta,
    pub imspec: ImSpec,
}

/// `show layer` and `camera` share this shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStatement {
    pub meta: Meta,
    pub layer: Option<String>,
    pub at_list: Vec<Expr>,
    pub atl: Option<AtlBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct With {
    pub meta: Meta,
    pub expr: Option<Expr>,
    pub paired: Option<Expr>,
}

impl With {
    /// The opening half the compiler emits for `stmt with expr`.
    pub fn is_paired_opener(&self) -> bool {
        self.paired.is_some() && self.expr.as_ref().is_none_or(|e| e.is_none_literal())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub meta: Meta,
    pub label: String,
    pub arguments: Option<Arguments>,
    pub expression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Return {
    pub meta: Meta,
    pub expression: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuItem {
    pub label: String,
    pub condition: Expr,
    /// `None` marks a caption line rather than a choice.
    pub block: Option<Vec<Node>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Menu {
    pub meta: Meta,
    pub items: Vec<MenuItem>,
    pub item_arguments: Vec<Option<Arguments>>,
    pub set: Option<String>,
    pub with_: Option<Expr>,
    pub arguments: Option<Arguments>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Jump {
    pub meta: Meta,
    pub target: String,
    pub expression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pass {
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct While {
    pub meta: Meta,
    pub condition: Expr,
    pub block: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfEntry {
    pub condition: Expr,
    pub block: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct If {
    pub meta: Meta,
    pub entries: Vec<IfEntry>,
}

/// One source line of a creator-defined statement and the lines nested under it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserLine {
    pub line: usize,
    pub text: String,
    pub block: Vec<UserLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStatement {
    pub meta: Meta,
    pub line: String,
    pub block: Vec<UserLine>,
    pub code_block: Vec<Node>,
    pub subparses: Vec<Vec<Node>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Define {
    pub meta: Meta,
    pub varname: String,
    pub code: Expr,
    pub store: String,
    pub operator: String,
    pub index: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefaultDecl {
    pub meta: Meta,
    pub varname: String,
    pub code: Expr,
    pub store: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Screen {
    pub meta: Meta,
    pub screen: ScreenDef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Translate {
    pub meta: Meta,
    pub identifier: String,
    pub language: Option<String>,
    pub block: Vec<Node>,
    pub alternate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndTranslate {
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslateString {
    pub meta: Meta,
    pub language: Option<String>,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslateBlock {
    pub meta: Meta,
    pub language: Option<String>,
    pub block: Vec<Node>,
    pub early: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslateSay {
    pub say: Say,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Style {
    pub meta: Meta,
    pub name: String,
    pub parent: Option<String>,
    pub properties: Vec<(String, Expr)>,
    pub clear: bool,
    pub take: Option<String>,
    pub delattr: Vec<String>,
    pub variant: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Testcase {
    pub meta: Meta,
    pub label: String,
    /// Whether the test body holds any statements. They are not modelled.
    pub has_body: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Init {
    pub meta: Meta,
    pub block: Vec<Node>,
    pub priority: i64,
}

/// An engine node type with no rendering rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unknown {
    pub meta: Meta,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Node {
    Say(Say),
    Label(Label),
    Python(Python),
    EarlyPython(Python),
    Image(Image),
    Transform(Transform),
    Show(Show),
    ShowLayer(LayerStatement),
    Scene(Scene),
    Hide(Hide),
    With(With),
    Call(Call),
    Return(Return),
    Menu(Menu),
    Jump(Jump),
    Pass(Pass),
    While(While),
    If(If),
    UserStatement(UserStatement),
    Define(Define),
    Default(DefaultDecl),
    Screen(Screen),
    Translate(Translate),
    EndTranslate(EndTranslate),
    TranslateString(TranslateString),
    TranslateBlock(TranslateBlock),
    TranslateSay(TranslateSay),
    Style(Style),
    Testcase(Testcase),
    Camera(LayerStatement),
    Init(Init),
    Unknown(Unknown),
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Say(_) => "Say",
            Node::Label(_) => "Label",
            Node::Python(_) => "Python",
            Node::EarlyPython(_) => "EarlyPython",
            Node::Image(_) => "Image",
            Node::Transform(_) => "Transform",
            Node::Show(_) => "Show",
            Node::ShowLayer(_) => "ShowLayer",
            Node::Scene(_) => "Scene",
            Node::Hide(_) => "Hide",
            Node::With(_) => "With",
            Node::Call(_) => "Call",
            Node::Return(_) => "Return",
            Node::Menu(_) => "Menu",
            Node::Jump(_) => "Jump",
            Node::Pass(_) => "Pass",
            Node::While(_) => "While",
            Node::If(_) => "If",
            Node::UserStatement(_) => "UserStatement",
            Node::Define(_) => "Define",
            Node::Default(_) => "Default",
            Node::Screen(_) => "Screen",
            Node::Translate(_) => "Translate",
            Node::EndTranslate(_) => "EndTranslate",
            Node::TranslateString(_) => "TranslateString",
            Node::TranslateBlock(_) => "TranslateBlock",
            Node::TranslateSay(_) => "TranslateSay",
            Node::Style(_) => "Style",
            Node::Testcase(_) => "Testcase",
            Node::Camera(_) => "Camera",
            Node::Init(_) => "Init",
            Node::Unknown(_) => "Unknown",
        }
    }

    pub fn meta(&self) -> &Meta {
        match self {
            Node::Say(n) => &n.meta,
            Node::Label(n) => &n.meta,
            Node::Python(n) | Node::EarlyPython(n) => &n.meta,
            Node::Image(n) => &n.meta,
            Node::Transform(n) => &n.meta,
            Node::Show(n) => &n.meta,
            Node::ShowLayer(n) | Node::Camera(n) => &n.meta,
            Node::Scene(n) => &n.meta,
            Node::Hide(n) => &n.meta,
            Node::With(n) => &n.meta,
            Node::Call(n) => &n.meta,
            Node::Return(n) => &n.meta,
            Node::Menu(n) => &n.meta,
            Node::Jump(n) => &n.meta,
            Node::Pass(n) => &n.meta,
            Node::While(n) => &n.meta,
            Node::If(n) => &n.meta,
            Node::UserStatement(n) => &n.meta,
            Node::Define(n) => &n.meta,
            Node::Default(n) => &n.meta,
            Node::Screen(n) => &n.meta,
            Node::Translate(n) => &n.meta,
            Node::EndTranslate(n) => &n.meta,
            Node::TranslateString(n) => &n.meta,
            Node::TranslateBlock(n) => &n.meta,
            Node::TranslateSay(n) => &n.say.meta,
            Node::Style(n) => &n.meta,
            Node::Testcase(n) => &n.meta,
            Node::Init(n) => &n.meta,
            Node::Unknown(n) => &n.meta,
        }
    }

    pub fn loc(&self) -> &Loc {
        &self.meta().loc
    }

    /// Nested statement blocks, in source order.
    pub fn blocks(&self) -> Vec<&Vec<Node>> {
        match self {
            Node::Label(n) => vec![&n.block],
            Node::While(n) => vec![&n.block],
            Node::If(n) => n.entries.iter().map(|e| &e.block).collect(),
            Node::Menu(n) => n.items.iter().filter_map(|i| i.block.as_ref()).collect(),
            Node::UserStatement(n) => std::iter::once(&n.code_block)
                .chain(n.subparses.iter())
                .collect(),
            Node::Translate(n) => vec![&n.block],
            Node::TranslateBlock(n) => vec![&n.block],
            Node::Init(n) => vec![&n.block],
            _ => Vec::new(),
        }
    }

    pub fn blocks_mut(&mut self) -> Vec<&mut Vec<Node>> {
        match self {
            Node::Label(n) => vec![&mut n.block],
            Node::While(n) => vec![&mut n.block],
            Node::If(n) => n.entries.iter_mut().map(|e| &mut e.block).collect(),
            Node::Menu(n) => n
                .items
                .iter_mut()
                .filter_map(|i| i.block.as_mut())
                .collect(),
            Node::UserStatement(n) => std::iter::once(&mut n.code_block)
                .chain(n.subparses.iter_mut())
                .collect(),
            Node::Translate(n) => vec![&mut n.block],
            Node::TranslateBlock(n) => vec![&mut n.block],
            Node::Init(n) => vec![&mut n.block],
            _ => Vec::new(),
        }
    }

    /// Player-facing text carried directly by this node, with its line.
    pub fn strings(&self) -> Vec<(usize, &str)> {
        let found = match self {
            Node::Say(s) => vec![(s.meta.loc.line, s.what.as_str())],
            Node::TranslateSay(t) => vec![(t.say.meta.loc.line, t.say.what.as_str())],
            Node::Menu(m) => m
                .items
                .iter()
                .map(|item| {
                    let line = item
                        .block
                        .as_ref()
                        .and_then(|b| b.first())
                        .map(|first| first.loc().line.saturating_sub(1))
                        .unwrap_or(m.meta.loc.line);
                    (line, item.label.as_str())
                })
                .collect(),
            Node::TranslateString(t) => vec![(t.meta.loc.line, t.old.as_str())],
            _ => Vec::new(),
        };
        found.into_iter().filter(|(_, s)| !s.is_empty()).collect()
    }
}

/// Depth-first, parents before children.
pub fn walk<'a>(nodes: &'a [Node], f: &mut impl FnMut(&'a Node)) {
    for node in nodes {
        f(node);
        for block in node.blocks() {
            walk(block, f);
        }
    }
}

/// Like [`walk`], letting the callback edit each node before its children are visited.
pub fn walk_mut(nodes: &mut [Node], f: &mut impl FnMut(&mut Node)) {
    for node in nodes.iter_mut() {
        f(node);
        for block in node.blocks_mut() {
            walk_mut(block, f);
        }
    }
}

pub fn flatten(nodes: &[Node]) -> Vec<&Node> {
    let mut out = Vec::new();
    walk(nodes, &mut |n| out.push(n));
    out
}
