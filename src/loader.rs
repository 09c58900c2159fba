//! Converts the deserialized object graph into typed statement nodes.

use crate::ast::*;
use crate::atl::{AtlBlock, AtlStatement, Interpolation};
use crate::error::{Error, Result};
use crate::screen::{
    displayable_name, Branch, Displayable, Keywords, ScreenBlock, ScreenDef, ScreenNode, UseTarget,
};
use crate::value::{Object, Value};

const MAX_DEPTH: usize = 256;

pub fn load_statements(root: &Value) -> Result<Vec<Node>> {
    Loader::default().block(root)
}

#[derive(Default)]
struct Loader {
    depth: usize,
}

fn field<'a>(o: &'a Object, key: &str) -> Option<&'a Value> {
    o.get(key).filter(|v| !v.is_none())
}

fn flag(o: &Object, key: &str, default: bool) -> bool {
    o.get(key).map(|v| v.truthy()).unwrap_or(default)
}

const MAX_EXPR_NESTING: usize = 16;

/// Source text of a string or of an embedded-code record.
fn text_of(v: &Value) -> Option<String> {
    text_at(v, 0)
}

fn text_at(v: &Value, depth: usize) -> Option<String> {
    match v {
        Value::Str(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::Object(_) => expr_at(v, depth).map(|e| e.code),
        _ => None,
    }
}

fn str_field(o: &Object, key: &str) -> Option<String> {
    field(o, key).and_then(text_of)
}

fn expr_of(v: &Value) -> Option<Expr> {
    expr_at(v, 0)
}

/// Code records may wrap one another; a chain deeper than
/// `MAX_EXPR_NESTING` (including one that loops back) has no source.
fn expr_at(v: &Value, depth: usize) -> Option<Expr> {
    if depth > MAX_EXPR_NESTING {
        return None;
    }
    let depth = depth + 1;
    match v {
        Value::Str(s) => Some(Expr::new(s.clone())),
        Value::Bytes(b) => Some(Expr::new(String::from_utf8_lossy(b).into_owned())),
        Value::Int(i) => Some(Expr::new(i.to_string())),
        Value::Float(f) => Some(Expr::new(format!("{:?}", f))),
        Value::Bool(b) => Some(Expr::new(if *b { "True" } else { "False" })),
        Value::Object(obj) => {
            let o = obj.borrow();
            match o.class.name.as_str() {
                "PyExpr" => {
                    let code = match o.args.first() {
                        Some(Value::Str(s)) => s.clone(),
                        _ => field(&o, "expr").and_then(|e| text_at(e, depth))?,
                    };
                    let file = match o.args.get(1) {
                        Some(Value::Str(s)) => Some(s.clone()),
                        _ => field(&o, "filename").and_then(|f| text_at(f, depth)),
                    };
                    let line = o
                        .args
                        .get(2)
                        .and_then(|v| v.as_int())
                        .or_else(|| field(&o, "linenumber").and_then(|v| v.as_int()));
                    let loc = file.map(|file| Loc {
                        file,
                        line: line.and_then(|l| usize::try_from(l).ok()).unwrap_or(0),
                    });
                    Some(Expr { code, loc })
                }
                "PyCode" => {
                    if let Some(source) = field(&o, "source") {
                        return expr_at(source, depth);
                    }
                    let state = o.state.as_ref()?.elements()?;
                    expr_at(state.get(1)?, depth)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn expr_field(o: &Object, key: &str) -> Option<Expr> {
    field(o, key).and_then(expr_of)
}

fn exprs_of(v: Option<&Value>) -> Vec<Expr> {
    v.and_then(|v| v.elements())
        .map(|items| items.iter().filter_map(expr_of).collect())
        .unwrap_or_default()
}

fn strings_of(v: Option<&Value>) -> Vec<String> {
    v.and_then(|v| v.elements())
        .map(|items| items.iter().filter_map(text_of).collect())
        .unwrap_or_default()
}

fn loc_of(o: &Object) -> Option<Loc> {
    let (file, line) = match (str_field(o, "filename"), field(o, "linenumber")) {
        (Some(file), Some(line)) => (file, line.as_int()?),
        _ => {
            let pair = field(o, "loc").or_else(|| field(o, "location"))?.elements()?;
            (text_of(pair.first()?)?, pair.get(1)?.as_int()?)
        }
    };
    Some(Loc {
        file,
        line: usize::try_from(line).ok()?,
    })
}

fn label_name(o: &Object) -> Option<String> {
    str_field(o, "name").or_else(|| str_field(o, "_name"))
}

fn link_of(v: &Value) -> Option<NodeLink> {
    let o = v.as_object()?.borrow();
    Some(NodeLink {
        kind: o.class.name.clone(),
        loc: loc_of(&o).unwrap_or_default(),
        label: if o.class.name == "Label" {
            label_name(&o)
        } else {
            None
        },
    })
}

fn tuple_items(v: &Value, what: &str) -> Result<Vec<Value>> {
    v.elements()
        .ok_or_else(|| Error::shape(format!("{} is a {}, expected a sequence", what, v.type_name())))
}

fn parameters_of(v: &Value) -> Result<Parameters> {
    let obj = v
        .as_object()
        .ok_or_else(|| Error::shape("parameter signature is not a record"))?;
    let o = obj.borrow();
    match o.class.name.as_str() {
        "Signature" => {
            let entries = match field(&o, "parameters") {
                Some(Value::Dict(d)) => d.borrow().iter().map(|(_, v)| v.clone()).collect(),
                Some(other) => tuple_items(other, "signature parameters")?,
                None => Vec::new(),
            };
            let mut params = Vec::new();
            for entry in entries {
                let p = entry
                    .as_object()
                    .ok_or_else(|| Error::shape("signature parameter is not a record"))?
                    .borrow();
                let kind = match field(&p, "kind").and_then(|k| k.as_int()) {
                    Some(0) => ParamKind::PositionalOnly,
                    Some(1) | None => ParamKind::PositionalOrKeyword,
                    Some(2) => ParamKind::VarPositional,
                    Some(3) => ParamKind::KeywordOnly,
                    Some(4) => ParamKind::VarKeyword,
                    Some(other) => {
                        return Err(Error::shape(format!("unknown parameter kind {}", other)));
                    }
                };
                params.push(Parameter {
                    name: str_field(&p, "name").unwrap_or_default(),
                    kind,
                    default: str_field(&p, "default"),
                });
            }
            Ok(Parameters { params })
        }
        _ => {
            let positional = strings_of(field(&o, "positional"));
            let last_posonly = str_field(&o, "last_posonly");
            let mut posonly = last_posonly.is_some();
            let mut params = Vec::new();
            for entry in field(&o, "parameters")
                .map(|v| tuple_items(v, "parameters"))
                .transpose()?
                .unwrap_or_default()
            {
                let pair = tuple_items(&entry, "parameter")?;
                let name = pair.first().and_then(text_of).unwrap_or_default();
                let kind = if posonly {
                    ParamKind::PositionalOnly
                } else if positional.contains(&name) {
                    ParamKind::PositionalOrKeyword
                } else {
                    ParamKind::KeywordOnly
                };
                if last_posonly.as_deref() == Some(name.as_str()) {
                    posonly = false;
                }
                let default = pair.get(1).filter(|v| !v.is_none()).and_then(text_of);
                params.push(Parameter {
                    name,
                    kind,
                    default,
                });
            }
            if let Some(extrapos) = str_field(&o, "extrapos") {
                let at = params
                    .iter()
                    .position(|p| p.kind == ParamKind::KeywordOnly)
                    .unwrap_or(params.len());
                params.insert(
                    at,
                    Parameter {
                        name: extrapos,
                        kind: ParamKind::VarPositional,
                        default: None,
                    },
                );
            }
            if let Some(extrakw) = str_field(&o, "extrakw") {
                params.push(Parameter {
                    name: extrakw,
                    kind: ParamKind::VarKeyword,
                    default: None,
                });
            }
            Ok(Parameters { params })
        }
    }
}

fn arguments_of(v: &Value) -> Result<Arguments> {
    let obj = v
        .as_object()
        .ok_or_else(|| Error::shape("argument list is not a record"))?;
    let o = obj.borrow();
    let indexes = |key: &str| -> Vec<i64> {
        field(&o, key)
            .and_then(|v| v.elements())
            .map(|items| items.iter().filter_map(|i| i.as_int()).collect())
            .unwrap_or_default()
    };
    let starred = indexes("starred_indexes");
    let doublestarred = indexes("doublestarred_indexes");
    let mut args = Vec::new();
    for (i, entry) in field(&o, "arguments")
        .map(|v| tuple_items(v, "arguments"))
        .transpose()?
        .unwrap_or_default()
        .into_iter()
        .enumerate()
    {
        let pair = tuple_items(&entry, "argument")?;
        let name = pair.first().filter(|v| !v.is_none()).and_then(text_of);
        let value = pair.get(1).and_then(text_of).unwrap_or_default();
        let kind = if starred.contains(&(i as i64)) {
            ArgKind::Starred
        } else if doublestarred.contains(&(i as i64)) {
            ArgKind::DoubleStarred
        } else {
            ArgKind::Plain
        };
        args.push(Argument { name, value, kind });
    }
    for (key, kind) in [("extrapos", ArgKind::Starred), ("extrakw", ArgKind::DoubleStarred)] {
        if let Some(value) = str_field(&o, key) {
            args.push(Argument {
                name: None,
                value,
                kind,
            });
        }
    }
    Ok(Arguments { args })
}

/// Image specifiers come as 3-, 6- or 7-tuples depending on engine version.
fn imspec_of(v: &Value) -> Result<ImSpec> {
    let items = tuple_items(v, "image specifier")?;
    let get = |i: usize| items.get(i).filter(|v| !v.is_none());
    let mut spec = ImSpec {
        name: strings_of(get(0)),
        ..ImSpec::default()
    };
    match items.len() {
        3 => {
            spec.at_list = exprs_of(get(1));
            spec.layer = get(2).and_then(text_of);
        }
        6 | 7 => {
            spec.expression = get(1).and_then(expr_of);
            spec.tag = get(2).and_then(text_of);
            spec.at_list = exprs_of(get(3));
            spec.layer = get(4).and_then(text_of);
            spec.zorder = get(5).and_then(expr_of);
            spec.behind = strings_of(get(6));
        }
        n => {
            return Err(Error::shape(format!("image specifier has {} elements", n)));
        }
    }
    Ok(spec)
}

fn user_lines(v: Option<&Value>) -> Result<Vec<UserLine>> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in tuple_items(v, "user statement block")? {
        let parts = tuple_items(&entry, "user statement line")?;
        let (line, text, block) = match parts.len() {
            4 => (&parts[1], &parts[2], &parts[3]),
            5 => (&parts[1], &parts[3], &parts[4]),
            n => return Err(Error::shape(format!("user statement line has {} elements", n))),
        };
        out.push(UserLine {
            line: line.as_int().and_then(|l| usize::try_from(l).ok()).unwrap_or(0),
            text: text_of(text).unwrap_or_default(),
            block: user_lines(Some(block).filter(|b| !b.is_none()))?,
        });
    }
    Ok(out)
}

fn keywords_of(v: Option<&Value>) -> Result<Keywords> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in tuple_items(v, "keyword list")? {
        let pair = tuple_items(&entry, "keyword")?;
        let name = pair.first().and_then(text_of).unwrap_or_default();
        let value = pair.get(1).filter(|v| !v.is_none()).and_then(expr_of);
        out.push((name, value));
    }
    Ok(out)
}

impl Loader {
    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::shape(format!(
                "statement nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn block(&mut self, v: &Value) -> Result<Vec<Node>> {
        if v.is_none() {
            return Ok(Vec::new());
        }
        self.enter()?;
        let nodes = tuple_items(v, "statement block")?
            .iter()
            .map(|n| self.node(n))
            .collect::<Result<Vec<_>>>();
        self.leave();
        nodes
    }

    fn block_field(&mut self, o: &Object, key: &str) -> Result<Vec<Node>> {
        match field(o, key) {
            Some(v) => self.block(v),
            None => Ok(Vec::new()),
        }
    }

    fn meta(&self, o: &Object) -> Result<Meta> {
        let loc = loc_of(o).ok_or_else(|| {
            Error::shape(format!("{} node has no source location", o.class.name))
        })?;
        if loc.file.is_empty() {
            return Err(Error::shape(format!("{} node has an empty file name", o.class.name)));
        }
        Ok(Meta {
            loc,
            name: field(o, "name").and_then(|v| v.as_str()).map(String::from),
            next: field(o, "next").and_then(link_of),
            statement_start: field(o, "statement_start").and_then(link_of),
        })
    }

    fn node(&mut self, v: &Value) -> Result<Node> {
        let Some(obj) = v.as_object() else {
            return Err(Error::shape(format!(
                "expected a statement node, found {}",
                v.type_name()
            )));
        };
        let o = obj.borrow();
        if !o.class.module.starts_with("renpy") {
            return Err(Error::shape(format!("{} is not a statement node", o.class)));
        }
        let meta = self.meta(&o)?;
        let node = match o.class.name.as_str() {
            "Say" => Node::Say(say(&o, meta, true)?),
            "TranslateSay" => Node::TranslateSay(TranslateSay {
                language: str_field(&o, "language"),
                say: say(&o, meta, false)?,
            }),
            "Label" => Node::Label(Label {
                name: label_name(&o)
                    .ok_or_else(|| Error::shape(format!("label at {} has no name", meta.loc)))?,
                parameters: field(&o, "parameters").map(parameters_of).transpose()?,
                block: self.block_field(&o, "block")?,
                hide: flag(&o, "hide", false),
                meta,
            }),
            kind @ ("Python" | "EarlyPython") => {
                let python = Python {
                    code: match field(&o, "code") {
                        None => Expr::new(""),
                        Some(code) => expr_of(code).ok_or_else(|| {
                            Error::shape(format!("python block at {} has no source", meta.loc))
                        })?,
                    },
                    store: str_field(&o, "store").unwrap_or_else(|| "store".to_string()),
                    hide: flag(&o, "hide", false),
                    meta,
                };
                if kind == "Python" {
                    Node::Python(python)
                } else {
                    Node::EarlyPython(python)
                }
            }
            "Image" => Node::Image(Image {
                name: strings_of(field(&o, "imgname")),
                code: expr_field(&o, "code"),
                atl: field(&o, "atl").map(|v| self.atl_block(v)).transpose()?,
                meta,
            }),
            "Transform" => Node::Transform(Transform {
                varname: str_field(&o, "varname").unwrap_or_default(),
                store: str_field(&o, "store").unwrap_or_else(|| "store".to_string()),
                parameters: field(&o, "parameters").map(parameters_of).transpose()?,
                atl: field(&o, "atl").map(|v| self.atl_block(v)).transpose()?,
                meta,
            }),
            "Show" => Node::Show(Show {
                imspec: field(&o, "imspec")
                    .map(imspec_of)
                    .transpose()?
                    .ok_or_else(|| Error::shape(format!("show at {} has no image", meta.loc)))?,
                atl: field(&o, "atl").map(|v| self.atl_block(v)).transpose()?,
                meta,
            }),
            kind @ ("ShowLayer" | "Camera") => {
                let stmt = LayerStatement {
                    layer: str_field(&o, "layer"),
                    at_list: exprs_of(field(&o, "at_list")),
                    atl: field(&o, "atl").map(|v| self.atl_block(v)).transpose()?,
                    meta,
                };
                if kind == "Camera" {
                    Node::Camera(stmt)
                } else {
                    Node::ShowLayer(stmt)
                }
            }
            "Scene" => Node::Scene(Scene {
                imspec: field(&o, "imspec").map(imspec_of).transpose()?,
                layer: str_field(&o, "layer"),
                atl: field(&o, "atl").map(|v| self.atl_block(v)).transpose()?,
                meta,
            }),
            "Hide" => Node::Hide(Hide {
                imspec: field(&o, "imspec")
                    .map(imspec_of)
                    .transpose()?
                    .ok_or_else(|| Error::shape(format!("hide at {} has no image", meta.loc)))?,
                meta,
            }),
            "With" => Node::With(With {
                expr: expr_field(&o, "expr"),
                paired: expr_field(&o, "paired"),
                meta,
            }),
            "Call" => Node::Call(Call {
                label: str_field(&o, "label").unwrap_or_default(),
                arguments: field(&o, "arguments").map(arguments_of).transpose()?,
                expression: flag(&o, "expression", false),
                meta,
            }),
            "Return" => Node::Return(Return {
                expression: expr_field(&o, "expression"),
                meta,
            }),
            "Menu" => Node::Menu(self.menu(&o, meta)?),
            "Jump" => Node::Jump(Jump {
                target: str_field(&o, "target").unwrap_or_default(),
                expression: flag(&o, "expression", false),
                meta,
            }),
            "Pass" => Node::Pass(Pass { meta }),
            "While" => Node::While(While {
                condition: expr_field(&o, "condition").unwrap_or_else(|| Expr::new("True")),
                block: self.block_field(&o, "block")?,
                meta,
            }),
            "If" => {
                let mut entries = Vec::new();
                for entry in field(&o, "entries")
                    .map(|v| tuple_items(v, "if entries"))
                    .transpose()?
                    .unwrap_or_default()
                {
                    let pair = tuple_items(&entry, "if entry")?;
                    entries.push(IfEntry {
                        condition: pair
                            .first()
                            .and_then(expr_of)
                            .unwrap_or_else(|| Expr::new("True")),
                        block: match pair.get(1) {
                            Some(b) => self.block(b)?,
                            None => Vec::new(),
                        },
                    });
                }
                Node::If(If { entries, meta })
            }
            "UserStatement" => {
                let mut subparses = Vec::new();
                for sub in strict_elements(field(&o, "subparses"), "subparses")? {
                    let block = match sub.as_object() {
                        Some(s) => {
                            let s = s.borrow();
                            self.block_field(&s, "block")?
                        }
                        None => self.block(&sub)?,
                    };
                    subparses.push(block);
                }
                Node::UserStatement(UserStatement {
                    line: str_field(&o, "line").unwrap_or_default(),
                    block: user_lines(field(&o, "block"))?,
                    code_block: self.block_field(&o, "code_block")?,
                    subparses,
                    meta,
                })
            }
            "Define" => Node::Define(Define {
                varname: str_field(&o, "varname").unwrap_or_default(),
                code: expr_field(&o, "code").unwrap_or_else(|| Expr::new("None")),
                store: str_field(&o, "store").unwrap_or_else(|| "store".to_string()),
                operator: str_field(&o, "operator").unwrap_or_else(|| "=".to_string()),
                index: expr_field(&o, "index"),
                meta,
            }),
            "Default" => Node::Default(DefaultDecl {
                varname: str_field(&o, "varname").unwrap_or_default(),
                code: expr_field(&o, "code").unwrap_or_else(|| Expr::new("None")),
                store: str_field(&o, "store").unwrap_or_else(|| "store".to_string()),
                meta,
            }),
            "Screen" => Node::Screen(Screen {
                screen: match field(&o, "screen") {
                    Some(s) => self.screen_def(s)?,
                    None => return Err(Error::shape(format!("screen at {} is empty", meta.loc))),
                },
                meta,
            }),
            "Translate" => Node::Translate(Translate {
                identifier: str_field(&o, "identifier").unwrap_or_default(),
                language: str_field(&o, "language"),
                block: self.block_field(&o, "block")?,
                alternate: str_field(&o, "alternate"),
                meta,
            }),
            "EndTranslate" => Node::EndTranslate(EndTranslate { meta }),
            "TranslateString" => Node::TranslateString(TranslateString {
                language: str_field(&o, "language"),
                old: str_field(&o, "old").unwrap_or_default(),
                new: str_field(&o, "new").unwrap_or_default(),
                meta,
            }),
            kind @ ("TranslateBlock" | "TranslateEarlyBlock") => {
                Node::TranslateBlock(TranslateBlock {
                    language: str_field(&o, "language"),
                    block: self.block_field(&o, "block")?,
                    early: kind == "TranslateEarlyBlock",
                    meta,
                })
            }
            "Style" => {
                let mut properties = Vec::new();
                if let Some(props) = field(&o, "properties") {
                    for (k, v) in props.pairs().unwrap_or_default() {
                        if let (Some(name), Some(value)) = (text_of(&k), expr_of(&v)) {
                            properties.push((name, value));
                        }
                    }
                }
                Node::Style(Style {
                    name: str_field(&o, "style_name").unwrap_or_default(),
                    parent: str_field(&o, "parent"),
                    properties,
                    clear: flag(&o, "clear", false),
                    take: str_field(&o, "take"),
                    delattr: strings_of(field(&o, "delattr")),
                    variant: expr_field(&o, "variant"),
                    meta,
                })
            }
            "Testcase" => Node::Testcase(Testcase {
                label: str_field(&o, "label").unwrap_or_default(),
                has_body: field(&o, "test").is_some_and(|t| {
                    t.as_object()
                        .map(|t| field(&t.borrow(), "block").is_some_and(|b| b.truthy()))
                        .unwrap_or_else(|| t.truthy())
                }),
                meta,
            }),
            "Init" => Node::Init(Init {
                block: self.block_field(&o, "block")?,
                priority: field(&o, "priority").and_then(|p| p.as_int()).unwrap_or(0),
                meta,
            }),
            _ => {
                let class = o.class.qualified();
                tracing::warn!(class = %class, location = %meta.loc, "unrecognized statement class");
                Node::Unknown(Unknown { class, meta })
            }
        };
        Ok(node)
    }

    fn menu(&mut self, o: &Object, meta: Meta) -> Result<Menu> {
        let mut items = Vec::new();
        for entry in strict_elements(field(o, "items"), "menu items")? {
            let parts = tuple_items(&entry, "menu item")?;
            if parts.len() != 3 {
                return Err(Error::shape(format!(
                    "menu item at {} has {} elements",
                    meta.loc,
                    parts.len()
                )));
            }
            items.push(MenuItem {
                label: text_of(&parts[0]).unwrap_or_default(),
                condition: expr_of(&parts[1]).unwrap_or_else(|| Expr::new("True")),
                block: if parts[2].is_none() {
                    None
                } else {
                    Some(self.block(&parts[2])?)
                },
            });
        }
        let item_arguments = match field(o, "item_arguments") {
            None => vec![None; items.len()],
            Some(v) => tuple_items(v, "menu item arguments")?
                .iter()
                .map(|a| (!a.is_none()).then(|| arguments_of(a)).transpose())
                .collect::<Result<Vec<_>>>()?,
        };
        if item_arguments.len() != items.len() {
            return Err(Error::shape(format!(
                "menu at {} has {} items but {} argument lists",
                meta.loc,
                items.len(),
                item_arguments.len()
            )));
        }
        Ok(Menu {
            items,
            item_arguments,
            set: str_field(o, "set"),
            with_: expr_field(o, "with_"),
            arguments: field(o, "arguments").map(arguments_of).transpose()?,
            meta,
        })
    }

    fn atl_block(&mut self, v: &Value) -> Result<AtlBlock> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::shape(format!("ATL block is a {}", v.type_name())))?;
        let o = obj.borrow();
        self.enter()?;
        let statements = strict_elements(field(&o, "statements"), "ATL statements")?
            .iter()
            .map(|s| self.atl_statement(s))
            .collect::<Result<Vec<_>>>();
        self.leave();
        Ok(AtlBlock {
            loc: loc_of(&o),
            statements: statements?,
            animation: flag(&o, "animation", false),
        })
    }

    fn atl_blocks(&mut self, v: Option<&Value>, what: &str) -> Result<Vec<AtlBlock>> {
        strict_elements(v, what)?
            .iter()
            .map(|b| self.atl_block(b))
            .collect()
    }

    fn atl_statement(&mut self, v: &Value) -> Result<AtlStatement> {
        if v.is_none() {
            return Ok(AtlStatement::Pass);
        }
        let obj = v
            .as_object()
            .ok_or_else(|| Error::shape(format!("ATL statement is a {}", v.type_name())))?;
        let o = obj.borrow();
        let stmt = match o.class.name.as_str() {
            "RawBlock" => AtlStatement::Block(self.atl_block(v)?),
            "RawMultipurpose" => {
                let mut properties = Vec::new();
                for entry in strict_elements(field(&o, "properties"), "ATL properties")? {
                    let pair = tuple_items(&entry, "ATL property")?;
                    if let (Some(name), Some(value)) =
                        (pair.first().and_then(text_of), pair.get(1).and_then(expr_of))
                    {
                        properties.push((name, value));
                    }
                }
                let mut expressions = Vec::new();
                for entry in strict_elements(field(&o, "expressions"), "ATL expressions")? {
                    let pair = tuple_items(&entry, "ATL expression")?;
                    if let Some(expr) = pair.first().and_then(expr_of) {
                        expressions.push((expr, pair.get(1).and_then(expr_of)));
                    }
                }
                let mut splines = Vec::new();
                for entry in strict_elements(field(&o, "splines"), "ATL splines")? {
                    let pair = tuple_items(&entry, "ATL spline")?;
                    if let Some(name) = pair.first().and_then(text_of) {
                        splines.push((name, exprs_of(pair.get(1))));
                    }
                }
                AtlStatement::Interpolation(Interpolation {
                    warper: str_field(&o, "warper"),
                    duration: expr_field(&o, "duration").unwrap_or_else(|| Expr::new("0")),
                    warp_function: expr_field(&o, "warp_function"),
                    revolution: str_field(&o, "revolution"),
                    circles: expr_field(&o, "circles").unwrap_or_else(|| Expr::new("0")),
                    properties,
                    expressions,
                    splines,
                })
            }
            "RawRepeat" => AtlStatement::Repeat(expr_field(&o, "repeats")),
            "RawParallel" => AtlStatement::Parallel(self.atl_blocks(field(&o, "blocks"), "parallel blocks")?),
            "RawChoice" => {
                let mut choices = Vec::new();
                for entry in strict_elements(field(&o, "choices"), "ATL choices")? {
                    let pair = tuple_items(&entry, "ATL choice")?;
                    let block = match pair.get(1) {
                        Some(b) => self.atl_block(b)?,
                        None => AtlBlock::default(),
                    };
                    choices.push((pair.first().and_then(expr_of), block));
                }
                AtlStatement::Choice(choices)
            }
            "RawTime" => AtlStatement::Time(expr_field(&o, "time").unwrap_or_else(|| Expr::new("0"))),
            "RawOn" => {
                let mut handlers = Vec::new();
                for (name, block) in field(&o, "handlers").and_then(|h| h.pairs()).unwrap_or_default() {
                    handlers.push((text_of(&name).unwrap_or_default(), self.atl_block(&block)?));
                }
                AtlStatement::On(handlers)
            }
            "RawFunction" => AtlStatement::Function(expr_field(&o, "expr").unwrap_or_else(|| Expr::new("None"))),
            "RawContainsExpr" => {
                AtlStatement::Contains(expr_field(&o, "expression").unwrap_or_else(|| Expr::new("None")))
            }
            "RawChild" => AtlStatement::Child(self.atl_blocks(field(&o, "children"), "contains blocks")?),
            "RawEvent" => AtlStatement::Event(str_field(&o, "name").unwrap_or_default()),
            other => {
                return Err(Error::shape(format!("unsupported ATL statement {}", other)));
            }
        };
        Ok(stmt)
    }

    fn screen_def(&mut self, v: &Value) -> Result<ScreenDef> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::shape(format!("screen is a {}", v.type_name())))?;
        let o = obj.borrow();
        self.enter()?;
        let children = self.sl_children(&o);
        self.leave();
        Ok(ScreenDef {
            loc: loc_of(&o),
            name: str_field(&o, "name").unwrap_or_default(),
            parameters: field(&o, "parameters").map(parameters_of).transpose()?,
            keyword: keywords_of(field(&o, "keyword"))?,
            children: children?,
            tag: str_field(&o, "tag"),
        })
    }

    fn sl_children(&mut self, o: &Object) -> Result<Vec<ScreenNode>> {
        strict_elements(field(o, "children"), "screen children")?
            .iter()
            .map(|c| self.sl_node(c))
            .collect()
    }

    fn sl_block(&mut self, v: &Value) -> Result<ScreenBlock> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::shape(format!("screen block is a {}", v.type_name())))?;
        let o = obj.borrow();
        Ok(ScreenBlock {
            keyword: keywords_of(field(&o, "keyword"))?,
            children: self.sl_children(&o)?,
        })
    }

    fn sl_branches(&mut self, o: &Object) -> Result<Vec<Branch>> {
        let mut branches = Vec::new();
        for entry in strict_elements(field(o, "entries"), "screen branches")? {
            let pair = tuple_items(&entry, "screen branch")?;
            let block = match pair.get(1) {
                Some(b) if !b.is_none() => self.sl_block(b)?,
                _ => ScreenBlock::default(),
            };
            branches.push(Branch {
                condition: pair.first().and_then(expr_of),
                block,
            });
        }
        Ok(branches)
    }

    fn sl_node(&mut self, v: &Value) -> Result<ScreenNode> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::shape(format!("screen statement is a {}", v.type_name())))?;
        let o = obj.borrow();
        self.enter()?;
        let node = self.sl_node_inner(v, &o);
        self.leave();
        node
    }

    fn sl_node_inner(&mut self, v: &Value, o: &Object) -> Result<ScreenNode> {
        let node = match o.class.name.as_str() {
            "SLBlock" => ScreenNode::Block(self.sl_block(v)?),
            "SLDisplayable" => {
                let name = match str_field(o, "name") {
                    Some(name) => name,
                    None => {
                        let callable = match field(o, "displayable") {
                            Some(Value::Class(c)) => c.name.clone(),
                            Some(Value::Object(d)) => d.borrow().class.name.clone(),
                            _ => {
                                return Err(Error::shape("screen displayable has no callable"));
                            }
                        };
                        displayable_name(&callable, str_field(o, "style").as_deref())
                    }
                };
                ScreenNode::Displayable(Displayable {
                    name,
                    positional: exprs_of(field(o, "positional")),
                    keyword: keywords_of(field(o, "keyword"))?,
                    children: self.sl_children(o)?,
                })
            }
            "SLIf" => ScreenNode::If {
                branches: self.sl_branches(o)?,
            },
            "SLShowIf" => ScreenNode::ShowIf {
                branches: self.sl_branches(o)?,
            },
            "SLFor" => ScreenNode::For {
                variable: str_field(o, "variable").unwrap_or_default(),
                expression: expr_field(o, "expression").unwrap_or_else(|| Expr::new("()")),
                index: expr_field(o, "index_expression"),
                children: self.sl_children(o)?,
            },
            "SLPython" => ScreenNode::Python {
                code: expr_field(o, "code").unwrap_or_else(|| Expr::new("")),
            },
            "SLDefault" => ScreenNode::Default {
                variable: str_field(o, "variable").unwrap_or_default(),
                expression: expr_field(o, "expression").unwrap_or_else(|| Expr::new("None")),
            },
            "SLUse" => {
                let target = match field(o, "target") {
                    Some(Value::Str(s)) => UseTarget::Name(s.clone()),
                    Some(other) => UseTarget::Expression(
                        expr_of(other).ok_or_else(|| Error::shape("use target is not code"))?,
                    ),
                    None => return Err(Error::shape("use statement has no target")),
                };
                ScreenNode::Use {
                    target,
                    args: field(o, "args").map(arguments_of).transpose()?,
                    id: expr_field(o, "id"),
                    block: field(o, "block").map(|b| self.sl_block(b)).transpose()?,
                }
            }
            "SLTransclude" => ScreenNode::Transclude,
            "SLScreen" => ScreenNode::Screen(self.screen_def(v)?),
            "SLContinue" => ScreenNode::Continue,
            "SLPass" => ScreenNode::Pass,
            "SLBreak" => ScreenNode::Break,
            other => {
                return Err(Error::shape(format!("unsupported screen statement {}", other)));
            }
        };
        Ok(node)
    }
}

/// Elements of an optional sequence field; a non-sequence is a shape error.
fn strict_elements(v: Option<&Value>, what: &str) -> Result<Vec<Value>> {
    match v {
        None => Ok(Vec::new()),
        Some(v) => tuple_items(v, what),
    }
}

fn say(o: &Object, meta: Meta, identifier_implies_explicit: bool) -> Result<Say> {
    let identifier = str_field(o, "identifier");
    let explicit_identifier = match o.get("explicit_identifier") {
        Some(v) => v.truthy(),
        None => identifier_implies_explicit && identifier.is_some(),
    };
    Ok(Say {
        who: str_field(o, "who"),
        what: str_field(o, "what").unwrap_or_default(),
        with_: expr_field(o, "with_"),
        interact: flag(o, "interact", true),
        attributes: strings_of(field(o, "attributes")),
        temporary_attributes: strings_of(field(o, "temporary_attributes")),
        arguments: field(o, "arguments").map(arguments_of).transpose()?,
        identifier,
        explicit_identifier,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::AllowList;
    use crate::pickle::loads;
    use crate::testutil::{dump, expr, label, node, pycode, say as say_node, Py};

    fn load(stmts: Vec<Py>) -> Result<Vec<Node>> {
        let value = loads(&dump(&Py::List(stmts)), &AllowList::default())?;
        load_statements(&value)
    }

    #[test]
    fn test_label_and_say() {
        let nodes = load(vec![label(1, "start", vec![say_node(2, Some("e"), "Hi")])]).unwrap();
        let Node::Label(l) = &nodes[0] else {
            panic!("expected label, got {:?}", nodes[0]);
        };
        assert_eq!(l.name, "start");
        assert_eq!(l.meta.loc.line, 1);
        let Node::Say(s) = &l.block[0] else {
            panic!("expected say");
        };
        assert_eq!(s.who.as_deref(), Some("e"));
        assert_eq!(s.what, "Hi");
        assert!(s.interact);
        assert!(!s.explicit_identifier);
    }

    #[test]
    fn test_python_code_and_store() {
        let nodes = load(vec![node(
            "Python",
            3,
            vec![
                ("code", pycode("x = 1")),
                ("store", Py::s("store.inventory")),
                ("hide", Py::Bool(false)),
            ],
        )])
        .unwrap();
        let Node::Python(p) = &nodes[0] else {
            panic!("expected python");
        };
        assert_eq!(p.code.code, "x = 1");
        assert_eq!(p.store, "store.inventory");
    }

    fn python_with(code: Py) -> Py {
        node(
            "Python",
            3,
            vec![("code", code), ("store", Py::s("store")), ("hide", Py::Bool(false))],
        )
    }

    #[test]
    fn test_code_record_built_from_itself_is_rejected() {
        let looped = Py::obj_with_state("renpy.ast", "PyCode", vec![], Py::Get(0)).memoized(0);
        let err = load(vec![python_with(looped)]).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_code_records_sourcing_each_other_are_rejected() {
        let inner = Py::obj("renpy.ast", "PyCode", vec![], vec![("source", Py::Get(0))]);
        let outer =
            Py::obj("renpy.ast", "PyCode", vec![], vec![("source", inner)]).memoized(0);
        let err = load(vec![python_with(outer)]).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_self_referential_expression_has_no_text() {
        let looped = Py::obj("renpy.ast", "PyExpr", vec![], vec![("expr", Py::Get(0))]).memoized(0);
        let nodes = load(vec![node(
            "Jump",
            2,
            vec![("target", looped), ("expression", Py::Bool(true))],
        )])
        .unwrap();
        let Node::Jump(j) = &nodes[0] else {
            panic!("expected jump, got {:?}", nodes[0]);
        };
        assert_eq!(j.target, "");
    }

    #[test]
    fn test_imspec_lengths() {
        let name = Py::Tuple(vec![Py::s("eileen"), Py::s("happy")]);
        let seven = Py::Tuple(vec![
            name.clone(),
            Py::None,
            Py::s("e"),
            Py::List(vec![expr("right")]),
            Py::s("master"),
            Py::None,
            Py::List(vec![Py::s("bg")]),
        ]);
        let three = Py::Tuple(vec![name, Py::List(vec![expr("left")]), Py::s("overlay")]);
        let nodes = load(vec![
            node("Show", 1, vec![("imspec", seven), ("atl", Py::None)]),
            node("Hide", 2, vec![("imspec", three)]),
        ])
        .unwrap();
        let Node::Show(show) = &nodes[0] else {
            panic!("expected show");
        };
        assert_eq!(show.imspec.name, vec!["eileen", "happy"]);
        assert_eq!(show.imspec.tag.as_deref(), Some("e"));
        assert_eq!(show.imspec.behind, vec!["bg"]);
        let Node::Hide(hide) = &nodes[1] else {
            panic!("expected hide");
        };
        assert_eq!(hide.imspec.at_list[0].code, "left");
        assert_eq!(hide.imspec.layer.as_deref(), Some("overlay"));

        let bad = Py::Tuple(vec![Py::None, Py::None]);
        let err = load(vec![node("Hide", 3, vec![("imspec", bad)])]).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_menu_argument_lists_must_align() {
        let items = Py::List(vec![
            Py::Tuple(vec![Py::s("A"), Py::s("True"), Py::List(vec![])]),
            Py::Tuple(vec![Py::s("B"), Py::s("True"), Py::List(vec![])]),
        ]);
        let ok = load(vec![node("Menu", 1, vec![("items", items.clone())])]).unwrap();
        let Node::Menu(m) = &ok[0] else {
            panic!("expected menu");
        };
        assert_eq!(m.item_arguments, vec![None, None]);

        let err = load(vec![node(
            "Menu",
            1,
            vec![("items", items), ("item_arguments", Py::List(vec![Py::None]))],
        )])
        .unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_parameter_info() {
        let info = Py::obj(
            "renpy.ast",
            "ParameterInfo",
            vec![],
            vec![
                (
                    "parameters",
                    Py::List(vec![
                        Py::Tuple(vec![Py::s("a"), Py::None]),
                        Py::Tuple(vec![Py::s("b"), Py::s("2")]),
                        Py::Tuple(vec![Py::s("c"), Py::None]),
                    ]),
                ),
                ("positional", Py::List(vec![Py::s("a"), Py::s("b")])),
                ("extrapos", Py::s("args")),
                ("extrakw", Py::None),
            ],
        );
        let nodes = load(vec![node(
            "Label",
            1,
            vec![
                ("name", Py::s("chapter")),
                ("parameters", info),
                ("block", Py::List(vec![])),
            ],
        )])
        .unwrap();
        let Node::Label(l) = &nodes[0] else {
            panic!("expected label");
        };
        assert_eq!(l.parameters.as_ref().unwrap().render(), "(a, b=2, *args, c)");
    }

    #[test]
    fn test_unknown_engine_node() {
        let nodes = load(vec![node("RPY", 1, vec![("rest", Py::s("python 3"))])]).unwrap();
        assert!(matches!(&nodes[0], Node::Unknown(u) if u.class == "renpy.ast.RPY"));
    }

    #[test]
    fn test_rejects_non_nodes_and_missing_location() {
        let err = load(vec![Py::Int(3)]).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");

        let bare = Py::obj("renpy.ast", "Pass", vec![], vec![]);
        let err = load(vec![bare]).unwrap_err();
        assert!(matches!(err, Error::Unpickling { .. }), "{err:?}");
    }

    #[test]
    fn test_depth_is_capped() {
        let mut inner = label(1, "deep", vec![]);
        for _ in 0..(MAX_DEPTH + 5) {
            inner = label(1, "deep", vec![inner]);
        }
        let err = load(vec![inner]).unwrap_err();
        assert!(
            matches!(&err, Error::Unpickling { message, .. } if message.contains("nesting")),
            "{err:?}"
        );
    }

    #[test]
    fn test_statement_start_link() {
        let target = label(4, "choice", vec![]);
        let menu = node(
            "Menu",
            5,
            vec![("items", Py::List(vec![])), ("statement_start", target.clone())],
        );
        let nodes = load(vec![target, menu]).unwrap();
        let link = nodes[1].meta().statement_start.as_ref().unwrap();
        assert_eq!(link.kind, "Label");
        assert_eq!(link.label.as_deref(), Some("choice"));
        assert_eq!(link.loc.line, 4);
    }
}
