use crate::ast::{Arguments, Expr, Loc, Parameters};
use crate::unparser::{indent, python_block};
use serde::Serialize;

/// `keyword value` pairs; a missing value renders the bare keyword.
pub type Keywords = Vec<(String, Option<Expr>)>;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScreenDef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<Loc>,
    pub name: String,
    pub parameters: Option<Parameters>,
    pub keyword: Keywords,
    pub children: Vec<ScreenNode>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScreenBlock {
    pub keyword: Keywords,
    pub children: Vec<ScreenNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Displayable {
    pub name: String,
    pub positional: Vec<Expr>,
    pub keyword: Keywords,
    pub children: Vec<ScreenNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Branch {
    /// `None` or the `True` literal on the last branch means `else`.
    pub condition: Option<Expr>,
    pub block: ScreenBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UseTarget {
    Name(String),
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ScreenNode {
    Block(ScreenBlock),
    Displayable(Displayable),
    If {
        branches: Vec<Branch>,
    },
    ShowIf {
        branches: Vec<Branch>,
    },
    For {
        variable: String,
        expression: Expr,
        index: Option<Expr>,
        children: Vec<ScreenNode>,
    },
    Python {
        code: Expr,
    },
    Default {
        variable: String,
        expression: Expr,
    },
    Use {
        target: UseTarget,
        args: Option<Arguments>,
        id: Option<Expr>,
        block: Option<ScreenBlock>,
    },
    Transclude,
    Screen(ScreenDef),
    Continue,
    Pass,
    Break,
}

/// Loop variable the compiler substitutes for destructuring `for` targets.
const SL2_LOOP_VAR: &str = "_sl2_i";

fn keyword_lines(keyword: &Keywords) -> Vec<String> {
    keyword
        .iter()
        .map(|(k, v)| match v {
            Some(v) if !v.code.is_empty() => format!("{} {}", k, v),
            _ => k.clone(),
        })
        .collect()
}

fn children_text(children: &[ScreenNode], width: usize) -> String {
    children
        .iter()
        .map(|c| c.render(width))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn body(keyword: &Keywords, children: &[ScreenNode], width: usize) -> String {
    let mut lines = keyword_lines(keyword);
    let rendered = children_text(children, width);
    if !rendered.is_empty() {
        lines.push(rendered);
    }
    if lines.is_empty() {
        lines.push("pass".to_string());
    }
    indent(&lines.join("\n"), width)
}

impl ScreenDef {
    pub fn render(&self, width: usize) -> String {
        let mut header = format!("screen {}", self.name);
        if let Some(p) = &self.parameters {
            header.push_str(&p.render());
        }
        let mut keyword = self.keyword.clone();
        if let Some(tag) = &self.tag {
            keyword.push(("tag".to_string(), Some(Expr::new(tag.clone()))));
        }
        format!("{}:\n{}", header, body(&keyword, &self.children, width))
    }
}

impl ScreenNode {
    pub fn render(&self, width: usize) -> String {
        match self {
            ScreenNode::Block(b) => {
                let mut lines = keyword_lines(&b.keyword);
                let rendered = children_text(&b.children, width);
                if !rendered.is_empty() {
                    lines.push(rendered);
                }
                lines.join("\n")
            }
            ScreenNode::Displayable(d) => {
                let mut head = d.name.clone();
                for p in &d.positional {
                    head.push(' ');
                    head.push_str(&p.code);
                }
                if d.children.is_empty() {
                    for kw in keyword_lines(&d.keyword) {
                        head.push(' ');
                        head.push_str(&kw);
                    }
                    return head;
                }
                format!("{}:\n{}", head, body(&d.keyword, &d.children, width))
            }
            ScreenNode::If { branches } => render_branches("if", branches, width),
            ScreenNode::ShowIf { branches } => render_branches("showif", branches, width),
            ScreenNode::For {
                variable,
                expression,
                index,
                children,
            } => {
                let mut variable = variable.as_str();
                let mut children = children.as_slice();
                if variable == SL2_LOOP_VAR {
                    if let Some((ScreenNode::Python { code }, rest)) = children.split_first() {
                        if let Some(target) = code
                            .code
                            .trim()
                            .strip_suffix(SL2_LOOP_VAR)
                            .and_then(|s| s.trim_end().strip_suffix('='))
                        {
                            variable = target.trim();
                            children = rest;
                        }
                    }
                }
                let mut head = format!("for {}", variable);
                if let Some(i) = index {
                    head.push_str(&format!(" index {}", i));
                }
                head.push_str(&format!(" in {}", expression));
                format!("{}:\n{}", head, body(&Vec::new(), children, width))
            }
            ScreenNode::Python { code } => python_block(code, false, width),
            ScreenNode::Default {
                variable,
                expression,
            } => format!("default {} = {}", variable, expression),
            ScreenNode::Use {
                target,
                args,
                id,
                block,
            } => {
                let mut head = match target {
                    UseTarget::Name(name) => format!("use {}", name),
                    UseTarget::Expression(e) => format!("use expression {} pass", e),
                };
                if let Some(a) = args {
                    if matches!(target, UseTarget::Expression(_)) {
                        head.push(' ');
                    }
                    head.push_str(&a.render());
                }
                if let Some(id) = id {
                    head.push_str(&format!(" id {}", id));
                }
                match block {
                    Some(b) => format!("{}:\n{}", head, body(&b.keyword, &b.children, width)),
                    None => head,
                }
            }
            ScreenNode::Transclude => "transclude".to_string(),
            ScreenNode::Screen(s) => s.render(width),
            ScreenNode::Continue => "continue".to_string(),
            ScreenNode::Pass => "pass".to_string(),
            ScreenNode::Break => "break".to_string(),
        }
    }
}

fn render_branches(keyword: &str, branches: &[Branch], width: usize) -> String {
    let mut out = Vec::new();
    for (i, branch) in branches.iter().enumerate() {
        let last = i + 1 == branches.len();
        let header = match &branch.condition {
            _ if i == 0 => format!(
                "{} {}",
                keyword,
                branch
                    .condition
                    .as_ref()
                    .map(|c| c.code.as_str())
                    .unwrap_or("True")
            ),
            Some(c) if !(last && c.is_true()) => format!("elif {}", c),
            _ => "else".to_string(),
        };
        out.push(format!(
            "{}:\n{}",
            header,
            body(&branch.block.keyword, &branch.block.children, width)
        ));
    }
    out.join("\n")
}

/// Statement name for an SL2 displayable, from the callable it compiled to.
pub fn displayable_name(callable: &str, style: Option<&str>) -> String {
    let lower = callable.to_lowercase();
    let name = if let Some(rest) = lower.strip_prefix("sl2") {
        rest.to_string()
    } else if lower == "onevent" {
        "on".to_string()
    } else {
        lower.replace('_', "")
    };
    match (name.as_str(), style) {
        ("multibox" | "window", Some(style)) if !style.is_empty() => style.to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kw(k: &str, v: &str) -> (String, Option<Expr>) {
        (k.to_string(), Some(Expr::new(v)))
    }

    fn text(s: &str) -> ScreenNode {
        ScreenNode::Displayable(Displayable {
            name: "text".into(),
            positional: vec![Expr::new(format!("\"{}\"", s))],
            keyword: vec![],
            children: vec![],
        })
    }

    #[test]
    fn test_displayable_names() {
        assert_eq!(displayable_name("sl2vbar", None), "vbar");
        assert_eq!(displayable_name("OnEvent", None), "on");
        assert_eq!(displayable_name("_imagemap", None), "imagemap");
        assert_eq!(displayable_name("MultiBox", Some("vbox")), "vbox");
        assert_eq!(displayable_name("Window", Some("frame")), "frame");
        assert_eq!(displayable_name("Text", Some("say_label")), "text");
    }

    #[test]
    fn test_screen_render() {
        let screen = ScreenDef {
            loc: None,
            name: "hello".into(),
            parameters: Some(Parameters::default()),
            keyword: vec![kw("modal", "True")],
            children: vec![ScreenNode::Displayable(Displayable {
                name: "vbox".into(),
                positional: vec![],
                keyword: vec![kw("xalign", "0.5")],
                children: vec![text("Hi"), text("There")],
            })],
            tag: Some("menu".into()),
        };
        assert_eq!(
            screen.render(4),
            "screen hello():\n    modal True\n    tag menu\n    vbox:\n        xalign 0.5\n        text \"Hi\"\n        text \"There\""
        );
    }

    #[test]
    fn test_if_else_chain() {
        let block = |s: &str| ScreenBlock {
            keyword: vec![],
            children: vec![text(s)],
        };
        let node = ScreenNode::If {
            branches: vec![
                Branch {
                    condition: Some(Expr::new("n == 1")),
                    block: block("one"),
                },
                Branch {
                    condition: Some(Expr::new("n == 2")),
                    block: block("two"),
                },
                Branch {
                    condition: Some(Expr::new("True")),
                    block: block("many"),
                },
            ],
        };
        assert_eq!(
            node.render(4),
            "if n == 1:\n    text \"one\"\nelif n == 2:\n    text \"two\"\nelse:\n    text \"many\""
        );
    }

    #[test]
    fn test_for_restores_destructuring_target() {
        let node = ScreenNode::For {
            variable: SL2_LOOP_VAR.into(),
            expression: Expr::new("enumerate(items)"),
            index: None,
            children: vec![
                ScreenNode::Python {
                    code: Expr::new("i, item = _sl2_i"),
                },
                text("x"),
            ],
        };
        assert_eq!(
            node.render(4),
            "for i, item in enumerate(items):\n    text \"x\""
        );
    }

    #[test]
    fn test_use_forms() {
        let named = ScreenNode::Use {
            target: UseTarget::Name("nav".into()),
            args: None,
            id: None,
            block: None,
        };
        assert_eq!(named.render(4), "use nav");
        let expr = ScreenNode::Use {
            target: UseTarget::Expression(Expr::new("which")),
            args: Some(Arguments::default()),
            id: None,
            block: Some(ScreenBlock {
                keyword: vec![],
                children: vec![ScreenNode::Transclude],
            }),
        };
        assert_eq!(
            expr.render(4),
            "use expression which pass ():\n    transclude"
        );
    }
}
