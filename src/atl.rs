use crate::ast::{Expr, Loc};
use crate::unparser::indent;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AtlBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<Loc>,
    pub statements: Vec<AtlStatement>,
    pub animation: bool,
}

/// `linear 1.0 xalign 1.0` and friends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interpolation {
    pub warper: Option<String>,
    pub duration: Expr,
    pub warp_function: Option<Expr>,
    pub revolution: Option<String>,
    pub circles: Expr,
    pub properties: Vec<(String, Expr)>,
    /// Transform expressions, each with an optional `with` transition.
    pub expressions: Vec<(Expr, Option<Expr>)>,
    /// Property, then its knots; the final value is stored last.
    pub splines: Vec<(String, Vec<Expr>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum AtlStatement {
    Block(AtlBlock),
    Interpolation(Interpolation),
    Repeat(Option<Expr>),
    Parallel(Vec<AtlBlock>),
    Choice(Vec<(Option<Expr>, AtlBlock)>),
    Time(Expr),
    On(Vec<(String, AtlBlock)>),
    Function(Expr),
    Contains(Expr),
    Child(Vec<AtlBlock>),
    Event(String),
    Pass,
}

impl AtlBlock {
    pub fn render(&self, width: usize) -> String {
        if !self.animation && self.statements.len() == 1 {
            if let AtlStatement::Block(inner) = &self.statements[0] {
                return inner.render(width);
            }
        }
        let mut lines = Vec::new();
        if self.animation {
            lines.push("animation".to_string());
        }
        lines.extend(self.statements.iter().map(|s| s.render(width)));
        if self.statements.is_empty() {
            lines.push("pass".to_string());
        }
        lines.join("\n")
    }

    fn nested(&self, header: &str, width: usize) -> String {
        format!("{}:\n{}", header, indent(&self.render(width), width))
    }
}

impl AtlStatement {
    pub fn render(&self, width: usize) -> String {
        match self {
            AtlStatement::Block(b) => b.nested("block", width),
            AtlStatement::Interpolation(i) => i.render(),
            AtlStatement::Repeat(Some(n)) => format!("repeat {}", n),
            AtlStatement::Repeat(None) => "repeat".to_string(),
            AtlStatement::Parallel(blocks) => blocks
                .iter()
                .map(|b| b.nested("parallel", width))
                .collect::<Vec<_>>()
                .join("\n"),
            AtlStatement::Choice(choices) => choices
                .iter()
                .map(|(chance, b)| match chance {
                    Some(c) if c.code.trim() != "1.0" => b.nested(&format!("choice {}", c), width),
                    _ => b.nested("choice", width),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            AtlStatement::Time(t) => format!("time {}", t),
            AtlStatement::On(handlers) => handlers
                .iter()
                .map(|(event, b)| b.nested(&format!("on {}", event), width))
                .collect::<Vec<_>>()
                .join("\n"),
            AtlStatement::Function(f) => format!("function {}", f),
            AtlStatement::Contains(e) => format!("contains {}", e),
            AtlStatement::Child(children) => children
                .iter()
                .map(|b| b.nested("contains", width))
                .collect::<Vec<_>>()
                .join("\n"),
            AtlStatement::Event(name) => format!("event {}", name),
            AtlStatement::Pass => "pass".to_string(),
        }
    }
}

impl Interpolation {
    fn render(&self) -> String {
        let mut words = Vec::new();
        match (&self.warper, &self.warp_function) {
            (Some(warper), _) => words.push(format!("{} {}", warper, self.duration)),
            (None, Some(f)) => words.push(format!("warp {} {}", f, self.duration)),
            (None, None) => {}
        }
        if let Some(rev) = &self.revolution {
            words.push(rev.clone());
        }
        if self.circles.code.trim() != "0" {
            words.push(format!("circles {}", self.circles));
        }
        for (prop, value) in &self.properties {
            words.push(format!("{} {}", prop, value));
        }
        for (prop, knots) in &self.splines {
            let Some((last, rest)) = knots.split_last() else {
                continue;
            };
            let mut spline = format!("{} {}", prop, last);
            for k in rest {
                spline.push_str(&format!(" knot {}", k));
            }
            words.push(spline);
        }
        for (expr, with) in &self.expressions {
            match with {
                Some(w) => words.push(format!("{} with {}", expr, w)),
                None => words.push(expr.to_string()),
            }
        }
        if words.is_empty() {
            // A bare zero-length interpolation is how an empty line compiles.
            return "pass".to_string();
        }
        words.join(" ")
    }
}
