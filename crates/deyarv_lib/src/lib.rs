
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const ISEQ_MAGIC: &str = "YARVInstructionSequence/SimpleDataFormat";

const TAB: usize = 2;

#[derive(Debug, Error)]
pub enum DeyarvError {
    #[error("invalid instruction sequence: {0}")]
    InvalidSequence(String),

    #[error("unsupported instruction sequence format version: {major}.{minor}.{patch}")]
    UnsupportedFormat { major: i64, minor: i64, patch: i64 },

    #[error("operand stack underflow in {opcode} at body position {position}")]
    StackUnderflow { opcode: String, position: usize },

    #[error("unresolved dynamic variable: slot {index} at depth {depth}")]
    UnresolvedVariable { index: usize, depth: i64 },
}

fn invalid(msg: impl Into<String>) -> DeyarvError {
    DeyarvError::InvalidSequence(msg.into())
}

/// One value of the deserialized nested-array container produced by
/// `InstructionSequence#to_a`. Symbols and strings stay distinct so
/// literals render back with the right quoting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Raw {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    List(Vec<Raw>),
    Map(Vec<(String, Raw)>),
}

impl Raw {
    pub fn is_null(&self) -> bool {
        matches!(self, Raw::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Raw::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Symbols and strings are interchangeable as identifiers (opcode
    /// names, labels, variable names, kind tags).
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Raw::Str(s) | Raw::Sym(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Raw]> {
        match self {
            Raw::List(items) => Some(items),
            _ => None,
        }
    }

    /// Converts a JSON dump of `InstructionSequence#to_a` into a `Raw`
    /// tree. JSON has no symbol type, so strings prefixed with `:`
    /// decode as symbols.
    pub fn from_json(v: &serde_json::Value) -> Raw {
        use serde_json::Value;
        match v {
            Value::Null => Raw::Null,
            Value::Bool(b) => Raw::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Raw::Int(i),
                None => Raw::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => match s.strip_prefix(':') {
                Some(rest) => Raw::Sym(rest.to_string()),
                None => Raw::Str(s.clone()),
            },
            Value::Array(items) => Raw::List(items.iter().map(Raw::from_json).collect()),
            Value::Object(map) => Raw::Map(
                map.iter()
                    .map(|(k, v)| (k.trim_start_matches(':').to_string(), Raw::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders the value as a source literal (`inspect` conventions).
    pub fn inspect(&self) -> String {
        match self {
            Raw::Null => "nil".to_string(),
            Raw::Bool(b) => b.to_string(),
            Raw::Int(v) => v.to_string(),
            Raw::Float(v) => format!("{v:?}"),
            Raw::Str(s) => format!("{s:?}"),
            Raw::Sym(s) => format!(":{s}"),
            Raw::List(items) => {
                let parts: Vec<String> = items.iter().map(Raw::inspect).collect();
                format!("[{}]", parts.join(", "))
            }
            Raw::Map(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{:?} => {}", k, v.inspect()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }
}

impl fmt::Display for Raw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inspect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IseqKind {
    Top,
    Method,
    Block,
    Class,
}

impl IseqKind {
    fn parse(tag: &str) -> Result<IseqKind, DeyarvError> {
        match tag {
            "top" => Ok(IseqKind::Top),
            "method" => Ok(IseqKind::Method),
            "block" => Ok(IseqKind::Block),
            "class" => Ok(IseqKind::Class),
            other => Err(invalid(format!("unknown sequence kind: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    GetLocal,
    SetLocal,
    GetDynamic,
    SetDynamic,
    GetInstanceVariable,
    SetInstanceVariable,
    GetGlobal,
    SetGlobal,
    GetConstant,
    SetConstant,
    GetSpecial,
    PutObject,
    PutNil,
    PutSelf,
    PutString,
    PutSpecialObject,
    PutIseq,
    ToString,
    ConcatStrings,
    DupArray,
    NewArray,
    SplatArray,
    ConcatArray,
    NewRange,
    NewHash,
    SetN,
    Dup,
    Swap,
    Pop,
    OptAref,
    OptAset,
    OptNot,
    OptLength,
    OptSucc,
    OptPlus,
    OptMinus,
    OptMult,
    OptDiv,
    OptMod,
    OptEq,
    OptNeq,
    OptLt,
    OptLe,
    OptGt,
    OptGe,
    OptLtLt,
    OptRegexpMatch2,
    Send,
    InvokeSuper,
    InvokeBlock,
    BranchUnless,
    BranchIf,
    Jump,
    Throw,
    DefineClass,
    GetInlineCache,
    OnceInlineCache,
    SetInlineCache,
    Leave,
    Trace,
    Nop,
    Unknown(String),
}

impl Opcode {
    pub fn parse(name: &str) -> Opcode {
        match name {
            "getlocal" => Opcode::GetLocal,
            "setlocal" => Opcode::SetLocal,
            "getdynamic" => Opcode::GetDynamic,
            "setdynamic" => Opcode::SetDynamic,
            "getinstancevariable" => Opcode::GetInstanceVariable,
            "setinstancevariable" => Opcode::SetInstanceVariable,
            "getglobal" => Opcode::GetGlobal,
            "setglobal" => Opcode::SetGlobal,
            "getconstant" => Opcode::GetConstant,
            "setconstant" => Opcode::SetConstant,
            "getspecial" => Opcode::GetSpecial,
            "putobject" => Opcode::PutObject,
            "putnil" => Opcode::PutNil,
            "putself" => Opcode::PutSelf,
            "putstring" => Opcode::PutString,
            "putspecialobject" => Opcode::PutSpecialObject,
            "putiseq" => Opcode::PutIseq,
            "tostring" => Opcode::ToString,
            "concatstrings" => Opcode::ConcatStrings,
            "duparray" => Opcode::DupArray,
            "newarray" => Opcode::NewArray,
            "splatarray" => Opcode::SplatArray,
            "concatarray" => Opcode::ConcatArray,
            "newrange" => Opcode::NewRange,
            "newhash" => Opcode::NewHash,
            "setn" => Opcode::SetN,
            "dup" => Opcode::Dup,
            "swap" => Opcode::Swap,
            "pop" => Opcode::Pop,
            "opt_aref" => Opcode::OptAref,
            "opt_aset" => Opcode::OptAset,
            "opt_not" => Opcode::OptNot,
            "opt_length" => Opcode::OptLength,
            "opt_succ" => Opcode::OptSucc,
            "opt_plus" => Opcode::OptPlus,
            "opt_minus" => Opcode::OptMinus,
            "opt_mult" => Opcode::OptMult,
            "opt_div" => Opcode::OptDiv,
            "opt_mod" => Opcode::OptMod,
            "opt_eq" => Opcode::OptEq,
            "opt_neq" => Opcode::OptNeq,
            "opt_lt" => Opcode::OptLt,
            "opt_le" => Opcode::OptLe,
            "opt_gt" => Opcode::OptGt,
            "opt_ge" => Opcode::OptGe,
            "opt_ltlt" => Opcode::OptLtLt,
            "opt_regexpmatch2" => Opcode::OptRegexpMatch2,
            "send" => Opcode::Send,
            "invokesuper" => Opcode::InvokeSuper,
            "invokeblock" => Opcode::InvokeBlock,
            "branchunless" => Opcode::BranchUnless,
            "branchif" => Opcode::BranchIf,
            "jump" => Opcode::Jump,
            "throw" => Opcode::Throw,
            "defineclass" => Opcode::DefineClass,
            "getinlinecache" => Opcode::GetInlineCache,
            "onceinlinecache" => Opcode::OnceInlineCache,
            "setinlinecache" => Opcode::SetInlineCache,
            "leave" => Opcode::Leave,
            "trace" => Opcode::Trace,
            "nop" => Opcode::Nop,
            other => Opcode::Unknown(other.to_string()),
        }
    }

    /// Operator token for the specialized infix instructions.
    fn infix_op(&self) -> Option<&'static str> {
        match self {
            Opcode::OptPlus => Some("+"),
            Opcode::OptMinus => Some("-"),
            Opcode::OptMult => Some("*"),
            Opcode::OptDiv => Some("/"),
            Opcode::OptMod => Some("%"),
            Opcode::OptEq => Some("=="),
            Opcode::OptNeq => Some("!="),
            Opcode::OptLt => Some("<"),
            Opcode::OptLe => Some("<="),
            Opcode::OptGt => Some(">"),
            Opcode::OptGe => Some(">="),
            Opcode::OptLtLt => Some("<<"),
            Opcode::OptRegexpMatch2 => Some("=~"),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::GetLocal => "getlocal",
            Opcode::SetLocal => "setlocal",
            Opcode::GetDynamic => "getdynamic",
            Opcode::SetDynamic => "setdynamic",
            Opcode::GetInstanceVariable => "getinstancevariable",
            Opcode::SetInstanceVariable => "setinstancevariable",
            Opcode::GetGlobal => "getglobal",
            Opcode::SetGlobal => "setglobal",
            Opcode::GetConstant => "getconstant",
            Opcode::SetConstant => "setconstant",
            Opcode::GetSpecial => "getspecial",
            Opcode::PutObject => "putobject",
            Opcode::PutNil => "putnil",
            Opcode::PutSelf => "putself",
            Opcode::PutString => "putstring",
            Opcode::PutSpecialObject => "putspecialobject",
            Opcode::PutIseq => "putiseq",
            Opcode::ToString => "tostring",
            Opcode::ConcatStrings => "concatstrings",
            Opcode::DupArray => "duparray",
            Opcode::NewArray => "newarray",
            Opcode::SplatArray => "splatarray",
            Opcode::ConcatArray => "concatarray",
            Opcode::NewRange => "newrange",
            Opcode::NewHash => "newhash",
            Opcode::SetN => "setn",
            Opcode::Dup => "dup",
            Opcode::Swap => "swap",
            Opcode::Pop => "pop",
            Opcode::OptAref => "opt_aref",
            Opcode::OptAset => "opt_aset",
            Opcode::OptNot => "opt_not",
            Opcode::OptLength => "opt_length",
            Opcode::OptSucc => "opt_succ",
            Opcode::OptPlus => "opt_plus",
            Opcode::OptMinus => "opt_minus",
            Opcode::OptMult => "opt_mult",
            Opcode::OptDiv => "opt_div",
            Opcode::OptMod => "opt_mod",
            Opcode::OptEq => "opt_eq",
            Opcode::OptNeq => "opt_neq",
            Opcode::OptLt => "opt_lt",
            Opcode::OptLe => "opt_le",
            Opcode::OptGt => "opt_gt",
            Opcode::OptGe => "opt_ge",
            Opcode::OptLtLt => "opt_ltlt",
            Opcode::OptRegexpMatch2 => "opt_regexpmatch2",
            Opcode::Send => "send",
            Opcode::InvokeSuper => "invokesuper",
            Opcode::InvokeBlock => "invokeblock",
            Opcode::BranchUnless => "branchunless",
            Opcode::BranchIf => "branchif",
            Opcode::Jump => "jump",
            Opcode::Throw => "throw",
            Opcode::DefineClass => "defineclass",
            Opcode::GetInlineCache => "getinlinecache",
            Opcode::OnceInlineCache => "onceinlinecache",
            Opcode::SetInlineCache => "setinlinecache",
            Opcode::Leave => "leave",
            Opcode::Trace => "trace",
            Opcode::Nop => "nop",
            Opcode::Unknown(other) => other,
        };
        write!(f, "{name}")
    }
}

/// Method names rendered as infix operator expressions instead of
/// dotted calls.
fn infix_method(name: &str) -> Option<&'static str> {
    match name {
        "+" => Some("+"),
        "-" => Some("-"),
        "*" => Some("*"),
        "/" => Some("/"),
        "%" => Some("%"),
        "==" => Some("=="),
        "!=" => Some("!="),
        "<" => Some("<"),
        "<=" => Some("<="),
        ">" => Some(">"),
        ">=" => Some(">="),
        "<<" => Some("<<"),
        "=~" => Some("=~"),
        "<=>" => Some("<=>"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Inst {
    pub op: Opcode,
    pub operands: Vec<Raw>,
}

#[derive(Debug, Clone)]
pub enum Entry {
    Line(i64),
    Label(String),
    Inst(Inst),
}

impl Entry {
    fn from_raw(raw: &Raw) -> Result<Entry, DeyarvError> {
        match raw {
            Raw::Int(n) => Ok(Entry::Line(*n)),
            Raw::Str(s) | Raw::Sym(s) => Ok(Entry::Label(s.clone())),
            Raw::List(items) => {
                let name = items
                    .first()
                    .and_then(Raw::as_name)
                    .ok_or_else(|| invalid("instruction without an opcode name"))?;
                Ok(Entry::Inst(Inst {
                    op: Opcode::parse(name),
                    operands: items[1..].to_vec(),
                }))
            }
            other => Err(invalid(format!("bad body entry: {other}"))),
        }
    }
}

/// One parsed code object: the header fields plus the ordered body of
/// line markers, labels and instructions. The engine overrides `name`
/// for intercepted method definitions before walking the body.
#[derive(Debug, Clone)]
pub struct Iseq {
    pub magic: String,
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
    pub stats: Vec<(String, Raw)>,
    pub name: String,
    pub filename: String,
    pub line: Option<i64>,
    pub kind: IseqKind,
    pub locals: Vec<String>,
    pub args: Raw,
    pub catch_tables: Raw,
    pub body: Vec<Entry>,
    labels: OnceCell<HashMap<String, usize>>,
}

impl Iseq {
    pub fn from_raw(raw: &Raw) -> Result<Iseq, DeyarvError> {
        let fields = raw
            .as_list()
            .ok_or_else(|| invalid("sequence container is not a list"))?;
        if fields.len() < 12 {
            return Err(invalid(format!(
                "sequence container has {} fields, expected at least 12",
                fields.len()
            )));
        }

        let magic = fields[0]
            .as_name()
            .ok_or_else(|| invalid("magic is not a string"))?
            .to_string();
        let major = fields[1].as_int().ok_or_else(|| invalid("major version"))?;
        let minor = fields[2].as_int().ok_or_else(|| invalid("minor version"))?;
        let patch = fields[3].as_int().ok_or_else(|| invalid("patch version"))?;

        if magic != ISEQ_MAGIC {
            return Err(invalid(format!("bad magic {magic:?}")));
        }
        if (major, minor, patch) < (1, 1, 1) {
            return Err(invalid(format!(
                "version {major}.{minor}.{patch} is below the supported minimum 1.1.1"
            )));
        }

        // The 1.1.1 layout has no starting-line field; everything from
        // the kind tag onward shifts down by one.
        let (line_field, kind_field) = match (major, minor, patch) {
            (1, 1, 1) => (None, 7),
            (1, 2, 1) => (Some(7), 8),
            _ => return Err(DeyarvError::UnsupportedFormat { major, minor, patch }),
        };
        if fields.len() < kind_field + 5 {
            return Err(invalid("sequence container is truncated"));
        }

        let stats = match &fields[4] {
            Raw::Map(pairs) => pairs.clone(),
            Raw::Null => Vec::new(),
            _ => return Err(invalid("stats is not a map")),
        };
        let name = fields[5]
            .as_name()
            .ok_or_else(|| invalid("name is not a string"))?
            .to_string();
        let filename = fields[6]
            .as_name()
            .ok_or_else(|| invalid("filename is not a string"))?
            .to_string();
        let line = line_field.and_then(|i| fields[i].as_int());
        let kind = IseqKind::parse(
            fields[kind_field]
                .as_name()
                .ok_or_else(|| invalid("kind tag is not a symbol"))?,
        )?;

        let locals = fields[kind_field + 1]
            .as_list()
            .ok_or_else(|| invalid("locals is not a list"))?
            .iter()
            .map(|entry| match entry {
                Raw::Str(s) | Raw::Sym(s) => Ok(s.clone()),
                Raw::Int(n) => Ok(n.to_string()),
                other => Err(invalid(format!("bad local name: {other}"))),
            })
            .collect::<Result<Vec<String>, DeyarvError>>()?;

        let args = fields[kind_field + 2].clone();
        let catch_tables = fields[kind_field + 3].clone();

        let body = fields[kind_field + 4]
            .as_list()
            .ok_or_else(|| invalid("body is not a list"))?
            .iter()
            .map(Entry::from_raw)
            .collect::<Result<Vec<Entry>, DeyarvError>>()?;

        Ok(Iseq {
            magic,
            major,
            minor,
            patch,
            stats,
            name,
            filename,
            line,
            kind,
            locals,
            args,
            catch_tables,
            body,
            labels: OnceCell::new(),
        })
    }

    pub fn version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// Declared-argument count, taken from the stats map.
    pub fn arg_size(&self) -> usize {
        self.stats
            .iter()
            .find(|(k, _)| k.trim_start_matches(':') == "arg_size")
            .and_then(|(_, v)| v.as_int())
            .unwrap_or(0)
            .max(0) as usize
    }

    /// The declared arguments are the leading entries of the locals
    /// table.
    pub fn argstring(&self) -> String {
        let n = self.arg_size().min(self.locals.len());
        self.locals[..n].join(", ")
    }

    /// Body position of a jump-target label. The index is built on the
    /// first query.
    pub fn label_position(&self, label: &str) -> Option<usize> {
        self.labels
            .get_or_init(|| {
                let mut map = HashMap::new();
                for (pos, entry) in self.body.iter().enumerate() {
                    if let Entry::Label(name) = entry {
                        map.insert(name.clone(), pos);
                    }
                }
                map
            })
            .get(label)
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    If,
    Elsif,
    Unless,
}

/// Reconstructed source expression or statement. Rendering is pure
/// structural recursion with no engine state.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Lit(Raw),
    Nil,
    GetVar(String),
    SetVar { name: String, value: Box<Node> },
    Array(Vec<Node>),
    Splat(Box<Node>),
    Range { first: Box<Node>, last: Box<Node>, inclusive: bool },
    Infix { op: String, args: Vec<Node> },
    Hash(Vec<(Node, Node)>),
    Not(Box<Node>),
    Aref { recv: Box<Node>, key: Box<Node> },
    Aset { recv: Box<Node>, key: Box<Node>, value: Box<Node> },
    Send { recv: Option<Box<Node>>, method: String, args: Vec<Node>, block: Option<String> },
    Super { args: Vec<Node>, block: Option<String> },
    DefMethod { text: String },
    DefClass { name: String, base: String, superclass: String, body: Vec<String> },
    DefMetaclass { base: String, body: Vec<String> },
    DefModule { name: String, base: String, body: Vec<String> },
    Cond { kind: CondKind, predicate: Box<Node> },
    Else,
    End,
}

impl Node {
    fn is_nil(&self) -> bool {
        matches!(self, Node::Nil)
    }

    fn is_true(&self) -> bool {
        matches!(self, Node::Lit(Raw::Bool(true)))
    }

    fn is_int(&self) -> bool {
        matches!(self, Node::Lit(Raw::Int(_)))
    }

    /// Simple nodes compose into infix chains without parentheses.
    fn is_simple(&self) -> bool {
        !matches!(
            self,
            Node::Infix { .. }
                | Node::Send { .. }
                | Node::Super { .. }
                | Node::SetVar { .. }
                | Node::Aset { .. }
                | Node::Cond { .. }
                | Node::Else
                | Node::End
        )
    }

    fn render_operand(&self) -> String {
        if self.is_simple() {
            self.render()
        } else {
            format!("({})", self.render())
        }
    }

    pub fn render(&self) -> String {
        match self {
            Node::Lit(raw) => raw.inspect(),
            Node::Nil => "nil".to_string(),
            Node::GetVar(name) => name.clone(),
            Node::SetVar { name, value } => format!("{name} = {}", value.render()),
            Node::Array(items) => {
                let parts: Vec<String> = items.iter().map(Node::render).collect();
                format!("[{}]", parts.join(", "))
            }
            Node::Splat(value) => format!("*{}", value.render()),
            Node::Range { first, last, inclusive } => {
                let dots = if *inclusive { ".." } else { "..." };
                format!("({}{dots}{})", first.render(), last.render())
            }
            Node::Infix { op, args } => {
                let parts: Vec<String> = args.iter().map(Node::render_operand).collect();
                parts.join(&format!(" {op} "))
            }
            Node::Hash(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{} => {}", k.render(), v.render()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Node::Not(value) => format!("!{}", value.render()),
            Node::Aref { recv, key } => format!("{}[{}]", recv.render(), key.render()),
            Node::Aset { recv, key, value } => {
                format!("{}[{}] = {}", recv.render(), key.render(), value.render())
            }
            Node::Send { recv, method, args, block } => {
                let mut out = match recv {
                    Some(r) => format!("{}.{method}", r.render()),
                    None => method.clone(),
                };
                if !args.is_empty() {
                    let parts: Vec<String> = args.iter().map(Node::render).collect();
                    out.push_str(&format!("({})", parts.join(", ")));
                }
                if let Some(block) = block {
                    out.push_str(block);
                }
                out
            }
            Node::Super { args, block } => {
                let mut out = "super".to_string();
                if !args.is_empty() {
                    let parts: Vec<String> = args.iter().map(Node::render).collect();
                    out.push_str(&format!("({})", parts.join(", ")));
                }
                if let Some(block) = block {
                    out.push_str(block);
                }
                out
            }
            Node::DefMethod { text } => text.clone(),
            Node::DefClass { name, base, superclass, body } => {
                render_definition(&format!("class {base}{name}{superclass}"), body)
            }
            Node::DefMetaclass { base, body } => {
                render_definition(&format!("class << {base}"), body)
            }
            Node::DefModule { name, base, body } => {
                render_definition(&format!("module {base}{name}"), body)
            }
            Node::Cond { kind, predicate } => {
                let keyword = match kind {
                    CondKind::If => "if",
                    CondKind::Elsif => "elsif",
                    CondKind::Unless => "unless",
                };
                format!("{keyword} {}", predicate.render())
            }
            Node::Else => "else".to_string(),
            Node::End => "end".to_string(),
        }
    }
}

fn render_definition(header: &str, body: &[String]) -> String {
    let mut out = header.to_string();
    for line in body {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out.push_str("\nend");
    out
}

#[derive(Debug, Clone)]
struct Slot {
    indent: usize,
    node: Node,
}

/// Symbolic stack machine over one sequence body. A fresh scope is
/// spawned for every nested sequence (blocks, method bodies, class
/// bodies) with a read-only link to the lexical parent for dynamic
/// variable resolution.
struct Scope<'p> {
    iseq: Iseq,
    parent: Option<&'p Scope<'p>>,
    locals: Vec<String>,
    base_indent: usize,
    indent: usize,
    current_line: i64,
    stack: Vec<Slot>,
    else_stack: Vec<String>,
    end_stack: Vec<String>,
    cur_op: String,
    cur_pos: usize,
}

impl<'p> Scope<'p> {
    fn new(iseq: Iseq, parent: Option<&'p Scope<'p>>, base_indent: usize) -> Scope<'p> {
        // Bytecode slot indices address the local table in reverse,
        // with the implicit receiver at the highest slot.
        let mut locals = iseq.locals.clone();
        locals.push("self".to_string());
        locals.reverse();
        Scope {
            iseq,
            parent,
            locals,
            base_indent,
            indent: base_indent,
            current_line: 0,
            stack: Vec::new(),
            else_stack: Vec::new(),
            end_stack: Vec::new(),
            cur_op: String::new(),
            cur_pos: 0,
        }
    }

    fn run(&mut self) -> Result<String, DeyarvError> {
        let pad = " ".repeat(self.base_indent);
        let lines = match self.iseq.kind {
            IseqKind::Top | IseqKind::Class => self.walk()?,
            IseqKind::Method => {
                let head = if self.iseq.arg_size() > 0 {
                    format!("{pad}def {}({})", self.iseq.name, self.iseq.argstring())
                } else {
                    format!("{pad}def {}", self.iseq.name)
                };
                self.indent = self.base_indent + TAB;
                let mut lines = vec![head];
                lines.extend(self.walk()?);
                lines.push(format!("{pad}end"));
                lines
            }
            IseqKind::Block => {
                // The header line stays unindented so it concatenates
                // onto the send that carries the block.
                let head = if self.iseq.arg_size() > 0 {
                    format!(" do |{}|", self.iseq.argstring())
                } else {
                    " do".to_string()
                };
                self.indent = self.base_indent + TAB;
                let mut lines = vec![head];
                lines.extend(self.walk()?);
                lines.push(format!("{pad}end"));
                lines
            }
        };
        Ok(lines.join("\n"))
    }

    fn walk(&mut self) -> Result<Vec<String>, DeyarvError> {
        let body = self.iseq.body.clone();
        for (pos, entry) in body.iter().enumerate() {
            match entry {
                Entry::Line(n) => self.current_line = *n,
                Entry::Label(name) => {
                    // Consecutive scopes may close on the same label.
                    while self.end_stack.last().map(String::as_str) == Some(name.as_str()) {
                        self.end_stack.pop();
                        self.outdent();
                        self.push(Node::End);
                    }
                }
                Entry::Inst(inst) => {
                    self.cur_op = inst.op.to_string();
                    self.cur_pos = pos;
                    self.dispatch(inst, pos)?;
                }
            }
        }
        let mut lines = Vec::with_capacity(self.stack.len());
        for slot in std::mem::take(&mut self.stack) {
            lines.push(format!("{}{}", " ".repeat(slot.indent), slot.node.render()));
        }
        Ok(lines)
    }

    fn indent(&mut self) {
        self.indent += TAB;
    }

    fn outdent(&mut self) {
        self.indent = self.indent.saturating_sub(TAB);
    }

    fn push(&mut self, node: Node) {
        self.stack.push(Slot { indent: self.indent, node });
    }

    fn push_at(&mut self, indent: usize, node: Node) {
        self.stack.push(Slot { indent, node });
    }

    fn pop(&mut self) -> Result<Node, DeyarvError> {
        match self.stack.pop() {
            Some(slot) => Ok(slot.node),
            None => Err(DeyarvError::StackUnderflow {
                opcode: self.cur_op.clone(),
                position: self.cur_pos,
            }),
        }
    }

    /// Pops the top `n` nodes, returned in original push order.
    fn popn(&mut self, n: usize) -> Result<Vec<Node>, DeyarvError> {
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(self.pop()?);
        }
        nodes.reverse();
        Ok(nodes)
    }

    /// Assignments leave a duplicated expression value behind; drop it
    /// so it is not re-emitted as a trailing statement.
    fn discard_dup(&mut self) {
        self.stack.pop();
    }

    fn local_var(&self, index: usize) -> Result<String, DeyarvError> {
        self.dynamic_var(index, 0)
    }

    fn dynamic_var(&self, index: usize, depth: i64) -> Result<String, DeyarvError> {
        if depth == 0 {
            index
                .checked_sub(1)
                .and_then(|i| self.locals.get(i))
                .cloned()
                .ok_or(DeyarvError::UnresolvedVariable { index, depth })
        } else if let Some(parent) = self.parent {
            parent.dynamic_var(index, depth - 1)
        } else {
            Err(DeyarvError::UnresolvedVariable { index, depth })
        }
    }

    fn forward_jump(&self, pos: usize, label: &str) -> bool {
        self.iseq.label_position(label).is_some_and(|target| target > pos)
    }

    fn operand<'a>(&self, inst: &'a Inst, idx: usize) -> Result<&'a Raw, DeyarvError> {
        inst.operands
            .get(idx)
            .ok_or_else(|| invalid(format!("missing operand {idx} for {}", inst.op)))
    }

    fn int_operand(&self, inst: &Inst, idx: usize) -> Result<i64, DeyarvError> {
        self.operand(inst, idx)?
            .as_int()
            .ok_or_else(|| invalid(format!("operand {idx} of {} is not an integer", inst.op)))
    }

    fn name_operand(&self, inst: &Inst, idx: usize) -> Result<String, DeyarvError> {
        Ok(self
            .operand(inst, idx)?
            .as_name()
            .ok_or_else(|| invalid(format!("operand {idx} of {} is not a name", inst.op)))?
            .to_string())
    }

    /// Runs a child scope over a nested sequence and returns its
    /// rendered text.
    fn nested_text(&self, iseq: Iseq, base_indent: usize) -> Result<String, DeyarvError> {
        let mut child = Scope::new(iseq, Some(self), base_indent);
        child.run()
    }

    fn block_text(&self, raw: &Raw) -> Result<Option<String>, DeyarvError> {
        if raw.is_null() {
            return Ok(None);
        }
        let iseq = Iseq::from_raw(raw)?;
        Ok(Some(self.nested_text(iseq, self.indent)?))
    }

    fn dispatch(&mut self, inst: &Inst, pos: usize) -> Result<(), DeyarvError> {
        match &inst.op {
            Opcode::GetLocal => {
                let index = self.int_operand(inst, 0)? as usize;
                let name = self.local_var(index)?;
                self.push(Node::GetVar(name));
            }
            Opcode::SetLocal => {
                let index = self.int_operand(inst, 0)? as usize;
                let value = self.pop()?;
                self.discard_dup();
                let name = self.local_var(index)?;
                self.push(Node::SetVar { name, value: Box::new(value) });
            }
            Opcode::GetDynamic => {
                let index = self.int_operand(inst, 0)? as usize;
                let depth = self.int_operand(inst, 1)?;
                let name = self.dynamic_var(index, depth)?;
                self.push(Node::GetVar(name));
            }
            Opcode::SetDynamic => {
                let index = self.int_operand(inst, 0)? as usize;
                let depth = self.int_operand(inst, 1)?;
                let value = self.pop()?;
                self.discard_dup();
                let name = self.dynamic_var(index, depth)?;
                self.push(Node::SetVar { name, value: Box::new(value) });
            }
            Opcode::GetInstanceVariable | Opcode::GetGlobal => {
                let name = self.name_operand(inst, 0)?;
                self.push(Node::GetVar(name));
            }
            Opcode::SetInstanceVariable | Opcode::SetGlobal => {
                let name = self.name_operand(inst, 0)?;
                let value = self.pop()?;
                self.discard_dup();
                self.push(Node::SetVar { name, value: Box::new(value) });
            }
            Opcode::GetConstant => {
                let name = self.name_operand(inst, 0)?;
                let base = self.pop()?;
                let full = if base.is_nil() {
                    name
                } else {
                    format!("{}::{name}", base.render())
                };
                self.push(Node::GetVar(full));
            }
            Opcode::SetConstant => {
                let name = self.name_operand(inst, 0)?;
                let _scoping = self.pop()?;
                let value = self.pop()?;
                self.discard_dup();
                self.push(Node::SetVar { name, value: Box::new(value) });
            }
            Opcode::GetSpecial => {
                // Packed name: bit 0 set means the high bits are a
                // character code, otherwise a backreference digit.
                let packed = self.int_operand(inst, 1)?;
                if packed != 0 {
                    let name = if packed & 1 == 1 {
                        let ch = char::from_u32((packed >> 1) as u32).unwrap_or('?');
                        format!("${ch}")
                    } else {
                        format!("${}", packed >> 1)
                    };
                    self.push(Node::GetVar(name));
                }
            }
            Opcode::PutObject
            | Opcode::PutString
            | Opcode::DupArray
            | Opcode::PutIseq
            | Opcode::PutSpecialObject => {
                let value = self.operand(inst, 0)?.clone();
                self.push(Node::Lit(value));
            }
            Opcode::PutNil => self.push(Node::Nil),
            Opcode::PutSelf => self.push(Node::GetVar("self".to_string())),
            Opcode::ToString => {
                let recv = self.pop()?;
                self.push(Node::Send {
                    recv: Some(Box::new(recv)),
                    method: "to_s".to_string(),
                    args: Vec::new(),
                    block: None,
                });
            }
            Opcode::ConcatStrings => {
                let count = self.int_operand(inst, 0)? as usize;
                let args = self.popn(count)?;
                self.push(Node::Infix { op: "+".to_string(), args });
            }
            Opcode::NewArray => {
                let count = self.int_operand(inst, 0)? as usize;
                let items = self.popn(count)?;
                self.push(Node::Array(items));
            }
            Opcode::SplatArray => {
                let value = self.pop()?;
                self.push(Node::Splat(Box::new(value)));
            }
            Opcode::ConcatArray => {
                let arg = self.pop()?;
                let mut recv = self.pop()?;
                if let Node::Splat(inner) = recv {
                    recv = *inner;
                }
                self.push(Node::Infix { op: "+".to_string(), args: vec![recv, arg] });
            }
            Opcode::NewRange => {
                let exclusive = self.int_operand(inst, 0)?;
                let last = self.pop()?;
                let first = self.pop()?;
                self.push(Node::Range {
                    first: Box::new(first),
                    last: Box::new(last),
                    inclusive: exclusive != 1,
                });
            }
            Opcode::NewHash => {
                let count = self.int_operand(inst, 0)? as usize;
                let items = self.popn(count)?;
                let mut pairs = Vec::with_capacity(count / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                self.push(Node::Hash(pairs));
            }
            Opcode::SetN => {
                let n = self.int_operand(inst, 0)? as usize;
                let value = self.pop()?;
                let len = self.stack.len();
                if n == 0 || len < n {
                    return Err(DeyarvError::StackUnderflow {
                        opcode: self.cur_op.clone(),
                        position: self.cur_pos,
                    });
                }
                self.stack[len - n].node = value.clone();
                self.push(value);
            }
            Opcode::Dup => {
                let value = self.pop()?;
                self.push(value.clone());
                self.push(value);
            }
            Opcode::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Opcode::OptAref => {
                let key = self.pop()?;
                let recv = self.pop()?;
                self.push(Node::Aref { recv: Box::new(recv), key: Box::new(key) });
            }
            Opcode::OptAset => {
                let value = self.pop()?;
                let key = self.pop()?;
                let recv = self.pop()?;
                self.push(Node::Aset {
                    recv: Box::new(recv),
                    key: Box::new(key),
                    value: Box::new(value),
                });
            }
            Opcode::OptNot => {
                let value = self.pop()?;
                self.push(Node::Not(Box::new(value)));
            }
            Opcode::OptLength => {
                let recv = self.pop()?;
                self.push(Node::Send {
                    recv: Some(Box::new(recv)),
                    method: "length".to_string(),
                    args: Vec::new(),
                    block: None,
                });
            }
            Opcode::OptSucc => {
                let recv = self.pop()?;
                self.push(Node::Send {
                    recv: Some(Box::new(recv)),
                    method: "succ".to_string(),
                    args: Vec::new(),
                    block: None,
                });
            }
            Opcode::OptPlus
            | Opcode::OptMinus
            | Opcode::OptMult
            | Opcode::OptDiv
            | Opcode::OptMod
            | Opcode::OptEq
            | Opcode::OptNeq
            | Opcode::OptLt
            | Opcode::OptLe
            | Opcode::OptGt
            | Opcode::OptGe
            | Opcode::OptLtLt
            | Opcode::OptRegexpMatch2 => {
                let op = inst.op.infix_op().unwrap_or("+").to_string();
                let arg = self.pop()?;
                let recv = self.pop()?;
                self.push(Node::Infix { op, args: vec![recv, arg] });
            }
            Opcode::Send => {
                let method = self.name_operand(inst, 0)?;
                let argc = self.int_operand(inst, 1)? as usize;
                let block = self.operand(inst, 2)?.clone();
                self.handle_send(&method, argc, &block)?;
            }
            Opcode::InvokeSuper => {
                let argc = self.int_operand(inst, 0)? as usize;
                let block = self.operand(inst, 1)?.clone();
                let args = self.popn(argc)?;
                let explicit = self.pop()?;
                let args = if explicit.is_true() { args } else { Vec::new() };
                let block = self.block_text(&block)?;
                self.push(Node::Super { args, block });
            }
            Opcode::InvokeBlock => {
                let argc = self.int_operand(inst, 0)? as usize;
                let args = self.popn(argc)?;
                self.push(Node::Send {
                    recv: None,
                    method: "yield".to_string(),
                    args,
                    block: None,
                });
            }
            Opcode::BranchUnless => {
                let target = self.name_operand(inst, 0)?;
                if self.forward_jump(pos, &target) {
                    let predicate = self.pop()?;
                    match self.stack.last() {
                        // An open else marker on top means this is an
                        // elsif continuation, not a fresh conditional.
                        Some(slot) if slot.node == Node::Else => {
                            let indent = slot.indent;
                            self.stack.pop();
                            self.end_stack.pop();
                            self.push_at(
                                indent,
                                Node::Cond {
                                    kind: CondKind::Elsif,
                                    predicate: Box::new(predicate),
                                },
                            );
                        }
                        _ => {
                            self.push(Node::Cond {
                                kind: CondKind::If,
                                predicate: Box::new(predicate),
                            });
                            self.indent();
                        }
                    }
                    self.else_stack.push(target);
                } else {
                    debug!(opcode = %inst.op, position = pos, "skipping backward branch");
                }
            }
            Opcode::BranchIf => {
                let target = self.name_operand(inst, 0)?;
                if self.forward_jump(pos, &target) {
                    let predicate = self.pop()?;
                    self.push(Node::Cond {
                        kind: CondKind::Unless,
                        predicate: Box::new(predicate),
                    });
                    self.indent();
                    self.else_stack.push(target);
                } else {
                    debug!(opcode = %inst.op, position = pos, "skipping backward branch");
                }
            }
            Opcode::Jump => {
                let target = self.name_operand(inst, 0)?;
                if self.forward_jump(pos, &target) {
                    let at_else = matches!(
                        self.iseq.body.get(pos + 1),
                        Some(Entry::Label(next)) if Some(next.as_str())
                            == self.else_stack.last().map(String::as_str)
                    );
                    if at_else {
                        self.end_stack.push(target);
                        self.outdent();
                        self.push(Node::Else);
                        self.indent();
                        self.else_stack.pop();
                    }
                } else {
                    debug!(opcode = %inst.op, position = pos, "skipping backward jump");
                }
            }
            Opcode::Throw => {
                let packed = self.int_operand(inst, 0)?;
                let state = packed & 0xff;
                match state {
                    0x01 | 0x02 | 0x03 => {
                        let keyword = match state {
                            0x01 => "return",
                            0x02 => "break",
                            _ => "next",
                        };
                        let value = self.pop()?;
                        self.push(Node::Send {
                            recv: None,
                            method: keyword.to_string(),
                            args: vec![value],
                            block: None,
                        });
                    }
                    0x04 | 0x05 => {
                        let keyword = if state == 0x04 { "retry" } else { "redo" };
                        let _placeholder = self.pop()?;
                        self.push(Node::Send {
                            recv: None,
                            method: keyword.to_string(),
                            args: Vec::new(),
                            block: None,
                        });
                    }
                    other => {
                        debug!(state = other, "skipping throw with unknown state");
                    }
                }
            }
            Opcode::DefineClass => {
                let name = self.name_operand(inst, 0)?;
                let body_raw = self.operand(inst, 1)?.clone();
                let def_type = self.int_operand(inst, 2)?;
                let superclass = self.pop()?;
                let base = self.pop()?;

                let superclass = if superclass.is_nil() {
                    String::new()
                } else {
                    format!(" < {}", superclass.render())
                };
                let base_prefix = if base.is_int() || base.is_nil() {
                    String::new()
                } else {
                    format!("{}::", base.render())
                };

                let child = Iseq::from_raw(&body_raw)?;
                let body: Vec<String> =
                    self.nested_text(child, 0)?.lines().map(str::to_string).collect();

                let node = match def_type {
                    0 => Node::DefClass { name, base: base_prefix, superclass, body },
                    1 => Node::DefMetaclass { base: base.render(), body },
                    2 => Node::DefModule { name, base: base_prefix, body },
                    other => {
                        return Err(invalid(format!("unknown defineclass type {other}")));
                    }
                };
                self.push(node);
            }
            Opcode::GetInlineCache | Opcode::OnceInlineCache => self.push(Node::Nil),
            Opcode::SetInlineCache
            | Opcode::Leave
            | Opcode::Trace
            | Opcode::Nop
            | Opcode::Pop => {}
            Opcode::Unknown(name) => {
                debug!(
                    opcode = %name,
                    position = pos,
                    line = self.current_line,
                    "skipping unrecognized opcode"
                );
            }
        }
        Ok(())
    }

    fn handle_send(&mut self, method: &str, argc: usize, block: &Raw) -> Result<(), DeyarvError> {
        let args = self.popn(argc)?;
        let recv = self.pop()?;

        if block.is_null() {
            if method == "[]=" && args.len() == 2 {
                let mut args = args.into_iter();
                let key = args.next().unwrap_or(Node::Nil);
                let value = args.next().unwrap_or(Node::Nil);
                self.discard_dup();
                self.push(Node::Aset {
                    recv: Box::new(recv),
                    key: Box::new(key),
                    value: Box::new(value),
                });
                return Ok(());
            }
            if let Some(op) = infix_method(method) {
                if args.len() == 1 {
                    let mut args = args;
                    let arg = args.pop().unwrap_or(Node::Nil);
                    self.push(Node::Infix { op: op.to_string(), args: vec![recv, arg] });
                    return Ok(());
                }
            }
        }

        if method == "core#define_method" || method == "core#define_singleton_method" {
            return self.handle_define_method(args);
        }

        if method == "[]=" {
            self.discard_dup();
        }

        let block = self.block_text(block)?;
        let recv = if recv.is_nil() { None } else { Some(Box::new(recv)) };
        self.push(Node::Send { recv, method: method.to_string(), args, block });
        Ok(())
    }

    /// `def`/`def self.` lower to a pseudo-call whose arguments carry
    /// the definee, the method name and the body sequence.
    fn handle_define_method(&mut self, args: Vec<Node>) -> Result<(), DeyarvError> {
        let mut args = args.into_iter();
        let definee = args.next().unwrap_or(Node::Nil);
        let name_node = args.next().unwrap_or(Node::Nil);
        let body = args.next().unwrap_or(Node::Nil);

        let body_raw = match body {
            Node::Lit(raw @ Raw::List(_)) => raw,
            other => {
                return Err(invalid(format!(
                    "method definition body is not a sequence: {}",
                    other.render()
                )));
            }
        };

        let rendered = name_node.render();
        let name = rendered.strip_prefix(':').unwrap_or(&rendered);
        let qualified = if definee.is_int() || definee.is_nil() {
            name.to_string()
        } else {
            format!("{}.{name}", definee.render())
        };

        let mut iseq = Iseq::from_raw(&body_raw)?;
        iseq.name = qualified;
        let text = self.nested_text(iseq, 0)?;
        self.push(Node::DefMethod { text });
        Ok(())
    }
}

/// Decompiles a deserialized instruction-sequence container back into
/// source text.
pub fn decompile(raw: &Raw) -> Result<String, DeyarvError> {
    let iseq = Iseq::from_raw(raw)?;
    let mut scope = Scope::new(iseq, None, 0);
    scope.run()
}
