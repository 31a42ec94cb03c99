use crate::spec::OutputFormat;
use crate::workspace::ChangedFiles;
use std::collections::BTreeMap;
use thiserror::*;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Unclosed expression in template {template:?}")]
    Unclosed { template: String },

    #[error("Could not parse expression {expr:?}: {reason}")]
    BadExpression { expr: String, reason: String },

    #[error("Unknown variable {name:?} in template expression")]
    UnknownVariable { name: String },

    #[error("Value at {path:?} has no field {field:?}")]
    UnknownField { path: String, field: String },

    #[error("Unknown function {name:?}")]
    UnknownFunction { name: String },

    #[error("index() expects a list and a position")]
    BadIndexArguments,

    #[error("Index {index} is out of bounds for a list of {len} items")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Value {path:?} cannot be rendered as text")]
    NotText { path: String },

    #[error("Value is not valid UTF-8 and cannot be rendered as text")]
    InvalidUtf8,

    #[error("Could not parse output {name:?} as {format:?}: {detail}")]
    OutputParse {
        name: String,
        format: OutputFormat,
        detail: String,
    },
}

/// What an expression can evaluate to. Step stdout/stderr are carried as
/// raw bytes and only decoded when they end up in a text position.
///
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    fn render(&self, path: &str) -> Result<String, TemplateError> {
        match self {
            Value::Null => Ok(String::new()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    Ok(format!("{}", *n as i64))
                } else {
                    Ok(n.to_string())
                }
            }
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map_err(|_| TemplateError::InvalidUtf8),
            Value::List(items) => {
                let rendered = items
                    .iter()
                    .map(|item| item.render(path))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("[{}]", rendered.join(" ")))
            }
            Value::Object(_) => Err(TemplateError::NotText {
                path: path.to_string(),
            }),
        }
    }

    fn text_list(items: &[String]) -> Value {
        Value::List(items.iter().cloned().map(Value::Text).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(value: serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(b),
            serde_yaml::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_yaml::Value::String(s) => Value::Text(s),
            serde_yaml::Value::Sequence(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_yaml::Value::Mapping(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        let key = match k {
                            serde_yaml::Value::String(s) => s,
                            other => serde_yaml::to_string(&other)
                                .unwrap_or_default()
                                .trim()
                                .trim_start_matches("---")
                                .trim()
                                .to_string(),
                        };
                        (key, Value::from(v))
                    })
                    .collect(),
            ),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).to_string())
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// The raw capture of one executed step, bound under `step.*` while its
/// outputs are evaluated.
///
#[derive(Debug, Clone, Default)]
pub struct StepSnapshot {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub changed: ChangedFiles,
}

/// The variable environment templates are evaluated against. The executor
/// owns one per task and advances it step by step.
///
#[derive(Debug, Clone)]
pub struct Environment {
    repository_name: String,
    repository_branch: String,
    cumulative: ChangedFiles,
    current_step: Option<StepSnapshot>,
    outputs: BTreeMap<String, Value>,
}

impl Environment {
    pub fn new(repository_name: impl Into<String>, repository_branch: impl Into<String>) -> Self {
        Self {
            repository_name: repository_name.into(),
            repository_branch: repository_branch.into(),
            cumulative: ChangedFiles::default(),
            current_step: None,
            outputs: BTreeMap::new(),
        }
    }

    /// The environment the final changeset template sees: cumulative
    /// changes and outputs, no `step.*`. Everything here is derivable
    /// from a cached result, so warm and cold runs render identical
    /// specs.
    pub fn from_result(
        repository_name: impl Into<String>,
        repository_branch: impl Into<String>,
        changed: &ChangedFiles,
        outputs: &BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            repository_name: repository_name.into(),
            repository_branch: repository_branch.into(),
            cumulative: changed.clone(),
            current_step: None,
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
        }
    }

    /// Record a finished step: it becomes `step.*` and folds into the
    /// cumulative `steps.*` lists.
    pub fn record_step(&mut self, snapshot: StepSnapshot) {
        self.cumulative.extend(&snapshot.changed);
        self.current_step = Some(snapshot);
    }

    pub fn add_output(&mut self, name: impl Into<String>, value: Value) {
        self.outputs.insert(name.into(), value);
    }

    pub fn outputs_json(&self) -> BTreeMap<String, serde_json::Value> {
        self.outputs
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
            .collect()
    }

    fn changed_field(changed: &ChangedFiles, field: &str) -> Option<Value> {
        match field {
            "modified_files" => Some(Value::text_list(&changed.modified)),
            "added_files" => Some(Value::text_list(&changed.added)),
            "deleted_files" => Some(Value::text_list(&changed.deleted)),
            "renamed_files" => Some(Value::text_list(&changed.renamed)),
            _ => None,
        }
    }

    fn resolve(&self, segments: &[String]) -> Result<Value, TemplateError> {
        let unknown = || TemplateError::UnknownVariable {
            name: segments.join("."),
        };

        match segments {
            [root, rest @ ..] if root == "repository" => match rest {
                [field] if field == "name" => Ok(Value::Text(self.repository_name.clone())),
                [field] if field == "branch" => Ok(Value::Text(self.repository_branch.clone())),
                _ => Err(unknown()),
            },

            [root, rest @ ..] if root == "steps" => match rest {
                [field] => Self::changed_field(&self.cumulative, field).ok_or_else(unknown),
                _ => Err(unknown()),
            },

            [root, rest @ ..] if root == "step" => {
                let step = self.current_step.as_ref().ok_or_else(unknown)?;
                match rest {
                    [field] if field == "stdout" => Ok(Value::Bytes(step.stdout.clone())),
                    [field] if field == "stderr" => Ok(Value::Bytes(step.stderr.clone())),
                    [field] => Self::changed_field(&step.changed, field).ok_or_else(unknown),
                    _ => Err(unknown()),
                }
            }

            [root, name, rest @ ..] if root == "outputs" => {
                let mut value = self.outputs.get(name).ok_or_else(unknown)?;
                let mut path = format!("outputs.{}", name);
                for field in rest {
                    match value {
                        Value::Object(map) => {
                            value = map.get(field).ok_or_else(|| TemplateError::UnknownField {
                                path: path.clone(),
                                field: field.clone(),
                            })?;
                        }
                        _ => {
                            return Err(TemplateError::UnknownField {
                                path,
                                field: field.clone(),
                            })
                        }
                    }
                    path = format!("{}.{}", path, field);
                }
                Ok(value.clone())
            }

            _ => Err(unknown()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(Vec<String>),
    Int(i64),
    Str(String),
    Call { name: String, args: Vec<Expr> },
}

struct Parser<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> TemplateError {
        TemplateError::BadExpression {
            expr: self.src.to_string(),
            reason: reason.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn parse(mut self) -> Result<Expr, TemplateError> {
        let expr = self.parse_expr()?;
        self.skip_whitespace();
        if let Some(&(_, c)) = self.chars.peek() {
            return Err(self.error(format!("unexpected character {:?}", c)));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, TemplateError> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some(&(_, c)) if c.is_ascii_digit() => self.parse_int(),
            Some(&(_, '"')) | Some(&(_, '\'')) => self.parse_str(),
            Some(&(_, c)) if is_ident_char(c) => self.parse_path_or_call(),
            Some(&(_, c)) => Err(self.error(format!("unexpected character {:?}", c))),
            None => Err(self.error("empty expression")),
        }
    }

    fn parse_int(&mut self) -> Result<Expr, TemplateError> {
        let mut digits = String::new();
        while matches!(self.chars.peek(), Some((_, c)) if c.is_ascii_digit()) {
            digits.push(self.chars.next().unwrap().1);
        }
        digits
            .parse::<i64>()
            .map(Expr::Int)
            .map_err(|_| self.error(format!("invalid number {:?}", digits)))
    }

    fn parse_str(&mut self) -> Result<Expr, TemplateError> {
        let (_, quote) = self.chars.next().unwrap();
        let mut out = String::new();
        for (_, c) in self.chars.by_ref() {
            if c == quote {
                return Ok(Expr::Str(out));
            }
            out.push(c);
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_ident(&mut self) -> String {
        let mut ident = String::new();
        while matches!(self.chars.peek(), Some((_, c)) if is_ident_char(*c)) {
            ident.push(self.chars.next().unwrap().1);
        }
        ident
    }

    fn parse_path_or_call(&mut self) -> Result<Expr, TemplateError> {
        let first = self.parse_ident();

        if matches!(self.chars.peek(), Some((_, '('))) {
            self.chars.next();
            let mut args = vec![];
            loop {
                self.skip_whitespace();
                match self.chars.peek() {
                    Some((_, ')')) => {
                        self.chars.next();
                        break;
                    }
                    None => return Err(self.error("unterminated argument list")),
                    _ => {
                        args.push(self.parse_expr()?);
                        self.skip_whitespace();
                        if matches!(self.chars.peek(), Some((_, ','))) {
                            self.chars.next();
                        }
                    }
                }
            }
            return Ok(Expr::Call { name: first, args });
        }

        let mut segments = vec![first];
        while matches!(self.chars.peek(), Some((_, '.'))) {
            self.chars.next();
            let segment = self.parse_ident();
            if segment.is_empty() {
                return Err(self.error("trailing '.' in path"));
            }
            segments.push(segment);
        }
        Ok(Expr::Path(segments))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn eval(expr: &Expr, env: &Environment) -> Result<Value, TemplateError> {
    match expr {
        Expr::Path(segments) => env.resolve(segments),
        Expr::Int(n) => Ok(Value::Number(*n as f64)),
        Expr::Str(s) => Ok(Value::Text(s.clone())),
        Expr::Call { name, args } => match name.as_str() {
            "index" => {
                let [list, position] = args.as_slice() else {
                    return Err(TemplateError::BadIndexArguments);
                };
                let list = match eval(list, env)? {
                    Value::List(items) => items,
                    _ => return Err(TemplateError::BadIndexArguments),
                };
                let index = match eval(position, env)? {
                    Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                    _ => return Err(TemplateError::BadIndexArguments),
                };
                list.get(index)
                    .cloned()
                    .ok_or(TemplateError::IndexOutOfBounds {
                        index,
                        len: list.len(),
                    })
            }
            _ => Err(TemplateError::UnknownFunction { name: name.clone() }),
        },
    }
}

/// Replace every `${{ expr }}` in `template` with its rendered value.
pub fn evaluate(template: &str, env: &Environment) -> Result<String, TemplateError> {
    let mut out = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after.find("}}").ok_or_else(|| TemplateError::Unclosed {
            template: template.to_string(),
        })?;

        let src = after[..end].trim();
        let expr = Parser::new(src).parse()?;
        let value = eval(&expr, env)?;
        out.push_str(&value.render(src)?);

        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Turn a rendered output value into its bound form: plain text, or a
/// structured value parsed from YAML/JSON.
pub fn parse_output(
    name: &str,
    format: OutputFormat,
    rendered: &str,
) -> Result<Value, TemplateError> {
    match format {
        OutputFormat::Text => Ok(Value::Text(rendered.to_string())),
        OutputFormat::Yaml => serde_yaml::from_str::<serde_yaml::Value>(rendered)
            .map(Value::from)
            .map_err(|err| TemplateError::OutputParse {
                name: name.to_string(),
                format,
                detail: err.to_string(),
            }),
        OutputFormat::Json => serde_json::from_str::<serde_json::Value>(rendered)
            .map(Value::from)
            .map_err(|err| TemplateError::OutputParse {
                name: name.to_string(),
                format,
                detail: err.to_string(),
            }),
    }
}
