//! Renders `Patch` templates.
//!
//! The language is the substitution subset of Go's `text/template`:
//!
//! - `{{ .key }}` inserts the value of `key`
//! - `{{ index . "some-key" }}` does the same for keys that are not identifiers
//! - `{{ "text" }}` and `` {{ `text` }} `` insert a literal
//! - `{{ . }}` inserts the whole mapping, Go style: `map[a:1 b:2]`
//! - `{{/* comment */}}` inserts nothing
//! - `{{-` and `-}}` trim the whitespace before and after the action
//!
//! Control structures and functions are rejected when parsing. A key that is
//! not in the data is an error, never an empty string.

use std::{collections::BTreeMap, fmt::Display};

const LEFT: &str = "{{";
const RIGHT: &str = "}}";

const KEYWORDS: &[&str] = &[
    "if", "else", "end", "range", "with", "define", "template", "block", "break", "continue",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template: patch:{line}: {message}")]
    Parse { line: usize, message: String },
    #[error("template: patch:{line}: executing \"patch\" at <{action}>: {message}")]
    Exec {
        line: usize,
        action: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    /// `.`
    Dot,
    /// `.a` or `.a.b`
    Field(Vec<String>),
    /// `index . "key"`
    Index(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Action {
        expr: Expr,
        line: usize,
        source: String,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

/// Parses and executes `template` in one go.
pub fn render(template: &str, data: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    Template::parse(template)?.execute(data)
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

fn parse_error(line: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Parse {
        line,
        message: message.into(),
    }
}

/// What sits between a pair of delimiters.
enum Scanned<'a> {
    Comment,
    Action(&'a str),
}

struct ScannedAction<'a> {
    body: Scanned<'a>,
    trim_right: bool,
    /// Bytes consumed, including the closing delimiter
    len: usize,
}

impl Template {
    pub fn parse(src: &str) -> Result<Template, TemplateError> {
        let mut nodes = Vec::new();
        let mut rest = src;
        let mut line = 1;
        let mut trim_next = false;
        loop {
            let Some(start) = rest.find(LEFT) else {
                let text = if trim_next {
                    rest.trim_start_matches(is_space)
                } else {
                    rest
                };
                if !text.is_empty() {
                    nodes.push(Node::Text(text.to_string()));
                }
                break;
            };

            let after_left = &rest[start + LEFT.len()..];
            let trim_left = after_left.starts_with('-')
                && after_left[1..].starts_with(is_space);
            let marker_len = if trim_left { 1 } else { 0 };

            let mut text = &rest[..start];
            if trim_next {
                text = text.trim_start_matches(is_space);
            }
            if trim_left {
                text = text.trim_end_matches(is_space);
            }
            if !text.is_empty() {
                nodes.push(Node::Text(text.to_string()));
            }
            line += rest[..start].matches('\n').count();

            let scanned = scan_action(&after_left[marker_len..], line)?;
            if let Scanned::Action(source) = scanned.body {
                let expr = parse_action(source, line)?;
                nodes.push(Node::Action {
                    expr,
                    line,
                    source: source.trim_matches(is_space).to_string(),
                });
            }
            let consumed = start + LEFT.len() + marker_len + scanned.len;
            line += rest[start..consumed].matches('\n').count();
            rest = &rest[consumed..];
            trim_next = scanned.trim_right;
        }
        Ok(Template { nodes })
    }

    pub fn execute(&self, data: &BTreeMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action { expr, line, source } => {
                    let exec_error = |message: String| TemplateError::Exec {
                        line: *line,
                        action: source.clone(),
                        message,
                    };
                    let lookup = |key: &str| {
                        data.get(key)
                            .ok_or_else(|| exec_error(format!("map has no entry for key {:?}", key)))
                    };
                    match expr {
                        Expr::Dot => out.push_str(&go_map_string(data)),
                        Expr::Literal(s) => out.push_str(s),
                        Expr::Index(key) => out.push_str(lookup(key.as_str())?),
                        Expr::Field(path) => {
                            let value = lookup(path[0].as_str())?;
                            if let Some(field) = path.get(1) {
                                return Err(exec_error(format!(
                                    "can't evaluate field {} in type string",
                                    field
                                )));
                            }
                            out.push_str(value);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for node in &self.nodes {
            match node {
                Node::Text(text) => write!(f, "{}", text)?,
                Node::Action { source, .. } => write!(f, "{} {} {}", LEFT, source, RIGHT)?,
            }
        }
        Ok(())
    }
}

fn go_map_string(data: &BTreeMap<String, String>) -> String {
    let entries: Vec<String> = data.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
    format!("map[{}]", entries.join(" "))
}

/// Finds the end of the action starting right after the left delimiter (and
/// its trim marker).
fn scan_action(body: &str, line: usize) -> Result<ScannedAction<'_>, TemplateError> {
    let leading = body.len() - body.trim_start_matches(is_space).len();
    if body[leading..].starts_with("/*") {
        let comment_start = leading + 2;
        let Some(end) = body[comment_start..].find("*/") else {
            return Err(parse_error(line, "unclosed comment"));
        };
        let after = &body[comment_start + end + 2..];
        let close = closing_delimiter(after)
            .ok_or_else(|| parse_error(line, "comment ends before closing delimiter"))?;
        return Ok(ScannedAction {
            body: Scanned::Comment,
            trim_right: close.0,
            len: comment_start + end + 2 + close.1,
        });
    }

    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if q == b'"' && b == b'\\' {
                    i += 2;
                    continue;
                }
                if q == b'"' && b == b'\n' {
                    return Err(parse_error(line, "unterminated quoted string"));
                }
                if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if bytes[i..].starts_with(RIGHT.as_bytes()) {
                    let content = &body[..i];
                    let len = i + RIGHT.len();
                    if let Some(stripped) = content.strip_suffix('-') {
                        if stripped.ends_with(is_space) {
                            return Ok(ScannedAction {
                                body: Scanned::Action(stripped),
                                trim_right: true,
                                len,
                            });
                        }
                    }
                    return Ok(ScannedAction {
                        body: Scanned::Action(content),
                        trim_right: false,
                        len,
                    });
                }
            }
        }
        i += 1;
    }
    match quote {
        Some(b'`') => Err(parse_error(line, "unterminated raw quoted string")),
        Some(_) => Err(parse_error(line, "unterminated quoted string")),
        None => Err(parse_error(line, "unclosed action")),
    }
}

/// Matches optional whitespace, an optional trim marker and `}}`.
/// Returns whether the marker was present and the length matched.
fn closing_delimiter(s: &str) -> Option<(bool, usize)> {
    let spaces = s.len() - s.trim_start_matches(is_space).len();
    let rest = &s[spaces..];
    if rest.starts_with(RIGHT) {
        Some((false, spaces + RIGHT.len()))
    } else if spaces > 0 && rest.starts_with("-}}") {
        Some((true, spaces + 1 + RIGHT.len()))
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Dot,
    Field(Vec<String>),
    Str(String),
    Word(String),
    Pipe,
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn take_ident(s: &str) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.split_at(end)
}

fn tokenize(source: &str, line: usize) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source.trim_start_matches(is_space);
    while let Some(c) = rest.chars().next() {
        match c {
            '"' => {
                let (s, after) = quoted(&rest[1..], line)?;
                tokens.push(Token::Str(s));
                rest = after;
            }
            '`' => {
                let end = rest[1..]
                    .find('`')
                    .ok_or_else(|| parse_error(line, "unterminated raw quoted string"))?;
                tokens.push(Token::Str(rest[1..1 + end].to_string()));
                rest = &rest[end + 2..];
            }
            '|' => {
                tokens.push(Token::Pipe);
                rest = &rest[1..];
            }
            '.' => {
                let mut path = Vec::new();
                while let Some(after_dot) = rest.strip_prefix('.') {
                    let (ident, after) = take_ident(after_dot);
                    if ident.is_empty() {
                        break;
                    }
                    if !ident.starts_with(is_ident_start) {
                        return Err(parse_error(line, format!("bad field name {:?}", ident)));
                    }
                    path.push(ident.to_string());
                    rest = after;
                }
                if path.is_empty() {
                    tokens.push(Token::Dot);
                    rest = &rest[1..];
                } else {
                    tokens.push(Token::Field(path));
                }
            }
            c if is_ident_start(c) => {
                let (word, after) = take_ident(rest);
                tokens.push(Token::Word(word.to_string()));
                rest = after;
            }
            c => {
                return Err(parse_error(
                    line,
                    format!("unexpected {:?} in command", c.to_string()),
                ))
            }
        }
        if let Some(c) = rest.chars().next() {
            if !is_space(c) && c != '|' && !matches!(tokens.last(), Some(Token::Pipe)) {
                return Err(parse_error(
                    line,
                    format!("unexpected {:?} in operand", c.to_string()),
                ));
            }
        }
        rest = rest.trim_start_matches(is_space);
    }
    Ok(tokens)
}

/// Reads a double quoted string (after the opening quote). Returns the
/// unescaped value and the remaining input.
fn quoted(s: &str, line: usize) -> Result<(String, &str), TemplateError> {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &s[i + 1..])),
            '\\' => match chars.next().map(|(_, c)| c) {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some('\\') => value.push('\\'),
                Some('"') => value.push('"'),
                Some(other) => {
                    return Err(parse_error(
                        line,
                        format!("invalid syntax: unknown escape \\{}", other),
                    ))
                }
                None => break,
            },
            c => value.push(c),
        }
    }
    Err(parse_error(line, "unterminated quoted string"))
}

fn parse_action(source: &str, line: usize) -> Result<Expr, TemplateError> {
    let tokens = tokenize(source, line)?;
    if tokens.contains(&Token::Pipe) {
        return Err(parse_error(line, "pipelines are not supported"));
    }
    match tokens.as_slice() {
        [] => Err(parse_error(line, "missing value for command")),
        [Token::Dot] => Ok(Expr::Dot),
        [Token::Field(path)] => Ok(Expr::Field(path.clone())),
        [Token::Str(s)] => Ok(Expr::Literal(s.clone())),
        [Token::Word(w), Token::Dot, Token::Str(key)] if w == "index" => {
            Ok(Expr::Index(key.clone()))
        }
        [Token::Word(w), ..] if w == "index" => Err(parse_error(
            line,
            "index is only supported as: index . \"key\"",
        )),
        [Token::Word(w), ..] if KEYWORDS.contains(&w.as_str()) => {
            Err(parse_error(line, format!("unsupported action {:?}", w)))
        }
        [Token::Word(w), ..] => Err(parse_error(line, format!("function {:?} not defined", w))),
        _ => Err(parse_error(line, "too many operands")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parse_message(r: Result<Template, TemplateError>) -> (usize, String) {
        match r {
            Err(TemplateError::Parse { line, message }) => (line, message),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn substitutes_fields() {
        let d = data(&[("name", "nginx")]);
        assert_eq!(render("image: {{.name}}", &d).unwrap(), "image: nginx");
        assert_eq!(render("image: {{ .name }}", &d).unwrap(), "image: nginx");
    }

    #[test]
    fn non_ascii_inside_actions() {
        let d = data(&[("café", "x"), ("key", "v")]);
        assert_eq!(render("v: {{ .café }}", &d).unwrap(), "v: x");
        assert_eq!(render("{{ \"héllo}}\" }}", &d).unwrap(), "héllo}}");
        assert_eq!(render("{{ `ünï` }}-{{ index . \"café\" }}", &d).unwrap(), "ünï-x");
        assert_eq!(render("é {{- .key -}} ö", &d).unwrap(), "évö");
        let (line, message) = parse_message(Template::parse("{{ é }}"));
        assert_eq!(line, 1);
        assert!(message.contains("\"é\" not defined"), "{}", message);
    }

    #[test]
    fn text_without_actions_is_unchanged() {
        let src = "spec:\n  replicas: 3\n";
        assert_eq!(render(src, &BTreeMap::new()).unwrap(), src);
    }

    #[test]
    fn rendering_is_deterministic() {
        let d = data(&[("a", "1"), ("b", "2")]);
        let t = Template::parse("{{ .a }}-{{ .b }}-{{ . }}").unwrap();
        let first = t.execute(&d).unwrap();
        assert_eq!(first, "1-2-map[a:1 b:2]");
        for _ in 0..3 {
            assert_eq!(t.execute(&d).unwrap(), first);
        }
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = render("a: {{ .a }}\nb: {{ .missing }}", &data(&[("a", "1")])).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Exec {
                line: 2,
                action: ".missing".to_string(),
                message: "map has no entry for key \"missing\"".to_string(),
            }
        );
        assert_eq!(
            err.to_string(),
            "template: patch:2: executing \"patch\" at <.missing>: map has no entry for key \"missing\""
        );
    }

    #[test]
    fn index_reaches_any_key() {
        let d = data(&[("tls.crt", "CERT"), ("db-host", "db")]);
        assert_eq!(
            render("{{ index . \"tls.crt\" }} {{ index . `db-host` }}", &d).unwrap(),
            "CERT db"
        );
        assert!(matches!(
            render("{{ index . \"nope\" }}", &d),
            Err(TemplateError::Exec { .. })
        ));
    }

    #[test]
    fn nested_field_is_an_error() {
        let err = render("{{ .a.b }}", &data(&[("a", "1")])).unwrap_err();
        assert!(matches!(err, TemplateError::Exec { message, .. } if message.contains("can't evaluate field b")));
    }

    #[test]
    fn literals_and_comments() {
        let d = BTreeMap::new();
        assert_eq!(render("{{ \"a\\\"b\" }}", &d).unwrap(), "a\"b");
        assert_eq!(render("{{ `{{raw}}` }}", &d).unwrap(), "{{raw}}");
        assert_eq!(render("x{{/* note */}}y", &d).unwrap(), "xy");
        assert_eq!(render("x{{/* }} */}}y", &d).unwrap(), "xy");
    }

    #[test]
    fn trim_markers() {
        let d = data(&[("v", "1")]);
        assert_eq!(render("a:  \n  {{- .v -}}  \n  b", &d).unwrap(), "a:1b");
        assert_eq!(render("a: {{- .v }} b", &d).unwrap(), "a:1 b");
        assert_eq!(render("a: {{ .v -}} b", &d).unwrap(), "a: 1b");
        assert_eq!(render("a {{- /* c */ -}} b", &d).unwrap(), "ab");
    }

    #[test]
    fn closing_delimiter_inside_string() {
        let d = BTreeMap::new();
        assert_eq!(render("{{ \"}}\" }}", &d).unwrap(), "}}");
    }

    #[test]
    fn parse_errors() {
        let d = BTreeMap::new();
        let (line, msg) = parse_message(Template::parse("a\nb {{ .x"));
        assert_eq!((line, msg.as_str()), (2, "unclosed action"));

        let (_, msg) = parse_message(Template::parse("{{ if .x }}y{{ end }}"));
        assert_eq!(msg, "unsupported action \"if\"");

        let (_, msg) = parse_message(Template::parse("{{ upper .x }}"));
        assert_eq!(msg, "function \"upper\" not defined");

        let (_, msg) = parse_message(Template::parse("{{ .x | printf \"%s\" }}"));
        assert_eq!(msg, "pipelines are not supported");

        let (_, msg) = parse_message(Template::parse("{{ }}"));
        assert_eq!(msg, "missing value for command");

        let (_, msg) = parse_message(Template::parse("{{ \"abc }}"));
        assert_eq!(msg, "unterminated quoted string");

        let (_, msg) = parse_message(Template::parse("{{/* abc }}"));
        assert_eq!(msg, "unclosed comment");

        let (_, msg) = parse_message(Template::parse("{{ .x .y }}"));
        assert_eq!(msg, "too many operands");

        let (_, msg) = parse_message(Template::parse("{{ .x! }}"));
        assert_eq!(msg, "unexpected \"!\" in operand");

        // parse errors happen before any data is consulted
        assert!(matches!(
            render("{{ .a }}{{ if }}", &d),
            Err(TemplateError::Parse { .. })
        ));
    }

    #[test]
    fn display_round_trips_actions() {
        let src = "image: {{ .name }}\n{{ index . \"a-b\" }}";
        assert_eq!(Template::parse(src).unwrap().to_string(), src);
    }

    #[test]
    fn line_numbers_follow_multiline_actions() {
        let err = render("{{/* one\ntwo */}}\n{{ .x }}", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Exec { line: 3, .. }), "{:?}", err);
    }
}
