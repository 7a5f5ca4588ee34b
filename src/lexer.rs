//! Lexical analysis: template source to a flat token stream.
//!
//! The lexer alternates between two modes. Outside delimiters it scans raw
//! text up to the next `{{`, `{%` or `{#`; inside a variable or tag region
//! it lexes a small expression grammar. Whitespace control (`{%-`, `-%}`)
//! and the `trim_blocks` / `lstrip_blocks` options are resolved here, so
//! the parser only ever sees clean text tokens. Every token carries the
//! 1-based line it started on.

use std::fmt;

use crate::error::{SyntaxError, SyntaxErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

impl Token {
    fn new(kind: TokenKind, line: u32) -> Self {
        Self { kind, line }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Raw template text between delimiters.
    Text(String),
    VarBegin,
    VarEnd,
    TagBegin,
    TagEnd,

    Name(String),
    Str(String),
    Int(i64),
    Float(f64),

    // Keywords.
    If,
    Elsif,
    Else,
    Endif,
    Unless,
    Endunless,
    For,
    Endfor,
    In,
    Macro,
    Endmacro,
    Call,
    Endcall,
    Set,
    Endset,
    Assign,
    Endassign,
    Capture,
    Endcapture,
    Filter,
    Endfilter,
    Block,
    Endblock,
    Extends,
    Include,
    From,
    Import,
    And,
    Or,
    Not,
    Is,
    True,
    False,
    NoneLit,

    // Operators and punctuation.
    Pipe,
    Dot,
    Comma,
    Colon,
    Equal,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Tilde,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    Eof,
}

impl TokenKind {
    fn from_ident(ident: &str) -> Option<Self> {
        let kind = match ident {
            "if" => Self::If,
            "elsif" => Self::Elsif,
            "else" => Self::Else,
            "endif" => Self::Endif,
            "unless" => Self::Unless,
            "endunless" => Self::Endunless,
            "for" => Self::For,
            "endfor" => Self::Endfor,
            "in" => Self::In,
            "macro" => Self::Macro,
            "endmacro" => Self::Endmacro,
            "call" => Self::Call,
            "endcall" => Self::Endcall,
            "set" => Self::Set,
            "endset" => Self::Endset,
            "assign" => Self::Assign,
            "endassign" => Self::Endassign,
            "capture" => Self::Capture,
            "endcapture" => Self::Endcapture,
            "filter" => Self::Filter,
            "endfilter" => Self::Endfilter,
            "block" => Self::Block,
            "endblock" => Self::Endblock,
            "extends" => Self::Extends,
            "include" => Self::Include,
            "from" => Self::From,
            "import" => Self::Import,
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            "is" => Self::Is,
            "true" | "True" => Self::True,
            "false" | "False" => Self::False,
            "none" | "None" | "nil" => Self::NoneLit,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text(_) => "text",
            Self::VarBegin => "'{{'",
            Self::VarEnd => "'}}'",
            Self::TagBegin => "'{%'",
            Self::TagEnd => "'%}'",
            Self::Name(n) => return write!(f, "'{n}'"),
            Self::Str(_) => "string literal",
            Self::Int(_) | Self::Float(_) => "number",
            Self::If => "'if'",
            Self::Elsif => "'elsif'",
            Self::Else => "'else'",
            Self::Endif => "'endif'",
            Self::Unless => "'unless'",
            Self::Endunless => "'endunless'",
            Self::For => "'for'",
            Self::Endfor => "'endfor'",
            Self::In => "'in'",
            Self::Macro => "'macro'",
            Self::Endmacro => "'endmacro'",
            Self::Call => "'call'",
            Self::Endcall => "'endcall'",
            Self::Set => "'set'",
            Self::Endset => "'endset'",
            Self::Assign => "'assign'",
            Self::Endassign => "'endassign'",
            Self::Capture => "'capture'",
            Self::Endcapture => "'endcapture'",
            Self::Filter => "'filter'",
            Self::Endfilter => "'endfilter'",
            Self::Block => "'block'",
            Self::Endblock => "'endblock'",
            Self::Extends => "'extends'",
            Self::Include => "'include'",
            Self::From => "'from'",
            Self::Import => "'import'",
            Self::And => "'and'",
            Self::Or => "'or'",
            Self::Not => "'not'",
            Self::Is => "'is'",
            Self::True => "'true'",
            Self::False => "'false'",
            Self::NoneLit => "'none'",
            Self::Pipe => "'|'",
            Self::Dot => "'.'",
            Self::Comma => "','",
            Self::Colon => "':'",
            Self::Equal => "'='",
            Self::EqEq => "'=='",
            Self::NotEq => "'!='",
            Self::Lt => "'<'",
            Self::LtEq => "'<='",
            Self::Gt => "'>'",
            Self::GtEq => "'>='",
            Self::Plus => "'+'",
            Self::Minus => "'-'",
            Self::Star => "'*'",
            Self::StarStar => "'**'",
            Self::Slash => "'/'",
            Self::SlashSlash => "'//'",
            Self::Percent => "'%'",
            Self::Tilde => "'~'",
            Self::LParen => "'('",
            Self::RParen => "')'",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::LBrace => "'{'",
            Self::RBrace => "'}'",
            Self::Eof => "end of template",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LexerOptions {
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
}

pub(crate) struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    line: u32,
    in_code: bool,
    /// Strip all leading whitespace from the next text chunk (`-%}`).
    strip_next: bool,
    /// Drop one newline from the next text chunk (`trim_blocks`).
    skip_newline: bool,
    options: LexerOptions,
    done: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, options: LexerOptions) -> Self {
        Self {
            source,
            pos: 0,
            line: 1,
            in_code: false,
            strip_next: false,
            skip_newline: false,
            options,
            done: false,
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn bump(&mut self, n: usize) {
        let eaten = &self.source[self.pos..self.pos + n];
        self.line += eaten.matches('\n').count() as u32;
        self.pos += n;
    }

    pub fn next_token(&mut self) -> Result<Token, SyntaxError> {
        if self.in_code {
            self.lex_code()
        } else {
            self.lex_text()
        }
    }

    fn lex_text(&mut self) -> Result<Token, SyntaxError> {
        loop {
            if self.pos >= self.source.len() {
                self.done = true;
                return Ok(Token::new(TokenKind::Eof, self.line));
            }
            let start_line = self.line;
            let rest = self.rest();
            let delim_at = find_delimiter(rest);
            let raw = match delim_at {
                Some(at) => &rest[..at],
                None => rest,
            };
            let mut text = raw;
            if self.skip_newline {
                self.skip_newline = false;
                text = text
                    .strip_prefix("\r\n")
                    .or_else(|| text.strip_prefix('\n'))
                    .unwrap_or(text);
            }
            if self.strip_next {
                self.strip_next = false;
                text = text.trim_start();
            }
            let mut text = text.to_string();
            if let Some(at) = delim_at {
                let delim = &rest[at..];
                if delim.as_bytes().get(2) == Some(&b'-') {
                    text.truncate(text.trim_end().len());
                } else if self.options.lstrip_blocks && !delim.starts_with("{{") {
                    // Drop indentation before a tag that sits on its own line.
                    let tail = text.rfind('\n').map_or(0, |i| i + 1);
                    if text[tail..].chars().all(|c| c == ' ' || c == '\t') {
                        text.truncate(tail);
                    }
                }
            }
            self.bump(raw.len());
            if !text.is_empty() {
                return Ok(Token::new(TokenKind::Text(text), start_line));
            }
            // Nothing survived stripping; handle the delimiter (or EOF).
            match delim_at {
                None => {
                    self.done = true;
                    return Ok(Token::new(TokenKind::Eof, self.line));
                }
                Some(_) => {
                    if let Some(token) = self.open_delimiter()? {
                        return Ok(token);
                    }
                    // A comment was consumed; keep scanning text.
                }
            }
        }
    }

    /// Consumes the delimiter at the cursor. Comments yield no token.
    fn open_delimiter(&mut self) -> Result<Option<Token>, SyntaxError> {
        let line = self.line;
        let rest = self.rest();
        let minus = rest.as_bytes().get(2) == Some(&b'-');
        let open_len = if minus { 3 } else { 2 };
        if rest.starts_with("{#") {
            let interior = &rest[open_len..];
            let Some(end) = interior.find("#}") else {
                return Err(SyntaxError::new(line, SyntaxErrorKind::UnterminatedComment));
            };
            if interior[..end].ends_with('-') {
                self.strip_next = true;
            }
            self.bump(open_len + end + 2);
            if self.options.trim_blocks {
                self.skip_newline = true;
            }
            Ok(None)
        } else if rest.starts_with("{{") {
            self.bump(open_len);
            self.in_code = true;
            Ok(Some(Token::new(TokenKind::VarBegin, line)))
        } else {
            self.bump(open_len);
            self.in_code = true;
            Ok(Some(Token::new(TokenKind::TagBegin, line)))
        }
    }

    fn lex_code(&mut self) -> Result<Token, SyntaxError> {
        loop {
            match self.rest().chars().next() {
                Some(c) if c.is_whitespace() => self.bump(c.len_utf8()),
                Some(_) => break,
                None => {
                    return Err(SyntaxError::new(
                        self.line,
                        SyntaxErrorKind::unexpected_eof(Some("'%}' or '}}'")),
                    ));
                }
            }
        }
        let line = self.line;
        let rest = self.rest();

        // Region close, with or without whitespace control.
        for (pat, kind, strip) in [
            ("-%}", TokenKind::TagEnd, true),
            ("-}}", TokenKind::VarEnd, true),
            ("%}", TokenKind::TagEnd, false),
            ("}}", TokenKind::VarEnd, false),
        ] {
            if rest.starts_with(pat) {
                self.bump(pat.len());
                self.in_code = false;
                if strip {
                    self.strip_next = true;
                }
                if kind == TokenKind::TagEnd && self.options.trim_blocks {
                    self.skip_newline = true;
                }
                return Ok(Token::new(kind, line));
            }
        }

        let c = rest.chars().next().unwrap_or_default();
        if c.is_ascii_alphabetic() || c == '_' {
            let len = rest
                .find(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
                .unwrap_or(rest.len());
            let ident = &rest[..len];
            self.bump(len);
            let kind = TokenKind::from_ident(ident)
                .unwrap_or_else(|| TokenKind::Name(ident.to_string()));
            return Ok(Token::new(kind, line));
        }
        if c.is_ascii_digit() {
            return self.lex_number(line);
        }
        if c == '\'' || c == '"' {
            return self.lex_string(c, line);
        }

        for (pat, kind) in [
            ("==", TokenKind::EqEq),
            ("!=", TokenKind::NotEq),
            ("<=", TokenKind::LtEq),
            (">=", TokenKind::GtEq),
            ("//", TokenKind::SlashSlash),
            ("**", TokenKind::StarStar),
        ] {
            if rest.starts_with(pat) {
                self.bump(2);
                return Ok(Token::new(kind, line));
            }
        }
        let kind = match c {
            '|' => TokenKind::Pipe,
            '.' => TokenKind::Dot,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '=' => TokenKind::Equal,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '~' => TokenKind::Tilde,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            other => {
                return Err(SyntaxError::new(
                    line,
                    SyntaxErrorKind::UnexpectedChar { found: other },
                ));
            }
        };
        self.bump(1);
        Ok(Token::new(kind, line))
    }

    fn lex_number(&mut self, line: u32) -> Result<Token, SyntaxError> {
        let rest = self.rest();
        let mut len = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let mut float = false;
        // A dot only belongs to the number when digits follow; `1.upper`
        // stays an integer plus an attribute access.
        if rest[len..].starts_with('.')
            && rest[len + 1..].starts_with(|c: char| c.is_ascii_digit())
        {
            float = true;
            let frac = &rest[len + 1..];
            len += 1 + frac.find(|c: char| !c.is_ascii_digit()).unwrap_or(frac.len());
        }
        let literal = &rest[..len];
        self.bump(len);
        if float {
            literal
                .parse::<f64>()
                .map(|f| Token::new(TokenKind::Float(f), line))
                .map_err(|_| invalid_number(line, literal))
        } else {
            literal
                .parse::<i64>()
                .map(|i| Token::new(TokenKind::Int(i), line))
                .map_err(|_| invalid_number(line, literal))
        }
    }

    fn lex_string(&mut self, quote: char, line: u32) -> Result<Token, SyntaxError> {
        self.bump(1);
        let mut out = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(SyntaxError::new(line, SyntaxErrorKind::UnterminatedString));
            };
            self.bump(c.len_utf8());
            if c == quote {
                return Ok(Token::new(TokenKind::Str(out), line));
            }
            if c == '\\' {
                let Some(esc) = self.rest().chars().next() else {
                    return Err(SyntaxError::new(line, SyntaxErrorKind::UnterminatedString));
                };
                self.bump(esc.len_utf8());
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                }
            } else {
                out.push(c);
            }
        }
    }
}

fn invalid_number(line: u32, literal: &str) -> SyntaxError {
    SyntaxError::new(
        line,
        SyntaxErrorKind::Message {
            message: format!("invalid number literal '{literal}'"),
        },
    )
}

fn find_delimiter(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(at) = text[from..].find('{') {
        let at = from + at;
        match text.as_bytes().get(at + 1) {
            Some(b'{' | b'%' | b'#') => return Some(at),
            _ => from = at + 1,
        }
    }
    None
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, SyntaxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        Some(self.next_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        kinds_with(source, LexerOptions::default())
    }

    fn kinds_with(source: &str, options: LexerOptions) -> Vec<TokenKind> {
        Lexer::new(source, options)
            .map(|t| t.map(|t| t.kind))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn text_and_variable_regions() {
        assert_eq!(
            kinds("a {{ name }} b"),
            vec![
                TokenKind::Text("a ".to_string()),
                TokenKind::VarBegin,
                TokenKind::Name("name".to_string()),
                TokenKind::VarEnd,
                TokenKind::Text(" b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn keywords_and_operators() {
        assert_eq!(
            kinds("{% if a == 1 and not b %}"),
            vec![
                TokenKind::TagBegin,
                TokenKind::If,
                TokenKind::Name("a".to_string()),
                TokenKind::EqEq,
                TokenKind::Int(1),
                TokenKind::And,
                TokenKind::Not,
                TokenKind::Name("b".to_string()),
                TokenKind::TagEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn comments_vanish() {
        assert_eq!(
            kinds("a{# hidden {% not a tag %} #}b"),
            vec![TokenKind::Text("a".to_string()), TokenKind::Text("b".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn minus_strips_whitespace() {
        assert_eq!(
            kinds("a   {%- if x -%}   b{% endif %}"),
            vec![
                TokenKind::Text("a".to_string()),
                TokenKind::TagBegin,
                TokenKind::If,
                TokenKind::Name("x".to_string()),
                TokenKind::TagEnd,
                TokenKind::Text("b".to_string()),
                TokenKind::TagBegin,
                TokenKind::Endif,
                TokenKind::TagEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn trim_blocks_drops_the_newline_after_a_tag() {
        let options = LexerOptions {
            trim_blocks: true,
            lstrip_blocks: false,
        };
        assert_eq!(
            kinds_with("{% if x %}\nbody\n{% endif %}\n", options),
            vec![
                TokenKind::TagBegin,
                TokenKind::If,
                TokenKind::Name("x".to_string()),
                TokenKind::TagEnd,
                TokenKind::Text("body\n".to_string()),
                TokenKind::TagBegin,
                TokenKind::Endif,
                TokenKind::TagEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn lstrip_blocks_drops_tag_indentation() {
        let options = LexerOptions {
            trim_blocks: false,
            lstrip_blocks: true,
        };
        assert_eq!(
            kinds_with("x\n    {% if y %}", options),
            vec![
                TokenKind::Text("x\n".to_string()),
                TokenKind::TagBegin,
                TokenKind::If,
                TokenKind::Name("y".to_string()),
                TokenKind::TagEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn numbers_and_attribute_dots() {
        assert_eq!(
            kinds("{{ 1.5 + 2.next }}"),
            vec![
                TokenKind::VarBegin,
                TokenKind::Float(1.5),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Dot,
                TokenKind::Name("next".to_string()),
                TokenKind::VarEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn string_escapes() {
        assert_eq!(
            kinds(r#"{{ 'a\'b' ~ "c\nd" }}"#),
            vec![
                TokenKind::VarBegin,
                TokenKind::Str("a'b".to_string()),
                TokenKind::Tilde,
                TokenKind::Str("c\nd".to_string()),
                TokenKind::VarEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn unterminated_string_reports_its_line() {
        let err = Lexer::new("line one\n{{ 'open }}", LexerOptions::default())
            .find_map(|t| t.err())
            .unwrap();
        assert_eq!(err.line, 2);
        assert_eq!(err.kind, SyntaxErrorKind::UnterminatedString);
    }

    #[test]
    #[ntest::timeout(100)]
    fn unknown_character() {
        let err = Lexer::new("{{ a ? b }}", LexerOptions::default())
            .find_map(|t| t.err())
            .unwrap();
        assert_eq!(err.kind, SyntaxErrorKind::UnexpectedChar { found: '?' });
    }

    #[test]
    #[ntest::timeout(100)]
    fn lines_are_tracked_through_text() {
        let tokens: Vec<Token> = Lexer::new("a\nb\n{{ x }}", LexerOptions::default())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tokens[1].kind, TokenKind::VarBegin);
        assert_eq!(tokens[1].line, 3);
    }
}
