pub type MoltenResult<T> = std::result::Result<T, MoltenError>;

/// What went wrong while lexing or parsing, without the location.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SyntaxErrorKind {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("unexpected end of template{expected_what}")]
    UnexpectedEof { expected_what: String },
    #[error("unexpected character '{found}'")]
    UnexpectedChar { found: char },
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("unknown tag '{name}'")]
    UnknownTag { name: String },
    #[error("unexpected tag '{name}'")]
    UnexpectedTag { name: String },
    #[error("cannot assign to reserved name '{name}'")]
    ReservedName { name: String },
    #[error("{message}")]
    Message { message: String },
}

impl SyntaxErrorKind {
    pub fn unexpected_eof(expected: Option<&str>) -> Self {
        Self::UnexpectedEof {
            expected_what: expected.map_or_else(String::new, |e| format!(" (expected {e})")),
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("syntax error at line {line}: {kind}")]
pub struct SyntaxError {
    pub line: u32,
    pub kind: SyntaxErrorKind,
}

impl SyntaxError {
    pub fn new(line: u32, kind: SyntaxErrorKind) -> Self {
        Self { line, kind }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MoltenError {
    /// Lexer or parser rejected the template.
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    /// Static semantic error caught while compiling: bad parameter
    /// ordering, a filter or test name missing from the registry.
    #[error("assertion error at line {line}: {message}")]
    Assertion { line: u32, message: String },
    /// An operation needed a concrete value but found Undefined.
    #[error("undefined error: {message}")]
    Undefined { message: String },
    #[error("template not found: {name}")]
    TemplateNotFound { name: String },
    #[error("template already exists: {name}")]
    TemplateExists { name: String },
    /// The sandbox policy vetoed an access or call.
    #[error("security error: {message}")]
    Security { message: String },
    /// Anything that only blows up while rendering: bad operand types,
    /// division by zero, iterating a non-iterable, recursion limits,
    /// filter failures.
    #[error("runtime error: {message}")]
    Runtime { message: String },
}

impl MoltenError {
    pub(crate) fn undefined(message: impl Into<String>) -> Self {
        Self::Undefined {
            message: message.into(),
        }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    pub(crate) fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    pub(crate) fn assertion(line: u32, message: impl Into<String>) -> Self {
        Self::Assertion {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn syntax_error_mentions_line() {
        let err = MoltenError::from(SyntaxError::new(
            7,
            SyntaxErrorKind::UnexpectedToken {
                expected: "'%}'".to_string(),
                found: "','".to_string(),
            },
        ));
        assert_eq!(
            err.to_string(),
            "syntax error at line 7: expected '%}', found ','"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn eof_formats_with_and_without_expectation() {
        assert_eq!(
            SyntaxErrorKind::unexpected_eof(None).to_string(),
            "unexpected end of template"
        );
        assert_eq!(
            SyntaxErrorKind::unexpected_eof(Some("'endfor'")).to_string(),
            "unexpected end of template (expected 'endfor')"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn taxonomy_is_comparable() {
        let a = MoltenError::TemplateNotFound {
            name: "base.html".to_string(),
        };
        let b = MoltenError::TemplateNotFound {
            name: "base.html".to_string(),
        };
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "template not found: base.html");
    }
}
