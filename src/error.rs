use thiserror::Error;

/// Broad classification used by the diagnostic report and by the decision
/// whether compilation can continue past the offending statement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Lexical,
    Syntactic,
    Semantic,
    Limit,
    Resource,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("malformed constant `{0}`")]
    MalformedConstant(String),

    #[error("unterminated character constant")]
    UnterminatedString,

    #[error("expression syntax: {0}")]
    ExpressionSyntax(&'static str),

    #[error("unexpected token near `{0}`")]
    UnexpectedToken(String),

    #[error("missing {0}")]
    MissingPunctuation(&'static str),

    #[error("statement is not valid in this part of the program unit")]
    MisplacedStatement,

    #[error("statement label {0} is not defined")]
    UndefinedLabel(u32),

    #[error("`{0}` is defined twice")]
    DoubleDefinition(String),

    #[error("invalid EQUIVALENCE: {0}")]
    InvalidEquivalence(&'static str),

    #[error("division by zero in constant expression")]
    ConstantDivZero,

    #[error("operands of `{op}` have incompatible types {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("`{0}` is not an array")]
    NotAnArray(String),

    #[error("wrong number of subscripts for `{0}`")]
    SubscriptCount(String),

    #[error("subscript {0} is outside the bounds of `{1}`")]
    SubscriptRange(i64, String),

    #[error("`{0}` cannot be used this way")]
    InvalidReference(String),

    #[error("wrong number of arguments for `{0}`")]
    ArgumentCount(String),

    #[error("IMPLICIT NONE is in force and `{0}` has no declared type")]
    NoImplicitType(String),

    #[error("{0} stack overflow")]
    StackOverflow(&'static str),

    #[error("all {0}-registers are allocated")]
    AllRegistersAllocated(char),
}

impl CompileError {
    pub fn kind(&self) -> ErrorKind {
        use CompileError::*;
        match self {
            MalformedConstant(_) | UnterminatedString => ErrorKind::Lexical,
            ExpressionSyntax(_) | UnexpectedToken(_) | MissingPunctuation(_) => {
                ErrorKind::Syntactic
            }
            MisplacedStatement
            | UndefinedLabel(_)
            | DoubleDefinition(_)
            | InvalidEquivalence(_)
            | ConstantDivZero
            | TypeMismatch { .. }
            | NotAnArray(_)
            | SubscriptCount(_)
            | SubscriptRange(..)
            | InvalidReference(_)
            | ArgumentCount(_)
            | NoImplicitType(_) => ErrorKind::Semantic,
            StackOverflow(_) => ErrorKind::Limit,
            AllRegistersAllocated(_) => ErrorKind::Resource,
        }
    }

    /// Limit and resource exhaustion are compiler failures; everything else
    /// is charged to the source program and compilation continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Limit | ErrorKind::Resource)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Severity {
    Warning,
    Error,
}

/// One formatted diagnostic, bound to the source line it was raised on.
#[derive(Debug)]
pub struct Diagnostic {
    pub line: u32,
    pub severity: Severity,
    pub message: String,
}

/// Per-compilation sink for non-fatal diagnostics. Errors and warnings are
/// counted across the whole source file; the per-unit slice is drained into
/// the listing at each END statement.
#[derive(Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    errors: u32,
    warnings: u32,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn error(&mut self, line: u32, err: &CompileError) {
        self.errors += 1;
        let message = err.to_string();
        log::error!("line {}: {}", line, message);
        self.items.push(Diagnostic {
            line,
            severity: Severity::Error,
            message,
        });
    }

    pub fn warning(&mut self, line: u32, message: String) {
        self.warnings += 1;
        log::warn!("line {}: {}", line, message);
        self.items.push(Diagnostic {
            line,
            severity: Severity::Warning,
            message,
        });
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings
    }

    pub fn drain_unit(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.items)
    }

    pub fn summary(&self) -> String {
        format!("{} errors, {} warnings", self.errors, self.warnings)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(CompileError::StackOverflow("operand").is_fatal());
        assert!(CompileError::AllRegistersAllocated('S').is_fatal());
        assert!(!CompileError::ConstantDivZero.is_fatal());
        assert_eq!(CompileError::UnterminatedString.kind(), ErrorKind::Lexical);
    }
}
