use std::fmt;

use thiserror::Error;

/// A single compile-time diagnostic, formatted `[line N] Error at 'x': msg`.
///
/// `lexeme` is `None` for diagnostics raised on scanner error tokens, which
/// carry the message themselves and have no printable location.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub line: u32,
    pub lexeme: Option<String>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.lexeme {
            Some(l) if l.is_empty() => write!(f, " at end")?,
            Some(l) => write!(f, " at '{}'", l)?,
            None => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Everything the compiler reported before giving up. The first entry is the
/// real error; the rest survived panic-mode resynchronization.
#[derive(Clone, Debug)]
pub struct CompileErrors(pub Vec<Diagnostic>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// One line of a runtime stack trace, newest frame first.
#[derive(Clone, Debug)]
pub struct TraceFrame {
    pub line: u32,
    /// `None` for the top-level script frame.
    pub function: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n[line {}] in ", frame.line)?;
            match &frame.function {
                Some(name) => write!(f, "{}()", name)?,
                None => write!(f, "script")?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error)]
pub enum EmbrError {
    #[error("{0}")]
    Compile(CompileErrors),
    #[error("{0}")]
    Runtime(RuntimeError),
}

impl EmbrError {
    /// Conventional interpreter exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            EmbrError::Compile(_) => 65,
            EmbrError::Runtime(_) => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_formats_location() {
        let d = Diagnostic {
            line: 3,
            lexeme: Some("}".to_string()),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(d.to_string(), "[line 3] Error at '}': Expect expression.");
    }

    #[test]
    fn diagnostic_at_end() {
        let d = Diagnostic {
            line: 7,
            lexeme: Some(String::new()),
            message: "Expect '}' after block.".to_string(),
        };
        assert_eq!(d.to_string(), "[line 7] Error at end: Expect '}' after block.");
    }

    #[test]
    fn runtime_error_prints_trace_newest_first() {
        let e = RuntimeError {
            message: "Operands must be numbers.".to_string(),
            trace: vec![
                TraceFrame { line: 2, function: Some("inner".to_string()) },
                TraceFrame { line: 5, function: None },
            ],
        };
        assert_eq!(
            e.to_string(),
            "Operands must be numbers.\n[line 2] in inner()\n[line 5] in script"
        );
    }
}
