//! Name expressions and the demangled names they are matched against.
//!
//! A name expression is whatever the user would write to take the address
//! of a kernel, e.g. `&scale<float>`. After compilation it is resolved by
//! demangling every emitted symbol, reducing each to a [`SignaturePrefix`]
//! (qualified name plus template arguments, without return type or
//! parameters) and comparing that with the expression, ignoring whitespace.

/// Substring that marks kernel descriptor symbols. They share the kernel's
/// name and never resolve a name expression.
pub const KERNEL_DESCRIPTOR_MARKER: &str = ".kd";

/// Reduce a name expression to the form compared against symbols.
///
/// Surrounding parentheses and a leading `&` are removed:
/// `(&scale<float>)` becomes `scale<float>`.
pub fn strip_name_expression(expr: &str) -> String {
    let mut stripped = expr.trim();
    loop {
        let unwrapped = unwrap_parens(stripped)
            .or_else(|| stripped.strip_prefix('&'))
            .map(str::trim);
        match unwrapped {
            Some(inner) if !inner.is_empty() => stripped = inner,
            _ => break,
        }
    }
    stripped.to_owned()
}

/// `(x)` to `x`, only if the opening parenthesis closes at the very end.
fn unwrap_parens(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

pub fn without_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    #[error("empty demangled name")]
    Empty,
    #[error("kernel descriptor symbol")]
    KernelDescriptor,
    #[error("unbalanced template argument list")]
    Unbalanced,
}

/// The part of a demangled function signature that a name expression names.
///
/// `void ns::scale<float, 4>(float*, int)` has the prefix `ns::scale<float, 4>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePrefix {
    text: String,
    template_args: bool,
}

impl SignaturePrefix {
    /// Parse a demangled symbol.
    ///
    /// Tokens separated by spaces outside any template argument list are a
    /// return type and are skipped. The prefix ends at the parameter list or
    /// at the end of the input; `<`/`>` must balance before that.
    pub fn parse(demangled: &str) -> Result<Self, PrefixError> {
        let demangled = demangled.trim();
        if demangled.is_empty() {
            return Err(PrefixError::Empty);
        }
        if demangled.contains(KERNEL_DESCRIPTOR_MARKER) {
            return Err(PrefixError::KernelDescriptor);
        }

        let mut start = 0;
        let mut end = demangled.len();
        let mut depth = 0usize;
        let mut template_at = None;

        for (i, c) in demangled.char_indices() {
            match c {
                '<' => {
                    if depth == 0 && template_at.is_none() {
                        template_at = Some(i);
                    }
                    depth += 1;
                }
                '>' => {
                    depth = depth.checked_sub(1).ok_or(PrefixError::Unbalanced)?;
                }
                ' ' if depth == 0 => {
                    // Everything so far was the return type.
                    start = i + 1;
                    template_at = None;
                }
                '(' if depth == 0 => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(PrefixError::Unbalanced);
        }

        let text = demangled[start..end].trim();
        if text.is_empty() {
            return Err(PrefixError::Empty);
        }
        Ok(Self {
            text: text.to_owned(),
            template_args: template_at.is_some_and(|at| at >= start),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn has_template_args(&self) -> bool {
        self.template_args
    }

    /// Whitespace-insensitive comparison with a stripped name expression.
    pub fn matches(&self, stripped: &str) -> bool {
        without_whitespace(&self.text) == without_whitespace(stripped)
    }
}
