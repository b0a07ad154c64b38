//! Properties of demangled-name reduction.

use gpucompat_rtc::{strip_name_expression, SignaturePrefix, KERNEL_DESCRIPTOR_MARKER};

/// Check one arbitrary demangled name.
///
/// Parsing must not panic, a descriptor symbol never yields a prefix, and a
/// prefix is a substring of the input that ends before any parameter list.
pub fn check_demangled(input: &str) -> Result<(), String> {
    let Ok(prefix) = SignaturePrefix::parse(input) else {
        return Ok(());
    };
    let text = prefix.as_str();
    if input.contains(KERNEL_DESCRIPTOR_MARKER) {
        return Err(format!("descriptor {input:?} produced prefix {text:?}"));
    }
    if text.is_empty() {
        return Err(format!("empty prefix from {input:?}"));
    }
    if !input.contains(text) {
        return Err(format!("prefix {text:?} not found in {input:?}"));
    }
    if !prefix.matches(text) {
        return Err(format!("prefix {text:?} does not match itself"));
    }
    Ok(())
}

/// Build a signature from generated pieces and check it reduces to `name`.
pub fn check_signature(return_type: &str, name: &str, params: &str) -> Result<(), String> {
    let demangled = format!("{return_type} {name}({params})");
    let prefix = SignaturePrefix::parse(&demangled)
        .map_err(|e| format!("{demangled:?} rejected: {e}"))?;
    if !prefix.matches(name) {
        return Err(format!("{demangled:?} reduced to {:?}", prefix.as_str()));
    }
    let expr = format!("(&{name})");
    if !prefix.matches(&strip_name_expression(&expr)) {
        return Err(format!("{expr:?} did not resolve against {demangled:?}"));
    }
    Ok(())
}

/// A C++ identifier drawn from `seed`.
pub fn identifier(seed: &[u8]) -> String {
    const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyz_";
    const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz_0123456789";
    let mut id = String::new();
    for (i, b) in seed.iter().take(12).enumerate() {
        let table = if i == 0 { ALPHA } else { ALNUM };
        id.push(table[*b as usize % table.len()] as char);
    }
    if id.is_empty() {
        id.push('k');
    }
    id
}

/// A possibly nested template name such as `ns::f<int, g<char> >`.
pub fn template_name(seed: &[u8], depth: u8) -> String {
    let base = format!("ns::{}", identifier(seed));
    let mut args = identifier(seed.get(1..).unwrap_or_default());
    for level in 0..depth % 4 {
        args = format!("{}<{args} >", identifier(&[level, depth]));
    }
    if depth == 0 {
        base
    } else {
        format!("{base}<{args}, int>")
    }
}
