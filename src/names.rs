/// Normalize an agent class name into the kebab-case form used in routing
/// URLs. Camel-case boundaries become dashes, underscores are treated as
/// dashes, runs collapse into a single dash, and leading/trailing dashes are
/// dropped. The conversion is idempotent, so already-normalized names pass
/// through unchanged.
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for c in name.chars() {
        if c == '_' || c == '-' {
            // Collapse runs of separators into one dash
            if !out.ends_with('-') && !out.is_empty() {
                out.push('-');
            }
        } else if c.is_ascii_uppercase() {
            // A capital after a lowercase letter or digit starts a new word
            if prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
                && !out.ends_with('-')
            {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    // A trailing separator leaves a dangling dash
    if out.ends_with('-') {
        out.pop();
    }
    out
}

/// Deterministic identifier for an agent instance, derived from the
/// `(class, name)` pair. Stable across restarts, so it doubles as the
/// database file name for the instance.
pub fn agent_id(class: &str, name: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(class.as_bytes());
    hasher.update(b"\0");
    hasher.update(name.as_bytes());
    hasher.finalize().to_hex().to_string()
}
