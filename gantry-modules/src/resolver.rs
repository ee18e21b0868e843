//! Relative module identifier resolution
//!
//! Pure string manipulation, independent of the engine: translating `./x`
//! and `../x` forms into absolute identifiers relative to the declaring
//! module's path.

/// True for identifiers that already address a concrete location, either via
/// a URL scheme (`https://...`, `file://...`) or a leading `/`.
pub fn is_absolute(id: &str) -> bool {
    if id.starts_with('/') {
        return true;
    }
    let Some(pos) = id.find("://") else {
        return false;
    };
    let scheme = &id[..pos];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
        }
        _ => false,
    }
}

/// Collapse `.` and `..` segments of a module identifier.
///
/// A `..` consumes the preceding segment unless that segment is itself a
/// `..`, so excess parent segments accumulate at the front instead of
/// clamping or failing. The function is idempotent.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." => {}
            ".." => {
                if matches!(segments.last(), Some(&prev) if prev != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}

/// Resolves relative dependency identifiers against the path of the module
/// that declared them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdResolver {
    /// Owner id up to and including the final `/`; empty for top-level ids.
    from_module_path: String,
}

impl ModuleIdResolver {
    /// Resolver for dependencies declared by the module `owner_id`.
    pub fn new(owner_id: &str) -> Self {
        let from_module_path = match owner_id.rfind('/') {
            Some(pos) => owner_id[..pos + 1].to_string(),
            None => String::new(),
        };
        Self { from_module_path }
    }

    /// Resolver with no owning path, for top-level requests.
    pub fn root() -> Self {
        Self {
            from_module_path: String::new(),
        }
    }

    /// Translate `raw` into an absolute identifier.
    ///
    /// Identifiers that are already absolute, or that carry no `./`/`../`
    /// prefix, are returned unchanged.
    pub fn resolve(&self, raw: &str) -> String {
        if raw.starts_with("./") || raw.starts_with("../") {
            normalize(&format!("{}{}", self.from_module_path, raw))
        } else {
            raw.to_string()
        }
    }
}
