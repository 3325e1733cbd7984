//! Substitution maps and template expansion.
//!
//! A kernel template is plain text with underscore-delimited placeholder
//! tokens (`_nbX_`, `_familyMasks_`, `_forceModel_`, ...). Specialization
//! walks the template once, replacing every placeholder whose name is in
//! the map; unknown `_..._` spans are left untouched (they may be ordinary
//! identifiers in the kernel language).

use std::collections::BTreeMap;
use std::fmt::Display;

/// Ordered placeholder → replacement map.
///
/// Keys are the bare placeholder names, without the delimiting underscores.
/// Ordered storage keeps the snapshot rendering (attached to compile
/// failures for diagnosis) deterministic.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionMap {
    entries: BTreeMap<String, String>,
}

impl SubstitutionMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a replacement for `_name_`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_string(), value.into());
    }

    /// Looks up a replacement by bare name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Applies [`compact_code`] to every entry, so each substitution splices
    /// in as a single line and compile-error line numbers keep pointing at
    /// the emission site.
    pub fn compact_all(&mut self) {
        for v in self.entries.values_mut() {
            *v = compact_code(v);
        }
    }

    /// Renders the map for diagnostics (attached to compile failures).
    #[must_use]
    pub fn snapshot(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            let truncated = v.len() > 160;
            let shown = v.get(..160).unwrap_or(v.as_str());
            out.push('_');
            out.push_str(k);
            out.push_str("_ => ");
            out.push_str(shown);
            if truncated {
                out.push('…');
            }
            out.push('\n');
        }
        out
    }
}

/// Expands `template` against `map` in one pass.
///
/// The scanner looks for `_name_` spans where `name` is a non-empty run of
/// alphanumerics; replaced text is *not* rescanned, so substitutions cannot
/// trigger each other.
#[must_use]
pub fn specialize(template: &str, map: &SubstitutionMap) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            // Find the closing underscore of a candidate placeholder.
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] as char).is_ascii_alphanumeric() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b'_' {
                let name = &template[i + 1..j];
                if let Some(rep) = map.get(name) {
                    out.push_str(rep);
                    i = j + 1;
                    continue;
                }
            }
        }
        // Advance one char (the template is ASCII in practice, but stay
        // correct for any UTF-8 input).
        let ch_len = template[i..]
            .chars()
            .next()
            .map_or(1, char::len_utf8);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    out
}

/// Collapses a code snippet onto one line: newlines become spaces and runs
/// of whitespace shrink to a single space.
#[must_use]
pub fn compact_code(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut last_ws = false;
    for c in src.chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            out.push(c);
            last_ws = false;
        }
    }
    out.trim().to_string()
}

/// Renders an iterator of values as comma-separated literals, the form in
/// which dense registry arrays (the family mask matrix, counts) are carried
/// in a substitution map: spliced into kernel text where a template names
/// them, and surfaced in the map snapshot when compilation fails.
pub fn csv_literals<T: Display>(values: impl IntoIterator<Item = T>) -> String {
    let mut out = String::new();
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_known_placeholders_only() {
        let mut map = SubstitutionMap::new();
        map.insert("nbX", "128");
        map.insert("forceModel", "forceX = 0;");
        let out = specialize("nb = _nbX_; _forceModel_ keep _unknown_;", &map);
        assert_eq!(out, "nb = 128; forceX = 0; keep _unknown_;");
    }

    #[test]
    fn replacement_is_single_pass() {
        let mut map = SubstitutionMap::new();
        map.insert("a", "_b_");
        map.insert("b", "boom");
        assert_eq!(specialize("_a_", &map), "_b_");
    }

    #[test]
    fn compact_code_collapses_to_one_line() {
        let s = "vX = 1;\n  vY = 2;\n\tvZ = 3;";
        assert_eq!(compact_code(s), "vX = 1; vY = 2; vZ = 3;");
    }

    #[test]
    fn csv_literals_joins_with_commas() {
        assert_eq!(csv_literals([1, 0, 1]), "1,0,1");
        assert_eq!(csv_literals([0.5f64]), "0.5");
    }
}
