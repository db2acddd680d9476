//! Loss-free INI reader/writer for the rule file.
//!
//! Every section keeps the exact text it was parsed from, so a document that
//! is parsed and rendered again without edits is byte-identical. Sections the
//! engine rewrites are merged line by line: comments, blank lines and keys
//! the engine does not own stay where they were.

/// One `[name]` section and the text it owns (its header line up to the next
/// header, including trailing blank and comment lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    raw: String,
    entries: Vec<(String, String)>,
}

/// A parsed document: text before the first header plus the sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    pub preamble: String,
    pub sections: Vec<IniSection>,
}

/// Split a `key = value` line. `=` wins over `:` so binary payloads like
/// `hex:01,02` never split on the colon.
fn split_entry(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
        return None;
    }
    let at = trimmed.find('=').or_else(|| trimmed.find(':'))?;
    let key = trimmed[..at].trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }
    Some((key, trimmed[at + 1..].trim().to_string()))
}

fn header_name(line: &str) -> Option<&str> {
    let t = line.trim();
    t.strip_prefix('[')?.strip_suffix(']').map(str::trim)
}

fn line_ending(text: &str) -> &'static str {
    if text.contains("\r\n") { "\r\n" } else { "\n" }
}

impl IniDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = IniDocument::default();
        let mut current: Option<IniSection> = None;

        for line in text.split_inclusive('\n') {
            if let Some(name) = header_name(line) {
                if let Some(done) = current.take() {
                    doc.sections.push(done);
                }
                current = Some(IniSection {
                    name: name.to_string(),
                    raw: line.to_string(),
                    entries: Vec::new(),
                });
                continue;
            }
            match current.as_mut() {
                Some(section) => {
                    section.raw.push_str(line);
                    if let Some(entry) = split_entry(line) {
                        section.entries.push(entry);
                    }
                }
                None => doc.preamble.push_str(line),
            }
        }
        if let Some(done) = current {
            doc.sections.push(done);
        }
        doc
    }

    pub fn render(&self) -> String {
        let mut out = self.preamble.clone();
        for section in &self.sections {
            out.push_str(&section.raw);
        }
        out
    }

    /// Append a brand-new section, separated from the previous text by a
    /// blank line.
    pub fn push_section(&mut self, name: &str, entries: &[(String, String)]) {
        let tail = self
            .sections
            .last()
            .map(|s| s.raw.as_str())
            .unwrap_or(self.preamble.as_str());
        let nl = line_ending(tail);
        let mut raw = String::new();
        if !tail.is_empty() {
            if !tail.ends_with('\n') {
                raw.push_str(nl);
            }
            raw.push_str(nl);
        }
        raw.push_str(&format!("[{name}]{nl}"));
        for (key, value) in entries {
            raw.push_str(&format_entry(key, value, nl));
        }
        self.sections.push(IniSection {
            name: name.to_string(),
            raw,
            entries: entries.to_vec(),
        });
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }
}

fn format_entry(key: &str, value: &str, nl: &str) -> String {
    if value.is_empty() {
        format!("{key} ={nl}")
    } else {
        format!("{key} = {value}{nl}")
    }
}

impl IniSection {
    /// Last value for `key` (keys are case-insensitive; later duplicates win).
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Rewrite the section body from `canonical` entries.
    ///
    /// Lines holding a canonical key are replaced in place (first occurrence;
    /// later duplicates are dropped). Lines whose key `owned` claims but which
    /// `canonical` no longer lists are dropped. Everything else is kept.
    /// Canonical keys not yet present are appended before trailing blank lines.
    pub fn rewrite(&mut self, canonical: &[(String, String)], owned: impl Fn(&str) -> bool) {
        let nl = line_ending(&self.raw);
        let mut lines = self.raw.split_inclusive('\n');
        let mut body = lines.next().unwrap_or_default().to_string();
        if !body.ends_with('\n') {
            body.push_str(nl);
        }
        let rest: Vec<&str> = lines.collect();

        // Trailing blank lines stay at the end of the section.
        let keep_until = rest
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map_or(0, |i| i + 1);
        let (content, trailer) = rest.split_at(keep_until);

        let mut emitted: Vec<&str> = Vec::new();
        for line in content {
            let Some((key, _)) = split_entry(line) else {
                body.push_str(line);
                if !line.ends_with('\n') {
                    body.push_str(nl);
                }
                continue;
            };
            if let Some((k, v)) = canonical.iter().find(|(k, _)| *k == key) {
                if !emitted.contains(&k.as_str()) {
                    body.push_str(&format_entry(k, v, nl));
                    emitted.push(k.as_str());
                }
            } else if !owned(&key) {
                body.push_str(line);
                if !line.ends_with('\n') {
                    body.push_str(nl);
                }
            }
        }
        for (k, v) in canonical {
            if !emitted.contains(&k.as_str()) {
                body.push_str(&format_entry(k, v, nl));
            }
        }
        for line in trailer {
            body.push_str(line);
        }

        let reparsed = IniDocument::parse(&body);
        self.entries = reparsed
            .sections
            .into_iter()
            .next()
            .map(|s| s.entries)
            .unwrap_or_default();
        self.raw = body;
    }
}
