//! Section-aware markdown editing.
//!
//! A document is a preamble followed by sections, each starting at a line
//! that begins with `# `. Parsing keeps every byte of the original text, so a
//! document that is parsed and rendered without edits comes back unchanged,
//! and an edit to one section never touches the text of another.
//!
//! Lines inside fenced code blocks are never treated as headings.

/// A parsed markdown document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    /// Text before the first heading.
    preamble: String,
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    title: String,
    /// The raw heading line, including its newline when present.
    heading: String,
    body: String,
}

impl Document {
    /// Parses `text` into a preamble and ordered sections.
    pub fn parse(text: &str) -> Self {
        let mut document = Self::default();
        let mut in_fence = false;

        for line in text.split_inclusive('\n') {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }

            if !in_fence && let Some(title) = heading_title(line) {
                document.sections.push(Section {
                    title: title.to_string(),
                    heading: line.to_string(),
                    body: String::new(),
                });
                continue;
            }

            match document.sections.last_mut() {
                Some(section) => section.body.push_str(line),
                None => document.preamble.push_str(line),
            }
        }

        document
    }

    /// Section titles in document order.
    pub fn sections(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.title.as_str()).collect()
    }

    /// The body of the first section whose title matches, if any.
    pub fn section(&self, title: &str) -> Option<&str> {
        let title = title.trim();
        self.sections
            .iter()
            .find(|s| s.title == title)
            .map(|s| s.body.as_str())
    }

    /// Appends `entry` at the end of the matching section's body.
    ///
    /// If no section matches, a new section is added at the end of the
    /// document. Only the amended section (or, for a new section, the
    /// trailing newlines of the previous last block) is rewritten.
    ///
    /// The entry can never start a section of its own: lines that would parse
    /// as `# ` headings are escaped, and an unclosed fence is closed.
    pub fn append_under_section(&mut self, title: &str, entry: &str) {
        let title = title.trim();
        let entry = contained(entry.trim_end_matches('\n'));

        let index = match self.sections.iter().position(|s| s.title == title) {
            Some(i) => i,
            None => {
                self.separate_tail();
                self.sections.push(Section {
                    title: title.to_string(),
                    heading: format!("# {title}\n"),
                    body: String::new(),
                });
                self.sections.len() - 1
            }
        };

        let is_last = index + 1 == self.sections.len();
        let section = &mut self.sections[index];
        if !section.heading.ends_with('\n') {
            section.heading.push('\n');
        }

        let existing = section.body.trim_end();
        let mut body = if existing.is_empty() {
            String::from("\n")
        } else {
            format!("{existing}\n\n")
        };
        body.push_str(&entry);
        body.push('\n');
        if !is_last {
            body.push('\n');
        }
        section.body = body;
    }

    /// Renders the document back to text.
    pub fn render(&self) -> String {
        let mut out = self.preamble.clone();
        for section in &self.sections {
            out.push_str(&section.heading);
            out.push_str(&section.body);
        }
        out
    }

    /// Makes sure whatever currently ends the document is followed by a
    /// blank line, so a new heading starts a fresh block.
    fn separate_tail(&mut self) {
        let has_sections = !self.sections.is_empty();
        let tail = match self.sections.last_mut() {
            Some(section) => {
                if !section.heading.ends_with('\n') {
                    section.heading.push('\n');
                }
                &mut section.body
            }
            None => &mut self.preamble,
        };

        if tail.is_empty() {
            if has_sections {
                tail.push('\n');
            }
            return;
        }
        while !tail.ends_with("\n\n") {
            tail.push('\n');
        }
    }
}

/// `entry` rewritten so that, once appended, it stays inside its section.
fn contained(entry: &str) -> String {
    let mut out = String::with_capacity(entry.len());
    let mut in_fence = false;
    for line in entry.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && heading_title(line).is_some() {
            out.push('\\');
        }
        out.push_str(line);
    }
    if in_fence {
        out.push_str("\n```");
    }
    out
}

/// Returns the title if `line` is a top-level `# ` heading.
fn heading_title(line: &str) -> Option<&str> {
    line.strip_prefix("# ").map(str::trim)
}
