use std::collections::HashMap;

/// One article reference inside an NZB `<file>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub message_id: String,
    /// 1-based position within the file, per the `number` attribute.
    pub number: u32,
    /// Declared size in bytes. NZB-declared sizes are frequently wrong;
    /// [`crate::size_oracle`] corrects them once the real size is known.
    pub declared_bytes: u64,
}

/// One `<file>` entry: a poster, subject, newsgroups, and its segments.
#[derive(Debug, Clone)]
pub struct NzbFile {
    pub subject: String,
    pub poster: String,
    pub date: i64,
    pub groups: Vec<String>,
    pub segments: Vec<Segment>,
}

impl NzbFile {
    /// Segments in article order. NZB producers do not guarantee `<segments>`
    /// child order matches `number`, so callers must sort explicitly
    /// (spec §4.8 step 1 edge case).
    pub fn segments_in_order(&self) -> Vec<&Segment> {
        let mut segs: Vec<&Segment> = self.segments.iter().collect();
        segs.sort_by_key(|s| s.number);
        segs
    }

    pub fn total_declared_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.declared_bytes).sum()
    }
}

/// Free-form `<head><meta type="..">value</meta></head>` entries (e.g.
/// `password`, `tag`). Order-preserving is unnecessary; last value wins on
/// duplicate keys, matching how every known NZB producer treats them.
#[derive(Debug, Clone, Default)]
pub struct NzbMeta(pub HashMap<String, String>);

impl NzbMeta {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}
