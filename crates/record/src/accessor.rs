//! Dotted-path accessor match/removal engine (C2).
//!
//! A pattern is a dotted key path with an optional trailing array index
//! (`a.b.c`, `a.b[2]`). `AccessorMatcher` compiles a list of such patterns
//! once and then runs all of them against a decoded record in a single
//! pass: for each top-level key it finds at most one pattern "anchored"
//! there (first-registered pattern wins, mirroring
//! `accessor_key_find_match`'s linear scan over the rule table), then
//! recurses into that key's value, dropping only the innermost matched
//! key/value pair and copying every sibling untouched. This is a direct
//! port of `flb_mp_accessor_keys_remove`/`accessor_sub_pack`.

use crate::mp::{ArrayHeader, MapHeader};
use crate::Error;
use rmpv::Value;

/// One segment of a compiled dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(u32),
}

/// A single compiled accessor pattern, e.g. `"a.b[2]"`.
#[derive(Debug, Clone)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compiles a dotted path into a pattern. Each dot-separated component
    /// may carry a single trailing `[n]` array index.
    pub fn compile(path: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        for component in path.split('.') {
            if component.is_empty() {
                return Err(Error::BadPattern);
            }
            match component.find('[') {
                None => segments.push(Segment::Key(component.to_string())),
                Some(bracket) => {
                    let (key, rest) = component.split_at(bracket);
                    if key.is_empty() || !rest.ends_with(']') {
                        return Err(Error::BadPattern);
                    }
                    segments.push(Segment::Key(key.to_string()));
                    let digits = &rest[1..rest.len() - 1];
                    let index: u32 = digits.parse().map_err(|_| Error::BadPattern)?;
                    segments.push(Segment::Index(index));
                }
            }
        }
        if segments.is_empty() {
            return Err(Error::BadPattern);
        }
        Ok(Self { segments })
    }
}

/// Outcome of an [`AccessorMatcher::remove`] call.
#[derive(Debug)]
pub enum Outcome {
    /// No pattern matched; the caller should keep using the original buffer.
    Unmodified,
    /// At least one pattern matched; holds the re-encoded record.
    Modified(Vec<u8>),
}

/// A compiled set of accessor patterns, run together against a record.
#[derive(Debug, Clone)]
pub struct AccessorMatcher {
    patterns: Vec<Pattern>,
}

impl AccessorMatcher {
    /// Compiles a matcher from a list of dotted-path strings.
    pub fn new<I, S>(paths: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = paths
            .into_iter()
            .map(|p| Pattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Number of compiled patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// True if no pattern was compiled.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// For each top-level key index in `map`, the rule id of the first
    /// pattern anchored there, if any. Exposed mainly for tests that check
    /// the "first registered pattern wins an anchor" tie-break rule.
    pub fn anchors(&self, map: &[(Value, Value)]) -> Vec<Option<usize>> {
        let mut slots = vec![None; map.len()];
        for (rule_id, pattern) in self.patterns.iter().enumerate() {
            if let Some(anchor) = find_anchor(map, &pattern.segments) {
                if slots[anchor].is_none() {
                    slots[anchor] = Some(rule_id);
                }
            }
        }
        slots
    }

    /// Decodes `record`, applies every compiled pattern, and re-encodes the
    /// result. Returns [`Outcome::Unmodified`] untouched if nothing matched,
    /// so the caller can keep the original bytes instead of paying for a
    /// pointless re-encode.
    pub fn remove(&self, record: &[u8]) -> Result<Outcome, Error> {
        let value = rmpv::decode::read_value(&mut &record[..]).map_err(|_| Error::BadRecord)?;
        let Value::Map(map) = value else {
            return Err(Error::BadRecord);
        };
        if map.is_empty() || self.patterns.is_empty() {
            return Ok(Outcome::Unmodified);
        }

        let anchors = self.anchors(&map);
        if anchors.iter().all(Option::is_none) {
            return Ok(Outcome::Unmodified);
        }

        let mut rewritten = Vec::with_capacity(map.len());
        for (idx, (key, val)) in map.into_iter().enumerate() {
            match anchors[idx] {
                None => rewritten.push((key, val)),
                Some(rule_id) => {
                    let remaining = &self.patterns[rule_id].segments[1..];
                    if remaining.is_empty() {
                        continue;
                    }
                    rewritten.push((key, remove_along_path(val, remaining)));
                }
            }
        }

        let mut out = Vec::new();
        encode_value(&Value::Map(rewritten), &mut out)?;
        Ok(Outcome::Modified(out))
    }
}

fn key_matches(key: &Value, name: &str) -> bool {
    key.as_str() == Some(name)
}

/// Returns the top-level key index in `map` where `segments` (a full
/// pattern) first matches, or `None`.
fn find_anchor(map: &[(Value, Value)], segments: &[Segment]) -> Option<usize> {
    let (first, rest) = segments.split_first()?;
    let Segment::Key(name) = first else {
        return None;
    };
    for (idx, (key, val)) in map.iter().enumerate() {
        if key_matches(key, name) && (rest.is_empty() || descend_matches(val, rest)) {
            return Some(idx);
        }
    }
    None
}

/// Does `remaining` (a pattern suffix) match somewhere under `value`?
fn descend_matches(value: &Value, remaining: &[Segment]) -> bool {
    match (&remaining[0], value) {
        (Segment::Key(name), Value::Map(entries)) => entries
            .iter()
            .find(|(k, _)| key_matches(k, name))
            .is_some_and(|(_, v)| remaining.len() == 1 || descend_matches(v, &remaining[1..])),
        (Segment::Index(i), Value::Array(items)) => items
            .get(*i as usize)
            .is_some_and(|v| remaining.len() == 1 || descend_matches(v, &remaining[1..])),
        _ => false,
    }
}

/// Rebuilds `value` with the innermost pair/element named by `remaining`
/// elided, copying every sibling unchanged.
fn remove_along_path(value: Value, remaining: &[Segment]) -> Value {
    match (&remaining[0], value) {
        (Segment::Key(name), Value::Map(entries)) => {
            let mut out = Vec::with_capacity(entries.len());
            for (key, val) in entries {
                if key_matches(&key, name) {
                    if remaining.len() > 1 {
                        out.push((key, remove_along_path(val, &remaining[1..])));
                    }
                    // remaining.len() == 1: elide this pair entirely.
                } else {
                    out.push((key, val));
                }
            }
            Value::Map(out)
        }
        (Segment::Index(target), Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                if i as u32 == *target {
                    if remaining.len() > 1 {
                        out.push(remove_along_path(item, &remaining[1..]));
                    }
                } else {
                    out.push(item);
                }
            }
            Value::Array(out)
        }
        (_, other) => other,
    }
}

/// Recursively encodes a decoded `rmpv::Value` using the widest-header
/// builder from [`crate::mp`], so a record rewritten by the accessor engine
/// uses the same header form a freshly built one would.
pub fn encode_value(value: &Value, writer: &mut Vec<u8>) -> Result<(), Error> {
    match value {
        Value::Map(entries) => {
            let mut header = MapHeader::open(writer);
            for (key, val) in entries {
                let _ = header.entry();
                encode_value(key, writer)?;
                header.record_write();
                encode_value(val, writer)?;
                header.record_write();
            }
            header.close(writer)
        }
        Value::Array(items) => {
            let mut header = ArrayHeader::open(writer);
            for item in items {
                let _ = header.entry();
                encode_value(item, writer)?;
                header.record_write();
            }
            header.close(writer)
        }
        scalar => {
            rmpv::encode::write_value(writer, scalar).map_err(|_| Error::Overflow)?;
            Ok(())
        }
    }
}
