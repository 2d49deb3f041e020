//! Turning fetched object bytes into events.

use serde::{Deserialize, Serialize};

use cloudtap_storage::ObjectDescriptor;

/// One ingested record, handed to the caller's event sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Object location the event was read from.
    pub source: String,
    /// Byte offset of the event within the object.
    pub offset: u64,
    pub body: String,
}

/// Events decoded from one fetched range.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transformed {
    pub events: Vec<Event>,
    /// Bytes of the range fully accounted for by `events`. The object's
    /// checkpoint advances by exactly this much; the rest is fetched again.
    pub consumed: usize,
}

pub trait Transformer: Send + Sync {
    /// Decode `data`, which starts at byte `offset` of `object`.
    /// `end_of_object` is set when `data` runs to the end of the object.
    fn transform(
        &self,
        object: &ObjectDescriptor,
        offset: u64,
        data: &[u8],
        end_of_object: bool,
    ) -> Transformed;
}

/// Newline-delimited records. Blank lines are dropped, invalid UTF-8 is replaced.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineTransformer;

impl Transformer for LineTransformer {
    fn transform(
        &self,
        object: &ObjectDescriptor,
        offset: u64,
        data: &[u8],
        end_of_object: bool,
    ) -> Transformed {
        let mut events = Vec::new();
        let mut push = |start: usize, end: usize| {
            let text = String::from_utf8_lossy(&data[start..end]);
            let line = text.trim_end_matches('\r');
            if !line.trim().is_empty() {
                events.push(Event {
                    source: object.location.clone(),
                    offset: offset + start as u64,
                    body: line.to_string(),
                });
            }
        };

        let mut line_start = 0;
        for (i, byte) in data.iter().enumerate() {
            if *byte == b'\n' {
                push(line_start, i);
                line_start = i + 1;
            }
        }

        // A trailing partial line is only complete at the end of the object.
        let consumed = if end_of_object && line_start < data.len() {
            push(line_start, data.len());
            data.len()
        } else {
            line_start
        };

        Transformed { events, consumed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn object() -> ObjectDescriptor {
        ObjectDescriptor {
            location: "logs/app.log".into(),
            size: 100,
            last_modified: Utc::now(),
            etag: None,
        }
    }

    #[test]
    fn splits_complete_lines_and_holds_partial() {
        let out = LineTransformer.transform(&object(), 10, b"alpha\nbeta\r\ngam", false);
        let bodies: Vec<&str> = out.events.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["alpha", "beta"]);
        assert_eq!(out.events[0].offset, 10);
        assert_eq!(out.events[1].offset, 16);
        assert_eq!(out.consumed, 12);
    }

    #[test]
    fn trailing_line_emitted_at_end_of_object() {
        let out = LineTransformer.transform(&object(), 0, b"a\n\n  \nlast", true);
        let bodies: Vec<&str> = out.events.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "last"]);
        assert_eq!(out.consumed, 10);
    }

    #[test]
    fn line_longer_than_range_consumes_nothing() {
        let out = LineTransformer.transform(&object(), 0, b"no newline yet", false);
        assert!(out.events.is_empty());
        assert_eq!(out.consumed, 0);
    }
}
