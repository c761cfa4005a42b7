//! iCalendar (RFC 5545) reading and writing for VTODO components.
//!
//! Only the parts of the format todos need are understood. Properties the
//! model does not know about, including nested components such as VALARM,
//! are kept as raw [`Property`] values and written back in order.

use crate::errors::{AppError, AppResult};
use crate::models::{Timestamp, Todo, TodoStatus, MAX_PERCENT, MAX_PRIORITY};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const PRODID: &str = "-//todo-vdir//EN";
const FOLD_WIDTH: usize = 75;

static DATE_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})(\d{2})(\d{2})(?:T(\d{2})(\d{2})(\d{2})(Z)?)?$").expect("valid regex")
});

/// Turns file contents into todos and back.
pub trait RecordCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> AppResult<Vec<Todo>>;
    fn encode(&self, todo: &Todo) -> AppResult<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(default)]
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl Property {
    fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            value: value.into(),
        }
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn render(&self) -> String {
        let mut line = self.name.clone();
        for (key, value) in &self.params {
            line.push(';');
            line.push_str(key);
            line.push('=');
            if value.contains(|c: char| matches!(c, ':' | ';' | ',')) {
                line.push('"');
                line.push_str(value);
                line.push('"');
            } else {
                line.push_str(value);
            }
        }
        line.push(':');
        line.push_str(&self.value);
        line
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IcalCodec;

impl RecordCodec for IcalCodec {
    fn decode(&self, bytes: &[u8]) -> AppResult<Vec<Todo>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|error| AppError::Codec(format!("file is not valid UTF-8: {}", error)))?;

        let mut todos = Vec::new();
        let mut current: Option<Vec<Property>> = None;
        let mut nested_depth = 0usize;

        for line in unfold(text) {
            let property = parse_line(&line)?;
            let is_begin = property.name == "BEGIN";
            let is_end = property.name == "END";
            let is_vtodo = property.value.trim().eq_ignore_ascii_case("VTODO");

            let Some(properties) = current.as_mut() else {
                if is_begin && is_vtodo {
                    current = Some(Vec::new());
                }
                continue;
            };
            if is_end && is_vtodo && nested_depth == 0 {
                let finished = std::mem::take(properties);
                current = None;
                todos.push(todo_from_properties(finished)?);
                continue;
            }
            if is_begin {
                nested_depth += 1;
            } else if is_end {
                nested_depth = nested_depth.saturating_sub(1);
            }
            properties.push(property);
        }

        if current.is_some() {
            return Err(AppError::Codec("unterminated VTODO component".to_string()));
        }
        Ok(todos)
    }

    fn encode(&self, todo: &Todo) -> AppResult<Vec<u8>> {
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            format!("PRODID:{}", PRODID),
            "BEGIN:VTODO".to_string(),
        ];
        for property in todo_to_properties(todo)? {
            lines.push(property.render());
        }
        lines.push("END:VTODO".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut output = String::new();
        for line in lines {
            fold_into(&mut output, &line);
        }
        Ok(output.into_bytes())
    }
}

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(continuation) = raw.strip_prefix(|c: char| c == ' ' || c == '\t') {
            if let Some(last) = lines.last_mut() {
                last.push_str(continuation);
                continue;
            }
        }
        if !raw.trim().is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

fn fold_into(output: &mut String, line: &str) {
    let mut width = 0usize;
    for ch in line.chars() {
        let len = ch.len_utf8();
        if width + len > FOLD_WIDTH {
            output.push_str("\r\n ");
            width = 1;
        }
        output.push(ch);
        width += len;
    }
    output.push_str("\r\n");
}

fn parse_line(line: &str) -> AppResult<Property> {
    let mut in_quotes = false;
    let mut split_at = None;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                split_at = Some(idx);
                break;
            }
            _ => {}
        }
    }
    let Some(split_at) = split_at else {
        return Err(AppError::Codec(format!("content line without value: {}", line)));
    };

    let (head, value) = (&line[..split_at], &line[split_at + 1..]);
    let mut segments = split_unquoted(head, ';').into_iter();
    let name = segments.next().unwrap_or_default().trim().to_ascii_uppercase();
    if name.is_empty() {
        return Err(AppError::Codec(format!("content line without name: {}", line)));
    }

    let mut params = Vec::new();
    for segment in segments {
        let Some((key, raw)) = segment.split_once('=') else {
            return Err(AppError::Codec(format!("malformed parameter '{}' in {}", segment, name)));
        };
        params.push((key.trim().to_ascii_uppercase(), raw.trim_matches('"').to_string()));
    }

    Ok(Property {
        name,
        params,
        value: value.to_string(),
    })
}

fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in input.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == separator && !in_quotes {
            parts.push(&input[start..idx]);
            start = idx + ch.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unescape_text(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => output.push('\n'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

fn escape_text(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => output.push_str("\\\\"),
            ';' => output.push_str("\\;"),
            ',' => output.push_str("\\,"),
            '\n' => output.push_str("\\n"),
            '\r' => {}
            other => output.push(other),
        }
    }
    output
}

fn parse_timestamp(property: &Property) -> AppResult<Timestamp> {
    let value = property.value.trim();
    let captures = DATE_VALUE.captures(value).ok_or_else(|| {
        AppError::Codec(format!("invalid date value '{}' for {}", value, property.name))
    })?;
    let number = |idx: usize| -> u32 {
        captures
            .get(idx)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };

    let date = NaiveDate::from_ymd_opt(number(1) as i32, number(2), number(3))
        .ok_or_else(|| AppError::Codec(format!("invalid date '{}' for {}", value, property.name)))?;
    if captures.get(4).is_none() {
        return Ok(Timestamp::Date { date });
    }

    let time = NaiveTime::from_hms_opt(number(4), number(5), number(6))
        .ok_or_else(|| AppError::Codec(format!("invalid time '{}' for {}", value, property.name)))?;
    let local = NaiveDateTime::new(date, time);
    if captures.get(7).is_some() {
        return Ok(Timestamp::Utc {
            at: Utc.from_utc_datetime(&local),
        });
    }
    match property.param("TZID") {
        Some(tzid) => Ok(Timestamp::Zoned {
            local,
            tzid: tzid.to_string(),
        }),
        None => Ok(Timestamp::Floating { local }),
    }
}

fn timestamp_property(name: &str, timestamp: &Timestamp) -> Property {
    match timestamp {
        Timestamp::Date { date } => Property {
            name: name.to_string(),
            params: vec![("VALUE".to_string(), "DATE".to_string())],
            value: date.format("%Y%m%d").to_string(),
        },
        Timestamp::Floating { local } => Property::new(name, local.format("%Y%m%dT%H%M%S").to_string()),
        Timestamp::Utc { at } => Property::new(name, at.format("%Y%m%dT%H%M%SZ").to_string()),
        Timestamp::Zoned { local, tzid } => Property {
            name: name.to_string(),
            params: vec![("TZID".to_string(), tzid.clone())],
            value: local.format("%Y%m%dT%H%M%S").to_string(),
        },
    }
}

fn parse_small_int(property: &Property, max: u8) -> AppResult<u8> {
    property
        .value
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|value| *value <= max)
        .ok_or_else(|| AppError::Codec(format!("invalid {} value '{}'", property.name, property.value)))
}

fn todo_from_properties(properties: Vec<Property>) -> AppResult<Todo> {
    let mut todo = Todo::draft("");
    for property in properties {
        let name = property.name.clone();
        match name.as_str() {
            "UID" => todo.uid = property.value.trim().to_string(),
            "SUMMARY" => todo.summary = unescape_text(&property.value),
            "DESCRIPTION" => todo.description = Some(unescape_text(&property.value)),
            "LOCATION" => todo.location = Some(unescape_text(&property.value)),
            "CATEGORIES" => todo.categories.extend(
                split_categories(&property.value)
                    .into_iter()
                    .filter(|value| !value.is_empty()),
            ),
            "PRIORITY" => todo.priority = Some(parse_small_int(&property, MAX_PRIORITY)?).filter(|value| *value > 0),
            "PERCENT-COMPLETE" => todo.percent_complete = Some(parse_small_int(&property, MAX_PERCENT)?),
            "STATUS" => match TodoStatus::parse(&property.value) {
                Some(status) => todo.status = status,
                None => todo.extra.push(property),
            },
            "DUE" => todo.due = Some(parse_timestamp(&property)?),
            "DTSTART" => todo.start = Some(parse_timestamp(&property)?),
            "CREATED" => todo.created_at = Some(parse_timestamp(&property)?),
            "COMPLETED" => todo.completed_at = Some(parse_timestamp(&property)?),
            "LAST-MODIFIED" => todo.last_modified = Some(parse_timestamp(&property)?),
            "DTSTAMP" => todo.dtstamp = Some(parse_timestamp(&property)?),
            _ => todo.extra.push(property),
        }
    }
    todo.mark_clean();
    Ok(todo)
}

fn split_categories(raw: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push('\\');
                    current.push(next);
                }
            }
            ',' => values.push(unescape_text(std::mem::take(&mut current).trim())),
            other => current.push(other),
        }
    }
    values.push(unescape_text(current.trim()));
    values
}

fn todo_to_properties(todo: &Todo) -> AppResult<Vec<Property>> {
    if todo.uid.is_empty() {
        return Err(AppError::Codec("cannot encode a todo without UID".to_string()));
    }
    // Never write what `decode` would refuse.
    todo.validate()?;

    let mut properties = vec![Property::new("UID", todo.uid.clone())];
    properties.push(Property::new("SUMMARY", escape_text(&todo.summary)));
    if let Some(description) = &todo.description {
        properties.push(Property::new("DESCRIPTION", escape_text(description)));
    }
    if let Some(location) = &todo.location {
        properties.push(Property::new("LOCATION", escape_text(location)));
    }
    if !todo.categories.is_empty() {
        let joined = todo
            .categories
            .iter()
            .map(|value| escape_text(value))
            .collect::<Vec<_>>()
            .join(",");
        properties.push(Property::new("CATEGORIES", joined));
    }
    if let Some(priority) = todo.priority {
        properties.push(Property::new("PRIORITY", priority.to_string()));
    }
    if let Some(percent) = todo.percent_complete {
        properties.push(Property::new("PERCENT-COMPLETE", percent.to_string()));
    }
    properties.push(Property::new("STATUS", todo.status.as_str()));

    let stamps = [
        ("DUE", &todo.due),
        ("DTSTART", &todo.start),
        ("CREATED", &todo.created_at),
        ("COMPLETED", &todo.completed_at),
        ("LAST-MODIFIED", &todo.last_modified),
        ("DTSTAMP", &todo.dtstamp),
    ];
    for (name, value) in stamps {
        if let Some(timestamp) = value {
            properties.push(timestamp_property(name, timestamp));
        }
    }

    properties.extend(todo.extra.iter().cloned());
    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(body: &str) -> Vec<u8> {
        format!("BEGIN:VCALENDAR\nBEGIN:VTODO\n{}END:VTODO\nEND:VCALENDAR\n", body).into_bytes()
    }

    #[test]
    fn decodes_basic_fields() {
        let todos = IcalCodec
            .decode(&wrap(
                "UID:abc\nSUMMARY:harhar\nPERCENT-COMPLETE:78\nPRIORITY:9\nLOCATION:Boston\nSTATUS:IN-PROCESS\n",
            ))
            .expect("decode");
        assert_eq!(todos.len(), 1);
        let todo = &todos[0];
        assert_eq!(todo.uid, "abc");
        assert_eq!(todo.summary, "harhar");
        assert_eq!(todo.percent_complete, Some(78));
        assert_eq!(todo.priority, Some(9));
        assert_eq!(todo.location.as_deref(), Some("Boston"));
        assert_eq!(todo.status, TodoStatus::InProgress);
        assert!(!todo.is_dirty());
    }

    #[test]
    fn decodes_every_todo_in_a_shared_file() {
        let todos = IcalCodec
            .decode(&wrap("SUMMARY:a\nEND:VTODO\nBEGIN:VTODO\nSUMMARY:b\n"))
            .expect("decode");
        let summaries: Vec<_> = todos.iter().map(|todo| todo.summary.as_str()).collect();
        assert_eq!(summaries, vec!["a", "b"]);
    }

    #[test]
    fn date_values_keep_their_zone_information() {
        let todos = IcalCodec
            .decode(&wrap(
                "UID:1\nDUE;VALUE=DATE-TIME;TZID=CET:20170304T180000\nDTSTART;VALUE=DATE:20170301\nCREATED:20170101T120000Z\nCOMPLETED:20170102T080000\n",
            ))
            .expect("decode");
        let todo = &todos[0];
        let local = NaiveDate::from_ymd_opt(2017, 3, 4)
            .and_then(|date| date.and_hms_opt(18, 0, 0))
            .expect("valid");
        assert_eq!(
            todo.due,
            Some(Timestamp::Zoned {
                local,
                tzid: "CET".to_string()
            })
        );
        assert_eq!(
            todo.start,
            Some(Timestamp::Date {
                date: NaiveDate::from_ymd_opt(2017, 3, 1).expect("valid")
            })
        );
        assert!(matches!(todo.created_at, Some(Timestamp::Utc { .. })));
        assert!(matches!(todo.completed_at, Some(Timestamp::Floating { .. })));
    }

    #[test]
    fn unfolds_and_unescapes_text() {
        let todos = IcalCodec
            .decode(&wrap("UID:1\nDESCRIPTION:Lots of text\\, really.\n  Yum!\\nMore\nCATEGORIES:home,work\\,ish\n"))
            .expect("decode");
        assert_eq!(todos[0].description.as_deref(), Some("Lots of text, really. Yum!\nMore"));
        assert_eq!(todos[0].categories, vec!["home".to_string(), "work,ish".to_string()]);
    }

    #[test]
    fn rejects_malformed_content() {
        assert!(IcalCodec.decode(&wrap("UID:1\nthis line has no value\n")).is_err());
        assert!(IcalCodec.decode(&wrap("UID:1\nDUE:tomorrow\n")).is_err());
        assert!(IcalCodec.decode(b"BEGIN:VTODO\nSUMMARY:x\n").is_err());
        assert!(IcalCodec.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn files_without_todos_decode_to_nothing() {
        let todos = IcalCodec
            .decode(b"BEGIN:VCALENDAR\nBEGIN:VEVENT\nSUMMARY:party\nEND:VEVENT\nEND:VCALENDAR\n")
            .expect("decode");
        assert!(todos.is_empty());
    }

    #[test]
    fn encoding_preserves_unknown_properties_and_alarms() {
        let source = wrap(
            "UID:keep\nSUMMARY:with alarm\nX-CUSTOM;X-PARAM=\"a:b\":value\nBEGIN:VALARM\nACTION:DISPLAY\nTRIGGER:-PT15M\nEND:VALARM\n",
        );
        let todo = IcalCodec.decode(&source).expect("decode").remove(0);
        let encoded = IcalCodec.encode(&todo).expect("encode");
        let text = String::from_utf8(encoded.clone()).expect("utf8");
        assert!(text.contains("X-CUSTOM;X-PARAM=\"a:b\":value\r\n"));
        assert!(text.contains("BEGIN:VALARM\r\nACTION:DISPLAY\r\n"));

        let again = IcalCodec.decode(&encoded).expect("decode again").remove(0);
        assert_eq!(again.extra, todo.extra);
        assert_eq!(again.summary, "with alarm");
    }

    #[test]
    fn long_lines_are_folded() {
        let mut todo = Todo::draft(&"x".repeat(200));
        todo.uid = "fold".to_string();
        let text = String::from_utf8(IcalCodec.encode(&todo).expect("encode")).expect("utf8");
        assert!(text.split("\r\n").all(|line| line.len() <= FOLD_WIDTH));
        let decoded = IcalCodec.decode(text.as_bytes()).expect("decode");
        assert_eq!(decoded[0].summary.len(), 200);
    }

    #[test]
    fn refuses_to_encode_without_uid() {
        assert!(IcalCodec.encode(&Todo::draft("nameless")).is_err());
    }

    #[test]
    fn refuses_to_encode_values_it_could_not_decode() {
        let mut todo = Todo::draft("too urgent");
        todo.uid = "urgent".to_string();
        todo.priority = Some(MAX_PRIORITY + 1);
        assert!(matches!(IcalCodec.encode(&todo), Err(AppError::InvalidPriority(_))));

        todo.priority = Some(MAX_PRIORITY);
        let decoded = IcalCodec.decode(&IcalCodec.encode(&todo).expect("encode")).expect("decode");
        assert_eq!(decoded[0].priority, Some(MAX_PRIORITY));
    }
}
