//! Decoding one raw frame into a structured record.
//!
//! Decoding is pure and total over any byte slice: malformed input yields a
//! typed [`DecodeError`], never a panic and never a partial record. Absent
//! trailing sections are not an error — the firmware omits them depending on
//! the active measurement mode.

use crate::error::DecodeError;
use crate::protocol::frame::{END_MARKER, START_MARKER};
use crate::protocol::units;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;

/// Header/measurement separator (ETB).
const SECTION_SEPARATOR: char = '\u{17}';
/// Record separator truncating the measurement half (RS).
const RECORD_SEPARATOR: char = '\u{1e}';

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameHeader {
    /// Whitespace-normalized header text, as printed by the instrument.
    pub raw: String,
    /// Instrument model, e.g. "CX-505".
    pub model: Option<String>,
    /// Instrument serial number.
    pub serial: Option<String>,
    /// Instrument status word.
    pub status: Option<String>,
    /// Active measuring range.
    pub range: Option<String>,
    /// Active measuring mode.
    pub mode: Option<String>,
}

/// Parsed measurement half of a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Sequence id (text after the colon in section 0, or the whole section).
    pub sequence: Option<String>,
    /// Primary value; `None` when the numeric text is unparsable.
    pub value: Option<f64>,
    /// Primary value unit label as printed, e.g. "pH".
    pub unit: Option<String>,
    /// Temperature value.
    pub temperature: Option<f64>,
    /// Temperature unit label as printed, e.g. "C".
    pub temperature_unit: Option<String>,
    /// Date string (section 3), verbatim.
    pub date: Option<String>,
    /// Time string (section 4), verbatim.
    pub time: Option<String>,
    /// Combined date+time parsed as day-month-year hour:minute:second.
    pub timestamp: Option<NaiveDateTime>,
    /// Sections beyond index 4, preserved as-is.
    pub extra_fields: Vec<String>,
    /// Semantic aliases for recognized units, e.g. `value_ph`,
    /// `temperature_celsius`.
    pub derived: BTreeMap<String, f64>,
}

/// One fully decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    /// Header half.
    pub header: FrameHeader,
    /// Measurement half.
    pub measurement: Measurement,
}

/// Decode a single raw frame (start marker through end marker, with optional
/// trailing CR/LF).
pub fn decode_frame(frame: &[u8]) -> Result<DecodedFrame, DecodeError> {
    if is_blank(frame) {
        return Err(DecodeError::Empty);
    }
    if frame[0] != START_MARKER {
        return Err(DecodeError::MissingStart);
    }
    let end = frame
        .iter()
        .position(|&b| b == END_MARKER)
        .ok_or(DecodeError::MissingEnd)?;

    let payload = String::from_utf8_lossy(&frame[1..end]);
    let (header_half, measurement_half) = match payload.split_once(SECTION_SEPARATOR) {
        Some((h, m)) => (h, m),
        None => (payload.as_ref(), ""),
    };
    // Anything after a record separator belongs to the next logical record.
    let measurement_half = measurement_half
        .split(RECORD_SEPARATOR)
        .next()
        .unwrap_or_default();

    Ok(DecodedFrame {
        header: parse_header(header_half),
        measurement: parse_measurement(measurement_half),
    })
}

/// True when the slice carries no printable content at all.
fn is_blank(bytes: &[u8]) -> bool {
    bytes.is_empty()
        || String::from_utf8_lossy(bytes)
            .chars()
            .all(|c| c.is_whitespace())
}

/// Normalize one section: control bytes and Unicode whitespace become plain
/// spaces, degree signs are folded, runs of spaces collapse, ends trimmed.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        let mapped = match c {
            '\u{2103}' => Some('C'), // ℃
            '\u{2109}' => Some('F'), // ℉
            '\u{b0}' | '\u{ba}' => None,
            c if c.is_control() || c.is_whitespace() => Some(' '),
            c => Some(c),
        };
        match mapped {
            Some(' ') => {
                if !last_space {
                    out.push(' ');
                    last_space = true;
                }
            }
            Some(c) => {
                out.push(c);
                last_space = false;
            }
            None => {}
        }
    }
    out.trim_end().to_string()
}

/// Split a half into `#`-delimited, normalized sections. A leading empty
/// section (payloads usually begin with `#`) is dropped.
fn sections(half: &str) -> Vec<String> {
    let mut secs: Vec<String> = half.split('#').map(normalize).collect();
    if secs.first().is_some_and(String::is_empty) {
        secs.remove(0);
    }
    secs
}

fn nonempty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

fn parse_header(half: &str) -> FrameHeader {
    let secs = sections(half);
    let (model, serial) = match secs.first() {
        Some(first) => match first.split_once("S/N") {
            Some((m, s)) => (nonempty(m), nonempty(s)),
            None => (nonempty(first), None),
        },
        None => (None, None),
    };
    FrameHeader {
        raw: normalize(half),
        model,
        serial,
        status: secs.get(1).map(String::as_str).and_then(nonempty),
        range: secs.get(2).map(String::as_str).and_then(nonempty),
        mode: secs.get(3).map(String::as_str).and_then(nonempty),
    }
}

/// Parse "value unit-label": numeric part before the first space (comma
/// accepted as decimal point), label after it. An unparsable numeric part
/// yields `None` rather than an error.
fn split_value_unit(section: &str) -> (Option<f64>, Option<String>) {
    let (num_text, label) = match section.split_once(' ') {
        Some((n, u)) => (n, nonempty(u)),
        None => (section, None),
    };
    let value = num_text.replace(',', ".").parse::<f64>().ok();
    (value, label)
}

fn parse_measurement(half: &str) -> Measurement {
    let secs = sections(half);

    let sequence = secs.first().and_then(|s| match s.split_once(':') {
        Some((_, rest)) => nonempty(rest),
        None => nonempty(s),
    });

    let mut derived = BTreeMap::new();

    let (value, unit) = secs
        .get(1)
        .map(|s| split_value_unit(s))
        .unwrap_or((None, None));
    if let (Some(v), Some(label)) = (value, unit.as_deref()) {
        if let Some(quantity) = units::quantity_for(&units::slug(label)) {
            derived.insert(format!("value_{quantity}"), v);
        }
    }

    let (temperature, temperature_unit) = secs
        .get(2)
        .map(|s| split_value_unit(s))
        .unwrap_or((None, None));
    if let (Some(t), Some(label)) = (temperature, temperature_unit.as_deref()) {
        if let Some(scale) = units::temperature_scale_for(&units::slug(label)) {
            derived.insert(format!("temperature_{scale}"), t);
        }
    }

    let date = secs.get(3).map(String::as_str).and_then(nonempty);
    let time = secs.get(4).map(String::as_str).and_then(nonempty);
    let timestamp = match (date.as_deref(), time.as_deref()) {
        (Some(d), Some(t)) => parse_timestamp(d, t),
        _ => None,
    };

    let extra_fields = if secs.len() > 5 {
        secs[5..].to_vec()
    } else {
        Vec::new()
    };

    Measurement {
        sequence,
        value,
        unit,
        temperature,
        temperature_unit,
        date,
        time,
        timestamp,
        extra_fields,
        derived,
    }
}

/// Combine date and time sections; parse failure is silently ignored.
fn parse_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let merged = format!("{date} {time}");
    NaiveDateTime::parse_from_str(&merged, "%d-%m-%Y %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&merged, "%d-%m-%y %H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn build_frame(header: &str, measurement: &str) -> Vec<u8> {
        let mut v = vec![START_MARKER];
        v.extend_from_slice(header.as_bytes());
        v.push(0x17);
        v.extend_from_slice(measurement.as_bytes());
        v.push(END_MARKER);
        v.extend_from_slice(b"\r\n");
        v
    }

    #[test]
    fn decodes_reference_frame() {
        // 0x01 "#CX-505 S/N 123#READY" 0x17 0x02 "#001# 7.12 pH# 24.5 C" 0x03 0x0d 0x0a
        let frame = build_frame("#CX-505 S/N 123#READY", "\u{2}#001# 7.12 pH# 24.5 C");
        let decoded = decode_frame(&frame).unwrap();

        assert_eq!(decoded.header.model.as_deref(), Some("CX-505"));
        assert_eq!(decoded.header.serial.as_deref(), Some("123"));
        assert_eq!(decoded.header.status.as_deref(), Some("READY"));

        let m = &decoded.measurement;
        assert_eq!(m.sequence.as_deref(), Some("001"));
        assert_eq!(m.value, Some(7.12));
        assert_eq!(m.unit.as_deref(), Some("pH"));
        assert_eq!(m.derived.get("value_ph"), Some(&7.12));
        assert_eq!(m.temperature, Some(24.5));
        assert_eq!(m.temperature_unit.as_deref(), Some("C"));
        assert_eq!(m.derived.get("temperature_celsius"), Some(&24.5));
    }

    #[test]
    fn missing_trailing_sections_is_not_an_error() {
        let frame = build_frame("#CX-505#READY", "#002# 6.9 pH");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.sequence.as_deref(), Some("002"));
        assert!(m.temperature.is_none());
        assert!(m.date.is_none());
        assert!(m.time.is_none());
        assert!(m.timestamp.is_none());
        assert!(m.extra_fields.is_empty());
    }

    #[test]
    fn rejects_frame_without_start_marker() {
        assert_eq!(
            decode_frame(b"#001# 7.0 pH\x03"),
            Err(DecodeError::MissingStart)
        );
    }

    #[test]
    fn rejects_blank_frame() {
        assert_eq!(decode_frame(b""), Err(DecodeError::Empty));
        assert_eq!(decode_frame(b"   \r\n"), Err(DecodeError::Empty));
    }

    #[test]
    fn rejects_frame_without_end_marker() {
        assert_eq!(
            decode_frame(b"\x01#001# 7.0 pH"),
            Err(DecodeError::MissingEnd)
        );
    }

    #[test]
    fn parses_timestamp_from_date_and_time() {
        let frame = build_frame("#CX-505", "#003# 7.01 pH# 22.0 C# 24-06-2024# 13:45:01");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.date.as_deref(), Some("24-06-2024"));
        assert_eq!(m.time.as_deref(), Some("13:45:01"));
        let ts = m.timestamp.unwrap();
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(2024, 6, 24).unwrap());
        assert_eq!(ts.hour(), 13);
        assert_eq!(ts.second(), 1);
    }

    #[test]
    fn bad_timestamp_is_silently_omitted() {
        let frame = build_frame("#CX-505", "#004# 7.0 pH# 22.0 C# 99-99-9999# 25:61:61");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.date.as_deref(), Some("99-99-9999"));
        assert!(m.timestamp.is_none());
    }

    #[test]
    fn comma_decimal_point_is_accepted() {
        let frame = build_frame("#CX-505", "#005# 7,25 pH");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.value, Some(7.25));
    }

    #[test]
    fn unparsable_value_becomes_none() {
        let frame = build_frame("#CX-505", "#006# ---- pH");
        let m = decode_frame(&frame).unwrap().measurement;
        assert!(m.value.is_none());
        assert_eq!(m.unit.as_deref(), Some("pH"));
        assert!(m.derived.is_empty());
    }

    #[test]
    fn sequence_after_colon() {
        let frame = build_frame("#CX-505", "#No: 42# 7.0 pH");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.sequence.as_deref(), Some("42"));
    }

    #[test]
    fn overflow_sections_are_preserved() {
        let frame = build_frame("#CX-505", "#007# 7.0 pH# 21.0 C# 01-01-2024# 00:00:00# A# B");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.extra_fields, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn measurement_trimmed_at_record_separator() {
        let frame = build_frame("#CX-505", "#008# 7.0 pH\u{1e}#garbage# 1.0 mV");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.sequence.as_deref(), Some("008"));
        assert_eq!(m.value, Some(7.0));
        assert!(m.extra_fields.is_empty());
    }

    #[test]
    fn header_without_serial() {
        let frame = build_frame("#CX-461#HOLD#0-14#pH", "#009# 7.0 pH");
        let h = decode_frame(&frame).unwrap().header;
        assert_eq!(h.model.as_deref(), Some("CX-461"));
        assert!(h.serial.is_none());
        assert_eq!(h.status.as_deref(), Some("HOLD"));
        assert_eq!(h.range.as_deref(), Some("0-14"));
        assert_eq!(h.mode.as_deref(), Some("pH"));
    }

    #[test]
    fn frame_without_separator_has_empty_measurement() {
        let frame = {
            let mut v = vec![START_MARKER];
            v.extend_from_slice(b"#CX-505 S/N 9#READY");
            v.push(END_MARKER);
            v
        };
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.header.model.as_deref(), Some("CX-505"));
        assert!(decoded.measurement.sequence.is_none());
        assert!(decoded.measurement.value.is_none());
    }

    #[test]
    fn degree_sign_folded_in_temperature_unit() {
        let frame = build_frame("#CX-505", "#010# 7.0 pH# 19.5 \u{b0}C");
        let m = decode_frame(&frame).unwrap().measurement;
        assert_eq!(m.temperature_unit.as_deref(), Some("C"));
        assert_eq!(m.derived.get("temperature_celsius"), Some(&19.5));
    }
}
