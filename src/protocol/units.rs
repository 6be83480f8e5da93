//! Unit-label slugging and physical-quantity alias tables.
//!
//! The meter prints unit labels as free text ("pH", "mV", "mg/l", "°C", and
//! Polish-localized variants on older firmware). Labels are slugged to a
//! stable ascii key and matched against small alias tables so decoded
//! measurements can expose semantic fields (`value_ph`, `temperature_celsius`)
//! without the ingestion layer re-parsing label text.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Slug a unit label: lowercase, fold accents, `%` → "percent", collapse any
/// other non-alphanumeric run to a single `_`, trim leading/trailing `_`.
pub fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for c in label.to_lowercase().chars() {
        let mapped: Option<char> = match c {
            'a'..='z' | '0'..='9' => Some(c),
            '%' => None, // handled below
            'ą' => Some('a'),
            'ć' => Some('c'),
            'ę' => Some('e'),
            'ł' => Some('l'),
            'ń' => Some('n'),
            'ó' => Some('o'),
            'ś' => Some('s'),
            'ź' | 'ż' => Some('z'),
            'µ' | 'μ' => Some('u'),
            _ => {
                pending_sep = !out.is_empty();
                continue;
            }
        };
        if c == '%' {
            if pending_sep || !out.is_empty() {
                out.push('_');
            }
            out.push_str("percent");
            pending_sep = false;
            continue;
        }
        if let Some(m) = mapped {
            if pending_sep {
                out.push('_');
                pending_sep = false;
            }
            out.push(m);
        }
    }
    out
}

/// Slug → canonical physical quantity for the primary measurement value.
static QUANTITY_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ph", "ph"),
        ("mv", "mv"),
        ("mg_l", "mg_l"),
        ("percent", "percent"),
        ("percent_o2", "percent"),
        ("ms_cm", "ms_cm"),
        ("us_cm", "us_cm"),
    ])
});

/// Slug → canonical temperature scale.
static TEMPERATURE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("c", "celsius"),
        ("celsius", "celsius"),
        ("deg_c", "celsius"),
        ("st_c", "celsius"),
        ("f", "fahrenheit"),
        ("fahrenheit", "fahrenheit"),
        ("deg_f", "fahrenheit"),
        ("k", "kelvin"),
        ("kelvin", "kelvin"),
    ])
});

/// Canonical quantity name for a value-unit slug, if known.
pub fn quantity_for(slug: &str) -> Option<&'static str> {
    QUANTITY_ALIASES.get(slug).copied()
}

/// Canonical temperature scale for a temperature-unit slug, if known.
pub fn temperature_scale_for(slug: &str) -> Option<&'static str> {
    TEMPERATURE_ALIASES.get(slug).copied()
}
