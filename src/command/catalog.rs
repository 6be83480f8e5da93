//! Named instrument command definitions.
//!
//! The catalog is loaded once per session from the `[commands]` table of the
//! configuration file and referenced by name from schedule entries and the
//! startup list. Definitions are immutable once loaded.

use crate::error::CommandError;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// One named instrument command.
///
/// At least one of `write_hex` / `write_ascii` is required; a definition with
/// neither is a configuration error raised before any I/O.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandDefinition {
    /// Command name (filled from the catalog key).
    #[serde(skip)]
    pub name: String,

    /// Raw write payload as hex text, e.g. `"1b 02 0d"`.
    pub write_hex: Option<String>,

    /// Write payload as ASCII text.
    pub write_ascii: Option<String>,

    /// Delay between the write and the read window.
    #[serde(default, with = "humantime_serde")]
    pub post_delay: Duration,

    /// Duration of the response capture window; no read when absent.
    #[serde(default, with = "humantime_serde::option")]
    pub read_duration: Option<Duration>,

    /// Expected response prefix as hex text.
    pub expect_hex: Option<String>,

    /// Expected response prefix as ASCII text.
    pub expect_ascii: Option<String>,

    /// Per-command default retry count.
    pub retries: Option<u32>,

    /// Per-command default backoff base.
    #[serde(default, with = "humantime_serde::option")]
    pub backoff: Option<Duration>,
}

impl CommandDefinition {
    /// Build the write payload(s), hex first, then ASCII.
    ///
    /// # Errors
    /// [`CommandError::NoPayload`] when neither form is configured,
    /// [`CommandError::BadHex`] when the hex text does not parse.
    pub fn payloads(&self) -> Result<Vec<Vec<u8>>, CommandError> {
        let mut payloads = Vec::new();
        if let Some(hex) = &self.write_hex {
            payloads.push(parse_hex(hex).map_err(|detail| CommandError::BadHex {
                name: self.name.clone(),
                detail,
            })?);
        }
        if let Some(text) = &self.write_ascii {
            payloads.push(text.as_bytes().to_vec());
        }
        if payloads.is_empty() {
            return Err(CommandError::NoPayload {
                name: self.name.clone(),
            });
        }
        Ok(payloads)
    }

    /// The expected response prefix, if one is configured. Hex takes
    /// precedence when both forms are present.
    pub fn expected_prefix(&self) -> Result<Option<Vec<u8>>, CommandError> {
        if let Some(hex) = &self.expect_hex {
            return parse_hex(hex)
                .map(Some)
                .map_err(|detail| CommandError::BadHex {
                    name: self.name.clone(),
                    detail,
                });
        }
        Ok(self.expect_ascii.as_ref().map(|t| t.as_bytes().to_vec()))
    }
}

/// Parse hex text, tolerating whitespace between byte pairs.
fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(format!("odd-length hex string '{text}'"));
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&compact[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte '{}'", &compact[i..i + 2]))
        })
        .collect()
}

/// Name → definition lookup table.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    commands: HashMap<String, CommandDefinition>,
}

impl CommandCatalog {
    /// Build a catalog from the configuration map, stamping each definition
    /// with its key as the command name.
    pub fn new(map: HashMap<String, CommandDefinition>) -> Self {
        let commands = map
            .into_iter()
            .map(|(name, mut def)| {
                def.name = name.clone();
                (name, def)
            })
            .collect();
        Self { commands }
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.get(name)
    }

    /// Whether a name is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Iterate over defined command names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when no commands are defined.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
