//! Shared types for tether components.
//!
//! This crate provides the client identity types used across tether-rpc and
//! tether-daemon. A remote app announces itself with a [`ClientQuery`]; the
//! [`ClientIdentity`] derived from it is the key every connection is filed
//! under, and its string form is persisted by UI collaborators, so the format
//! produced by [`ClientIdentity::build`] must never change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between the parts of a client id and a plugin key.
pub const ID_SEPARATOR: char = '#';

/// Errors produced while building or parsing client identities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Client identity field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Client identity field '{field}' must not contain '#': {value}")]
    ForbiddenSeparator { field: &'static str, value: String },

    #[error("Malformed client id '{0}': expected 4 '#'-separated parts")]
    Malformed(String),

    #[error("Malformed plugin key '{0}'")]
    MalformedPluginKey(String),
}

/// What a remote app sends when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientQuery {
    pub app: String,
    pub os: String,
    pub device: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
}

impl ClientQuery {
    #[must_use]
    pub fn new(
        app: impl Into<String>,
        os: impl Into<String>,
        device: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            os: os.into(),
            device: device.into(),
            device_id: device_id.into(),
            sdk_version: None,
            medium: None,
        }
    }

    #[must_use]
    pub fn with_sdk_version(mut self, sdk_version: u32) -> Self {
        self.sdk_version = Some(sdk_version);
        self
    }

    /// Validate the query and derive its identity.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if a required field is empty or a field
    /// other than `app` contains the id separator.
    pub fn identity(&self) -> Result<ClientIdentity, IdentityError> {
        ClientIdentity::new(&self.app, &self.os, &self.device, &self.device_id)
    }

    /// SDK version announced by the app, `0` when absent.
    #[must_use]
    pub fn sdk_version(&self) -> u32 {
        self.sdk_version.unwrap_or(0)
    }
}

/// Composite key identifying one app instance on one device.
///
/// `device_id` may be empty, which denotes the host device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity {
    app: String,
    os: String,
    device: String,
    device_id: String,
}

impl ClientIdentity {
    /// Create a validated identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EmptyField`] for an empty `app`, `os` or
    /// `device`, and [`IdentityError::ForbiddenSeparator`] if `os`, `device`
    /// or `device_id` contain `#` (only `app` is escaped in the id string).
    pub fn new(
        app: impl Into<String>,
        os: impl Into<String>,
        device: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            app: app.into(),
            os: os.into(),
            device: device.into(),
            device_id: device_id.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    fn validate(&self) -> Result<(), IdentityError> {
        for (field, value) in [("app", &self.app), ("os", &self.os), ("device", &self.device)] {
            if value.is_empty() {
                return Err(IdentityError::EmptyField(field));
            }
        }
        for (field, value) in [
            ("os", &self.os),
            ("device", &self.device),
            ("device_id", &self.device_id),
        ] {
            if value.contains(ID_SEPARATOR) {
                return Err(IdentityError::ForbiddenSeparator {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    #[must_use]
    pub fn os(&self) -> &str {
        &self.os
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn is_host_device(&self) -> bool {
        self.device_id.is_empty()
    }

    /// Build the client id string: `escape(app)#os#device#device_id`.
    #[must_use]
    pub fn build(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            js_escape(&self.app),
            self.os,
            self.device,
            self.device_id,
            sep = ID_SEPARATOR
        )
    }

    /// Parse a client id string produced by [`ClientIdentity::build`].
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] unless the string has exactly four
    /// parts, or the validation errors of [`ClientIdentity::new`].
    pub fn parse(client_id: &str) -> Result<Self, IdentityError> {
        let parts: Vec<&str> = client_id.split(ID_SEPARATOR).collect();
        let [app, os, device, device_id] = parts.as_slice() else {
            return Err(IdentityError::Malformed(client_id.to_string()));
        };
        Self::new(js_unescape(app), *os, *device, *device_id)
    }

    /// Key under which a plugin's state for this client is stored.
    #[must_use]
    pub fn plugin_key(&self, plugin_id: &str) -> String {
        format!("{}{ID_SEPARATOR}{plugin_id}", self.build())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

impl FromStr for ClientIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ClientIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.build())
    }
}

impl<'de> Deserialize<'de> for ClientIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Split a plugin key into its client identity and plugin id.
///
/// # Errors
///
/// Returns [`IdentityError::MalformedPluginKey`] if the key does not have the
/// five parts of `client id + '#' + plugin id`.
pub fn deconstruct_plugin_key(key: &str) -> Result<(ClientIdentity, String), IdentityError> {
    let Some((client_id, plugin_id)) = key.rsplit_once(ID_SEPARATOR) else {
        return Err(IdentityError::MalformedPluginKey(key.to_string()));
    };
    if plugin_id.is_empty() {
        return Err(IdentityError::MalformedPluginKey(key.to_string()));
    }
    let identity = ClientIdentity::parse(client_id)
        .map_err(|_| IdentityError::MalformedPluginKey(key.to_string()))?;
    Ok((identity, plugin_id.to_string()))
}

fn is_unreserved(unit: u16) -> bool {
    matches!(unit,
        0x30..=0x39 | 0x41..=0x5A | 0x61..=0x7A
        | 0x40 | 0x2A | 0x5F | 0x2B | 0x2D | 0x2E | 0x2F)
}

/// ECMAScript `escape()`: operates on UTF-16 code units.
#[must_use]
pub fn js_escape(input: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(input.len());
    for unit in input.encode_utf16() {
        if is_unreserved(unit) {
            // Unreserved units are ASCII
            out.push(char::from(u8::try_from(unit).unwrap_or(b'?')));
        } else if unit < 0x100 {
            let _ = write!(out, "%{unit:02X}");
        } else {
            let _ = write!(out, "%u{unit:04X}");
        }
    }
    out
}

/// ECMAScript `unescape()`. Malformed escapes are kept literally.
#[must_use]
pub fn js_unescape(input: &str) -> String {
    let units: Vec<u16> = input.encode_utf16().collect();
    let mut out: Vec<u16> = Vec::with_capacity(units.len());
    let mut i = 0;
    while i < units.len() {
        if units[i] == u16::from(b'%') {
            if units.get(i + 1) == Some(&u16::from(b'u'))
                && let Some(value) = hex_units(units.get(i + 2..i + 6))
            {
                out.push(value);
                i += 6;
                continue;
            }
            if let Some(value) = hex_units(units.get(i + 1..i + 3)) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(units[i]);
        i += 1;
    }
    String::from_utf16_lossy(&out)
}

fn hex_units(units: Option<&[u16]>) -> Option<u16> {
    let units = units?;
    let mut value: u16 = 0;
    for &unit in units {
        let digit = char::from_u32(u32::from(unit))?.to_digit(16)?;
        value = value.checked_mul(16)?.checked_add(u16::try_from(digit).ok()?)?;
    }
    Some(value)
}
