//! Structured kernel debug profile resolver.
//!
//! A profile is a JSON document describing the symbols and struct layouts
//! of a guest kernel, in the Rekall format:
//!
//! ```json
//! {
//!   "$CONSTANTS": { "PsInitialSystemProcess": 5443840, ... },
//!   "$STRUCTS": {
//!     "_EPROCESS": [2624, {
//!       "UniqueProcessId": [384, ["Pointer", {}]],
//!       ...
//!     }]
//!   }
//! }
//! ```
//!
//! Lookups never degrade to a silent zero: a missing symbol, struct or
//! field is always an error. The whole document is parsed into maps up
//! front, so every lookup after construction is a memo hit.

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

/// An error produced by profile parsing or lookup.
#[derive(thiserror::Error, Debug)]
pub enum ProfileError {
    /// The profile document could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The profile document is not valid JSON or misses the required
    /// top-level tables.
    #[error("malformed profile: {0}")]
    Malformed(String),

    /// The requested symbol is not present in `$CONSTANTS`.
    #[error("profile is missing symbol `{0}`")]
    MissingSymbol(String),

    /// The requested struct is not present in `$STRUCTS`.
    #[error("profile is missing struct `{0}`")]
    MissingStruct(String),

    /// The requested field is not present in the struct's field map.
    #[error("profile is missing field `{0}.{1}`")]
    MissingField(String, String),
}

impl From<serde_json::Error> for ProfileError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// One struct described by the profile: its size and field offsets.
#[derive(Debug, Clone)]
pub struct ProfileStruct {
    size: u64,
    fields: IndexMap<String, u64>,
}

impl ProfileStruct {
    /// Returns the size of the struct in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the offset of a field.
    pub fn field(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }
}

#[derive(Deserialize)]
struct RawProfile {
    #[serde(rename = "$CONSTANTS", default)]
    constants: IndexMap<String, u64>,

    #[serde(rename = "$STRUCTS", default)]
    structs: IndexMap<String, Value>,
}

/// A parsed kernel debug profile.
#[derive(Debug, Clone)]
pub struct Profile {
    constants: IndexMap<String, u64>,
    structs: IndexMap<String, ProfileStruct>,
}

impl Profile {
    /// Parses a profile from a JSON string.
    pub fn from_str(content: &str) -> Result<Self, ProfileError> {
        let raw: RawProfile = serde_json::from_str(content)?;

        let mut structs = IndexMap::with_capacity(raw.structs.len());
        for (name, value) in raw.structs {
            structs.insert(name.clone(), parse_struct(&name, &value)?);
        }

        tracing::debug!(
            constants = raw.constants.len(),
            structs = structs.len(),
            "loaded profile"
        );

        Ok(Self {
            constants: raw.constants,
            structs,
        })
    }

    /// Parses a profile from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        Self::from_str(&std::fs::read_to_string(path)?)
    }

    /// Looks up a symbol RVA in `$CONSTANTS`.
    pub fn constant(&self, symbol: &str) -> Result<u64, ProfileError> {
        self.constants
            .get(symbol)
            .copied()
            .ok_or_else(|| ProfileError::MissingSymbol(symbol.to_string()))
    }

    /// Checks whether a symbol exists in `$CONSTANTS`.
    pub fn has_constant(&self, symbol: &str) -> bool {
        self.constants.contains_key(symbol)
    }

    /// Looks up a struct in `$STRUCTS`.
    pub fn struct_(&self, name: &str) -> Result<&ProfileStruct, ProfileError> {
        self.structs
            .get(name)
            .ok_or_else(|| ProfileError::MissingStruct(name.to_string()))
    }

    /// Returns the size of a struct.
    pub fn struct_size(&self, name: &str) -> Result<u64, ProfileError> {
        Ok(self.struct_(name)?.size())
    }

    /// Returns the offset of a field within a struct.
    pub fn struct_field(&self, name: &str, field: &str) -> Result<u64, ProfileError> {
        self.struct_(name)?
            .field(field)
            .ok_or_else(|| ProfileError::MissingField(name.to_string(), field.to_string()))
    }
}

/// Parses one `$STRUCTS` entry: `[size, {field: [offset, type], ...}]`.
fn parse_struct(name: &str, value: &Value) -> Result<ProfileStruct, ProfileError> {
    let entry = value
        .as_array()
        .filter(|entry| entry.len() >= 2)
        .ok_or_else(|| ProfileError::Malformed(format!("struct `{name}` is not [size, fields]")))?;

    let size = entry[0]
        .as_u64()
        .ok_or_else(|| ProfileError::Malformed(format!("struct `{name}` has no size")))?;

    let field_map = entry[1]
        .as_object()
        .ok_or_else(|| ProfileError::Malformed(format!("struct `{name}` has no field map")))?;

    let mut fields = IndexMap::with_capacity(field_map.len());
    for (field, descriptor) in field_map {
        let offset = descriptor
            .as_array()
            .and_then(|descriptor| descriptor.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ProfileError::Malformed(format!("field `{name}.{field}` has no offset"))
            })?;

        fields.insert(field.clone(), offset);
    }

    Ok(ProfileStruct { size, fields })
}
