use crate::error::{Error, SerializationError};

use std::any::type_name;
use std::fmt::Debug;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Longest type name accepted as an entity name.
pub const MAX_TYPE_NAME_LENGTH: usize = 255;

/// Converts messages to and from transport payloads.
pub trait Serializer
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Bytes, SerializationError>;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid encoding of `T`.
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// JSON bodies via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Bytes, SerializationError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|source| SerializationError::Serialize {
                type_name: type_name::<T>(),
                source: Box::new(source),
            })
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|source| SerializationError::Deserialize {
            type_name: type_name::<T>(),
            source: Box::new(source),
        })
    }
}

/// Stable, entity-safe names for Rust types.
///
/// `my_app::messages::Ping` becomes `my_app.messages.Ping`. Characters other
/// than ASCII alphanumerics, `.`, `_` and `-` (generic brackets, spaces,
/// references) are replaced with `_`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TypeNameSerializer;

impl TypeNameSerializer {
    /// Name of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeName`] if the name is longer than
    /// [`MAX_TYPE_NAME_LENGTH`].
    pub fn serialize<T: ?Sized + 'static>() -> Result<String, Error> {
        Self::sanitize(type_name::<T>())
    }

    /// Applies the naming rules to an arbitrary type path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeName`] if the result is too long.
    pub fn sanitize(raw: &str) -> Result<String, Error> {
        let name: String = raw
            .replace("::", ".")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if name.len() > MAX_TYPE_NAME_LENGTH {
            return Err(Error::TypeName {
                length: name.len(),
                type_name: name,
            });
        }

        Ok(name)
    }
}
