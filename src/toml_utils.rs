//! Helpers for [`toml_span`]. We only use TOML as an alternative syntax for
//! JSON-shaped configuration, so everything is converted to a JSON [`Value`].

use std::borrow::Cow;

use toml_span::{DeserError, value::ValueInner};

use crate::prelude::*;

/// Parse a TOML document into a JSON [`Value`].
pub fn toml_to_json(toml_str: &str) -> Result<Value> {
    let mut value = toml_span::de::parse(toml_str)
        .map_err(|err| anyhow!("could not parse TOML: {err:?}"))?;
    let json = <JsonValue as toml_span::Deserialize>::deserialize(&mut value)
        .map_err(|err| anyhow!("could not convert TOML to JSON: {err:?}"))?;
    Ok(json.into_json())
}

/// Create a custom [`DeserError`] with a span.
fn custom_deser_error(span: toml_span::Span, msg: impl Into<Cow<'static, str>>) -> DeserError {
    let err_kind = toml_span::ErrorKind::Custom(msg.into());
    let err = toml_span::Error::from((err_kind, span));
    DeserError::from(err)
}

/// JSON [`Value`] wrapper for deserializing raw JSON from TOML.
#[derive(Debug)]
pub struct JsonValue(Value);

impl JsonValue {
    /// Convert to a [`Value`].
    pub fn into_json(self) -> Value {
        self.0
    }
}

impl<'de> toml_span::Deserialize<'de> for JsonValue {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let inner = value.take();
        let json = match inner {
            ValueInner::String(cow) => Value::String(cow.into_owned()),
            ValueInner::Integer(i) => Value::Number(serde_json::Number::from(i)),
            ValueInner::Float(f) => Value::Number(
                serde_json::Number::from_f64(f)
                    .ok_or_else(|| custom_deser_error(value.span, "Invalid float value"))?,
            ),
            ValueInner::Boolean(b) => Value::Bool(b),
            ValueInner::Array(values) => Value::Array(
                values
                    .into_iter()
                    .map(|mut v| JsonValue::deserialize(&mut v).map(JsonValue::into_json))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            ValueInner::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, mut v)| -> Result<(String, Value), DeserError> {
                        Ok((k.name.into_owned(), JsonValue::deserialize(&mut v)?.into_json()))
                    })
                    .collect::<Result<serde_json::Map<_, _>, _>>()?,
            ),
        };
        Ok(JsonValue(json))
    }
}
