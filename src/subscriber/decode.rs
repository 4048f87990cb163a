//! Narrows raw watch payloads to [`InitializablePod`].

use serde_json::Value;

use crate::pod::{self, InitializablePod};

/// Decodes one list item or watch event object.
///
/// Payloads that declare another kind are rejected before any field is read,
/// so a misrouted object never reaches the reconciler.
pub fn pod(value: Value) -> Result<InitializablePod, Error> {
    let declared = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_owned);

    if let Some(kind) = declared("kind") {
        if kind != pod::KIND {
            return Err(Error::UnexpectedKind {
                kind,
                name: object_name(&value),
            });
        }
    }
    if let Some(api_version) = declared("apiVersion") {
        if api_version != pod::API_VERSION {
            return Err(Error::UnexpectedApiVersion {
                api_version,
                name: object_name(&value),
            });
        }
    }

    let name = object_name(&value);
    serde_json::from_value(value).map_err(|source| Error::Malformed { name, source })
}

fn object_name(value: &Value) -> String {
    let field = |field: &str| {
        value
            .pointer(&format!("/metadata/{field}"))
            .and_then(Value::as_str)
    };
    match (field("namespace"), field("name")) {
        (Some(namespace), Some(name)) => format!("{namespace}/{name}"),
        (None, Some(name)) => name.to_owned(),
        _ => "<unnamed>".to_owned(),
    }
}

/// The error type returned by [`pod`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object {name} has kind {kind}, expected Pod")]
    UnexpectedKind { kind: String, name: String },
    #[error("object {name} has apiVersion {api_version}, expected v1")]
    UnexpectedApiVersion { api_version: String, name: String },
    #[error("object {name} is not a valid pod: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}
