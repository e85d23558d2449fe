//! The persisted form of a computation outcome.
//!
//! Every outcome, fresh or cached, is a [`ResultRecord`]: either a fulfilled JSON value or a
//! rejection reason, plus the files that were observed while computing it. Records are stored
//! as JSON, for example:
//!
//! ```json
//! {"state":"fulfilled","value":3,"observedFiles":[]}
//! {"state":"rejected","reason":{"name":"Error","message":"boom"},"reasonIsError":true,"observedFiles":[]}
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fingerprint::ObservedFile;

/// The diagnostic fields of a failed computation.
///
/// This is what remains of an error after it went through JSON: a name, a message and any
/// custom properties. Backtraces and live `source` errors do not survive; the messages of the
/// source chain are kept in a `causes` property instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// The reason a computation failed.
///
/// Any [`std::error::Error`] converts into a structured [`Rejection::Error`], so computations
/// can use `?` freely. [`Rejection::Value`] carries an arbitrary JSON value instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// A structured, error-like object.
    Error(ErrorObject),
    /// Any other rejected value.
    Value(Value),
}

impl Rejection {
    /// Creates a structured error rejection.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorObject {
            name: name.into(),
            message: message.into(),
            properties: Map::new(),
        })
    }

    /// Creates a rejection carrying an arbitrary value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Attaches a custom property to a structured error.
    ///
    /// `name` and `message` are reserved and cannot be overridden this way. Value rejections
    /// are returned unchanged.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Self::Error(ref mut error) = self {
            let key = key.into();
            if key == "name" || key == "message" {
                tracing::warn!(key, "Ignoring reserved error property");
            } else {
                error.properties.insert(key, value.into());
            }
        }
        self
    }

    /// Returns the structured error, if this is one.
    pub fn as_error(&self) -> Option<&ErrorObject> {
        match self {
            Self::Error(error) => Some(error),
            Self::Value(_) => None,
        }
    }

    fn into_reason(self) -> Result<(Value, bool), serde_json::Error> {
        match self {
            Self::Error(error) => Ok((serde_json::to_value(error)?, true)),
            Self::Value(value) => Ok((value, false)),
        }
    }

    fn from_reason(reason: Value, is_error: bool) -> Self {
        if is_error && reason.is_object() {
            match serde_json::from_value(reason.clone()) {
                Ok(error) => return Self::Error(error),
                Err(err) => tracing::warn!(error = %err, "Malformed error object in cache record"),
            }
        }
        Self::Value(reason)
    }
}

impl<E: std::error::Error> From<E> for Rejection {
    fn from(err: E) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(Value::String(cause.to_string()));
            source = cause.source();
        }

        let rejection = Self::error(short_type_name::<E>(), err.to_string());
        if causes.is_empty() {
            rejection
        } else {
            rejection.with_property("causes", causes)
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(error) if error.name.is_empty() => f.write_str(&error.message),
            Self::Error(error) => write!(f, "{}: {}", error.name, error.message),
            Self::Value(value) => write!(f, "{value}"),
        }
    }
}

/// `std::io::error::Error` becomes `Error`, `my::ParseError<T>` becomes `ParseError`.
fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    let name = name.split('<').next().unwrap_or(name);
    name.rsplit("::").next().unwrap_or(name)
}

/// The settled state of a computation, as it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Outcome {
    Fulfilled {
        value: Value,
    },
    Rejected {
        reason: Value,
        #[serde(rename = "reasonIsError", default)]
        reason_is_error: bool,
    },
}

/// A cache record: one computation outcome and the files it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(default)]
    pub observed_files: Vec<ObservedFile>,
}

impl ResultRecord {
    /// Builds a record from the result of a computation.
    ///
    /// Fails if the fulfilled value cannot be represented as JSON.
    pub fn from_result<T: Serialize>(
        result: &Result<T, Rejection>,
        observed_files: Vec<ObservedFile>,
    ) -> Result<Self, serde_json::Error> {
        let outcome = match result {
            Ok(value) => Outcome::Fulfilled {
                value: serde_json::to_value(value)?,
            },
            Err(rejection) => {
                let (reason, reason_is_error) = rejection.clone().into_reason()?;
                Outcome::Rejected {
                    reason,
                    reason_is_error,
                }
            }
        };

        Ok(Self {
            outcome,
            observed_files,
        })
    }

    /// Parses a record from its JSON representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serializes this record into its JSON representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Whether the computation that produced this record succeeded.
    pub fn is_fulfilled(&self) -> bool {
        matches!(self.outcome, Outcome::Fulfilled { .. })
    }

    /// Checks every observed file against its recorded fingerprint.
    ///
    /// Returns the first file that changed, if any.
    pub fn changed_file(&self) -> Option<&ObservedFile> {
        self.observed_files.iter().find(|file| !file.is_unchanged())
    }

    /// Reconstructs the computation result.
    ///
    /// The outer error signals that the stored value does not fit `T`.
    pub fn into_result<T: DeserializeOwned>(
        self,
    ) -> Result<Result<T, Rejection>, serde_json::Error> {
        match self.outcome {
            Outcome::Fulfilled { value } => serde_json::from_value(value).map(Ok),
            Outcome::Rejected {
                reason,
                reason_is_error,
            } => Ok(Err(Rejection::from_reason(reason, reason_is_error))),
        }
    }
}

/// Passes a result through one encode/decode cycle.
///
/// This is what makes fresh results indistinguishable from cached ones: anything JSON cannot
/// represent is coerced the same way in both cases. Coercion can produce a shape `T` cannot
/// hold, like `null` for a non-finite `f64`, in which case decoding fails.
pub fn round_trip<T>(
    result: &Result<T, Rejection>,
) -> Result<Result<T, Rejection>, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = ResultRecord::from_result(result, Vec::new())?.to_bytes()?;
    ResultRecord::from_bytes(&bytes)?.into_result()
}
