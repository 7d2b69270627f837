use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{fmt, vec};

use super::error::RemoteError;

/// A closed set of remotely callable methods.
///
/// Implementations map each wire name to exactly one variant;
/// names outside the set are rejected before the owner is invoked.
pub trait Verb: Copy + fmt::Debug + Send + Sync + 'static {
    /// Looks up the verb for a method name.
    fn parse(method: &str) -> Option<Self>;

    /// Method name transmitted on the wire.
    fn name(self) -> &'static str;
}

/// Defines an enum implementing [Verb] with one wire name per variant.
#[macro_export]
macro_rules! verbs {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),*
        }

        impl $crate::rpc::Verb for $name {
            fn parse(method: &str) -> Option<Self> {
                match method {
                    $( $wire => Some(Self::$variant), )*
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $wire, )*
                }
            }
        }
    };
}

/// Owner of a skeleton: executes the verbs it exposes.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// The verbs exposed by this owner.
    type Verb: Verb;

    /// Executes a verb with the received arguments.
    async fn invoke(&self, verb: Self::Verb, args: Args) -> Result<Value, RemoteError>;
}

/// Positional arguments of a received request.
#[derive(Debug)]
pub struct Args {
    method: &'static str,
    values: vec::IntoIter<Value>,
    position: usize,
}

impl Args {
    /// Wraps the arguments received for a method.
    pub fn new(method: &'static str, values: Vec<Value>) -> Self {
        Self { method, values: values.into_iter(), position: 0 }
    }

    /// Takes the next argument and converts it to the requested type.
    pub fn next<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, RemoteError> {
        let position = self.position;
        self.position += 1;
        let value = self.values.next().ok_or_else(|| {
            RemoteError::invalid_arguments(format!("{}: missing argument {} ({})", self.method, position, name))
        })?;
        serde_json::from_value(value).map_err(|err| {
            RemoteError::invalid_arguments(format!("{}: argument {} ({}): {}", self.method, position, name, err))
        })
    }
}

/// Converts a handler result into a response value.
pub fn reply<T: Serialize>(value: T) -> Result<Value, RemoteError> {
    serde_json::to_value(value)
        .map_err(|err| RemoteError::new(super::ErrorKind::Other("SerializationError".into()), err.to_string()))
}
