//! Wire protocol types for node-to-node proxy traffic.
//!
//! A single tagged union covers both directions: requests carry a `type`
//! discriminator (`cmd`, `stat`, `push`, `expire`), responses are `resp`
//! frames echoing the originating request id. Field names are stable wire
//! contract and must not change between versions.

use std::fmt;

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A wire message, request or response.
///
/// Messages are ephemeral: built, encoded, shipped, and discarded. The `id`
/// is a string-encoded counter private to the sending proxy; it only needs
/// to be unique among that proxy's outstanding requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Invoke `func` with an ordered argument list on module `mod`.
    Cmd {
        #[serde(rename = "mod")]
        module: String,
        func: String,
        args: Vec<Value>,
        id: String,
    },

    /// Read the current value of status key `stat` on module `mod`.
    Stat {
        #[serde(rename = "mod")]
        module: String,
        stat: String,
        id: String,
    },

    /// Drive a module/dependency lifecycle or status-write operation.
    Push {
        #[serde(flatten)]
        op: PushOp,
        id: String,
    },

    /// Invalidate cached state for control system `sys`.
    Expire { sys: String, id: String },

    /// Completion of a previously sent request.
    Resp {
        id: String,
        #[serde(flatten)]
        outcome: Outcome,
    },
}

impl Message {
    /// The correlation id carried by any frame.
    pub fn id(&self) -> &str {
        match self {
            Self::Cmd { id, .. }
            | Self::Stat { id, .. }
            | Self::Push { id, .. }
            | Self::Expire { id, .. }
            | Self::Resp { id, .. } => id,
        }
    }
}

/// The `push` sub-kinds. Flattened into the frame alongside `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum PushOp {
    /// Write status key `stat` to `val` on module `mod`.
    Status {
        #[serde(rename = "mod")]
        module: String,
        stat: String,
        val: Value,
    },

    Start {
        #[serde(rename = "mod")]
        module: String,
    },

    Stop {
        #[serde(rename = "mod")]
        module: String,
    },

    /// Refresh a running module instance in place. Serviced on the receiving
    /// node by the *update* lifecycle operation, not unload.
    Load {
        #[serde(rename = "mod")]
        module: String,
    },

    Unload {
        #[serde(rename = "mod")]
        module: String,
    },

    /// Force-reload dependency `dep`'s backing class.
    Reload { dep: String },
}

/// Response payload: exactly one of `resolve` or `reject`.
///
/// Decoding is hand-written: flattened into a `resp` frame, a derived enum
/// would let the first recognized key win when a frame carries both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Success value returned by the servicing collaborator.
    Resolve(Value),
    /// Error detail string, carried verbatim back to the original caller.
    Reject(String),
}

impl<'de> Deserialize<'de> for Outcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OutcomeVisitor;

        impl<'de> Visitor<'de> for OutcomeVisitor {
            type Value = Outcome;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map with exactly one of `resolve` or `reject`")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Outcome, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut outcome = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "resolve" => {
                            if outcome.is_some() {
                                return Err(de::Error::custom(
                                    "response carries more than one outcome",
                                ));
                            }
                            outcome = Some(Outcome::Resolve(map.next_value()?));
                        }
                        "reject" => {
                            if outcome.is_some() {
                                return Err(de::Error::custom(
                                    "response carries more than one outcome",
                                ));
                            }
                            outcome = Some(Outcome::Reject(map.next_value()?));
                        }
                        _ => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                outcome.ok_or_else(|| de::Error::custom("response carries no outcome"))
            }
        }

        deserializer.deserialize_map(OutcomeVisitor)
    }
}

impl Outcome {
    pub fn resolved_true() -> Self {
        Self::Resolve(Value::Bool(true))
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}
