use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Thread and run ids are normally chosen by the client; tool-call ids by the
// model session. `new()` exists for tests and for collaborators that need one.
branded_id!(ThreadId, "thread");
branded_id!(RunId, "run");
branded_id!(ToolCallId, "call");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_prefix() {
        assert!(ThreadId::new().as_str().starts_with("thread_"));
        assert!(RunId::new().as_str().starts_with("run_"));
        assert!(ToolCallId::new().as_str().starts_with("call_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ToolCallId::new(), ToolCallId::new());
    }

    #[test]
    fn from_raw_preserves_client_value() {
        let id = ThreadId::from_raw("thread-from-browser");
        assert_eq!(id.as_str(), "thread-from-browser");
        assert_eq!(id.to_string(), "thread-from-browser");
    }

    #[test]
    fn blank_ids_are_empty() {
        assert!(RunId::from_raw("   ").is_empty());
        assert!(!RunId::from_raw("r1").is_empty());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ToolCallId::from_raw("call_42");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""call_42""#);
        let parsed: ToolCallId = serde_json::from_str(r#""call_42""#).unwrap();
        assert_eq!(parsed, id);
    }
}
