use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Built-in callback every worker answers, used for the handshake.
pub const GET_INFO: &str = "get_info";

/// Caller name used for calls that originate in the host itself.
pub const CORE_CALLER: &str = "core";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What an addon reports about itself through `get_info`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddonInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub callbacks: BTreeMap<String, CallbackMeta>,
    /// Addons this one depends on; it is put to sleep when one of them stops.
    #[serde(default)]
    pub lock_on: Vec<String>,
    /// Minimum host version, e.g. `>=0.2.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_version: Option<String>,
}

impl AddonInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            ..Default::default()
        }
    }

    pub fn with_callback(mut self, name: impl Into<String>, description: Option<&str>) -> Self {
        self.callbacks.insert(
            name.into(),
            CallbackMeta { description: description.map(str::to_string) },
        );
        self
    }

    pub fn with_lock_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.lock_on.contains(&dependency) {
            self.lock_on.push(dependency);
        }
        self
    }

    pub fn with_core_version(mut self, requirement: impl Into<String>) -> Self {
        self.core_version = Some(requirement.into());
        self
    }

    pub fn callback_names(&self) -> impl Iterator<Item = &str> {
        self.callbacks.keys().map(String::as_str)
    }
}

/// Passed to every callback: who is calling and under which message id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackHeader {
    pub id: String,
    pub from: String,
}

impl CallbackHeader {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self { id: id.into(), from: from.into() }
    }
}

/// Lifecycle notifications flowing from an addon to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum LifecycleEvent {
    Start,
    Ready,
    Stop,
    Sleep,
    Awake,
    /// A transition raised an error. `transition` is one of
    /// `start`, `stop`, `sleep`, `awake` or `worker`.
    Failed { transition: String, message: String },
}

/// Lifecycle triggers flowing from the host to an addon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum LifecycleSignal {
    Start,
    Stop,
    Sleep,
    AddonLoaded { from: String },
}

/// One piece of a reply travelling back to a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Single complete result.
    Body(Value),
    /// Partial result of a stream.
    Chunk(Value),
    /// End of stream.
    Completed,
    Error(String),
}

impl Delivery {
    /// Whether nothing else follows this delivery.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Delivery::Chunk(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum AddonState {
    Loaded,
    Started,
    Sleeping,
    Stopped,
}

impl AddonState {
    pub fn is_running(self) -> bool {
        matches!(self, AddonState::Started | AddonState::Sleeping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn info_uses_camel_case_keys() {
        let info = AddonInfo::new("weather")
            .with_callback("forecast", Some("daily forecast"))
            .with_lock_on("http")
            .with_core_version(">=0.2.0");
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["lockOn"], json!(["http"]));
        assert_eq!(v["coreVersion"], json!(">=0.2.0"));
        assert_eq!(v["callbacks"]["forecast"]["description"], json!("daily forecast"));
    }

    #[test]
    fn info_accepts_minimal_payload() {
        let info: AddonInfo = serde_json::from_value(json!({"name": "bare"})).unwrap();
        assert_eq!(info.name, "bare");
        assert!(info.callbacks.is_empty());
        assert!(info.lock_on.is_empty());
        assert!(info.core_version.is_none());
    }

    #[test]
    fn lock_on_is_deduplicated() {
        let info = AddonInfo::new("a").with_lock_on("b").with_lock_on("b");
        assert_eq!(info.lock_on, vec!["b".to_string()]);
    }

    #[test]
    fn signal_is_tagged_by_name() {
        let v = serde_json::to_value(LifecycleSignal::AddonLoaded { from: "b".into() }).unwrap();
        assert_eq!(v, json!({"name": "addonLoaded", "from": "b"}));
    }

    #[test]
    fn state_names() {
        assert_eq!(AddonState::Sleeping.to_string(), "sleeping");
        assert_eq!("started".parse::<AddonState>().unwrap(), AddonState::Started);
        assert!(AddonState::Sleeping.is_running());
        assert!(!AddonState::Loaded.is_running());
    }
}
