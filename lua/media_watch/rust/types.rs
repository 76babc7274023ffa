use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ChangeKind {
    Changed,
}

impl ChangeKind {
    /// Literal written to the `type` field of the wire payload.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            ChangeKind::Changed => "change",
        }
    }
}

/// A discrete "storage changed" notification handed to the attached sink.
///
/// `subject` is whatever identifier the native source could offer for the
/// changed item. Sources are free to omit it, so consumers must treat it as a
/// hint and refresh their whole view when it is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub subject: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn changed(subject: Option<String>) -> Self {
        Self {
            kind: ChangeKind::Changed,
            subject,
            emitted_at: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> ChangePayload {
        ChangePayload {
            kind: self.kind.as_wire_str().to_string(),
            uri: self.subject.clone(),
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(&self.to_payload())?)
    }
}

/// Serialized shape consumed by the application: `{"type":"change","uri":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: Option<String>,
}

#[cfg(feature = "lua")]
impl mlua::IntoLua for ChangePayload {
    fn into_lua(self, lua: &mlua::Lua) -> mlua::Result<mlua::Value> {
        let table = lua.create_table()?;
        table.set("type", self.kind)?;
        table.set("uri", self.uri)?;
        Ok(mlua::Value::Table(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_subject_uri() {
        let event = ChangeEvent::changed(Some("content://media/external/images/42".to_string()));
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"type":"change","uri":"content://media/external/images/42"}"#
        );
    }

    #[test]
    fn test_payload_without_subject_has_null_uri() {
        let event = ChangeEvent::changed(None);
        assert_eq!(event.to_json().unwrap(), r#"{"type":"change","uri":null}"#);
    }

    #[test]
    fn test_payload_omits_emission_timestamp() {
        let event = ChangeEvent::changed(None);
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert!(object.contains_key("type"));
        assert!(object.contains_key("uri"));
    }

    #[test]
    fn test_emission_time_is_stamped() {
        let before = Utc::now();
        let event = ChangeEvent::changed(None);
        assert!(event.emitted_at >= before);
        assert_eq!(event.kind, ChangeKind::Changed);
    }
}
