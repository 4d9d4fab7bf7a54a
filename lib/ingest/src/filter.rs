//! Secondary trigger-match filters.

use relayflow_workflow::TriggerConfig;
use serde_json::Value as JsonValue;

/// Event attributes the filters inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventAttributes {
    /// Channel the event arrived on.
    pub channel: Option<String>,
    /// Priority carried by the payload (`priority` or `ticket.priority`).
    pub priority: Option<String>,
    /// Pipeline carried by the payload (`pipeline_id` or `lead.pipeline_id`).
    pub pipeline_id: Option<String>,
}

impl EventAttributes {
    /// Extracts attributes from an event's channel and run payload.
    #[must_use]
    pub fn extract(channel: Option<&str>, payload: &JsonValue) -> Self {
        Self {
            channel: channel.map(str::to_string),
            priority: scalar(payload, &["/priority", "/ticket/priority"]),
            pipeline_id: scalar(payload, &["/pipeline_id", "/lead/pipeline_id"]),
        }
    }
}

fn scalar(payload: &JsonValue, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|p| payload.pointer(p))
        .find_map(|value| match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// The filters configured on a workflow version.
///
/// Every configured filter must pass. An absent or empty allow-list passes
/// everything; a configured filter fails when the event lacks the
/// attribute. Channel and priority compare case-insensitively.
#[derive(Debug, Clone, Copy)]
pub struct TriggerFilters<'a> {
    config: &'a TriggerConfig,
}

impl<'a> TriggerFilters<'a> {
    /// Wraps a version's trigger configuration.
    #[must_use]
    pub fn new(config: &'a TriggerConfig) -> Self {
        Self { config }
    }

    /// Returns whether the event passes every configured filter.
    #[must_use]
    pub fn matches(&self, event: &EventAttributes) -> bool {
        allowed(self.config.channels.as_deref(), event.channel.as_deref())
            && allowed(self.config.priorities.as_deref(), event.priority.as_deref())
            && match self.config.pipeline_id.as_deref() {
                None | Some("") => true,
                Some(pipeline) => event.pipeline_id.as_deref() == Some(pipeline),
            }
    }
}

fn allowed(list: Option<&[String]>, value: Option<&str>) -> bool {
    match list {
        None | Some([]) => true,
        Some(list) => value.is_some_and(|v| {
            let v = v.trim();
            list.iter().any(|allowed| allowed.trim().eq_ignore_ascii_case(v))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> TriggerConfig {
        TriggerConfig {
            channels: Some(vec!["whatsapp".to_string(), "sms".to_string()]),
            priorities: Some(vec!["high".to_string()]),
            pipeline_id: Some("p1".to_string()),
            cron: None,
        }
    }

    #[test]
    fn absent_filters_pass() {
        let config = TriggerConfig::default();
        assert!(TriggerFilters::new(&config).matches(&EventAttributes::default()));

        let empty = TriggerConfig {
            channels: Some(Vec::new()),
            ..TriggerConfig::default()
        };
        assert!(TriggerFilters::new(&empty).matches(&EventAttributes::default()));
    }

    #[test]
    fn all_configured_filters_must_pass() {
        let config = config();
        let filters = TriggerFilters::new(&config);
        let payload = json!({"ticket": {"priority": "HIGH"}, "pipeline_id": "p1"});

        assert!(filters.matches(&EventAttributes::extract(Some("WhatsApp"), &payload)));
        assert!(!filters.matches(&EventAttributes::extract(Some("email"), &payload)));
        assert!(!filters.matches(&EventAttributes::extract(None, &payload)));

        let low = json!({"priority": "low", "pipeline_id": "p1"});
        assert!(!filters.matches(&EventAttributes::extract(Some("sms"), &low)));

        let other_pipeline = json!({"priority": "high", "lead": {"pipeline_id": "p2"}});
        assert!(!filters.matches(&EventAttributes::extract(Some("sms"), &other_pipeline)));
    }

    #[test]
    fn numeric_attributes_are_stringified() {
        let attrs = EventAttributes::extract(None, &json!({"pipeline_id": 42}));
        assert_eq!(attrs.pipeline_id.as_deref(), Some("42"));
    }
}
