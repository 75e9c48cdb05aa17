use reqwest::Method;
use serde::Serialize;
use snafu::ensure;

use crate::dtclient::{
    Client, EventMissingAttachRulesSnafu, EventMissingTypeSnafu, Result, TokenKind,
};

pub const MARKED_FOR_TERMINATION_EVENT: &str = "MARKED_FOR_TERMINATION";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub event_type: String,
    #[serde(rename = "start")]
    pub start_in_millis: u64,
    #[serde(rename = "end")]
    pub end_in_millis: u64,
    pub description: String,
    pub attach_rules: EventAttachRules,
    pub source: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAttachRules {
    pub entity_ids: Vec<String>,
}

impl Client {
    /// Posts an event to the tenant. The event needs a type and at least one entity to attach to.
    #[tracing::instrument(skip_all, fields(event.type = %event.event_type))]
    pub async fn send_event(&self, event: &EventData) -> Result<()> {
        ensure!(!event.event_type.is_empty(), EventMissingTypeSnafu);
        ensure!(
            !event.attach_rules.entity_ids.is_empty(),
            EventMissingAttachRulesSnafu
        );

        let request = self
            .request(Method::POST, "/v1/events", TokenKind::DataPlane)?
            .json(event);
        self.execute(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};

    use super::*;
    use crate::dtclient::{Error, tests::client};

    fn event() -> EventData {
        EventData {
            event_type: MARKED_FOR_TERMINATION_EVENT.to_owned(),
            start_in_millis: 1,
            end_in_millis: 2,
            description: "node deleted".to_owned(),
            attach_rules: EventAttachRules {
                entity_ids: vec!["HOST-42".to_owned()],
            },
            source: "Dynatrace Operator".to_owned(),
        }
    }

    #[tokio::test]
    async fn send() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/events")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "eventType": "MARKED_FOR_TERMINATION",
                "start": 1,
                "attachRules": {"entityIds": ["HOST-42"]}
            })))
            .with_status(201)
            .with_body(r#"{"storedEventIds":[1]}"#)
            .create_async()
            .await;

        client(&server).send_event(&event()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn event_without_type_is_not_sent() {
        let server = Server::new_async().await;
        let event = EventData {
            event_type: String::new(),
            ..event()
        };

        let error = client(&server).send_event(&event).await.unwrap_err();
        assert!(matches!(error, Error::EventMissingType));
    }

    #[tokio::test]
    async fn event_without_entities_is_not_sent() {
        let server = Server::new_async().await;
        let event = EventData {
            attach_rules: EventAttachRules::default(),
            ..event()
        };

        let error = client(&server).send_event(&event).await.unwrap_err();
        assert!(matches!(error, Error::EventMissingAttachRules));
    }
}
