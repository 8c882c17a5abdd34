use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ConversationLayer, ConversationRound};

/// Persisted/interchange shape of a [`ConversationLayer`].
///
/// Absent message content is written as an empty string, and an empty
/// string reads back as absent, so a present-but-empty turn does not
/// survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ConversationRecord {
    pub recent_rounds: Vec<RoundRecord>,
    pub summary_content: String,
    pub summarized_rounds: usize,
    #[schemars(with = "String")]
    #[schema(value_type = String, format = DateTime)]
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RoundRecord {
    pub user_content: String,
    pub assistant_content: String,
    #[schemars(with = "String")]
    #[schema(value_type = String, format = DateTime)]
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
}

impl ConversationRecord {
    pub fn from_layer(layer: &ConversationLayer) -> Self {
        Self {
            recent_rounds: layer
                .recent_rounds
                .iter()
                .map(|round| RoundRecord {
                    user_content: round.user_content.clone().unwrap_or_default(),
                    assistant_content: round.assistant_content.clone().unwrap_or_default(),
                    timestamp: round.timestamp,
                    token_count: round.token_count,
                })
                .collect(),
            summary_content: layer.summary_content.clone(),
            summarized_rounds: layer.summarized_rounds,
            saved_at: Utc::now(),
        }
    }

    pub fn into_layer(self) -> ConversationLayer {
        ConversationLayer {
            recent_rounds: self
                .recent_rounds
                .into_iter()
                .map(|round| ConversationRound {
                    user_content: non_empty(round.user_content),
                    assistant_content: non_empty(round.assistant_content),
                    timestamp: round.timestamp,
                    token_count: round.token_count,
                })
                .collect(),
            summary_content: self.summary_content,
            summarized_rounds: self.summarized_rounds,
        }
    }
}

fn non_empty(content: String) -> Option<String> {
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn record_uses_the_interchange_field_names() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let layer = ConversationLayer {
            recent_rounds: vec![ConversationRound {
                user_content: Some("hi".to_string()),
                assistant_content: None,
                timestamp,
                token_count: 7,
            }],
            summary_content: "earlier".to_string(),
            summarized_rounds: 3,
        };

        let mut value = serde_json::to_value(ConversationRecord::from_layer(&layer)).unwrap();
        value.as_object_mut().unwrap().remove("saved_at");
        assert_eq!(
            value,
            json!({
                "recent_rounds": [{
                    "user_content": "hi",
                    "assistant_content": "",
                    "timestamp": "2024-05-01T12:00:00Z",
                    "token_count": 7
                }],
                "summary_content": "earlier",
                "summarized_rounds": 3
            })
        );
    }

    #[test]
    fn empty_and_absent_content_collapse_on_reload() {
        let layer = ConversationLayer {
            recent_rounds: vec![
                ConversationRound::new(Some("q".to_string()), Some(String::new()), 1),
                ConversationRound::new(Some("q".to_string()), None, 1),
            ],
            summary_content: String::new(),
            summarized_rounds: 0,
        };

        let reloaded = ConversationRecord::from_layer(&layer).into_layer();
        // A present-but-empty assistant turn reads back as "no assistant turn".
        assert_eq!(reloaded.recent_rounds[0].assistant_content, None);
        assert_eq!(
            reloaded.recent_rounds[0].assistant_content,
            reloaded.recent_rounds[1].assistant_content
        );
        assert_eq!(reloaded.recent_rounds[0].user_content.as_deref(), Some("q"));
    }
}
