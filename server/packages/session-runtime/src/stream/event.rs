use bytes::Bytes;
use serde::Serialize;
use session_runtime_error::RuntimeError;

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    /// Reconnect hint in milliseconds.
    pub retry: Option<u64>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn typed(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Serializes `value` as the data payload.
    pub fn json<T: Serialize>(event: impl Into<String>, value: &T) -> Result<Self, RuntimeError> {
        let data = serde_json::to_string(value).map_err(|err| RuntimeError::InvalidRequest {
            message: format!("event payload is not serializable: {err}"),
        })?;
        Ok(Self::typed(event, data))
    }

    pub fn ping() -> Self {
        Self::typed("ping", "")
    }

    /// Terminal event sent before the server ends a stream.
    pub fn close(reason: &str) -> Self {
        Self::typed("close", serde_json::json!({ "reason": reason }).to_string())
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Wire form: `id`, `event`, `retry`, then one `data:` line per payload
    /// line, terminated by a blank line. An empty payload still gets one
    /// empty `data:` line; clients drop events that carry none.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(id) = &self.id {
            push_field(&mut out, "id", id);
        }
        if let Some(event) = &self.event {
            push_field(&mut out, "event", event);
        }
        if let Some(retry) = self.retry {
            push_field(&mut out, "retry", &retry.to_string());
        }
        for line in self.data.split('\n') {
            push_field(&mut out, "data", line.strip_suffix('\r').unwrap_or(line));
        }
        out.push('\n');
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode())
    }
}

// Line breaks inside single-line fields would start a new field.
fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.extend(value.chars().filter(|c| *c != '\n' && *c != '\r'));
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_event_is_a_single_data_line() {
        assert_eq!(SseEvent::data("hello").encode(), "data: hello\n\n");
    }

    #[test]
    fn multi_line_payload_gets_one_data_line_each() {
        let encoded = SseEvent::data("one\ntwo\r\nthree").encode();
        assert_eq!(encoded, "data: one\ndata: two\ndata: three\n\n");
        assert_eq!(encoded.matches("data: ").count(), 3);
    }

    #[test]
    fn trailing_newline_yields_trailing_empty_data_line() {
        assert_eq!(SseEvent::data("a\n").encode(), "data: a\ndata: \n\n");
    }

    #[test]
    fn prefix_fields_come_in_fixed_order() {
        let event = SseEvent::typed("delta", "x").with_retry(3000).with_id("7");
        assert_eq!(event.encode(), "id: 7\nevent: delta\nretry: 3000\ndata: x\n\n");
    }

    #[test]
    fn empty_payload_still_carries_a_data_line() {
        assert_eq!(SseEvent::ping().encode(), "event: ping\ndata: \n\n");
        assert_eq!(SseEvent::data("").encode(), "data: \n\n");
    }

    #[test]
    fn close_event_names_its_reason() {
        assert_eq!(
            SseEvent::close("server").encode(),
            "event: close\ndata: {\"reason\":\"server\"}\n\n"
        );
    }

    #[test]
    fn json_payload_is_serialized_to_one_line() {
        let event = SseEvent::json("done", &json!({"tokens": 3})).unwrap();
        assert_eq!(event.encode(), "event: done\ndata: {\"tokens\":3}\n\n");
    }

    #[test]
    fn newlines_in_id_are_stripped() {
        let event = SseEvent::data("x").with_id("a\nb");
        assert_eq!(event.encode(), "id: ab\ndata: x\n\n");
    }
}
