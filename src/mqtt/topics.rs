use crate::hub::HubMessage;
use url::form_urlencoded;

pub const DEFAULT_EVENTS_PREFIX: &str = "hub/events";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicBuilder {
    prefix: String,
    device_id: String,
}

impl TopicBuilder {
    pub fn new(device_id: String) -> Self {
        Self {
            prefix: "devices".to_string(),
            device_id,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Device-to-cloud topic with the message system properties in the trailing property bag.
    pub fn telemetry(&self, message: &HubMessage) -> String {
        format!(
            "{}/{}/messages/events/{}",
            self.prefix,
            self.device_id,
            property_bag(message)
        )
    }

    pub fn cloud_to_device(&self) -> String {
        format!("{}/{}/messages/devicebound/#", self.prefix, self.device_id)
    }
}

/// Topics of the hub-wide partitioned event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopics {
    prefix: String,
}

impl EventTopics {
    pub fn new(prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_EVENTS_PREFIX);
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Shared subscription covering every partition for one consumer group.
    pub fn group_filter(&self, consumer_group: &str) -> String {
        format!("$share/{}/{}/partitions/+", consumer_group, self.prefix)
    }

    pub fn parse_partition(&self, topic: &str) -> Option<String> {
        let expected_prefix = format!("{}/partitions/", self.prefix);
        let partition = topic.strip_prefix(&expected_prefix)?;
        if partition.is_empty() || partition.contains('/') {
            None
        } else {
            Some(partition.to_string())
        }
    }
}

/// Returns the property bag of a cloud-to-device topic, if the topic belongs to this device.
pub fn parse_cloud_to_device_topic(topic: &str, device_id: &str) -> Option<String> {
    let expected_prefix = format!("devices/{}/messages/devicebound/", device_id);
    topic
        .strip_prefix(&expected_prefix)
        .map(|bag| bag.to_string())
}

pub fn property_bag(message: &HubMessage) -> String {
    let mut properties = vec![("$.mid", message.message_id.as_str())];
    if let Some(content_type) = &message.content_type {
        properties.push(("$.ct", content_type.as_str()));
    }
    if let Some(encoding) = &message.content_encoding {
        properties.push(("$.ce", encoding.as_str()));
    }

    properties
        .into_iter()
        .map(|(key, value)| {
            let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
            format!("{}={}", key, encoded)
        })
        .collect::<Vec<_>>()
        .join("&")
}
