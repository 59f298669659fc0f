//! Notification content and its plaintext encoding.
//!
//! The plaintext is the JSON a service worker's `push` handler reads:
//!
//! ```json
//! {"title":"…","body":"…","icon":"/favicon.png","badge":"/favicon.png",
//!  "tag":"new-topic","data":{"url":"/home","topicId":"…"}}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ece::MAX_PLAINTEXT_LEN;
use super::error::{CryptoError, DispatchError};

/// Inbound request shape: every field optional, defaults fill the gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    /// Notification title.
    #[serde(default)]
    pub title: Option<String>,
    /// Notification body text.
    #[serde(default)]
    pub body: Option<String>,
    /// Topic the notification announces, forwarded in `data.topicId`.
    #[serde(default)]
    pub topic_id: Option<String>,
    /// Page to open on click, forwarded in `data.url`.
    #[serde(default)]
    pub url: Option<String>,
}

/// Values used when a request leaves a field unset or empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    /// Default title.
    pub title: String,
    /// Default body.
    pub body: String,
    /// Icon path shown next to the notification.
    pub icon: String,
    /// Monochrome badge path.
    pub badge: String,
    /// Tag; notifications sharing a tag replace each other on the device.
    pub tag: String,
    /// Default click-through URL.
    pub url: String,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "رحلة الكتاب المقدس 📖".to_string(),
            body: "موضوع جديد متاح للقراءة!".to_string(),
            icon: "/favicon.png".to_string(),
            badge: "/favicon.png".to_string(),
            tag: "new-topic".to_string(),
            url: "/home".to_string(),
        }
    }
}

/// Routing data delivered alongside the visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingData {
    /// URL to open on click.
    pub url: String,
    /// Topic identifier, omitted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
}

/// A fully resolved notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Title.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Icon reference.
    pub icon: String,
    /// Badge reference.
    pub badge: String,
    /// Replacement tag.
    pub tag: String,
    /// Routing data.
    pub data: RoutingData,
}

impl Notification {
    /// Resolve a request against `defaults`. Empty strings count as unset.
    pub fn from_request(request: NotificationRequest, defaults: &NotificationDefaults) -> Self {
        let or_default = |value: Option<String>, fallback: &str| {
            value
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };

        Self {
            title: or_default(request.title, &defaults.title),
            body: or_default(request.body, &defaults.body),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            tag: defaults.tag.clone(),
            data: RoutingData {
                url: or_default(request.url, &defaults.url),
                topic_id: request.topic_id.filter(|id| !id.is_empty()),
            },
        }
    }

    /// Serialize to the plaintext every subscriber receives.
    ///
    /// Fails if the JSON does not fit in a single `aes128gcm` record, so an
    /// oversized notification is rejected before any per-subscriber work.
    pub fn to_payload(&self) -> Result<Bytes, DispatchError> {
        let json = serde_json::to_vec(self).map_err(|e| DispatchError::Payload(e.to_string()))?;
        if json.len() > MAX_PLAINTEXT_LEN {
            let err = CryptoError::PayloadTooLarge {
                size: json.len(),
                max: MAX_PLAINTEXT_LEN,
            };
            return Err(DispatchError::Payload(err.to_string()));
        }
        Ok(Bytes::from(json))
    }
}
