//! Device topic templates
//!
//! Topics carry the device id in one path segment, e.g. `gw/{device_id}/up`.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEVICE_PLACEHOLDER: &str = "{device_id}";

/// A topic pattern with exactly one `{device_id}` segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicTemplate {
    template: String,
    prefix: String,
    suffix: String,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, String> {
        let (prefix, suffix) = template
            .split_once(DEVICE_PLACEHOLDER)
            .ok_or_else(|| format!("topic '{}' has no {} segment", template, DEVICE_PLACEHOLDER))?;
        if suffix.contains(DEVICE_PLACEHOLDER) {
            return Err(format!(
                "topic '{}' has more than one {} segment",
                template, DEVICE_PLACEHOLDER
            ));
        }
        if prefix.contains(['+', '#']) || suffix.contains(['+', '#']) {
            return Err(format!("topic '{}' must not contain wildcards", template));
        }
        Ok(Self {
            template: template.to_string(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Template from the text around the device segment, used verbatim
    pub fn around(prefix: &str, suffix: &str) -> Self {
        Self {
            template: format!("{}{}{}", prefix, DEVICE_PLACEHOLDER, suffix),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    /// Device id carried by `topic`, if it fits this template
    pub fn extract<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let id = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        (!id.is_empty() && !id.contains('/')).then_some(id)
    }

    pub fn render(&self, device_id: &str) -> String {
        format!("{}{}{}", self.prefix, device_id, self.suffix)
    }

    /// Subscription filter covering every device
    pub fn wildcard(&self) -> String {
        self.render("+")
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}

impl TryFrom<String> for TopicTemplate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TopicTemplate> for String {
    fn from(value: TopicTemplate) -> Self {
        value.template
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}
