use regex::Regex;
use serde_json::Value;

use super::Message;
use crate::config::{ConfigResult, ConfigurationError, ReceiverConfig};

/// Resolves the business correlation id from a message payload
#[derive(Debug, Clone)]
pub enum CorrelationIdExtractor {
    /// JSON pointer into a JSON payload
    JsonPointer(String),
    /// First capture group (or the whole match) of a regular expression
    Pattern(Regex),
}

impl CorrelationIdExtractor {
    pub fn from_config(config: &ReceiverConfig) -> ConfigResult<Option<Self>> {
        if let Some(pointer) = config.correlation_id_pointer.as_ref().filter(|p| !p.is_empty()) {
            return Ok(Some(Self::JsonPointer(pointer.clone())));
        }
        config
            .correlation_id_pattern
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|pattern| {
                Regex::new(pattern).map(Self::Pattern).map_err(|e| {
                    ConfigurationError::invalid_value("correlation_id_pattern", pattern.clone(), e.to_string())
                })
            })
            .transpose()
    }

    /// Extracted id, or `None` when the payload does not yield a non-empty value
    pub fn extract(&self, message: &Message) -> Option<String> {
        let text = message.as_str()?;
        let extracted = match self {
            Self::JsonPointer(pointer) => {
                let document: Value = serde_json::from_str(text).ok()?;
                match document.pointer(pointer)? {
                    Value::String(s) => s.clone(),
                    Value::Null => return None,
                    other => other.to_string(),
                }
            }
            Self::Pattern(regex) => {
                let caps = regex.captures(text)?;
                caps.get(1).or_else(|| caps.get(0))?.as_str().to_string()
            }
        };
        let trimmed = extracted.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_pointer() {
        let config = ReceiverConfig {
            correlation_id_pointer: Some("/header/ref".to_string()),
            ..ReceiverConfig::named("r")
        };
        let extractor = CorrelationIdExtractor::from_config(&config).unwrap().unwrap();
        let message = Message::from(r#"{"header":{"ref":"ORD-7"},"body":{}}"#);
        assert_eq!(extractor.extract(&message), Some("ORD-7".to_string()));

        let numeric = Message::from(r#"{"header":{"ref":17}}"#);
        assert_eq!(extractor.extract(&numeric), Some("17".to_string()));

        assert_eq!(extractor.extract(&Message::from("not json")), None);
    }

    #[test]
    fn test_pattern_capture() {
        let config = ReceiverConfig {
            correlation_id_pattern: Some(r"<ref>([^<]+)</ref>".to_string()),
            ..ReceiverConfig::named("r")
        };
        let extractor = CorrelationIdExtractor::from_config(&config).unwrap().unwrap();
        assert_eq!(
            extractor.extract(&Message::from("<m><ref> A-1 </ref></m>")),
            Some("A-1".to_string())
        );
        assert_eq!(extractor.extract(&Message::from("<m/>")), None);
    }

    #[test]
    fn test_not_configured() {
        let config = ReceiverConfig::named("r");
        assert!(CorrelationIdExtractor::from_config(&config).unwrap().is_none());
    }
}
