use regex::{Captures, Regex};

use super::Message;
use crate::config::{ConfigResult, ConfigurationError, HideMethod};

const MASK_CHAR: char = '*';

/// Masks sensitive content before a message is written to a store
#[derive(Debug, Clone)]
pub struct MessageMasker {
    regex: Regex,
    method: HideMethod,
}

impl MessageMasker {
    pub fn new(pattern: &str, method: HideMethod) -> ConfigResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConfigurationError::invalid_value("hide_regex", pattern, e.to_string()))?;
        Ok(Self { regex, method })
    }

    pub fn from_config(pattern: Option<&str>, method: HideMethod) -> ConfigResult<Option<Self>> {
        pattern
            .filter(|p| !p.is_empty())
            .map(|p| Self::new(p, method))
            .transpose()
    }

    pub fn mask(&self, text: &str) -> String {
        self.regex
            .replace_all(text, |caps: &Captures<'_>| {
                let matched = &caps[0];
                let length = matched.chars().count();
                let masked = match self.method {
                    HideMethod::All => length,
                    HideMethod::FirstHalf => length / 2,
                };
                let mut out: String = std::iter::repeat(MASK_CHAR).take(masked).collect();
                out.extend(matched.chars().skip(masked));
                out
            })
            .into_owned()
    }

    /// Masked copy of a textual message; binary payloads are returned as is
    pub fn mask_message(&self, message: &Message) -> Message {
        match message.as_str() {
            Some(text) => Message::from(self.mask(text)),
            None => message.clone(),
        }
    }
}
