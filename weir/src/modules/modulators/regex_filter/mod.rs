//! Regex filter: accept or reject messages by payload pattern
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, Filter, FilterVerdict, Message};

#[derive(Deserialize, Serialize)]
struct RegexFilterConfig {
    label: Option<String>,
    /// messages must match to pass
    allow: Option<String>,
    /// matching messages are dropped
    deny: Option<String>,
    /// judge this metadata path instead of the payload
    apply_to: Option<String>,
}

/// Accepts messages matching `allow` (when set) and rejects messages
/// matching `deny` (when set). With `apply_to`, the judged text is read
/// from a metadata path; a missing path passes `deny` and fails `allow`.
pub struct RegexFilter {
    allow: Option<Regex>,
    deny: Option<Regex>,
    apply_to: Option<String>,
}

impl RegexFilter {
    fn subject(&self, message: &Message) -> Result<Option<String>, Error> {
        match &self.apply_to {
            Some(path) => message.metadata.get_str(path),
            None => {
                let text = String::from_utf8(message.bytes.clone())
                    .map_err(|e| Error::ModulatorError(format!("{e}")))?;
                Ok(Some(text))
            }
        }
    }
}

impl Filter for RegexFilter {
    fn check(&self, message: &Message) -> Result<FilterVerdict, Error> {
        let subject = match self.subject(message)? {
            Some(text) => text,
            None => {
                // absent metadata: nothing to deny, nothing to allow
                return Ok(if self.allow.is_some() {
                    FilterVerdict::Drop
                } else {
                    FilterVerdict::Accept
                });
            }
        };
        if let Some(deny) = &self.deny {
            if deny.is_match(&subject) {
                return Ok(FilterVerdict::Drop);
            }
        }
        if let Some(allow) = &self.allow {
            if !allow.is_match(&subject) {
                return Ok(FilterVerdict::Drop);
            }
        }
        Ok(FilterVerdict::Accept)
    }
}

#[weir_plugin_factory]
fn create_regex_filter(conf: Value) -> Result<ExecutionType, Error> {
    let c: RegexFilterConfig = serde_yaml::from_value(conf.clone())?;
    if c.allow.is_none() && c.deny.is_none() {
        return Err(Error::ConfigFailedValidation(
            "regex_filter requires allow or deny".into(),
        ));
    }
    let compile = |pattern: &Option<String>| -> Result<Option<Regex>, Error> {
        match pattern {
            Some(p) => Regex::new(p)
                .map(Some)
                .map_err(|e| Error::ConfigFailedValidation(format!("{e}"))),
            None => Ok(None),
        }
    };
    let s = RegexFilter {
        allow: compile(&c.allow)?,
        deny: compile(&c.deny)?,
        apply_to: c.apply_to,
    };
    Ok(ExecutionType::Filter(Box::new(s)))
}

pub(super) fn register_regex_filter() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  allow:
    type: string
  deny:
    type: string
  apply_to:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "regex_filter".into(),
        ItemType::Filter,
        conf_spec,
        create_regex_filter,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn filter(allow: Option<&str>, deny: Option<&str>) -> RegexFilter {
        RegexFilter {
            allow: allow.map(|p| Regex::new(p).unwrap()),
            deny: deny.map(|p| Regex::new(p).unwrap()),
            apply_to: None,
        }
    }

    fn msg(text: &str) -> Message {
        Message {
            bytes: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn register_plugin() {
        register_regex_filter().unwrap()
    }

    #[test]
    fn deny_drops_matching_messages() {
        let f = filter(None, Some("Z"));
        assert_eq!(f.check(&msg("abc")).unwrap(), FilterVerdict::Accept);
        assert_eq!(f.check(&msg("123Z")).unwrap(), FilterVerdict::Drop);
        assert_eq!(f.check(&msg("def")).unwrap(), FilterVerdict::Accept);
    }

    #[test]
    fn allow_requires_a_match() {
        let f = filter(Some("^prod-"), None);
        assert_eq!(f.check(&msg("prod-web")).unwrap(), FilterVerdict::Accept);
        assert_eq!(f.check(&msg("dev-web")).unwrap(), FilterVerdict::Drop);
    }

    #[test]
    fn deny_wins_over_allow() {
        let f = filter(Some("web"), Some("secret"));
        assert_eq!(f.check(&msg("web ok")).unwrap(), FilterVerdict::Accept);
        assert_eq!(f.check(&msg("web secret")).unwrap(), FilterVerdict::Drop);
    }

    #[test]
    fn metadata_subject() {
        let mut message = msg("payload");
        message.metadata.set("origin", "edge-7").unwrap();
        let f = RegexFilter {
            allow: Some(Regex::new("^edge-").unwrap()),
            deny: None,
            apply_to: Some("origin".into()),
        };
        assert_eq!(f.check(&message).unwrap(), FilterVerdict::Accept);

        let plain = msg("payload");
        assert_eq!(f.check(&plain).unwrap(), FilterVerdict::Drop);
    }

    #[test]
    fn invalid_utf8_is_a_modulator_error() {
        let f = filter(None, Some("Z"));
        let message = Message {
            bytes: vec![0xff, 0xfe],
            ..Default::default()
        };
        assert!(f.check(&message).is_err());
    }

    #[test]
    fn factory_requires_a_pattern() {
        let v: Value = serde_yaml::from_str("label: bare").unwrap();
        let result = tokio_test::block_on(create_regex_filter(v));
        assert!(result.is_err());
    }
}
