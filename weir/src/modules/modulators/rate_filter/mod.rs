//! Rate filter: drops messages beyond a per-second budget
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::sync::Mutex;
use std::time::Instant;
use weir_macros::weir_plugin_factory;

use crate::config::{register_plugin, ConfigSpec, ExecutionType, ItemType};
use crate::{Error, Filter, FilterVerdict, Message};

#[derive(Deserialize, Serialize)]
struct RateFilterConfig {
    label: Option<String>,
    per_second: u64,
}

struct Window {
    started: Instant,
    count: u64,
}

/// Accepts up to `per_second` messages per one-second window; the rest
/// are dropped.
pub struct RateFilter {
    per_second: u64,
    window: Mutex<Window>,
}

impl RateFilter {
    fn new(per_second: u64) -> Self {
        RateFilter {
            per_second,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }
}

impl Filter for RateFilter {
    fn check(&self, _message: &Message) -> Result<FilterVerdict, Error> {
        let mut window = match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if window.started.elapsed().as_secs() >= 1 {
            window.started = Instant::now();
            window.count = 0;
        }
        if window.count < self.per_second {
            window.count += 1;
            Ok(FilterVerdict::Accept)
        } else {
            Ok(FilterVerdict::Drop)
        }
    }
}

#[weir_plugin_factory]
fn create_rate_filter(conf: Value) -> Result<ExecutionType, Error> {
    let c: RateFilterConfig = serde_yaml::from_value(conf.clone())?;
    if c.per_second == 0 {
        return Err(Error::ConfigFailedValidation(
            "per_second must be positive".into(),
        ));
    }
    Ok(ExecutionType::Filter(Box::new(RateFilter::new(c.per_second))))
}

pub(super) fn register_rate_filter() -> Result<(), Error> {
    let config = "type: object
properties:
  label:
    type: string
  per_second:
    type: integer
required:
  - per_second";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_plugin(
        "rate_filter".into(),
        ItemType::Filter,
        conf_spec,
        create_rate_filter,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_plugin() {
        register_rate_filter().unwrap()
    }

    #[test]
    fn budget_is_enforced_within_a_window() {
        let f = RateFilter::new(3);
        let m = Message::default();
        for _ in 0..3 {
            assert_eq!(f.check(&m).unwrap(), FilterVerdict::Accept);
        }
        assert_eq!(f.check(&m).unwrap(), FilterVerdict::Drop);
        assert_eq!(f.check(&m).unwrap(), FilterVerdict::Drop);
    }

    #[test]
    fn zero_budget_is_a_config_error() {
        let v: Value = serde_yaml::from_str("per_second: 0").unwrap();
        assert!(tokio_test::block_on(create_rate_filter(v)).is_err());
    }
}
