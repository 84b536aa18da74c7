use std::hash::Hash;

use crate::Map;
use crate::common::error::ConfigurationError;

/// Enumerated option of one driver variant.
pub trait OptionKey: Copy + Eq + Hash + 'static {
    /// Name of the driver that owns the option, used in error messages.
    const DRIVER: &'static str;

    fn all() -> &'static [Self];
    fn name(&self) -> &'static str;
    fn default_value(&self) -> Option<&'static str>;

    /// Checks a value before it is stored.
    fn validate(&self, _value: &str) -> bool {
        true
    }

    fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|key| key.name() == name)
    }
}

/// Configured values of a driver, falling back to option defaults.
#[derive(Debug, Clone)]
pub struct DriverOptions<K: OptionKey> {
    values: Map<K, String>,
}

impl<K: OptionKey> Default for DriverOptions<K> {
    fn default() -> Self {
        Self {
            values: Default::default(),
        }
    }
}

impl<K: OptionKey> DriverOptions<K> {
    /// Stores `value` under the option called `name`.
    /// Unknown options and invalid values are refused and leave the table untouched.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        let Some(key) = K::parse(name) else {
            log::warn!("Driver {} has no option {name}", K::DRIVER);
            return false;
        };
        if !key.validate(value) {
            log::warn!("Invalid value `{value}` of option {name} of driver {}", K::DRIVER);
            return false;
        }
        log::debug!("Driver {}: {name} = {value}", K::DRIVER);
        self.values.insert(key, value.to_string());
        true
    }

    pub fn get(&self, key: K) -> Option<&str> {
        self.values
            .get(&key)
            .map(|value| value.as_str())
            .or_else(|| key.default_value())
    }

    pub fn get_by_name(&self, name: &str) -> Result<String, ConfigurationError> {
        let key = K::parse(name).ok_or_else(|| ConfigurationError::UnknownOption {
            driver: K::DRIVER,
            option: name.to_string(),
        })?;
        self.get(key)
            .map(|value| value.to_string())
            .ok_or(ConfigurationError::MissingValue {
                driver: K::DRIVER,
                option: key.name(),
            })
    }

    pub fn names() -> Vec<&'static str> {
        K::all().iter().map(|key| key.name()).collect()
    }
}
