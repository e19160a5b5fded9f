use crate::env::Environment;
use crate::error::ConfigError;

/// Number of repetitions for stress runs.
pub const STRESS_CYCLES: &str = "STRESS_CYCLES";
/// Name of a test to stress instead of running the whole suite.
pub const STRESS: &str = "STRESS";
/// Seed for the test order shuffle.
pub const SEED: &str = "SEED";
/// Names of tests that need exclusive access to the terminal.
pub const INTERACTIVE: &str = "INTERACTIVE";

pub(crate) const DEFAULT_STRESS_CYCLES: usize = 10;

/// Typed engine settings read out of an [`Environment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub stress_cycles: usize,
    pub stress: Option<String>,
    pub seed: Option<u64>,
    pub interactive: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stress_cycles: DEFAULT_STRESS_CYCLES,
            stress: None,
            seed: None,
            interactive: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_env(env: &Environment) -> Result<Self, ConfigError> {
        let stress_cycles = match env.text(STRESS_CYCLES) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(cycles) if cycles > 0 => cycles,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: STRESS_CYCLES,
                        expected: "a positive integer",
                        value: raw,
                    });
                }
            },
            None => DEFAULT_STRESS_CYCLES,
        };

        let seed = match env.text(SEED) {
            Some(raw) if !raw.trim().is_empty() => {
                Some(raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                    key: SEED,
                    expected: "an unsigned integer",
                    value: raw.clone(),
                })?)
            }
            _ => None,
        };

        let stress = env.text(STRESS).filter(|name| !name.trim().is_empty());

        Ok(Self {
            stress_cycles,
            stress,
            seed,
            interactive: env.list(INTERACTIVE),
        })
    }

    pub fn is_interactive(&self, name: &str) -> bool {
        self.interactive.iter().any(|item| item == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        Environment::builder()
            .default(STRESS, "")
            .default(SEED, "")
            .process_vars(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
            .build()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_env(&env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_values_from_process() {
        let settings = Settings::from_env(&env(&[
            ("STRESS_CYCLES", "100"),
            ("STRESS", "json"),
            ("SEED", "42"),
            ("INTERACTIVE", "ansi color"),
        ]))
        .unwrap();

        assert_eq!(settings.stress_cycles, 100);
        assert_eq!(settings.stress.as_deref(), Some("json"));
        assert_eq!(settings.seed, Some(42));
        assert!(settings.is_interactive("ansi"));
        assert!(settings.is_interactive("color"));
        assert!(!settings.is_interactive("json"));
    }

    #[test]
    fn test_rejects_zero_cycles() {
        let result = Settings::from_env(&env(&[("STRESS_CYCLES", "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid { key: STRESS_CYCLES, .. })));
    }

    #[test]
    fn test_rejects_bad_seed() {
        let result = Settings::from_env(&env(&[("SEED", "abc")]));
        assert!(matches!(result, Err(ConfigError::Invalid { key: SEED, .. })));
    }
}
