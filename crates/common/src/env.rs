use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

/// Read a knob's override from the environment. Unset or unreadable
/// variables keep the built-in default; a set variable that fails to parse
/// is ignored with a warning rather than taking the process down, since
/// knobs are read at first use, long after startup validation could have
/// caught them.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => {
            tracing::info!(knob = name, "Knob overridden to {value:?} from the environment");
            value
        },
        Err(e) => {
            tracing::warn!(
                knob = name,
                "Ignoring unparsable override {raw:?} ({e:?}), keeping default {default:?}"
            );
            default
        },
    }
}

#[cfg(test)]
mod tests {
    use super::env_config;

    #[test]
    fn test_default_and_parse_fallback() {
        assert_eq!(env_config("BACKFILL_KNOB_THAT_IS_NEVER_SET", 42usize), 42);

        std::env::set_var("BACKFILL_KNOB_ENV_TEST", "17");
        assert_eq!(env_config("BACKFILL_KNOB_ENV_TEST", 42usize), 17);

        std::env::set_var("BACKFILL_KNOB_ENV_TEST", "not a number");
        assert_eq!(env_config("BACKFILL_KNOB_ENV_TEST", 42usize), 42);
        std::env::remove_var("BACKFILL_KNOB_ENV_TEST");
    }
}
