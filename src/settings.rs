use std::env;
use std::path::PathBuf;

/// Process-level knobs, read once from the environment with fallbacks.
///
/// The CLI layers on top of this: a flag given on the command line wins over
/// the corresponding variable.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub debug: bool,
    pub http_tracing: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        // optionally load .env
        let _ = dotenvy::dotenv();

        Settings {
            data_dir: PathBuf::from(env::var("SBTV_DATA_DIR").unwrap_or_else(|_| "data".into())),
            debug: parse_bool_var("SBTV_DEBUG", false),
            http_tracing: parse_bool_var("SBTV_HTTP_TRACING", false),
        }
    }
}

fn parse_bool_var(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(value) => parse_bool(&value).unwrap_or(default),
        Err(_) => default,
    }
}

/// Accepts the usual truthy/falsy spellings, returns None for anything else.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
