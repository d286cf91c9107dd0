use once_cell::sync::Lazy;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;

use crate::error::{Error, Result};

/// Helpers for the string-typed values the lounge wire format uses.
pub mod lounge_parse {
    pub fn parse_float(s: &str) -> f64 {
        s.parse::<f64>().unwrap_or(0.0)
    }

    pub fn parse_int(s: &str) -> i32 {
        s.parse::<i32>().unwrap_or(-1)
    }

    pub fn parse_bool(s: &str) -> bool {
        s == "true"
    }
}

static SID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\["c","([^"]*)""#).unwrap());
static GSESSIONID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\["S","([^"]*)""#).unwrap());

/// Extracts the `SID` / `gsessionid` pair from a bind response body.
pub fn extract_session_ids(body: &[u8]) -> Result<(String, String)> {
    let text = String::from_utf8_lossy(body);
    let sid = SID_RE
        .captures(&text)
        .and_then(|cap| cap.get(1).map(|m| m.as_str().to_string()));
    let gsessionid = GSESSIONID_RE
        .captures(&text)
        .and_then(|cap| cap.get(1).map(|m| m.as_str().to_string()));
    match (sid, gsessionid) {
        (Some(sid), Some(gsessionid)) => Ok((sid, gsessionid)),
        _ => Err(Error::InvalidResponse(
            "failed to obtain session ids".to_string(),
        )),
    }
}

/// Random `zx` nonce for bind requests.
pub fn request_nonce() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_from_bind_body() {
        let body = br#"266
[[0,["c","SID_VALUE","",8]]
,[1,["S","GSESSION_VALUE"]]
]"#;
        let (sid, gsessionid) = extract_session_ids(body).unwrap();
        assert_eq!(sid, "SID_VALUE");
        assert_eq!(gsessionid, "GSESSION_VALUE");
    }

    #[test]
    fn missing_ids_is_an_error() {
        assert!(extract_session_ids(b"[]").is_err());
    }

    #[test]
    fn nonce_shape() {
        let nonce = request_nonce();
        assert_eq!(nonce.len(), 12);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
