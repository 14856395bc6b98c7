//! Confirms that a device was actually linked by watching the bridge's
//! accounts endpoint for an E.164 number.

use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Default number of verification checks (one immediate + retries).
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Default pause between verification checks.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one accounts-endpoint check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// A device is linked under this E.164 number.
    Linked(String),
    NotLinked,
}

impl VerificationResult {
    pub fn is_linked(&self) -> bool {
        matches!(self, VerificationResult::Linked(_))
    }
}

pub struct LinkVerifier {
    client: Client,
}

impl LinkVerifier {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// One request against the accounts endpoint. Transport errors count as
    /// not-linked; the caller decides whether to retry.
    pub async fn check(&self, url: &str) -> VerificationResult {
        let body = match self.client.get(url).send().await {
            Ok(r) => r.text().await.unwrap_or_default(),
            Err(e) => {
                debug!("accounts endpoint not reachable: {}", e);
                return VerificationResult::NotLinked;
            }
        };
        match extract_number(&body) {
            Some(number) => VerificationResult::Linked(number),
            None => VerificationResult::NotLinked,
        }
    }

    /// Check immediately, then retry up to `attempts - 1` more times with
    /// `interval` between checks, absorbing the latency of the human scan.
    /// Returns the final result; never retries indefinitely.
    pub async fn verify_with_retry(
        &self,
        url: &str,
        attempts: u32,
        interval: Duration,
    ) -> VerificationResult {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            let result = self.check(url).await;
            if result.is_linked() || attempt == attempts {
                return result;
            }
            debug!("no linked device yet (check {}/{})", attempt, attempts);
            tokio::time::sleep(interval).await;
        }
        VerificationResult::NotLinked
    }
}

impl Default for LinkVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// First E.164 number in an accounts response. The bridge returns a JSON
/// array of account numbers; nested object shapes and plain-text bodies from
/// older bridge versions are handled too.
pub fn extract_number(body: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => first_number_in(&value),
        Err(_) => scan_tokens(body),
    }
}

fn first_number_in(value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match value {
        Value::String(s) => scan_tokens(s),
        Value::Array(items) => items.iter().find_map(first_number_in),
        Value::Object(map) => map.values().find_map(first_number_in),
        _ => None,
    }
}

/// First phone-number-shaped token in `body`: a `+` followed by 1 to 15
/// digits (E.164). Longer digit runs are not phone numbers and are skipped.
fn scan_tokens(body: &str) -> Option<String> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while let Some(offset) = body[i..].find('+') {
        let start = i + offset;
        let digits = bytes[start + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if (1..=15).contains(&digits) {
            return Some(body[start..start + 1 + digits].to_string());
        }
        i = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_number_from_accounts_body() {
        assert_eq!(
            extract_number(r#"["+15551234567"]"#),
            Some("+15551234567".to_string())
        );
    }

    #[test]
    fn no_token_means_not_linked() {
        assert_eq!(extract_number("[]"), None);
        assert_eq!(extract_number("plus + nothing"), None);
        assert_eq!(extract_number(""), None);
    }

    #[test]
    fn nested_account_objects_are_searched() {
        assert_eq!(
            extract_number(r#"[{"number": "+15551234567", "uuid": "abc"}]"#),
            Some("+15551234567".to_string())
        );
    }

    #[test]
    fn digit_runs_longer_than_e164_are_skipped() {
        assert_eq!(extract_number("+1234567890123456"), None);
        // A later valid token still matches.
        assert_eq!(
            extract_number("+1234567890123456 +49301234"),
            Some("+49301234".to_string())
        );
    }

    #[tokio::test]
    async fn check_finds_linked_number() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/accounts")
            .with_header("content-type", "application/json")
            .with_body(r#"["+15551234567"]"#)
            .create_async()
            .await;

        let verifier = LinkVerifier::new();
        let result = verifier.check(&format!("{}/v1/accounts", server.url())).await;
        assert_eq!(result, VerificationResult::Linked("+15551234567".to_string()));
    }

    #[tokio::test]
    async fn retry_is_bounded() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/v1/accounts")
            .with_body("[]")
            .expect(3)
            .create_async()
            .await;

        let verifier = LinkVerifier::new();
        let result = verifier
            .verify_with_retry(
                &format!("{}/v1/accounts", server.url()),
                3,
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(result, VerificationResult::NotLinked);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn retry_stops_early_on_link() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/accounts")
            .with_body(r#"["+15559876543"]"#)
            .create_async()
            .await;

        let verifier = LinkVerifier::new();
        let result = verifier
            .verify_with_retry(
                &format!("{}/v1/accounts", server.url()),
                5,
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(result, VerificationResult::Linked("+15559876543".to_string()));
    }
}
