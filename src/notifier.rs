// =============================================================================
// Chat notifier -- Telegram-style `sendMessage`, disabled when credentials
// are absent.
// =============================================================================

use std::time::Duration;

use tracing::warn;

const MAX_MESSAGE_LEN: usize = 4000;
const MIN_SEND_INTERVAL: Duration = Duration::from_millis(400);

pub struct Notifier {
    client: reqwest::Client,
    token: Option<String>,
    chat_id: Option<String>,
}

impl Notifier {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            chat_id,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some() && self.chat_id.is_some()
    }

    /// Split `text` on line boundaries into chunks of at most
    /// [`MAX_MESSAGE_LEN`] characters, then send each with inter-message
    /// pacing of at least [`MIN_SEND_INTERVAL`].
    pub async fn notify(&self, text: String) {
        if !self.is_enabled() {
            return;
        }
        let token = self.token.as_ref().unwrap();
        let chat_id = self.chat_id.as_ref().unwrap();
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");

        for (i, chunk) in split_on_line_boundaries(&text, MAX_MESSAGE_LEN).into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(MIN_SEND_INTERVAL).await;
            }

            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "disable_web_page_preview": true,
            });

            if let Err(e) = self.client.post(&url).json(&body).send().await {
                warn!(error = %e, "notifier: sendMessage failed");
            }
        }
    }
}

/// Greedily pack lines into chunks no longer than `max_len`, splitting on
/// `\n` boundaries. A single line longer than `max_len` is hard-split.
fn split_on_line_boundaries(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let candidate_len = current.len() + if current.is_empty() { 0 } else { 1 } + line.len();
        if candidate_len > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if line.len() > max_len {
            for hard_chunk in line.as_bytes().chunks(max_len) {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                chunks.push(String::from_utf8_lossy(hard_chunk).to_string());
            }
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_credentials() {
        let n = Notifier::new(None, None);
        assert!(!n.is_enabled());
    }

    #[test]
    fn enabled_with_both_credentials() {
        let n = Notifier::new(Some("t".to_string()), Some("c".to_string()));
        assert!(n.is_enabled());
    }

    #[test]
    fn splits_long_text_on_line_boundaries() {
        let line = "x".repeat(100);
        let text: String = (0..100).map(|_| line.clone()).collect::<Vec<_>>().join("\n");
        let chunks = split_on_line_boundaries(&text, 4000);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len() <= 4000);
        }
    }

    #[test]
    fn short_text_stays_one_chunk() {
        let chunks = split_on_line_boundaries("hello\nworld", 4000);
        assert_eq!(chunks, vec!["hello\nworld".to_string()]);
    }
}
