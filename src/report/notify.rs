//! Human readable status messages sent to a chat.

use reqwest::blocking::Client;
use reqwest::Url;

/// Default base URL of the Telegram bot API.
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Delivery of status messages.
///
/// Implementations must not fail: errors are logged and swallowed.
pub trait Notify {
    fn notify(&self, message: &str);
}

impl<N: Notify + ?Sized> Notify for &N {
    fn notify(&self, message: &str) {
        (**self).notify(message)
    }
}

impl<N: Notify + ?Sized> Notify for Box<N> {
    fn notify(&self, message: &str) {
        (**self).notify(message)
    }
}

/// Sends messages through a Telegram bot, prefixed with the node identity.
pub struct TelegramNotifier {
    client: Client,
    endpoint: Url,
    chat_id: String,
    node: String,
}

#[derive(serde::Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(api_url: &Url, token: &str, chat_id: &str, node: &str) -> reqwest::Result<Self> {
        let mut endpoint = api_url.clone();
        if let Ok(mut segments) = endpoint.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&format!("bot{token}"))
                .push("sendMessage");
        }

        Ok(Self {
            client: super::http_client()?,
            endpoint,
            chat_id: chat_id.to_string(),
            node: node.to_string(),
        })
    }

    fn send(&self, text: &str) -> reqwest::Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()?
            .error_for_status()?;

        Ok(())
    }
}

impl Notify for TelegramNotifier {
    fn notify(&self, message: &str) {
        let text = format!("[{}] {message}", self.node);
        log::debug!(target: "notify", "Sending: {text}");

        if let Err(e) = self.send(&text) {
            // the token is part of the url, don't leak it into the log
            log::error!(target: "notify", "Telegram send error: {}", e.without_url());
        }
    }
}

/// Used when no chat is configured: messages only end up in the log.
pub struct LogNotifier {
    node: String,
}

impl LogNotifier {
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
        }
    }
}

impl Notify for LogNotifier {
    fn notify(&self, message: &str) {
        log::info!(target: "notify", "[{}] {message}", self.node);
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    #[test]
    fn posts_prefixed_message() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::Json(serde_json::json!({
                "chat_id": "-100",
                "text": "[10.0.0.5] Backup VM 101 succeeded",
            })))
            .with_status(200)
            .create();

        let api = Url::parse(&server.url()).unwrap();
        let notifier = TelegramNotifier::new(&api, "TOKEN", "-100", "10.0.0.5").unwrap();
        notifier.notify("Backup VM 101 succeeded");

        mock.assert();
    }

    #[test]
    fn swallows_delivery_failures() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(502)
            .create();

        let api = Url::parse(&server.url()).unwrap();
        let notifier = TelegramNotifier::new(&api, "TOKEN", "-100", "node").unwrap();
        notifier.notify("does not panic");

        mock.assert();
    }
}
