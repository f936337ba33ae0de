//! Delivery backends for rendered notification bodies.

use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use thiserror::Error;

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01";
const PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} rejected the message: {detail}")]
    Rejected { service: &'static str, detail: String },
}

/// SMS delivery through Twilio's Messages endpoint, one send per recipient.
pub struct TwilioSink {
    account_sid: String,
    auth_token: String,
    from_number: String,
    recipients: Vec<String>,
    live: bool,
    client: Client,
}

impl TwilioSink {
    pub fn new(
        account_sid: String,
        auth_token: String,
        from_number: String,
        recipients: Vec<String>,
        live: bool,
    ) -> Result<Self, DeliveryError> {
        Ok(TwilioSink {
            account_sid,
            auth_token,
            from_number,
            recipients,
            live,
            client: Client::builder().timeout(HTTP_TIMEOUT).build()?,
        })
    }

    async fn send_one(&self, recipient: &str, body: &str) -> Result<(), DeliveryError> {
        if !self.live {
            println!("not live: to: {recipient}, from: {}, body: {body}", self.from_number);
            return Ok(());
        }

        let url = format!("{TWILIO_API}/Accounts/{}/Messages.json", self.account_sid);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", recipient),
                ("From", self.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let detail = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(DeliveryError::Rejected { service: "twilio", detail });
        }
        Ok(())
    }

    async fn send_all(&self, body: &str) -> Result<(), DeliveryError> {
        let sends = self.recipients.iter().map(|r| self.send_one(r, body));
        join_all(sends).await.into_iter().collect()
    }
}

/// Push delivery through Pushover; a single POST per message.
pub struct PushoverSink {
    user_key: String,
    api_token: String,
    live: bool,
    client: Client,
}

impl PushoverSink {
    pub fn new(user_key: String, api_token: String, live: bool) -> Result<Self, DeliveryError> {
        Ok(PushoverSink {
            user_key,
            api_token,
            live,
            client: Client::builder().timeout(HTTP_TIMEOUT).build()?,
        })
    }

    async fn send(&self, body: &str) -> Result<(), DeliveryError> {
        if !self.live {
            println!("not live: to: {}, body: {body}", self.user_key);
            return Ok(());
        }

        let response = self
            .client
            .post(PUSHOVER_API)
            .form(&[
                ("token", self.api_token.as_str()),
                ("user", self.user_key.as_str()),
                ("message", body),
            ])
            .send()
            .await?;

        let status = response.status();
        let payload = response.json::<serde_json::Value>().await.unwrap_or_default();
        let accepted = payload.get("status").and_then(|s| s.as_i64()) == Some(1);
        if !status.is_success() || !accepted {
            let detail = payload
                .get("errors")
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("http status {status}"));
            return Err(DeliveryError::Rejected { service: "pushover", detail });
        }
        Ok(())
    }
}

/// A delivery backend. One instance may serve many watchers.
pub enum Sink {
    Stdout,
    Twilio(TwilioSink),
    Pushover(PushoverSink),
    #[cfg(test)]
    Capture(std::sync::Arc<std::sync::Mutex<Vec<String>>>),
}

impl Sink {
    pub fn kind(&self) -> &'static str {
        match self {
            Sink::Stdout => "stdout",
            Sink::Twilio(_) => "twilio",
            Sink::Pushover(_) => "pushover",
            #[cfg(test)]
            Sink::Capture(_) => "capture",
        }
    }

    /// Deliver one rendered body.
    pub async fn deliver(&self, body: &str) -> Result<(), DeliveryError> {
        match self {
            Sink::Stdout => {
                println!("{body}");
                Ok(())
            }
            Sink::Twilio(twilio) => twilio.send_all(body).await,
            Sink::Pushover(pushover) => pushover.send(body).await,
            #[cfg(test)]
            Sink::Capture(captured) => {
                captured.lock().unwrap().push(body.to_string());
                Ok(())
            }
        }
    }
}
