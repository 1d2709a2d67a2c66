use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use url::Url;
use watchparty_core::{ConnectionStatus, IngestEndpoint, Relay, RelayError, RoomId};

/// A client for a Cloudflare Stream style live input API.
///
/// Only provisions, polls and destroys endpoints. Pushing and playing media
/// needs a WebRTC [MediaLink](watchparty_core::MediaLink) from the embedding
/// application, so the in-process demo sticks to [LoopbackRelay](super::LoopbackRelay).
pub struct HttpRelay {
    client: Client,
    base_url: Url,
    account_id: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct LiveInput {
    uid: String,
    #[serde(rename = "webRTC")]
    web_rtc: UrlField,
    #[serde(rename = "webRTCPlayback")]
    web_rtc_playback: UrlField,
    #[serde(default)]
    status: Option<LiveInputStatus>,
}

#[derive(Debug, Deserialize)]
struct UrlField {
    url: String,
}

#[derive(Debug, Deserialize)]
struct LiveInputStatus {
    current: Option<CurrentStatus>,
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    state: Option<String>,
}

impl HttpRelay {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.cloudflare.com/client/v4/";

    pub fn new(base_url: Url, account_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }

    fn live_inputs_url(&self, id: Option<&str>) -> Result<Url, RelayError> {
        let path = match id {
            Some(id) => format!("accounts/{}/stream/live_inputs/{}", self.account_id, id),
            None => format!("accounts/{}/stream/live_inputs", self.account_id),
        };

        self.base_url
            .join(&path)
            .map_err(|e| RelayError::Request(e.to_string()))
    }

    async fn read<T>(response: Response, id: Option<&str>) -> Result<T, RelayError>
    where
        T: DeserializeOwned,
    {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(RelayError::NotFound(id.unwrap_or_default().to_string()));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        parse_envelope(status.as_u16(), envelope)
    }
}

fn parse_envelope<T>(status: u16, envelope: Envelope<T>) -> Result<T, RelayError> {
    let message = || {
        envelope
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    if !envelope.success || !(200..300).contains(&status) {
        return Err(RelayError::Rejected {
            status,
            message: message(),
        });
    }

    let rejected = RelayError::Rejected {
        status,
        message: "response has no result".to_string(),
    };

    envelope.result.ok_or(rejected)
}

fn to_status(input: &LiveInput) -> ConnectionStatus {
    let state = input
        .status
        .as_ref()
        .and_then(|s| s.current.as_ref())
        .and_then(|c| c.state.as_deref());

    match state {
        Some("connected") => ConnectionStatus::Connected,
        _ => ConnectionStatus::Pending,
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn create_ingest_endpoint(&self, room_id: RoomId) -> Result<IngestEndpoint, RelayError> {
        let body = json!({
            "meta": { "name": room_id.to_string() },
            "recording": { "mode": "off" },
        });

        let response = self
            .client
            .post(self.live_inputs_url(None)?)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let input: LiveInput = Self::read(response, None).await?;
        debug!("Created live input {} for room {}", input.uid, room_id);

        Ok(IngestEndpoint {
            id: input.uid,
            ingest_url: input.web_rtc.url,
            playback_url: input.web_rtc_playback.url,
        })
    }

    async fn connection_status(&self, endpoint_id: &str) -> Result<ConnectionStatus, RelayError> {
        let response = self
            .client
            .get(self.live_inputs_url(Some(endpoint_id))?)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let input: LiveInput = Self::read(response, Some(endpoint_id)).await?;

        Ok(to_status(&input))
    }

    async fn destroy_endpoint(&self, endpoint_id: &str) -> Result<(), RelayError> {
        let response = self
            .client
            .delete(self.live_inputs_url(Some(endpoint_id))?)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(RelayError::NotFound(endpoint_id.to_string()));
        }

        if !status.is_success() {
            return Err(RelayError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}
