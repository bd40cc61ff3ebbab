use std::time::Duration;

use reqwest::Client;
use url::Url;

use super::{announce::Announce, response::Response, Result, URL_ENCODE_RESERVED};
use crate::error::tracker::TrackerError;

/// How long we wait for an HTTP tracker before giving up on the announce.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// An HTTP tracker for a torrent, from which we can request peers and to
/// which we announce transfer progress.
pub struct HttpTracker {
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        HttpTracker {
            client: Client::builder()
                .timeout(ANNOUNCE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends an announce request to the tracker with the specified
    /// parameters.
    pub async fn announce(&self, params: &Announce) -> Result<Response> {
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            ("compact", "1".to_string()),
        ];

        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }
        if let Some(ip) = &params.ip {
            query.push(("ip", ip.to_string()));
        }
        if let Some(event) = params.event {
            query.push(("event", event.query_str().to_string()));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push(("trackerid", tracker_id.clone()));
        }

        // the info hash and peer id are raw bytes and have to be URL
        // encoded by hand: reqwest's query serialization would treat them
        // as (invalid) UTF-8
        let url = format!(
            "{url}\
            ?info_hash={info_hash}\
            &peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encoding::percent_encode(
                &params.info_hash,
                URL_ENCODE_RESERVED
            ),
            peer_id = percent_encoding::percent_encode(
                &params.peer_id,
                URL_ENCODE_RESERVED
            )
        );

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout
                } else {
                    TrackerError::Http(e)
                }
            })?
            .error_for_status()?
            .bytes()
            .await?;

        let mut resp: Response = serde_bencode::from_bytes(&resp)?;
        if let Some(reason) = resp.failure_reason.take() {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &resp.warning_message {
            log::warn!("Tracker {} warning: {}", self.url, warning);
        }
        Ok(resp)
    }
}
