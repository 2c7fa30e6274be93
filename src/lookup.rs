//! HTTP client for `nsqlookupd`'s topic → producer discovery, plus the
//! handful of read-only endpoints (§4.7) supplemented from the reference
//! client's `Lookupd` class.

use serde::Deserialize;

use crate::error::{NsqError, Result};
use crate::protocol::assert_valid_topic_name;

const ACCEPT_HEADER: &str = "application/vnd.nsq; version=1.0";

#[derive(Debug, Deserialize)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
    pub http_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LookupResult {
    #[serde(default)]
    pub producers: Vec<Producer>,
    #[serde(default)]
    pub channels: Vec<String>,
}

pub struct LookupClient {
    base_url: String,
    user_agent: String,
    http: reqwest::Client,
}

impl LookupClient {
    pub fn new(address: &str) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        LookupClient {
            base_url,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            http: reqwest::Client::new(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .header("Accept", ACCEPT_HEADER)
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(NsqError::HttpError(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(resp.json::<T>().await?)
    }

    pub async fn lookup(&self, topic: &str) -> Result<LookupResult> {
        assert_valid_topic_name(topic)?;
        self.get_json("/lookup", &[("topic", topic)]).await
    }

    pub async fn topics(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            topics: Vec<String>,
        }
        let resp: Resp = self.get_json("/topics", &[]).await?;
        Ok(resp.topics)
    }

    pub async fn channels(&self, topic: &str) -> Result<Vec<String>> {
        assert_valid_topic_name(topic)?;
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            channels: Vec<String>,
        }
        let resp: Resp = self.get_json("/channels", &[("topic", topic)]).await?;
        Ok(resp.channels)
    }

    pub async fn nodes(&self) -> Result<Vec<Producer>> {
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            producers: Vec<Producer>,
        }
        let resp: Resp = self.get_json("/nodes", &[]).await?;
        Ok(resp.producers)
    }

    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/ping", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NsqError::HttpError(format!("ping returned {}", resp.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_address_to_http_url() {
        let client = LookupClient::new("127.0.0.1:4161");
        assert_eq!(client.base_url, "http://127.0.0.1:4161");
    }

    #[test]
    fn preserves_explicit_scheme() {
        let client = LookupClient::new("https://lookupd.internal:4161");
        assert_eq!(client.base_url, "https://lookupd.internal:4161");
    }
}
