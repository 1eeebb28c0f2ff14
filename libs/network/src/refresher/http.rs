//! HTTP configuration source.
//!
//! Streams bucket configurations from the cluster's config service over a
//! long-lived chunked HTTP response. Payloads on the stream are separated
//! by four newlines; the connection stays open until the server closes it
//! or the monitor is torn down.

use super::{no_config_source, ConfigPayload, ConfigSource, ConfigStream, Credentials, StreamMode};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use tracing::debug;

/// Separator between payloads on a streaming response.
const PAYLOAD_DELIMITER: &[u8] = b"\n\n\n\n";

/// Config source backed by the cluster's HTTP config endpoints.
pub struct HttpConfigSource {
    client: reqwest::Client,
    seed_hosts: Vec<String>,
    port: u16,
}

impl HttpConfigSource {
    pub fn new(seed_hosts: Vec<String>, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            seed_hosts,
            port,
        }
    }

    fn path(bucket: &str, mode: StreamMode, streaming: bool) -> String {
        match (mode, streaming) {
            (StreamMode::Terse, true) => format!("/pools/default/bs/{bucket}"),
            (StreamMode::Terse, false) => format!("/pools/default/b/{bucket}"),
            (StreamMode::Verbose, true) => format!("/pools/default/bucketsStreaming/{bucket}"),
            (StreamMode::Verbose, false) => format!("/pools/default/buckets/{bucket}"),
        }
    }

    async fn get(
        &self,
        host: &str,
        bucket: &str,
        auth: &Credentials,
        mode: StreamMode,
        streaming: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("http://{host}:{}{}", self.port, Self::path(bucket, mode, streaming));
        debug!(%url, "Fetching configuration");
        self.client
            .get(&url)
            .basic_auth(&auth.username, Some(&auth.password))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ClientError::config(format!("config request to {url} failed: {e}"), None))
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch_once(
        &self,
        bucket: &str,
        auth: &Credentials,
        mode: StreamMode,
    ) -> Result<ConfigPayload> {
        for host in &self.seed_hosts {
            match self.get(host, bucket, auth, mode, false).await {
                Ok(response) => {
                    let raw = response.text().await.map_err(|e| {
                        ClientError::config(format!("config body read failed: {e}"), None)
                    })?;
                    // The origin is the seed that answered, not seed zero.
                    return Ok(ConfigPayload {
                        raw,
                        origin: host.clone(),
                    });
                }
                Err(e) => debug!(%host, "Config fetch failed: {}", e),
            }
        }
        Err(no_config_source(bucket))
    }

    async fn open_stream(
        &self,
        bucket: &str,
        auth: &Credentials,
        mode: StreamMode,
    ) -> Result<ConfigStream> {
        for host in &self.seed_hosts {
            match self.get(host, bucket, auth, mode, true).await {
                Ok(response) => {
                    // Fused: the trailing-payload path polls once more after
                    // the inner stream ends.
                    let bytes = response.bytes_stream().fuse();
                    // Every payload on this connection was served by `host`.
                    let origin = host.clone();
                    let stream = futures::stream::try_unfold(
                        (bytes, BytesMut::new(), origin),
                        |(mut inner, mut buffer, origin)| async move {
                            loop {
                                if let Some(position) = find_delimiter(&buffer) {
                                    let chunk = buffer.split_to(position);
                                    buffer.advance(PAYLOAD_DELIMITER.len());
                                    let raw =
                                        String::from_utf8_lossy(&chunk).trim().to_string();
                                    if raw.is_empty() {
                                        continue;
                                    }
                                    let payload = ConfigPayload {
                                        raw,
                                        origin: origin.clone(),
                                    };
                                    return Ok(Some((payload, (inner, buffer, origin))));
                                }
                                match inner.next().await {
                                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                                    Some(Err(e)) => {
                                        return Err(ClientError::config(
                                            format!("config stream error: {e}"),
                                            None,
                                        ));
                                    }
                                    None => {
                                        // Server closed; a trailing payload
                                        // without delimiter still counts.
                                        let rest =
                                            String::from_utf8_lossy(&buffer).trim().to_string();
                                        buffer.clear();
                                        if rest.is_empty() {
                                            return Ok(None);
                                        }
                                        let payload = ConfigPayload {
                                            raw: rest,
                                            origin: origin.clone(),
                                        };
                                        return Ok(Some((payload, (inner, buffer, origin))));
                                    }
                                }
                            }
                        },
                    );
                    return Ok(stream.boxed());
                }
                Err(e) => debug!(%host, "Config stream open failed: {}", e),
            }
        }
        Err(no_config_source(bucket))
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(PAYLOAD_DELIMITER.len())
        .position(|window| window == PAYLOAD_DELIMITER)
}
