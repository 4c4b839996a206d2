//! SSE connector kind: open an SSE stream to `url` carrying `headers` (§4.2).
//! Keep-alive scheduling lives in `connector::mod`; this module only opens
//! the transport and performs the initialize handshake.

use rmcp::{
    service::RunningService,
    transport::sse_client::{SseClientConfig, SseClientTransport},
    RoleClient, ServiceExt,
};

use crate::{
    error::{HubError, HubResult},
    settings::ServerConfig,
};

pub async fn connect(
    config: &ServerConfig,
    handler: super::ConnectorClientHandler,
) -> HubResult<RunningService<RoleClient, super::ConnectorClientHandler>> {
    let url = config
        .url
        .as_ref()
        .ok_or_else(|| HubError::Config("sse server requires `url`".to_string()))?;

    let client = reqwest_client_with_headers(&config.headers).map_err(|e| HubError::Config(
        format!("invalid header in sse server config: {e}"),
    ))?;

    let transport = SseClientTransport::start_with_client(
        client,
        SseClientConfig {
            sse_endpoint: url.clone().into(),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| HubError::Transport {
        server: url.clone(),
        message: format!("open sse transport: {e}"),
    })?;

    handler
        .serve(transport)
        .await
        .map_err(|e| HubError::Transport {
            server: url.clone(),
            message: format!("initialize sse client: {e}"),
        })
}

fn reqwest_client_with_headers(
    headers: &std::collections::HashMap<String, String>,
) -> Result<reqwest::Client, reqwest::header::InvalidHeaderValue> {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let Ok(name) = reqwest::header::HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        map.insert(name, reqwest::header::HeaderValue::from_str(value)?);
    }
    Ok(reqwest::Client::builder()
        .default_headers(map)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new()))
}
