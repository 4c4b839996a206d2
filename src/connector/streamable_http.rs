//! Streamable-HTTP connector kind: bi-directional HTTP session to `url`
//! carrying `headers` (§4.2).

use rmcp::{
    service::RunningService,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
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
        .ok_or_else(|| HubError::Config("streamable-http server requires `url`".to_string()))?;

    let client = reqwest_client_with_headers(&config.headers).map_err(|e| {
        HubError::Config(format!(
            "invalid header in streamable-http server config: {e}"
        ))
    })?;

    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url.as_str().to_string()),
    );

    handler
        .serve(transport)
        .await
        .map_err(|e| HubError::Transport {
            server: url.clone(),
            message: format!("initialize streamable-http client: {e}"),
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
