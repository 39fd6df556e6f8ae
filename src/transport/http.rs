use std::collections::BTreeMap;

use tracing::trace;

use super::{HttpResponse, Transport, TransportError, TransportErrorKind};
use crate::config::CourierConfig;
use crate::request::{ApiRequest, Method};

fn error_kind(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    TransportError::new(error_kind(&err), err.to_string()).with_source(err)
}

/// [`Transport`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Builds a client with the configured timeout and user agent.
    pub fn new(config: &CourierConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.network_timeout)
            .connect_timeout(config.network_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(transport_error)?;
        Ok(ReqwestTransport {
            client,
            base_url: config.base_url.clone(),
        })
    }
}

impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url(&self.base_url);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        trace!(request_id = %request.id, %url, method = %request.method, "Sending request");
        let response = builder.send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(transport_error)?;
        trace!(request_id = %request.id, status, "Received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let config = CourierConfig::new("Xr5bFG").with_base_url("http://127.0.0.1:9");
        let transport = ReqwestTransport::new(&config).unwrap();
        assert_eq!(transport.base_url, "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let config = CourierConfig::new("Xr5bFG")
            .with_base_url("http://127.0.0.1:9")
            .with_network_timeout(std::time::Duration::from_secs(2));
        let transport = ReqwestTransport::new(&config).unwrap();
        let request = crate::test_utils::test_request();

        let err = transport.execute(&request).await.unwrap_err();

        assert!(matches!(
            err.kind,
            TransportErrorKind::Connect | TransportErrorKind::Timeout | TransportErrorKind::Other
        ));
    }
}
