use futures::future::BoxFuture;

use cadence_core::traits::HttpFetcher;
use cadence_core::types::{HttpOutcome, HttpRequest};

/// reqwest-backed HTTP capability for `http_request` nodes.
///
/// Never surfaces transport failure as an error: the outcome is data for
/// the flow to branch on. Retry/backoff policy, if wanted, belongs in the
/// client configuration, not in the engine.
pub struct ReqwestHttpFetcher {
    client: reqwest::Client,
}

impl ReqwestHttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher for ReqwestHttpFetcher {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, HttpOutcome> {
        Box::pin(async move {
            let method =
                match reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes()) {
                    Ok(m) => m,
                    Err(_) => {
                        return HttpOutcome::Error(format!(
                            "invalid HTTP method '{}'",
                            request.method
                        ))
                    }
                };

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.text().await {
                        Ok(body) => HttpOutcome::Response { status, body },
                        Err(e) => HttpOutcome::Error(e.to_string()),
                    }
                }
                Err(e) => HttpOutcome::Error(e.to_string()),
            }
        })
    }
}
