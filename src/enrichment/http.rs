use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use super::{extract_text, Completion, EnrichmentClient, EnrichmentError};
use crate::config::EnrichmentConfig;
use crate::persistence::{keys, KeyValueStore};

const TARGET: &str = "enrichment";
const ERROR_BODY_LIMIT: usize = 512;

/// Blocking `ureq` client driven from `spawn_blocking`. The credential is
/// read from the key-value store on every call so `SET_API_KEY` takes
/// effect without a restart.
pub struct HttpEnrichmentClient {
    config: EnrichmentConfig,
    store: Arc<dyn KeyValueStore>,
    agent: ureq::Agent,
}

impl HttpEnrichmentClient {
    pub fn new(config: EnrichmentConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout())
            .user_agent(concat!("pagelens-host/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            config,
            store,
            agent,
        }
    }

    async fn credential(&self) -> Result<String, EnrichmentError> {
        let stored = self
            .store
            .get(keys::API_KEY)
            .await
            .map_err(|err| EnrichmentError::Credential(format!("{err:#}")))?;

        match stored {
            Some(JsonValue::String(key)) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(EnrichmentError::NotConfigured),
        }
    }

    fn request_body(&self, prompt: &str) -> JsonValue {
        json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.config.max_tokens,
        })
    }
}

#[async_trait]
impl EnrichmentClient for HttpEnrichmentClient {
    async fn complete(&self, prompt: &str) -> Result<Completion, EnrichmentError> {
        if !self.config.enabled {
            return Err(EnrichmentError::Disabled);
        }

        let credential = self.credential().await?;
        let body = self.request_body(prompt);
        let endpoint = self.config.endpoint.clone();
        let agent = self.agent.clone();

        debug!(target: TARGET, %endpoint, prompt_chars = prompt.chars().count(), "requesting completion");

        tokio::task::spawn_blocking(move || post_completion(&agent, &endpoint, &credential, body))
            .await
            .map_err(|err| EnrichmentError::Worker(err.to_string()))?
    }
}

fn post_completion(
    agent: &ureq::Agent,
    endpoint: &str,
    credential: &str,
    body: JsonValue,
) -> Result<Completion, EnrichmentError> {
    let mut request = agent
        .post(endpoint)
        .set("Content-Type", "application/json")
        .set("Authorization", &format!("Bearer {credential}"));
    if endpoint.contains("anthropic.com") {
        request = request
            .set("x-api-key", credential)
            .set("anthropic-version", "2023-06-01");
    }

    let raw = match request.send_json(body) {
        Ok(response) => response
            .into_string()
            .map_err(|err| EnrichmentError::Transport(err.to_string()))?,
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            return Err(EnrichmentError::Status {
                status,
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        Err(ureq::Error::Transport(transport)) => {
            return Err(EnrichmentError::Transport(transport.to_string()));
        }
    };

    let parsed: JsonValue =
        serde_json::from_str(&raw).map_err(|err| EnrichmentError::Decode(err.to_string()))?;
    let text = extract_text(&parsed).ok_or(EnrichmentError::EmptyResponse)?;
    Ok(Completion { text, raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{SqliteConfig, SqlitePersistence};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(SqlitePersistence::bootstrap(SqliteConfig::memory()).expect("in-memory store"))
    }

    fn config(endpoint: String) -> EnrichmentConfig {
        EnrichmentConfig {
            endpoint,
            timeout_secs: 5,
            ..EnrichmentConfig::default()
        }
    }

    /// Serves one request and hands back the raw request text.
    fn serve_once(status_line: &'static str, body: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
        let address = listener.local_addr().expect("local addr available");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("client connects");
            let mut reader = BufReader::new(stream);
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("request line");
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                request.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut payload = vec![0_u8; content_length];
            reader.read_exact(&mut payload).expect("request body");
            request.push_str(&String::from_utf8_lossy(&payload));

            let mut stream = reader.into_inner();
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .expect("response written");
            request
        });
        (format!("http://{address}/v1/chat/completions"), handle)
    }

    #[tokio::test]
    async fn missing_credential_is_not_configured() {
        let client = HttpEnrichmentClient::new(config("http://127.0.0.1:9/".into()), store());
        let err = client.complete("hi").await.expect_err("no key stored");
        assert!(matches!(err, EnrichmentError::NotConfigured));
    }

    #[tokio::test]
    async fn disabled_client_short_circuits() {
        let store = store();
        store
            .set(keys::API_KEY, json!("sk-test"))
            .await
            .expect("store key");
        let client = HttpEnrichmentClient::new(
            EnrichmentConfig {
                enabled: false,
                ..config("http://127.0.0.1:9/".into())
            },
            store,
        );
        let err = client.complete("hi").await.expect_err("disabled");
        assert!(matches!(err, EnrichmentError::Disabled));
    }

    #[tokio::test]
    async fn posts_prompt_and_extracts_text() {
        let store = store();
        store
            .set(keys::API_KEY, json!("sk-test"))
            .await
            .expect("store key");

        let (endpoint, server) = serve_once(
            "HTTP/1.1 200 OK",
            json!({"choices": [{"message": {"content": " clean two-column grid "}}]}).to_string(),
        );
        let client = HttpEnrichmentClient::new(config(endpoint), store);

        let completion = client.complete("describe").await.expect("completion");
        let request = server.join().expect("server thread joined");

        assert_eq!(completion.text, "clean two-column grid");
        assert!(completion.raw.contains("choices"));
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.contains("Bearer sk-test"));
        assert!(request.contains("\"content\":\"describe\""));
        assert!(request.contains("\"max_tokens\":120"));
    }

    #[tokio::test]
    async fn http_errors_surface_status() {
        let store = store();
        store
            .set(keys::API_KEY, json!("sk-test"))
            .await
            .expect("store key");

        let (endpoint, server) = serve_once(
            "HTTP/1.1 429 Too Many Requests",
            json!({"error": {"message": "slow down"}}).to_string(),
        );
        let client = HttpEnrichmentClient::new(config(endpoint), store);

        let err = client.complete("describe").await.expect_err("rate limited");
        server.join().expect("server thread joined");

        match err {
            EnrichmentError::Status { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("slow down"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
