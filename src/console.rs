//! JSON-lines console over stdin/stdout
//!
//! Each input line is one request object selected by its `op` field; each
//! request produces exactly one response line, `{"ok": true, "result": ...}`
//! or `{"ok": false, "error": "..."}`.

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::{ApiKey, AuthConfig};
use crate::ingest::Ingestor;
use crate::models::Measurement;
use crate::query::QueryFacade;
use crate::storage::StatusFiles;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Ingest {
        #[serde(default)]
        api_key: Option<String>,
        measurement: Measurement,
    },
    Devices,
    Clients,
    Stats {
        device_key: String,
    },
    Readings {
        device_key: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    AddKey {
        #[serde(default)]
        admin_key: Option<String>,
        key: String,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        admin: bool,
    },
    RevokeKey {
        #[serde(default)]
        admin_key: Option<String>,
        key: String,
    },
}

pub struct Console {
    ingestor: Arc<Ingestor>,
    facade: QueryFacade,
    auth: Arc<RwLock<AuthConfig>>,
    files: StatusFiles,
}

impl Console {
    pub fn new(
        ingestor: Arc<Ingestor>,
        facade: QueryFacade,
        auth: Arc<RwLock<AuthConfig>>,
        files: StatusFiles,
    ) -> Self {
        Self {
            ingestor,
            facade,
            auth,
            files,
        }
    }

    /// Serve requests until the input is exhausted
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line).await;
            let mut encoded = response.to_string();
            encoded.push('\n');
            output.write_all(encoded.as_bytes()).await?;
            output.flush().await?;
        }
        info!("Console input closed");
        Ok(())
    }

    pub async fn handle_line(&self, line: &str) -> Value {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => match self.handle(request).await {
                Ok(result) => json!({ "ok": true, "result": result }),
                Err(message) => json!({ "ok": false, "error": message }),
            },
            Err(e) => {
                debug!("Malformed console request: {}", e);
                json!({ "ok": false, "error": format!("malformed request: {}", e) })
            }
        }
    }

    async fn handle(&self, request: Request) -> Result<Value, String> {
        match request {
            Request::Ingest {
                api_key,
                measurement,
            } => {
                let reading = self
                    .ingestor
                    .submit(api_key.as_deref(), measurement)
                    .map_err(|e| {
                        warn!("Rejected reading: {}", e);
                        e.to_string()
                    })?;
                to_value(&reading)
            }
            Request::Devices => to_value(&self.facade.get_devices()),
            Request::Clients => to_value(&self.facade.get_clients()),
            Request::Stats { device_key } => {
                let stats = self
                    .facade
                    .get_stats(&device_key)
                    .map_err(|e| e.to_string())?;
                to_value(&stats)
            }
            Request::Readings {
                device_key,
                from,
                to,
            } => {
                let readings = self
                    .facade
                    .get_readings_text(&device_key, from.as_deref(), to.as_deref())
                    .await
                    .map_err(|e| e.to_string())?;
                to_value(&readings)
            }
            Request::AddKey {
                admin_key,
                key,
                client_id,
                admin,
            } => {
                let entry = match (admin, client_id) {
                    (true, _) => ApiKey::admin(),
                    (false, Some(client_id)) => ApiKey::client(&client_id),
                    (false, None) => return Err("client_id is required for client keys".into()),
                };
                self.auth
                    .write()
                    .add_key(admin_key.as_deref(), &key, entry)
                    .map_err(|e| e.to_string())?;
                self.save_auth().await;
                Ok(json!({ "added": key }))
            }
            Request::RevokeKey { admin_key, key } => {
                let removed = self
                    .auth
                    .write()
                    .revoke_key(admin_key.as_deref(), &key)
                    .map_err(|e| e.to_string())?;
                if removed {
                    self.save_auth().await;
                }
                Ok(json!({ "revoked": removed }))
            }
        }
    }

    async fn save_auth(&self) {
        let auth = self.auth.read().clone();
        let files = self.files.clone();
        match tokio::task::spawn_blocking(move || files.save_auth(&auth)).await {
            Ok(Ok(())) => debug!("API key table saved"),
            Ok(Err(e)) => error!("Failed to save API key table: {}", e),
            Err(e) => error!("API key table save task failed: {}", e),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}
