// Hub registration against the platform REST API.
//
// A connector belongs to a hub. Before each session the supervisor makes
// sure the hub still exists, creating a fresh one when the stored id is
// unknown, and passes the resulting id into the auth handshake. After
// device synchronization the hub's device list is brought in line with
// the local device set.

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::transport::HttpClient;

#[derive(Debug, Deserialize)]
struct CreatedHub {
    id: String,
}

/// Platform view of a hub, from `GET /hubs/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HubInfo {
    pub name: String,
    /// Aggregate hash of the devices last associated with the hub.
    #[serde(default)]
    pub hash: Option<String>,
}

/// Result of [`HubApi::sync_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSync {
    /// Hub name as the platform knows it. The remote name wins.
    pub name: String,
    /// Whether the device list had to be sent.
    pub updated: bool,
}

/// Client for the `/hubs` endpoints.
#[derive(Debug, Clone)]
pub struct HubApi {
    http: HttpClient,
    base_url: Url,
}

impl HubApi {
    pub fn new(http: HttpClient, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn hubs_url(&self, id: Option<&str>) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let raw = match id {
            Some(id) => format!("{base}/hubs/{id}"),
            None => format!("{base}/hubs"),
        };
        Ok(Url::parse(&raw)?)
    }

    /// `HEAD /hubs/{id}`. A 404 becomes [`Error::HubNotFound`].
    pub async fn verify_hub(&self, id: &str) -> Result<(), Error> {
        let resp = self.http.head(&self.hubs_url(Some(id))?).await?;
        match resp.status {
            s if (200..300).contains(&s) => Ok(()),
            404 => Err(Error::HubNotFound { id: id.to_owned() }),
            status => Err(Error::Hub {
                status,
                body: resp.body,
            }),
        }
    }

    /// `POST /hubs` with `{"name"}`; returns the id the platform assigned.
    pub async fn create_hub(&self, name: &str) -> Result<String, Error> {
        let resp = self
            .http
            .post_json(&self.hubs_url(None)?, serde_json::json!({ "name": name }))
            .await?;
        if !resp.is_success() {
            return Err(Error::Hub {
                status: resp.status,
                body: resp.body,
            });
        }
        let created: CreatedHub = resp.json()?;
        tracing::info!(hub_id = %created.id, name, "Hub created");
        Ok(created.id)
    }

    /// Return a hub id that is known to exist on the platform.
    ///
    /// A stored id that the platform no longer knows is discarded and a
    /// new hub is created under `name`.
    pub async fn ensure_hub(&self, id: Option<&str>, name: &str) -> Result<String, Error> {
        if let Some(id) = id {
            match self.verify_hub(id).await {
                Ok(()) => {
                    tracing::debug!(hub_id = id, "Hub exists");
                    return Ok(id.to_owned());
                }
                Err(Error::HubNotFound { .. }) => {
                    tracing::warn!(hub_id = id, "Stored hub id unknown to platform, creating a new hub");
                }
                Err(e) => return Err(e),
            }
        }
        self.create_hub(name).await
    }

    /// `GET /hubs/{id}`. A 404 becomes [`Error::HubNotFound`].
    pub async fn get_hub(&self, id: &str) -> Result<HubInfo, Error> {
        let resp = self.http.get(&self.hubs_url(Some(id))?).await?;
        match resp.status {
            s if (200..300).contains(&s) => resp.json(),
            404 => Err(Error::HubNotFound { id: id.to_owned() }),
            status => Err(Error::Hub {
                status,
                body: resp.body,
            }),
        }
    }

    /// Associate `device_local_ids` with the hub.
    ///
    /// Reads the hub first; the device list is only sent (`PUT
    /// /hubs/{id}`) when the remote aggregate hash differs from `hash`.
    /// A differing remote name is adopted and reported back.
    pub async fn sync_devices(
        &self,
        id: &str,
        name: &str,
        device_local_ids: &[String],
        hash: &str,
    ) -> Result<HubSync, Error> {
        let remote = self.get_hub(id).await?;
        if remote.name != name {
            tracing::warn!(hub_id = id, local = name, remote = %remote.name, "Hub name differs, adopting remote name");
        }
        if remote.hash.as_deref() == Some(hash) {
            tracing::debug!(hub_id = id, "Hub device list up to date");
            return Ok(HubSync {
                name: remote.name,
                updated: false,
            });
        }

        tracing::info!(hub_id = id, devices = device_local_ids.len(), "Updating hub device list");
        let body = serde_json::json!({
            "id": id,
            "name": remote.name,
            "hash": hash,
            "device_local_ids": device_local_ids,
        });
        let resp = self.http.put_json(&self.hubs_url(Some(id))?, body).await?;
        match resp.status {
            s if (200..300).contains(&s) => Ok(HubSync {
                name: remote.name,
                updated: true,
            }),
            400 => Err(Error::HubDevicesRejected {
                id: id.to_owned(),
                body: resp.body,
            }),
            404 => Err(Error::HubNotFound { id: id.to_owned() }),
            status => Err(Error::Hub {
                status,
                body: resp.body,
            }),
        }
    }
}
