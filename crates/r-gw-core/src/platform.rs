//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Ingestion platform client and device provisioning."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Client for a ThingsBoard-compatible ingestion platform.
//!
//! Tenant calls authenticate with a JWT from `/api/auth/login` carried in the
//! `X-Authorization: Bearer` header; telemetry is posted with the per-device
//! access token embedded in the URL.

use async_trait::async_trait;
use r_gw_common::{DeviceAddress, PlatformConfig};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::PlatformError;
use crate::forwarder::TelemetryPayload;

/// Operations the forwarder needs from the ingestion platform.
#[async_trait]
pub trait IngestionPlatform: Send + Sync {
    /// Obtain a tenant session token.
    async fn authenticate(&self) -> Result<String, PlatformError>;

    /// Look up a device by name; `None` when it does not exist.
    async fn find_device(&self, session: &str, name: &str) -> Result<Option<String>, PlatformError>;

    /// Create a device and return its id.
    async fn create_device(
        &self,
        session: &str,
        name: &str,
        device_type: &str,
    ) -> Result<String, PlatformError>;

    /// Fetch the access token of an existing device.
    async fn device_credentials(&self, session: &str, device_id: &str)
        -> Result<String, PlatformError>;

    /// Post one telemetry sample using a device access token.
    async fn push_telemetry(
        &self,
        access_token: &str,
        payload: &TelemetryPayload,
    ) -> Result<(), PlatformError>;
}

/// Remote device name for `device`: `<device_type>_<address slug>`.
pub fn device_name(device_type: &str, device: &DeviceAddress) -> String {
    format!("{}_{}", device_type, device.slug())
}

/// Ensure a remote identity exists for `name` and return its access token.
/// Finds the device first and only creates it when absent.
pub async fn provision_device(
    platform: &dyn IngestionPlatform,
    name: &str,
    device_type: &str,
) -> Result<String, PlatformError> {
    let session = platform.authenticate().await?;
    let device_id = match platform.find_device(&session, name).await? {
        Some(id) => {
            debug!(device_name = name, device_id = %id, "existing platform device found");
            id
        }
        None => {
            let id = platform.create_device(&session, name, device_type).await?;
            info!(device_name = name, device_id = %id, "platform device created");
            id
        }
    };
    platform.device_credentials(&session, &device_id).await
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
struct CreateDeviceRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    device_type: &'a str,
}

#[derive(Deserialize)]
struct EntityId {
    id: String,
}

#[derive(Deserialize)]
struct DeviceInfo {
    id: EntityId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCredentials {
    credentials_id: String,
}

/// HTTP implementation of [`IngestionPlatform`] for ThingsBoard.
#[derive(Debug, Clone)]
pub struct ThingsBoardClient {
    http: Client,
    base: Url,
    username: String,
    password: String,
}

impl ThingsBoardClient {
    pub fn from_config(config: &PlatformConfig) -> Result<Self, PlatformError> {
        let mut base = Url::parse(&config.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(PlatformError::Client)?;
        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, PlatformError> {
        Ok(self.base.join(path)?)
    }

    async fn send(&self, endpoint: &Url, request: RequestBuilder) -> Result<Response, PlatformError> {
        request.send().await.map_err(|source| PlatformError::Http {
            endpoint: endpoint.path().to_owned(),
            source,
        })
    }

    fn ensure_success(endpoint: &Url, response: &Response) -> Result<(), PlatformError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PlatformError::Status {
                endpoint: endpoint.path().to_owned(),
                status: response.status().as_u16(),
            })
        }
    }

    async fn decode<T: DeserializeOwned>(endpoint: &Url, response: Response) -> Result<T, PlatformError> {
        let bytes = response.bytes().await.map_err(|source| PlatformError::Http {
            endpoint: endpoint.path().to_owned(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|err| PlatformError::Payload {
            endpoint: endpoint.path().to_owned(),
            reason: err.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder, session: &str) -> RequestBuilder {
        request.header("X-Authorization", format!("Bearer {session}"))
    }
}

#[async_trait]
impl IngestionPlatform for ThingsBoardClient {
    async fn authenticate(&self) -> Result<String, PlatformError> {
        let endpoint = self.endpoint("api/auth/login")?;
        let request = self.http.post(endpoint.clone()).json(&LoginRequest {
            username: &self.username,
            password: &self.password,
        });
        let response = self.send(&endpoint, request).await?;
        Self::ensure_success(&endpoint, &response)?;
        let login: LoginResponse = Self::decode(&endpoint, response).await?;
        Ok(login.token)
    }

    async fn find_device(&self, session: &str, name: &str) -> Result<Option<String>, PlatformError> {
        let endpoint = self.endpoint("api/tenant/devices")?;
        let request = self.authorized(
            self.http.get(endpoint.clone()).query(&[("deviceName", name)]),
            session,
        );
        let response = self.send(&endpoint, request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::ensure_success(&endpoint, &response)?;
        let body = response.bytes().await.map_err(|source| PlatformError::Http {
            endpoint: endpoint.path().to_owned(),
            source,
        })?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let device: Option<DeviceInfo> =
            serde_json::from_slice(&body).map_err(|err| PlatformError::Payload {
                endpoint: endpoint.path().to_owned(),
                reason: err.to_string(),
            })?;
        Ok(device.map(|device| device.id.id))
    }

    async fn create_device(
        &self,
        session: &str,
        name: &str,
        device_type: &str,
    ) -> Result<String, PlatformError> {
        let endpoint = self.endpoint("api/device")?;
        let request = self.authorized(
            self.http
                .post(endpoint.clone())
                .json(&CreateDeviceRequest { name, device_type }),
            session,
        );
        let response = self.send(&endpoint, request).await?;
        Self::ensure_success(&endpoint, &response)?;
        let device: DeviceInfo = Self::decode(&endpoint, response).await?;
        Ok(device.id.id)
    }

    async fn device_credentials(
        &self,
        session: &str,
        device_id: &str,
    ) -> Result<String, PlatformError> {
        let endpoint = self.endpoint(&format!("api/device/{device_id}/credentials"))?;
        let request = self.authorized(self.http.get(endpoint.clone()), session);
        let response = self.send(&endpoint, request).await?;
        Self::ensure_success(&endpoint, &response)?;
        let credentials: DeviceCredentials = Self::decode(&endpoint, response).await?;
        Ok(credentials.credentials_id)
    }

    async fn push_telemetry(
        &self,
        access_token: &str,
        payload: &TelemetryPayload,
    ) -> Result<(), PlatformError> {
        let endpoint = self.endpoint(&format!("api/v1/{access_token}/telemetry"))?;
        let request = self.http.post(endpoint.clone()).json(payload);
        let response = self.send(&endpoint, request).await?;
        Self::ensure_success(&endpoint, &response)
    }
}
