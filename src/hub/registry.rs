use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::crypto::SasError;
use crate::util::http::{Client, ClientError, InvalidUriError, Method, Response, StatusCode, Uri};
use crate::util::types::DeviceId;

use super::credentials::ServiceConnectionString;
use super::request::Auth;
use super::twin::{TwinPatch, TwinRecord};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry endpoint: {0}")]
    Endpoint(#[from] InvalidUriError),

    #[error(transparent)]
    Auth(#[from] SasError),

    #[error("request failed: {0}")]
    Http(#[from] ClientError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("device {0} not found")]
    NotFound(DeviceId),

    /// The concurrency token went stale between read and write.
    #[error("twin {0} was modified concurrently")]
    Conflict(DeviceId),

    #[error("server replied with status {0}")]
    Status(u16),
}

/// Service-side twin registry client.
///
/// Used by the one-shot fleet command only, so calls are single-attempt:
/// there is no retry or backoff here by design, a failed maintenance run
/// is simply reported.
pub struct Registry {
    client: Client,
    endpoint: Uri,
    auth: Auth,
}

impl Registry {
    pub fn new(
        endpoint: Uri,
        credentials: &ServiceConnectionString,
        timeout: Duration,
        sas_ttl: Duration,
    ) -> Self {
        let auth = Auth::Sas {
            resource: credentials.hostname.clone(),
            key: credentials.shared_access_key.clone(),
            policy: Some(credentials.policy_name.clone()),
            ttl: sas_ttl,
        };
        Self {
            client: Client::new(Some(timeout)),
            endpoint,
            auth,
        }
    }

    /// Fetch a twin record, including its concurrency token.
    pub async fn get_twin(&self, device_id: &DeviceId) -> Result<TwinRecord, RegistryError> {
        let uri = self.twin_uri(device_id)?;
        let response = self
            .request::<()>(Method::GET, &uri, None, None)
            .await?;
        decode(check(device_id, response)?).await
    }

    /// Conditionally update a twin.
    ///
    /// The update carries the etag captured by a previous [get_twin]; if
    /// the record changed in between, the hub answers 412 and the call
    /// surfaces [RegistryError::Conflict] rather than overwriting.
    ///
    /// [get_twin]: Registry::get_twin
    pub async fn update_twin(
        &self,
        device_id: &DeviceId,
        patch: &TwinPatch,
        etag: &str,
    ) -> Result<TwinRecord, RegistryError> {
        let uri = self.twin_uri(device_id)?;
        let response = self
            .request(Method::PATCH, &uri, Some(patch), Some(etag))
            .await?;
        decode(check(device_id, response)?).await
    }

    /// Run a read-only device query, returning matching device ids in
    /// response order. `page_size` caps the result count; there is no
    /// pagination.
    pub async fn query(
        &self,
        filter: &str,
        page_size: u32,
    ) -> Result<Vec<DeviceId>, RegistryError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct QueryRequest<'a> {
            query: &'a str,
            page_size: u32,
        }

        #[derive(Deserialize)]
        struct QueryResponse {
            items: Vec<QueryItem>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct QueryItem {
            device_id: DeviceId,
        }

        let uri = Uri::from_parts(self.endpoint.clone(), "/twins/query", None)?;
        let body = QueryRequest {
            query: filter,
            page_size,
        };
        let response = self
            .request(Method::POST, &uri, Some(&body), None)
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RegistryError::Unauthorized);
        }
        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }

        let result: QueryResponse = response.json().await?;
        Ok(result.items.into_iter().map(|item| item.device_id).collect())
    }

    fn twin_uri(&self, device_id: &DeviceId) -> Result<Uri, InvalidUriError> {
        Uri::from_parts(self.endpoint.clone(), &format!("/twins/{device_id}"), None)
    }

    async fn request<B: Serialize>(
        &self,
        method: Method,
        uri: &Uri,
        body: Option<&B>,
        if_match: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let token = self.auth.header()?;
        let response = self
            .client
            .request(method, uri, |mut request| {
                if let Some(token) = &token {
                    request = request.header("Authorization", token);
                }
                if let Some(etag) = if_match {
                    request = request.header("If-Match", etag);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                Ok(request)
            })
            .await?;
        Ok(response)
    }
}

fn check(device_id: &DeviceId, response: Response) -> Result<Response, RegistryError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Unauthorized),
        StatusCode::NOT_FOUND => Err(RegistryError::NotFound(device_id.clone())),
        StatusCode::PRECONDITION_FAILED => Err(RegistryError::Conflict(device_id.clone())),
        status => Err(RegistryError::Status(status.as_u16())),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RegistryError> {
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    const SERVICE_CONNECTION_STRING: &str =
        "HostName=hub.example.com;SharedAccessKeyName=registryReadWrite;SharedAccessKey=c2VjcmV0LWtleQ==";

    fn registry(endpoint: Uri) -> Registry {
        let credentials = SERVICE_CONNECTION_STRING
            .parse::<ServiceConnectionString>()
            .unwrap();
        Registry::new(
            endpoint,
            &credentials,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
    }

    fn twin_body(etag: &str) -> String {
        json!({
            "deviceId": "temp-sensor-1",
            "tags": {},
            "properties": {"desired": {}, "reported": {}},
            "etag": etag,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_get_twin_captures_etag() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/twins/temp-sensor-1")
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature .*&skn=registryReadWrite$".into()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(twin_body("AAAA"))
            .create_async()
            .await;

        let registry = registry(server.url().try_into().unwrap());
        let twin = registry.get_twin(&"temp-sensor-1".into()).await.unwrap();

        assert_eq!(twin.etag, "AAAA");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_twin_is_conditional() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/twins/temp-sensor-1")
            .match_header("if-match", "AAAA")
            .match_body(Matcher::Json(json!({
                "tags": {"location": {"region": "BG", "plant": "Sofia"}},
                "properties": {"desired": {"maxTemperature": 30}},
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(twin_body("AAAB"))
            .create_async()
            .await;

        let registry = registry(server.url().try_into().unwrap());
        let patch = TwinPatch::new(
            json!({"location": {"region": "BG", "plant": "Sofia"}}),
            json!({"maxTemperature": 30}),
        );
        let twin = registry
            .update_twin(&"temp-sensor-1".into(), &patch, "AAAA")
            .await
            .unwrap();

        assert_eq!(twin.etag, "AAAB");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_etag_is_a_conflict() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/twins/temp-sensor-1")
            .match_header("if-match", "STALE")
            .with_status(412)
            .create_async()
            .await;

        let registry = registry(server.url().try_into().unwrap());
        let patch = TwinPatch::new(json!({}), json!({}));
        let result = registry
            .update_twin(&"temp-sensor-1".into(), &patch, "STALE")
            .await;

        assert!(matches!(result, Err(RegistryError::Conflict(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_returns_ids_in_order() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/twins/query")
            .match_body(Matcher::Json(json!({
                "query": "SELECT * FROM devices WHERE tags.location.plant = 'Sofia'",
                "pageSize": 100,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"items": [
                    {"deviceId": "temp-sensor-2"},
                    {"deviceId": "temp-sensor-1"},
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let registry = registry(server.url().try_into().unwrap());
        let ids = registry
            .query(
                "SELECT * FROM devices WHERE tags.location.plant = 'Sofia'",
                100,
            )
            .await
            .unwrap();

        let ids: Vec<_> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, ["temp-sensor-2", "temp-sensor-1"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/twins/ghost")
            .with_status(404)
            .create_async()
            .await;

        let registry = registry(server.url().try_into().unwrap());
        let result = registry.get_twin(&"ghost".into()).await;

        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        mock.assert_async().await;
    }
}
