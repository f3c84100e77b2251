//! Nakivo API client.
//!
//! Nakivo Backup & Replication exposes a single JSON-RPC style endpoint
//! (`POST /c/router`). Every call is an envelope naming an `action` (the
//! server-side management class) and a `method`, with positional `data`.
//! A successful reply carries `{"data": ...}`; a failed one is
//! `{"type": "exception", "message": ...}`.
//!
//! A [`NakivoClient`] owns one cookie-backed session to one host. It must be
//! authenticated before any other remote method can be invoked.

use crate::config::HostConfig;
use crate::error::{NakivoError, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Router path every remote call is posted to.
pub const ROUTER_ENDPOINT: &str = "c/router";

/// Calls are strictly sequential on a session, so the correlation id never varies.
const TID: u64 = 1;

/// Repository id the exporter queries with `getBackupRepository`.
pub const DEFAULT_REPOSITORY_ID: i64 = 3;

/// Remote call envelope.
#[derive(Debug, Serialize)]
pub struct RemoteCallRequest<'a> {
    pub action: &'a str,
    pub method: &'a str,
    pub data: Value,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub tid: u64,
}

/// Nakivo API client bound to one host.
pub struct NakivoClient {
    client: Client,
    host: String,
    username: String,
    password: String,
    endpoint: String,
    authenticated: bool,
}

impl NakivoClient {
    /// Open a session to a Nakivo host.
    ///
    /// Builds a cookie-keeping HTTP client and probes the host once, so an
    /// unreachable host or a rejected certificate fails here with
    /// [`NakivoError::Connection`] instead of at the first remote call.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use nakivo_exporter::client::NakivoClient;
    /// use nakivo_exporter::config::HostConfig;
    ///
    /// # async fn run() -> nakivo_exporter::Result<()> {
    /// let host = HostConfig {
    ///     host: "https://nakivo.example.com:4443".to_string(),
    ///     username: "monitor".to_string(),
    ///     password: "secret".to_string(),
    ///     cert_verify: true,
    /// };
    /// let mut client = NakivoClient::connect(&host, 30).await?;
    /// if client.authenticate().await {
    ///     let license = client.get_license_info().await?;
    ///     println!("{}", license);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: &HostConfig, timeout_seconds: u64) -> Result<Self> {
        let connection_error = |reason: String| NakivoError::Connection {
            host: config.host.clone(),
            reason,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .danger_accept_invalid_certs(!config.cert_verify)
            .cookie_store(true)
            .build()
            .map_err(|e| connection_error(e.to_string()))?;

        let base = base_url(&config.host);
        debug!("Probing Nakivo host at {}", base);
        client
            .get(&base)
            .send()
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        Ok(Self {
            client,
            host: config.host.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            endpoint: format!("{}/{}", base, ROUTER_ENDPOINT),
            authenticated: false,
        })
    }

    /// Host this session talks to, as written in the configuration.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Log in with the configured credentials.
    ///
    /// Returns `true` only when the reply is neither an exception envelope
    /// nor falsy. Transport failures count as a failed login.
    pub async fn authenticate(&mut self) -> bool {
        let data = json!([self.username, self.password, false]);
        let result = match self.invoke("AuthenticationManagement", "login", data).await {
            Ok(result) => result,
            Err(e) => {
                error!("Authentication request to {} failed: {}", self.host, e);
                return false;
            }
        };

        if is_exception(&result) {
            error!(
                "Authentication Error on {}: {}",
                self.host,
                exception_message(&result)
            );
            return false;
        }
        if !is_truthy(&result) {
            error!("Authentication Error on {}: empty reply", self.host);
            return false;
        }

        info!("Authenticated to {} as {}", self.host, self.username);
        self.authenticated = true;
        true
    }

    /// Invoke a remote method and return the raw JSON reply.
    ///
    /// Exception envelopes are returned as `Ok`; callers inspect them with
    /// [`is_exception`].
    pub async fn invoke(&self, action: &str, method: &str, data: Value) -> Result<Value> {
        let request = RemoteCallRequest {
            action,
            method,
            data,
            kind: "rpc",
            tid: TID,
        };
        debug!("Invoking {}.{} on {}", action, method, self.endpoint);

        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        if let Err(e) = response.error_for_status_ref() {
            warn!("{}.{} failed on {}: {}", action, method, self.host, e);
            return Err(NakivoError::Api(e));
        }

        let body = response.text().await?;
        debug!("Raw API response for {}.{}: {}", action, method, body);

        serde_json::from_str(&body).map_err(|e| {
            NakivoError::ParseError(format!(
                "{}.{} returned invalid JSON: {}. Body preview: {}...",
                action,
                method,
                e,
                body.chars().take(200).collect::<String>()
            ))
        })
    }

    fn ensure_authenticated(&self) -> Result<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(NakivoError::NotAuthenticated(self.host.clone()))
        }
    }

    /// Get license information.
    pub async fn get_license_info(&self) -> Result<Value> {
        self.ensure_authenticated()?;
        self.invoke("LicensingManagement", "getLicenseInfo", Value::Null)
            .await
    }

    /// Get a backup repository description.
    pub async fn get_backup_repository(&self, repository_id: i64) -> Result<Value> {
        self.ensure_authenticated()?;
        self.invoke(
            "BackupManagement",
            "getBackupRepository",
            json!([repository_id]),
        )
        .await
    }

    /// List every job group, children included.
    pub async fn get_group_info(&self) -> Result<Value> {
        self.ensure_authenticated()?;
        // [group ids (null = all), clientTimeOffsetToUtc, include children]
        self.invoke(
            "JobSummaryManagement",
            "getGroupInfo",
            json!([[null], 0, true]),
        )
        .await
    }

    /// Get detailed job information, VM objects included.
    pub async fn get_job_info(&self, job_ids: &[i64]) -> Result<Value> {
        self.ensure_authenticated()?;
        // [job ids, clientTimeOffsetToUtc]
        self.invoke("JobSummaryManagement", "getJobInfo", json!([job_ids, 0]))
            .await
    }

    /// Get every job of every group with its VM objects.
    ///
    /// Lists all groups, flattens their `childJobIds` and asks for the job
    /// details of the whole list, even when it is empty. An exception reply
    /// from the group listing is handed back unchanged.
    pub async fn get_jobs(&self) -> Result<Value> {
        let groups = self.get_group_info().await?;
        if is_exception(&groups) {
            return Ok(groups);
        }

        let job_ids = child_job_ids(&groups, &self.host);
        debug!("Found {} jobs on {}", job_ids.len(), self.host);
        self.get_job_info(&job_ids).await
    }
}

/// Flatten `data.children[*].childJobIds` of a `getGroupInfo` reply.
///
/// Groups without a usable id list contribute nothing.
pub fn child_job_ids(groups: &Value, host: &str) -> Vec<i64> {
    let Some(children) = groups.pointer("/data/children").and_then(Value::as_array) else {
        error!("Cannot get job IDs on {}: no group list in reply", host);
        return Vec::new();
    };

    let mut ids = Vec::new();
    for group in children {
        let group_name = group.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
        match group.get("childJobIds").and_then(Value::as_array) {
            Some(child_ids) => ids.extend(child_ids.iter().filter_map(Value::as_i64)),
            None => error!("Cannot get job IDs of group {} on {}", group_name, host),
        }
    }
    ids
}

/// Whether a reply is an exception envelope. Anything without a string
/// `type` field is not.
pub fn is_exception(result: &Value) -> bool {
    result.get("type").and_then(Value::as_str) == Some("exception")
}

/// `message` of an exception envelope, or a placeholder.
pub fn exception_message(result: &Value) -> &str {
    result
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message")
}

/// JSON truthiness: null, false, zero and empty containers are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Scheme-qualified base URL of a host, without trailing slash.
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("nakivo.local:4443"), "https://nakivo.local:4443");
        assert_eq!(base_url("http://10.0.0.1:4443/"), "http://10.0.0.1:4443");
        assert_eq!(base_url("https://nakivo"), "https://nakivo");
    }

    #[test]
    fn test_request_envelope_shape() {
        let request = RemoteCallRequest {
            action: "LicensingManagement",
            method: "getLicenseInfo",
            data: Value::Null,
            kind: "rpc",
            tid: TID,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "action": "LicensingManagement",
                "method": "getLicenseInfo",
                "data": null,
                "type": "rpc",
                "tid": 1
            })
        );
    }

    #[test]
    fn test_is_exception() {
        assert!(is_exception(&json!({"type": "exception", "message": "bad creds"})));
        assert!(!is_exception(&json!({"type": "rpc", "data": {}})));
        assert!(!is_exception(&json!({"data": {}})));
        assert!(!is_exception(&json!({"type": 42})));
        assert!(!is_exception(&json!(["exception"])));
        assert!(!is_exception(&Value::Null));
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!({})));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!({"data": null})));
        assert!(is_truthy(&json!(true)));
    }

    #[test]
    fn test_child_job_ids_flattens_groups() {
        let groups = json!({"data": {"children": [
            {"name": "a", "childJobIds": [1, 2]},
            {"name": "b", "childJobIds": [3]}
        ]}});
        assert_eq!(child_job_ids(&groups, "h"), vec![1, 2, 3]);
    }

    #[test]
    fn test_child_job_ids_skips_malformed_groups() {
        let groups = json!({"data": {"children": [
            {"name": "broken"},
            {"name": "ok", "childJobIds": [7]},
            {"name": "wrong", "childJobIds": "nope"}
        ]}});
        assert_eq!(child_job_ids(&groups, "h"), vec![7]);
        assert!(child_job_ids(&json!({"data": {}}), "h").is_empty());
        assert!(child_job_ids(&Value::Null, "h").is_empty());
    }
}
