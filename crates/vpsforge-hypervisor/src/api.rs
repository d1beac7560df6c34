//! Backend talking to the hypervisor's HTTPS management API.
//!
//! Every write returns a task id (`UPID`) that is polled until the task
//! stops, so a call only succeeds once the node reports `OK`. The API has
//! no guest exec endpoint; guest commands go through `pct exec` on the
//! injected executor.
//!
//! A login ticket is reused until it nears its two hour lifetime or the
//! node answers `401`, whichever comes first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use vpsforge_common::config::{ApiAuth, ForgeConfig};
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::ContainerId;
use vpsforge_exec::{CommandExecutor, ExecOutput};

use crate::{
    CreateSpec, GuestCommand, Hypervisor, InstanceDescriptor, InstanceStatus, TemplateInfo, pct,
};

/// Age after which a ticket is renewed before use.
const TICKET_REFRESH: Duration = Duration::from_secs(90 * 60);

/// Connection parameters of [`ProxmoxApi`].
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// API root, e.g. `https://pve:8006/api2/json`.
    pub base_url: String,
    /// Node hosting the containers.
    pub node: String,
    /// Credentials.
    pub auth: ApiAuth,
    /// Accept self-signed certificates.
    pub insecure_tls: bool,
    /// Storage listing templates.
    pub template_storage: String,
    /// Budget for a call including task completion.
    pub timeout: Duration,
    /// Interval between task polls.
    pub poll_interval: Duration,
}

/// HTTPS control plane client.
pub struct ProxmoxApi {
    http: reqwest::Client,
    base: Url,
    settings: ApiSettings,
    guest: Arc<dyn CommandExecutor>,
    session: Mutex<Option<CachedSession>>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageItem {
    volid: String,
    size: Option<u64>,
}

/// Authentication material for one call.
#[derive(Clone)]
enum Session {
    Token(String),
    Ticket { cookie: String, csrf: String },
}

struct CachedSession {
    session: Session,
    issued: Instant,
}

/// Raw reply kept around so callers can inspect failures.
struct Reply {
    status: StatusCode,
    body: String,
}

impl ProxmoxApi {
    /// Creates a client from explicit settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(settings: ApiSettings, guest: Arc<dyn CommandExecutor>) -> Result<Self> {
        let base = Url::parse(&settings.base_url).map_err(|e| ForgeError::Config {
            message: format!("invalid api_url {}: {e}", settings.base_url),
        })?;
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.insecure_tls)
            .build()
            .map_err(|e| ForgeError::Config {
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base,
            settings,
            guest,
            session: Mutex::new(None),
        })
    }

    /// Creates a client from the `hypervisor` configuration section.
    ///
    /// # Errors
    ///
    /// Returns an error if `api_url` or `auth` is missing, or the client
    /// cannot be built.
    pub fn from_config(config: &ForgeConfig, guest: Arc<dyn CommandExecutor>) -> Result<Self> {
        let hv = &config.hypervisor;
        let base_url = hv.api_url.clone().ok_or_else(|| ForgeError::Config {
            message: "hypervisor.api_url is required for the api backend".into(),
        })?;
        let auth = hv.auth.clone().ok_or_else(|| ForgeError::Config {
            message: "hypervisor.auth is required for the api backend".into(),
        })?;
        Self::new(
            ApiSettings {
                base_url,
                node: hv.node.clone(),
                auth,
                insecure_tls: hv.insecure_tls,
                template_storage: hv.template_storage.clone(),
                timeout: config.timeouts.api(),
                poll_interval: config.timeouts.task_poll(),
            },
            guest,
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ForgeError::Config {
                message: format!("api_url {} cannot be a base", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn node_endpoint(&self, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["nodes", self.settings.node.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    fn transport_error(&self, operation: &str, err: &reqwest::Error) -> ForgeError {
        if err.is_timeout() {
            ForgeError::Timeout {
                operation: operation.to_string(),
                after: self.settings.timeout,
            }
        } else {
            ForgeError::external(operation, err.to_string())
        }
    }

    async fn login(&self) -> Result<Session> {
        match &self.settings.auth {
            ApiAuth::Token { token_id, secret } => {
                Ok(Session::Token(format!("PVEAPIToken={token_id}={secret}")))
            }
            ApiAuth::Ticket { username, password } => {
                let url = self.endpoint(&["access", "ticket"])?;
                let reply = self
                    .dispatch(
                        "api login",
                        self.http
                            .post(url)
                            .form(&[("username", username), ("password", password)]),
                    )
                    .await?;
                let ticket: TicketData = decode("api login", &reply)?;
                Ok(Session::Ticket {
                    cookie: format!("PVEAuthCookie={}", ticket.ticket),
                    csrf: ticket.csrf_token,
                })
            }
        }
    }

    /// The cached session, logging in when there is none or it is too old.
    async fn session(&self) -> Result<Session> {
        let mut cached = self.session.lock().await;
        if let Some(current) = cached
            .as_ref()
            .filter(|c| c.issued.elapsed() < TICKET_REFRESH)
        {
            return Ok(current.session.clone());
        }
        let session = self.login().await?;
        *cached = Some(CachedSession {
            session: session.clone(),
            issued: Instant::now(),
        });
        Ok(session)
    }

    async fn dispatch(&self, operation: &str, request: RequestBuilder) -> Result<Reply> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(operation, &e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(operation, &e))?;
        tracing::debug!(operation, %status, "api reply");
        Ok(Reply { status, body })
    }

    async fn call(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        form: Option<&[(&str, String)]>,
    ) -> Result<Reply> {
        let session = self.session().await?;
        let reply = self
            .send(operation, method.clone(), url.clone(), form, &session)
            .await?;
        if reply.status != StatusCode::UNAUTHORIZED || matches!(session, Session::Token(_)) {
            return Ok(reply);
        }
        tracing::debug!(operation, "ticket rejected, logging in again");
        *self.session.lock().await = None;
        let session = self.session().await?;
        self.send(operation, method, url, form, &session).await
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        form: Option<&[(&str, String)]>,
        session: &Session,
    ) -> Result<Reply> {
        let is_write = method != Method::GET;
        let mut request = self.http.request(method, url);
        request = match session {
            Session::Token(header) => request.header("Authorization", header),
            Session::Ticket { cookie, csrf } => {
                let request = request.header("Cookie", cookie);
                if is_write {
                    request.header("CSRFPreventionToken", csrf)
                } else {
                    request
                }
            }
        };
        if let Some(fields) = form {
            request = request.form(fields);
        }
        self.dispatch(operation, request).await
    }

    /// Issues a write that returns a task id and waits for the task.
    async fn run_task(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        form: Option<&[(&str, String)]>,
    ) -> Result<()> {
        let reply = self.call(operation, method, url, form).await?;
        let upid: String = decode(operation, &reply)?;
        self.wait_task(operation, &upid).await
    }

    async fn wait_task(&self, operation: &str, upid: &str) -> Result<()> {
        let url = self.node_endpoint(&["tasks", upid, "status"])?;
        let poll = async {
            loop {
                let reply = self
                    .call(operation, Method::GET, url.clone(), None)
                    .await?;
                let task: TaskStatus = decode(operation, &reply)?;
                if task.status == "stopped" {
                    return match task.exitstatus.as_deref() {
                        Some("OK") => Ok(()),
                        other => Err(ForgeError::external(
                            operation,
                            format!("task {upid} ended with {}", other.unwrap_or("no status")),
                        )),
                    };
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };
        tokio::time::timeout(self.settings.timeout, poll)
            .await
            .map_err(|_| ForgeError::Timeout {
                operation: operation.to_string(),
                after: self.settings.timeout,
            })?
    }
}

fn decode<T: DeserializeOwned>(operation: &str, reply: &Reply) -> Result<T> {
    if !reply.status.is_success() {
        return Err(ForgeError::external(
            operation,
            format!("HTTP {}: {}", reply.status, reply.body.trim()),
        ));
    }
    let envelope: Envelope<T> = serde_json::from_str(&reply.body)
        .map_err(|e| ForgeError::external(operation, format!("malformed reply: {e}")))?;
    Ok(envelope.data)
}

fn create_form(spec: &CreateSpec) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("vmid", spec.id.to_string()),
        ("ostemplate", spec.template_volume.clone()),
        ("hostname", spec.hostname.clone()),
        ("memory", spec.resources.memory_mb.to_string()),
        ("swap", spec.swap_mb.to_string()),
        ("cores", spec.resources.cpu_cores.to_string()),
        ("rootfs", spec.rootfs()),
        ("net0", spec.network.render()),
        ("ostype", spec.os_family.to_string()),
        ("password", spec.root_credential.expose().to_string()),
        ("unprivileged", "1".into()),
        ("features", "nesting=1,keyctl=1".into()),
        ("cmode", "shell".into()),
    ];
    if spec.start {
        form.push(("start", "1".into()));
    }
    form
}

#[async_trait]
impl Hypervisor for ProxmoxApi {
    async fn status(&self, id: ContainerId) -> Result<InstanceStatus> {
        let id_text = id.to_string();
        let url = self.node_endpoint(&["lxc", &id_text, "status", "current"])?;
        let reply = self.call("lxc status", Method::GET, url, None).await?;
        if reply.status == StatusCode::NOT_FOUND
            || (!reply.status.is_success() && reply.body.contains("does not exist"))
        {
            return Ok(InstanceStatus::Missing);
        }
        let current: CurrentStatus = decode("lxc status", &reply)?;
        match current.status.as_str() {
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            other => Err(ForgeError::external(
                "lxc status",
                format!("unexpected status {other}"),
            )),
        }
    }

    async fn create(&self, spec: &CreateSpec) -> Result<InstanceDescriptor> {
        tracing::info!(id = %spec.id, hostname = %spec.hostname, "creating container via api");
        let url = self.node_endpoint(&["lxc"])?;
        let form = create_form(spec);
        self.run_task("lxc create", Method::POST, url, Some(&form))
            .await?;
        Ok(InstanceDescriptor {
            id: spec.id,
            node: self.settings.node.clone(),
            hostname: spec.hostname.clone(),
        })
    }

    async fn start(&self, id: ContainerId) -> Result<()> {
        let id_text = id.to_string();
        let url = self.node_endpoint(&["lxc", &id_text, "status", "start"])?;
        self.run_task("lxc start", Method::POST, url, None).await
    }

    async fn stop(&self, id: ContainerId) -> Result<()> {
        let id_text = id.to_string();
        let url = self.node_endpoint(&["lxc", &id_text, "status", "stop"])?;
        self.run_task("lxc stop", Method::POST, url, None).await
    }

    async fn destroy(&self, id: ContainerId) -> Result<()> {
        let id_text = id.to_string();
        let mut url = self.node_endpoint(&["lxc", &id_text])?;
        let _ = url.query_pairs_mut().append_pair("purge", "1");
        self.run_task("lxc destroy", Method::DELETE, url, None).await
    }

    async fn exec(&self, id: ContainerId, command: &GuestCommand) -> Result<ExecOutput> {
        let spec = pct::guest_exec_command(id, command);
        self.guest.run(&spec).await
    }

    async fn list_templates(&self) -> Result<Vec<TemplateInfo>> {
        let mut url = self.node_endpoint(&["storage", &self.settings.template_storage, "content"])?;
        let _ = url.query_pairs_mut().append_pair("content", "vztmpl");
        let reply = self.call("storage content", Method::GET, url, None).await?;
        let items: Vec<StorageItem> = decode("storage content", &reply)?;
        Ok(items
            .into_iter()
            .map(|item| TemplateInfo {
                volume: item.volid,
                size_bytes: item.size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_json::json;
    use vpsforge_common::types::{Credential, OsFamily, ResourceSpec};
    use vpsforge_exec::recording::RecordingExecutor;
    use wiremock::matchers::{body_string_contains, header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::NetworkDescriptor;

    fn settings(server: &MockServer, auth: ApiAuth) -> ApiSettings {
        ApiSettings {
            base_url: format!("{}/api2/json", server.uri()),
            node: "pve".into(),
            auth,
            insecure_tls: false,
            template_storage: "local".into(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn token() -> ApiAuth {
        ApiAuth::Token {
            token_id: "root@pam!forge".into(),
            secret: "abc-123".into(),
        }
    }

    fn client(server: &MockServer, auth: ApiAuth) -> ProxmoxApi {
        ProxmoxApi::new(settings(server, auth), Arc::new(RecordingExecutor::new()))
            .expect("client")
    }

    async fn mount_task(server: &MockServer, exitstatus: &str) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "status": "stopped", "exitstatus": exitstatus }
            })))
            .mount(server)
            .await;
    }

    fn create_spec() -> CreateSpec {
        CreateSpec {
            id: ContainerId::new(101),
            hostname: "web1".into(),
            resources: ResourceSpec {
                memory_mb: 512,
                cpu_cores: 1,
                disk_gb: 8,
            },
            network: NetworkDescriptor {
                bridge: "vmbr1".into(),
                ip: Ipv4Addr::new(10, 10, 10, 4),
                prefix_len: 24,
                gateway: Ipv4Addr::new(10, 10, 10, 1),
                rate_mbps: Some(3),
            },
            template_volume: "local:vztmpl/alpine.tar.xz".into(),
            os_family: OsFamily::Alpine,
            root_credential: Credential::new("pw"),
            storage: "local".into(),
            swap_mb: 256,
            start: true,
        }
    }

    #[tokio::test]
    async fn create_with_token_waits_for_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve/lxc"))
            .and(header("Authorization", "PVEAPIToken=root@pam!forge=abc-123"))
            .and(body_string_contains("vmid=101"))
            .and(body_string_contains("hostname=web1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": "UPID:pve:0001:vzcreate:101:root@pam:" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        mount_task(&server, "OK").await;

        let descriptor = client(&server, token())
            .create(&create_spec())
            .await
            .expect("create");
        assert_eq!(descriptor.node, "pve");
        assert_eq!(descriptor.id, ContainerId::new(101));
    }

    #[tokio::test]
    async fn failed_task_is_an_external_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/start"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": "UPID:pve:0002:vzstart:101:root@pam:" })),
            )
            .mount(&server)
            .await;
        mount_task(&server, "command 'lxc-start' failed").await;

        let err = client(&server, token())
            .start(ContainerId::new(101))
            .await
            .unwrap_err();
        assert!(err.is_external());
        assert!(err.to_string().contains("lxc-start"), "{err}");
    }

    #[tokio::test]
    async fn ticket_auth_sends_cookie_and_csrf_on_writes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .and(body_string_contains("username=root%40pam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "ticket": "PVE:root@pam:TKT", "CSRFPreventionToken": "csrf-1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/stop"))
            .and(header("Cookie", "PVEAuthCookie=PVE:root@pam:TKT"))
            .and(header("CSRFPreventionToken", "csrf-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": "UPID:pve:0003:vzstop:101:root@pam:" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        mount_task(&server, "OK").await;

        let auth = ApiAuth::Ticket {
            username: "root@pam".into(),
            password: "secret".into(),
        };
        client(&server, auth)
            .stop(ContainerId::new(101))
            .await
            .expect("stop");
    }

    fn ticket() -> ApiAuth {
        ApiAuth::Ticket {
            username: "root@pam".into(),
            password: "secret".into(),
        }
    }

    async fn mount_login(server: &MockServer, logins: u64) {
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "ticket": "PVE:root@pam:TKT", "CSRFPreventionToken": "csrf-1" }
            })))
            .expect(logins)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn ticket_is_reused_across_calls_and_task_polls() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/stop"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": "UPID:pve:0004:vzstop:101:root@pam:" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api2/json/nodes/pve/tasks/.+/status$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "status": "running" } })),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        mount_task(&server, "OK").await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/current"))
            .and(header("Cookie", "PVEAuthCookie=PVE:root@pam:TKT"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "status": "stopped" } })),
            )
            .mount(&server)
            .await;

        let api = client(&server, ticket());
        api.stop(ContainerId::new(101)).await.expect("stop");
        assert_eq!(
            api.status(ContainerId::new(101)).await.unwrap(),
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn rejected_ticket_triggers_one_new_login() {
        let server = MockServer::start().await;
        mount_login(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/current"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/current"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "status": "running" } })),
            )
            .mount(&server)
            .await;

        let api = client(&server, ticket());
        assert_eq!(
            api.status(ContainerId::new(101)).await.unwrap(),
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn missing_config_maps_to_missing_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve/lxc/250/status/current"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "data": null,
                "message": "Configuration file 'nodes/pve/lxc/250.conf' does not exist\n"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve/lxc/101/status/current"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "status": "stopped" } })),
            )
            .mount(&server)
            .await;

        let api = client(&server, token());
        assert_eq!(
            api.status(ContainerId::new(250)).await.unwrap(),
            InstanceStatus::Missing
        );
        assert!(api.exists(ContainerId::new(101)).await.unwrap());
    }

    #[tokio::test]
    async fn lists_vztmpl_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve/storage/local/content"))
            .and(query_param("content", "vztmpl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "volid": "local:vztmpl/alpine.tar.xz", "size": 3_000_000 },
                    { "volid": "local:vztmpl/debian.tar.zst" }
                ]
            })))
            .mount(&server)
            .await;

        let templates = client(&server, token()).list_templates().await.unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].size_bytes, Some(3_000_000));
        assert_eq!(templates[1].size_bytes, None);
    }

    #[tokio::test]
    async fn exec_goes_through_pct_on_the_host() {
        let server = MockServer::start().await;
        let guest = RecordingExecutor::new();
        let api = ProxmoxApi::new(settings(&server, token()), Arc::new(guest.clone())).unwrap();
        let _ = api
            .exec(
                ContainerId::new(9),
                &GuestCommand::sh("true", Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(guest.lines(), vec!["pct exec 9 -- sh -c true"]);
    }
}
