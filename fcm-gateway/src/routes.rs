//! Axum route handlers for the VM manager API.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use fcm_core::{CreateRequest, NetworkRequest, VmName, VmRecord, VmState};
use fcm_executor::{CreateDefaults, ExecutorError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{error::GatewayError, service::VmService};

// ── Shared state ─────────────────────────────────────────────────────────────

type Service = Arc<dyn VmService>;

// ── Request / response types ──────────────────────────────────────────────────

/// Body of `POST /v1/vms`. Omitted kernel, image, size and resources fall
/// back to the configured defaults.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateVmBody {
    pub name: VmName,
    pub kernel: Option<String>,
    pub image: Option<String>,
    pub rootfs_size: Option<String>,
    pub vm_ip: Ipv4Addr,
    pub tap_ip: Ipv4Addr,
    pub cpus: Option<u8>,
    pub memory: Option<u32>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub network: NetworkRequest,
    #[serde(default)]
    pub force_rootfs: bool,
}

fn required<T>(field: &str, value: Option<T>, fallback: Option<&T>) -> Result<T, GatewayError>
where
    T: Clone,
{
    value.or_else(|| fallback.cloned()).ok_or_else(|| {
        GatewayError::InvalidRequest(format!("'{field}' is required and has no configured default"))
    })
}

impl CreateVmBody {
    /// Fills omitted fields from `defaults`.
    ///
    /// # Errors
    /// Returns [`GatewayError::InvalidRequest`] naming the first field that
    /// is neither given nor defaulted.
    pub fn into_request(self, defaults: &CreateDefaults) -> Result<CreateRequest, GatewayError> {
        Ok(CreateRequest {
            kernel: required("kernel", self.kernel, defaults.kernel.as_ref())?,
            image: required("image", self.image, defaults.image.as_ref())?,
            rootfs_size: required("rootfs_size", self.rootfs_size, defaults.rootfs_size.as_ref())?,
            cpus: required("cpus", self.cpus, defaults.cpus.as_ref())?,
            memory: required("memory", self.memory, defaults.memory.as_ref())?,
            name: self.name,
            vm_ip: self.vm_ip,
            tap_ip: self.tap_ip,
            hostname: self.hostname,
            metadata: self.metadata,
            network: self.network,
            force_rootfs: self.force_rootfs,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedVm {
    pub record: VmRecord,
    pub socket: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct StartedVm {
    pub name: VmName,
    pub socket: PathBuf,
    pub process: String,
}

#[derive(Debug, Serialize)]
pub struct VmStatus {
    pub name: VmName,
    pub state: VmState,
}

#[derive(Debug, Default, Deserialize)]
pub struct DestroyParams {
    #[serde(default)]
    pub force: bool,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router around `service`.
pub fn create_router(service: Service) -> Router {
    Router::new()
        .route("/v1/vms", get(list_vms).post(create_vm))
        .route("/v1/vms/{name}", get(vm_status).delete(destroy_vm))
        .route("/v1/vms/{name}/stop", post(stop_vm))
        .route("/v1/vms/{name}/start", post(start_vm))
        .route("/v1/vms/{name}/restart", post(restart_vm))
        .route("/health", get(health))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `GET /v1/vms`: every known VM, live where running.
///
/// # Errors
/// Returns 500 only if the record directory cannot be read.
pub async fn list_vms(State(service): State<Service>) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(service.list().await?))
}

/// `POST /v1/vms`: create and boot a VM.
///
/// # Errors
/// 400 for invalid input, 409 if a name, socket, rootfs or device is taken,
/// 502 if a host tool or the VMM failed (after rollback).
pub async fn create_vm(
    State(service): State<Service>,
    Json(body): Json<CreateVmBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let request = body.into_request(service.defaults())?;
    let report = detached(&service, move |svc| async move { svc.create(&request).await }).await?;
    tracing::info!(vm = %report.record.name, "created via API");
    let created = CreatedVm { socket: report.handle.socket_path, record: report.record };
    Ok((StatusCode::CREATED, Json(created)))
}

/// Runs a lifecycle operation on its own task. If the client disconnects
/// and the handler is dropped, the operation still finishes, including any
/// rollback of a failed create.
async fn detached<T, F, Fut>(service: &Service, op: F) -> Result<T, GatewayError>
where
    T: Send + 'static,
    F: FnOnce(Service) -> Fut,
    Fut: Future<Output = Result<T, ExecutorError>> + Send + 'static,
{
    Ok(tokio::spawn(op(Arc::clone(service))).await??)
}

async fn require(service: &Service, name: &VmName) -> Result<VmState, GatewayError> {
    match service.state(name).await? {
        VmState::Absent => Err(GatewayError::NotFound(name.to_string())),
        state => Ok(state),
    }
}

/// `GET /v1/vms/{name}`: lifecycle state of one VM.
///
/// # Errors
/// 404 if there is neither a record nor a running process.
pub async fn vm_status(
    State(service): State<Service>,
    Path(name): Path<VmName>,
) -> Result<impl IntoResponse, GatewayError> {
    let state = require(&service, &name).await?;
    Ok(Json(VmStatus { name, state }))
}

/// `POST /v1/vms/{name}/stop`
///
/// # Errors
/// 404 without a record, 502 if the supervisor fails.
pub async fn stop_vm(
    State(service): State<Service>,
    Path(name): Path<VmName>,
) -> Result<impl IntoResponse, GatewayError> {
    require(&service, &name).await?;
    let vm = name.clone();
    detached(&service, move |svc| async move { svc.stop(&vm).await }).await?;
    Ok(Json(VmStatus { name, state: VmState::Stopped }))
}

/// `POST /v1/vms/{name}/start`
///
/// # Errors
/// 404 without a record, 409 if already running or the record is
/// incomplete, 502 if a boot step fails.
pub async fn start_vm(
    State(service): State<Service>,
    Path(name): Path<VmName>,
) -> Result<impl IntoResponse, GatewayError> {
    require(&service, &name).await?;
    let vm = name.clone();
    let handle = detached(&service, move |svc| async move { svc.start(&vm).await }).await?;
    Ok(Json(StartedVm { name, socket: handle.socket_path, process: handle.process.to_string() }))
}

/// `POST /v1/vms/{name}/restart`
///
/// # Errors
/// Same as stop followed by start.
pub async fn restart_vm(
    State(service): State<Service>,
    Path(name): Path<VmName>,
) -> Result<impl IntoResponse, GatewayError> {
    require(&service, &name).await?;
    let vm = name.clone();
    let handle = detached(&service, move |svc| async move { svc.restart(&vm).await }).await?;
    Ok(Json(StartedVm { name, socket: handle.socket_path, process: handle.process.to_string() }))
}

/// `DELETE /v1/vms/{name}?force=true`: remove every resource of a stopped VM.
///
/// Destroying an unknown VM succeeds with outcome `nothing_to_destroy`.
///
/// # Errors
/// 409 without `force=true` or while the VM runs, 502 if a cleanup step
/// failed (the record is kept so the call can be repeated).
pub async fn destroy_vm(
    State(service): State<Service>,
    Path(name): Path<VmName>,
    Query(params): Query<DestroyParams>,
) -> Result<impl IntoResponse, GatewayError> {
    if !params.force {
        return Err(GatewayError::ConfirmationRequired(format!(
            "destroying '{name}' deletes its rootfs and devices; repeat with ?force=true"
        )));
    }
    let outcome = detached(&service, move |svc| async move { svc.destroy(&name).await }).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use fcm_executor::testing::{FakeHost, FakeVmm};
    use fcm_executor::{ImageCopyBuilder, Orchestrator, Settings};
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    struct TestApp {
        dir: tempfile::TempDir,
        host: Arc<FakeHost>,
        vmm: FakeVmm,
        router: Router,
    }

    fn test_app() -> TestApp {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let root = dir.path();
        let mut settings = Settings::default();
        settings.kernel_dir = root.join("kernels");
        settings.images_dir = root.join("images");
        settings.rootfs_dir = root.join("rootfs");
        settings.socket_dir = root.join("run");
        settings.cache_dir = root.join("cache");
        settings.supervisor_conf_dir = root.join("conf.d");
        settings.ready_timeout = Duration::from_millis(300);
        settings.defaults.kernel = Some("vmlinux-6.1".to_owned());
        settings.defaults.image = Some("base.ext4".to_owned());
        settings.defaults.rootfs_size = Some("1G".to_owned());
        settings.defaults.cpus = Some(1);
        settings.defaults.memory = Some(256);
        for (dir, file) in [(&settings.kernel_dir, "vmlinux-6.1"), (&settings.images_dir, "base.ext4")] {
            if let Err(e) = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(dir.join(file), "x")) {
                panic!("fixture {file}: {e}");
            }
        }

        let host = Arc::new(FakeHost::default());
        let vmm = FakeVmm::default();
        let orch = Orchestrator::new(
            settings,
            Arc::clone(&host),
            Arc::new(vmm.clone()),
            vmm.clone(),
            ImageCopyBuilder::new(Arc::clone(&host)),
        );
        TestApp { dir, host, vmm, router: create_router(Arc::new(orch)) }
    }

    async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        };
        let req = match req {
            Ok(r) => r,
            Err(e) => panic!("failed to build request: {e}"),
        };
        let resp = match app.router.clone().oneshot(req).await {
            Ok(r) => r,
            Err(e) => panic!("handler error: {e}"),
        };
        let status = resp.status();
        let bytes = match axum::body::to_bytes(resp.into_body(), 64 * 1024).await {
            Ok(b) => b,
            Err(e) => panic!("failed to read body: {e}"),
        };
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn create_body(name: &str, octet: u8) -> Value {
        serde_json::json!({
            "name": name,
            "vm_ip": format!("172.16.{octet}.2"),
            "tap_ip": format!("172.16.{octet}.1"),
            "metadata": {"role": "api"},
        })
    }

    #[tokio::test]
    async fn health_response_format_returns_ok_with_status_field() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_uses_defaults_and_lists_running_vm() {
        let app = test_app();
        let (status, body) = call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 0))).await;
        assert_eq!(status, StatusCode::CREATED, "body: {body}");
        assert_eq!(body["record"]["tap_device"], "tap0");
        assert_eq!(body["record"]["cpus"], 1);
        assert_eq!(body["record"]["memory"], 256);

        let (status, rows) = call(&app, Method::GET, "/v1/vms", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rows[0]["name"], "api1");
        assert_eq!(rows[0]["state"], "running");
        assert_eq!(rows[0]["vm_ip"], "172.16.0.2");
    }

    #[tokio::test]
    async fn invalid_create_is_bad_request_and_duplicate_is_conflict() {
        let app = test_app();
        let mut bad = create_body("api1", 0);
        bad["cpus"] = serde_json::json!(0);
        let (status, body) = call(&app, Method::POST, "/v1/vms", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        assert!(body["error"].as_str().is_some_and(|e| e.contains("cpus")));

        let (status, _) = call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 0))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 1))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn rejected_configuration_is_bad_gateway() {
        let app = test_app();
        app.vmm.reject_step("machine-config", "vCPU count too high");
        let (status, body) = call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 0))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("machine-config")), "body: {body}");
    }

    #[tokio::test]
    async fn unknown_vm_is_not_found() {
        let app = test_app();
        for action in ["stop", "start", "restart"] {
            let (status, _) = call(&app, Method::POST, &format!("/v1/vms/ghost/{action}"), None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{action}");
        }
    }

    #[tokio::test]
    async fn destroy_requires_force_and_a_stopped_vm() {
        let app = test_app();
        let (status, _) = call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 0))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(&app, Method::DELETE, "/v1/vms/api1", None).await;
        assert_eq!(status, StatusCode::CONFLICT, "destroy without force must be refused");
        let (status, _) = call(&app, Method::DELETE, "/v1/vms/api1?force=true", None).await;
        assert_eq!(status, StatusCode::CONFLICT, "a running VM must not be destroyed");

        let (status, body) = call(&app, Method::POST, "/v1/vms/api1/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "stopped");

        let (status, body) = call(&app, Method::DELETE, "/v1/vms/api1?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "destroyed");
        assert_eq!(body["removed_devices"], serde_json::json!(["tap0", "tap1"]));

        let (status, body) = call(&app, Method::DELETE, "/v1/vms/api1?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "nothing_to_destroy");
    }

    #[tokio::test]
    async fn create_abandoned_by_the_client_still_rolls_back() {
        let app = test_app();
        app.vmm.never_ready("api1");
        let req = match Request::builder()
            .method(Method::POST)
            .uri("/v1/vms")
            .header("content-type", "application/json")
            .body(Body::from(create_body("api1", 0).to_string()))
        {
            Ok(r) => r,
            Err(e) => panic!("failed to build request: {e}"),
        };

        let dropped = tokio::time::timeout(Duration::from_millis(50), app.router.clone().oneshot(req)).await;
        assert!(dropped.is_err(), "the create must still be waiting for the VMM when the client leaves");

        let rootfs = app.dir.path().join("rootfs/api1.ext4");
        let deadline = Instant::now() + Duration::from_secs(5);
        while rootfs.exists() || !app.vmm.supervisor_log().contains(&"unregister api1".to_owned()) {
            assert!(Instant::now() < deadline, "rollback never finished: {:?}", app.vmm.supervisor_log());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!app.vmm.is_registered("api1"));
        assert!(app.host.devices().is_empty());

        let (status, _) = call(&app, Method::GET, "/v1/vms/api1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_follows_the_lifecycle() {
        let app = test_app();
        let (status, _) = call(&app, Method::GET, "/v1/vms/api1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 0))).await;
        let (status, body) = call(&app, Method::GET, "/v1/vms/api1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "running");

        call(&app, Method::POST, "/v1/vms/api1/stop", None).await;
        let (_, body) = call(&app, Method::GET, "/v1/vms/api1", None).await;
        assert_eq!(body["state"], "stopped");
    }

    #[tokio::test]
    async fn start_after_stop_reports_the_program() {
        let app = test_app();
        call(&app, Method::POST, "/v1/vms", Some(create_body("api1", 0))).await;
        call(&app, Method::POST, "/v1/vms/api1/stop", None).await;
        let (status, body) = call(&app, Method::POST, "/v1/vms/api1/start", None).await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(body["name"], "api1");

        let (status, _) = call(&app, Method::POST, "/v1/vms/api1/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT, "starting a running VM is a state error");
    }

    #[test]
    fn missing_field_without_default_is_rejected() {
        let body: CreateVmBody = match serde_json::from_value(create_body("api1", 0)) {
            Ok(b) => b,
            Err(e) => panic!("body must parse: {e}"),
        };
        let err = match body.into_request(&CreateDefaults::default()) {
            Ok(r) => panic!("no kernel anywhere must fail, got {r:?}"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("kernel"));
    }
}
