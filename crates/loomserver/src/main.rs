use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use loomcore::{validate, NodeKind, Value, Workflow};
use loomnodes::{AgentHostClient, Capabilities, HttpLlmClient};
use loomruntime::{RuntimeConfig, WorkflowRuntime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<WorkflowRuntime>,
}

/// Request body for run submission
#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    inputs: HashMap<String, serde_json::Value>,
}

/// Response for workflow creation
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: Uuid,
    message: String,
}

/// Response for run submission
#[derive(Debug, Serialize)]
struct SubmitResponse {
    run_id: Uuid,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "loom"
    }))
}

/// List registered workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.runtime.list_workflows().await))
}

/// Register a new workflow. The workflow is validated before it is stored;
/// validation errors come back as 422 with the full error list.
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<Workflow>,
) -> ActixResult<impl Responder> {
    let workflow = workflow.into_inner();
    let name = workflow.name.clone();

    match data.runtime.register(workflow).await {
        Ok(id) => {
            info!("Registered workflow: {} ({})", name, id);
            Ok(HttpResponse::Created().json(WorkflowResponse {
                id,
                message: "Workflow registered".to_string(),
            }))
        }
        Err(report) => Ok(HttpResponse::UnprocessableEntity().json(serde_json::json!({
            "errors": report.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        }))),
    }
}

/// Validate a workflow without registering it
#[post("/api/workflows/validate")]
async fn validate_workflow(workflow: web::Json<Workflow>) -> ActixResult<impl Responder> {
    match validate(workflow.into_inner()) {
        Ok(validated) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "valid": true,
            "warnings": validated.warnings(),
        }))),
        Err(report) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "valid": false,
            "errors": report.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        }))),
    }
}

/// Get a registered workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    match data.runtime.workflow(&workflow_id).await {
        Some(validated) => Ok(HttpResponse::Ok().json(validated.workflow())),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Remove a registered workflow
#[actix_web::delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    if data.runtime.remove_workflow(&workflow_id).await {
        info!("Removed workflow: {}", workflow_id);
        Ok(HttpResponse::Ok().json(serde_json::json!({
            "message": "Workflow removed"
        })))
    } else {
        Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        }))
    }
}

/// Submit a run. Returns the run id immediately; progress is available
/// through the run endpoints.
#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<ExecuteRequest>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let inputs: HashMap<String, Value> = req
        .into_inner()
        .inputs
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();

    match data.runtime.submit(&workflow_id, inputs).await {
        Ok(run_id) => {
            info!("Submitted run {} of workflow {}", run_id, workflow_id);
            Ok(HttpResponse::Accepted().json(SubmitResponse { run_id }))
        }
        Err(e) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: e.to_string(),
        })),
    }
}

/// Get the current status of a run
#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.snapshot(&run_id).await {
        Some(snapshot) => Ok(HttpResponse::Ok().json(snapshot)),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Run {} not found", run_id),
        })),
    }
}

/// Get the node-by-node trace of a run
#[get("/api/runs/{id}/trace")]
async fn get_run_trace(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.trace(&run_id).await {
        Some(trace) => Ok(HttpResponse::Ok().json(trace)),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Run {} not found", run_id),
        })),
    }
}

/// Cancel a running workflow
#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    if data.runtime.cancel(&run_id).await {
        info!("Cancelled run: {}", run_id);
        Ok(HttpResponse::Ok().json(serde_json::json!({ "cancelled": true })))
    } else {
        Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Run {} not found", run_id),
        }))
    }
}

/// List the node kinds this server can execute
#[get("/api/nodes")]
async fn list_node_kinds(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let kinds: Vec<_> = data
        .runtime
        .executor_kinds()
        .into_iter()
        .map(|kind| kind.as_str())
        .collect();
    Ok(HttpResponse::Ok().json(kinds))
}

fn capabilities_from_env() -> Capabilities {
    let llm_base =
        std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm_key = std::env::var("LLM_API_KEY").ok();
    let host_base =
        std::env::var("AGENT_HOST_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let host_key = std::env::var("AGENT_HOST_API_KEY").ok();

    Capabilities {
        llm: Arc::new(HttpLlmClient::new(llm_base, llm_key)),
        host: Arc::new(AgentHostClient::new(host_base, host_key)),
        http: reqwest::Client::new(),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting Loom workflow server");

    let executors = loomnodes::standard_executors(capabilities_from_env());
    let runtime = WorkflowRuntime::new(executors, RuntimeConfig::default());

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    info!("Server listening on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_workflows)
            .service(create_workflow)
            .service(validate_workflow)
            .service(get_workflow)
            .service(delete_workflow)
            .service(execute_workflow)
            .service(get_run)
            .service(get_run_trace)
            .service(cancel_run)
            .service(list_node_kinds)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
