use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use launchpad_core::api;
use launchpad_core::config::{LaunchConfig, LicenseConfig, StackSettings};
use launchpad_core::stack::{DeploymentScope, ProvisionedStack, Provisioner, StackDefinition};
use launchpad_core::trigger::AuthMode;
use launchpad_core::{FargatePool, TaskRunner};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn provision(settings: StackSettings) -> Arc<ProvisionedStack> {
    let license = LicenseConfig::from_lookup(|k| Some(format!("{k}-test"))).unwrap();
    let config = LaunchConfig::new(settings, license).unwrap();
    Provisioner::new(DeploymentScope::new())
        .provision(&StackDefinition::from_config(config))
        .expect("Failed to provision stack")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_invoke_returns_accepted_run() {
    let stack = provision(StackSettings::default());
    let pool = Arc::new(stack.pool());
    let app = api::router(stack.trigger_endpoint(pool.clone()));

    let response = app.oneshot(post("")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = json_body(response).await;
    let run_id = body["runId"].as_str().unwrap();
    assert!(!run_id.is_empty());
    assert_eq!(body["cluster"], stack.cluster.arn.as_str());
    assert_eq!(body["taskDefinition"], stack.task_definition.as_str());

    let running = pool
        .list_tasks(
            &stack.trigger_identity,
            &stack.cluster.arn,
            launchpad_core::cluster::RunStatus::Running,
        )
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert!(running[0].as_str().ends_with(run_id));
}

#[tokio::test]
async fn test_get_also_invokes() {
    let stack = provision(StackSettings::default());
    let app = api::router(stack.trigger_endpoint(Arc::new(stack.pool())));

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_invoke_with_config_override() {
    let stack = provision(StackSettings::default());
    let pool = Arc::new(stack.pool());
    let app = api::router(stack.trigger_endpoint(pool.clone()));

    let response = app
        .oneshot(post(r#"{"config": {"generators": []}, "sample": 25}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = json_body(response).await;
    let task = launchpad_iam::Arn::parse(body["taskArn"].as_str().unwrap()).unwrap();
    let run = pool
        .describe_task(&stack.trigger_identity, &stack.cluster.arn, &task)
        .await
        .unwrap();
    assert_eq!(run.overrides[0].command[2..], ["--sample".to_string(), "25".to_string()]);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let stack = provision(StackSettings::default());
    let app = api::router(stack.trigger_endpoint(Arc::new(stack.pool())));

    let response = app.oneshot(post("{not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn test_capacity_exhausted_is_service_unavailable() {
    let stack = provision(StackSettings::default());
    let pool: Arc<FargatePool> = Arc::new(stack.pool().with_capacity(1));
    let app = api::router(stack.trigger_endpoint(pool));

    let first = app.clone().oneshot(post("")).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app.oneshot(post("")).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(second).await;
    assert!(body["error"].as_str().unwrap().contains("capacity"));
}

#[tokio::test]
async fn test_aws_iam_mode_requires_authorization_header() {
    let mut settings = StackSettings::default();
    settings.trigger.auth_mode = AuthMode::AwsIam;
    let stack = provision(settings);
    let app = api::router(stack.trigger_endpoint(Arc::new(stack.pool())));

    let response = app.clone().oneshot(post("")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let signed = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::AUTHORIZATION, "AWS4-HMAC-SHA256 Credential=test")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_health_check_does_not_start_runs() {
    let stack = provision(StackSettings::default());
    let pool = Arc::new(stack.pool());
    let app = api::router(stack.trigger_endpoint(pool.clone()));

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["function"], "ShadowTrafficRunner");

    let running = pool
        .list_tasks(
            &stack.trigger_identity,
            &stack.cluster.arn,
            launchpad_core::cluster::RunStatus::Running,
        )
        .await
        .unwrap();
    assert!(running.is_empty());
}
