#![allow(dead_code)]

use std::sync::Arc;

use application::{Actor, ManualClock};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use config::AppConfig;
use domain::{UserId, UserRole};
use infrastructure::Infrastructure;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot};
use tower::ServiceExt;
use web_api::{router, AppState};

pub const SECRET: &str = "integration-test-secret-with-32-plus-chars";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
}

pub struct TestUser {
    pub actor: Actor,
    pub token: String,
}

impl TestApp {
    /// 内存存储 + 手动时钟
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.jwt.secret = SECRET.to_string();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap(),
        ));
        let state = AppState::build(&config, Infrastructure::in_memory(), clock.clone());
        Self {
            router: router(state.clone()),
            state,
            clock,
        }
    }

    pub fn user(&self, name: &str, role: UserRole) -> TestUser {
        let actor = Actor {
            user_id: UserId::generate(),
            role,
            display_name: Some(name.to_string()),
        };
        let token = self
            .state
            .jwt
            .generate_token(&actor, chrono::Duration::hours(1))
            .expect("token");
        TestUser { actor, token }
    }

    /// 生成用户并调用一次接口，让用户目录里出现该用户
    pub async fn registered_user(&self, name: &str) -> TestUser {
        let user = self.user(name, UserRole::User);
        let (status, _) = self.get(&user, "/api/v1/me/unread").await;
        assert_eq!(status, StatusCode::OK);
        user
    }

    pub async fn request(
        &self,
        user: Option<&TestUser>,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(user) = user {
            builder = builder.header("authorization", format!("Bearer {}", user.token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.expect("request");
        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = serde_json::from_slice(&body_bytes).unwrap_or(json!({}));
        (status, body)
    }

    pub async fn get(&self, user: &TestUser, path: &str) -> (StatusCode, Value) {
        self.request(Some(user), "GET", path, None).await
    }

    pub async fn post(&self, user: &TestUser, path: &str, body: Value) -> (StatusCode, Value) {
        self.request(Some(user), "POST", path, Some(body)).await
    }

    pub async fn direct(&self, from: &TestUser, to: &TestUser) -> String {
        let (status, body) = self
            .post(
                from,
                "/api/v1/conversations",
                json!({ "type": "direct", "participant_ids": [to.actor.user_id] }),
            )
            .await;
        assert!(status.is_success(), "create conversation: {status} {body}");
        body["id"].as_str().expect("conversation id").to_string()
    }

    /// 在本地端口上启动服务，返回地址和关闭信号
    pub async fn serve(&self) -> (std::net::SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = self.router.clone();

        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        (addr, shutdown_tx)
    }
}
