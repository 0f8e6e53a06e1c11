use actix_web::web;

use crate::ai::generate;
use crate::auth::{login, logout, register};
use crate::errors::ApiError;
use crate::execution::{execute_code, stop_execution};
use crate::invitations::{
    accept_invitation, list_received, list_sent, reject_invitation, send_invitation,
};
use crate::project::{
    add_members, create_project, delete_project, get_messages, get_presence, get_project,
    list_projects, post_message, update_file_tree,
};
use crate::user_management::{
    get_me, get_user_by_id, list_users, search_users, update_me, update_username,
};
use crate::web_socket_server::ws_index;

/// Malformed bodies and query strings answer with the same JSON error shape
/// as the handlers.
fn extractor_configs(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    );
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    extractor_configs(cfg);

    cfg.service(
        web::scope("/auth")
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout)),
    )
    // USERS
    .service(
        web::scope("/users")
            .route("", web::get().to(list_users))
            .route("/me", web::get().to(get_me))
            .route("/me", web::put().to(update_me))
            .route("/me/username", web::put().to(update_username))
            .route("/search", web::get().to(search_users))
            .route("/{id}", web::get().to(get_user_by_id)),
    )
    // PROJECTS
    .service(
        web::scope("/projects")
            .route("", web::post().to(create_project))
            .route("", web::get().to(list_projects))
            .service(
                web::scope("/{project_id}")
                    .route("", web::get().to(get_project))
                    .route("", web::delete().to(delete_project))
                    .route("/members", web::put().to(add_members))
                    .route("/file-tree", web::put().to(update_file_tree))
                    .route("/messages", web::get().to(get_messages))
                    .route("/messages", web::post().to(post_message))
                    .route("/presence", web::get().to(get_presence)),
            ),
    )
    // INVITATIONS
    .service(
        web::scope("/invitations")
            .route("", web::post().to(send_invitation))
            .route("", web::get().to(list_received))
            .route("/sent", web::get().to(list_sent))
            .route("/{invitation_id}/accept", web::post().to(accept_invitation))
            .route("/{invitation_id}/reject", web::post().to(reject_invitation)),
    )
    // EXECUTION
    .service(
        web::scope("/execute")
            .route("", web::post().to(execute_code))
            .route("/{execution_id}/stop", web::post().to(stop_execution)),
    )
    .service(web::scope("/ai").route("/generate", web::post().to(generate)))
    // WEBSOCKET route for real-time
    .service(web::resource("/ws").route(web::get().to(ws_index)));
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use actix::Actor;
    use actix_web::web;

    use crate::ai::AiService;
    use crate::app_state::AppState;
    use crate::auth::{create_jwt, TokenBlacklist};
    use crate::config::{AiConfig, Config};
    use crate::db::MongoDB;
    use crate::execution::CodeRunner;
    use crate::project_hub::ProjectHub;

    pub const SECRET: &str = "test-secret";
    const TEST_URI: &str = "mongodb://127.0.0.1:27017/?serverSelectionTimeoutMS=200";

    /// State whose database client gives up on server selection quickly.
    /// Handler tests only exercise paths that answer before any query.
    pub async fn state() -> web::Data<AppState> {
        let mongodb = MongoDB::init(TEST_URI, "collab_test")
            .await
            .expect("parse test uri");
        let config = Config {
            mongo_uri: TEST_URI.into(),
            database_name: "collab_test".into(),
            jwt_secret: SECRET.into(),
            jwt_ttl_hours: 1,
            bind_addr: "127.0.0.1:0".into(),
            frontend_origin: "http://localhost:3000".into(),
            exec_timeout: Duration::from_secs(5),
            exec_max_output_bytes: 4096,
            ai: AiConfig::default(),
        };
        web::Data::new(AppState {
            hub: ProjectHub::new().start(),
            mongodb: Arc::new(mongodb),
            runner: CodeRunner::new(config.exec_timeout, config.exec_max_output_bytes),
            config,
            revoked_tokens: TokenBlacklist::default(),
            ai: Arc::new(AiService::with_providers(Vec::new())),
        })
    }

    pub fn bearer(user_id: &str) -> (&'static str, String) {
        let token = create_jwt(user_id, SECRET, 1).expect("sign test token");
        ("Authorization", format!("Bearer {}", token))
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};

    use super::test_support::{bearer, state, SECRET};
    use super::*;
    use crate::auth::create_jwt;
    use crate::middleware::Authentication;

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .wrap(Authentication)
                    .app_data($state.clone())
                    .configure(configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn protected_routes_need_a_token() {
        let data = state().await;
        let app = app!(data);

        for uri in ["/projects", "/users/me", "/invitations"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn bad_and_revoked_tokens_are_rejected() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::get()
            .uri("/projects")
            .insert_header(("Authorization", "Bearer not-a-jwt"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid token"));

        let token = create_jwt("u1", SECRET, 1).unwrap();
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        data.revoked_tokens.revoke(&token, exp);
        let req = test::TestRequest::get()
            .uri("/projects")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn project_without_name_is_a_validation_error() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/projects")
            .insert_header(bearer("u1"))
            .set_json(json!({ "name": "   " }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["errors"][0]["field"], "name");
    }

    #[actix_web::test]
    async fn register_reports_each_bad_field() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/auth/register")
            .set_json(json!({ "email": "nope", "username": "x", "password": "123" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["errors"].as_array().unwrap().len(), 3);
    }

    #[actix_web::test]
    async fn self_invitation_is_rejected() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/invitations")
            .insert_header(bearer("u1"))
            .set_json(json!({ "project_id": "p1", "recipient_id": "u1" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn malformed_json_uses_error_shape() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/execute")
            .insert_header(bearer("u1"))
            .insert_header(("Content-Type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].is_string());
    }

    #[actix_web::test]
    async fn execute_runs_a_shell_script() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/execute")
            .insert_header(bearer("u1"))
            .set_json(json!({ "language": "shell", "code": "echo hello" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["stdout"], "hello\n");
        assert_eq!(body["exit_code"], 0);
    }

    #[actix_web::test]
    async fn execute_rejects_unknown_language_and_stop_ids() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/execute")
            .insert_header(bearer("u1"))
            .set_json(json!({ "language": "cobol", "code": "DISPLAY 'x'" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/execute/missing/stop")
            .insert_header(bearer("u1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn generate_falls_back_without_providers() {
        let data = state().await;
        let app = app!(data);

        let req = test::TestRequest::post()
            .uri("/ai/generate")
            .insert_header(bearer("u1"))
            .set_json(json!({ "prompt": "write a python script that prints hi" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["file_tree"]["main.py"].is_string());

        let req = test::TestRequest::post()
            .uri("/ai/generate")
            .insert_header(bearer("u1"))
            .set_json(json!({ "prompt": "  " }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn logout_revokes_the_token() {
        let data = state().await;
        let app = app!(data);
        let header = bearer("u1");

        let req = test::TestRequest::post()
            .uri("/auth/logout")
            .insert_header(header.clone())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(data.revoked_tokens.len(), 1);

        let req = test::TestRequest::post()
            .uri("/auth/logout")
            .insert_header(header)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
