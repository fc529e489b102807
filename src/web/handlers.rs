use actix_web::{web, HttpResponse, Responder};
use log::{debug, error, info};
use serde_json::json;

use crate::model::ModelManager;
use crate::web::models::{ChatRequest, ChatResponse};

// Health/introspection endpoint
pub async fn root(manager: web::Data<ModelManager>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "ok": true,
        "base": manager.base(),
        "adapter_dir": manager.adapter_dir(),
        "device": manager.device(),
    }))
}

// Chat endpoint
pub async fn chat(
    manager: web::Data<ModelManager>,
    req: web::Json<ChatRequest>,
) -> impl Responder {
    let req = req.into_inner();

    if req.user.trim().is_empty() {
        return HttpResponse::UnprocessableEntity().json(json!({
            "error": "user must be a non-empty string"
        }));
    }

    info!(
        "Chat request: {} chars, {} context item(s), max_new_tokens {}",
        req.user.len(),
        req.context.as_ref().map_or(0, |c| c.len()),
        req.max_new_tokens
    );
    // Accepted but never forwarded; generation is always deterministic.
    debug!(
        "Sampling params in request: temperature={}, top_p={}",
        req.temperature, req.top_p
    );

    let manager = manager.into_inner();
    match web::block(move || manager.answer(&req)).await {
        Ok(Ok(answer)) => HttpResponse::Ok().json(ChatResponse { answer }),
        Ok(Err(e)) => {
            error!("Chat pipeline failed: {:#}", e);
            HttpResponse::InternalServerError().json(json!({
                "error": format!("{:#}", e)
            }))
        }
        Err(e) => {
            error!("Chat worker failed: {}", e);
            HttpResponse::InternalServerError().json(json!({
                "error": e.to_string()
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{test, web::Data, App};
    use serde_json::{json, Value};

    use crate::model::testing::ScriptedBackend;
    use crate::model::ModelManager;
    use crate::web::routes;

    fn manager_with(backend: Arc<ScriptedBackend>) -> Data<ModelManager> {
        Data::new(ModelManager::with_backend(
            backend,
            "./adapters".to_string(),
            "cpu",
        ))
    }

    #[actix_web::test]
    async fn root_reports_service_facts() {
        let manager = manager_with(Arc::new(ScriptedBackend::new("hi")));
        let app =
            test::init_service(App::new().app_data(manager).configure(routes::configure)).await;

        let req = test::TestRequest::get().uri("/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["base"], json!("scripted"));
        assert_eq!(body["adapter_dir"], json!("./adapters"));
        assert_eq!(body["device"], json!("cpu"));
    }

    #[actix_web::test]
    async fn chat_answers_with_cleaned_text() {
        let backend = Arc::new(ScriptedBackend::new("Sure. Here's: Hello world"));
        let manager = manager_with(backend.clone());
        let app =
            test::init_service(App::new().app_data(manager).configure(routes::configure)).await;

        let req = test::TestRequest::post()
            .uri("/v1/chat")
            .set_json(json!({"user": "Hi", "max_new_tokens": 500}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["answer"], json!("Hello world"));

        // Oversized request collapsed to the ceiling; decoding stayed greedy.
        let config = backend.last_config.lock().unwrap().clone().unwrap();
        assert_eq!(config.max_new_tokens, 256);
        assert!(!config.do_sample);
        assert_eq!(config.eos_token_id, Some(2));
        assert_eq!(config.pad_token_id, Some(2));
    }

    #[actix_web::test]
    async fn chat_ignores_client_sampling_params() {
        let backend = Arc::new(ScriptedBackend::new("fine"));
        let manager = manager_with(backend.clone());
        let app =
            test::init_service(App::new().app_data(manager).configure(routes::configure)).await;

        let req = test::TestRequest::post()
            .uri("/v1/chat")
            .set_json(json!({"user": "Hi", "temperature": 0.9, "top_p": 0.5}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let config = backend.last_config.lock().unwrap().clone().unwrap();
        assert!(!config.do_sample);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.top_p, 1.0);
    }

    #[actix_web::test]
    async fn generation_failure_is_a_500() {
        let backend = Arc::new(ScriptedBackend {
            fail_generate: true,
            ..ScriptedBackend::new("ignored")
        });
        let manager = manager_with(backend);
        let app =
            test::init_service(App::new().app_data(manager).configure(routes::configure)).await;

        let req = test::TestRequest::post()
            .uri("/v1/chat")
            .set_json(json!({"user": "Hi"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn empty_user_is_rejected() {
        let manager = manager_with(Arc::new(ScriptedBackend::new("hi")));
        let app =
            test::init_service(App::new().app_data(manager).configure(routes::configure)).await;

        let req = test::TestRequest::post()
            .uri("/v1/chat")
            .set_json(json!({"user": "   "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 422);
    }
}
