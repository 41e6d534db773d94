use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use tracing::info;

/// `GET /api/transcriptions`: full history, newest first.
pub async fn list_transcriptions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let records = state.relay.store().list_all_desc();
    Ok(HttpResponse::Ok().json(records))
}

/// `DELETE /api/transcriptions`
pub async fn clear_transcriptions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let removed = state.relay.store().clear();
    info!(removed, "Transcription history cleared");
    Ok(HttpResponse::Ok().body("History cleaned"))
}

/// `POST /api/transcriptions/audio`: forward an opaque (base64) audio chunk
/// to the translation backend.
pub async fn send_audio(state: web::Data<AppState>, body: String) -> AppResult<HttpResponse> {
    if body.trim().is_empty() {
        return Err(AppError::BadRequest("audio payload is empty".to_string()));
    }

    let bytes = body.len();
    state.relay.send_audio(body).await?;
    info!(bytes, "Audio forwarded to translation backend");

    Ok(HttpResponse::Ok().body("Audio data sent to translation backend"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::Relay;
    use crate::store::{MemoryStore, NewTranscription, TranslationStore};
    use crate::upstream::{LinkState, UpstreamLink};
    use actix_web::{http::StatusCode, test, App};
    use futures_util::StreamExt;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    fn state_with(config: AppConfig, store: Arc<MemoryStore>) -> AppState {
        let link = Arc::new(UpstreamLink::new(config.upstream.clone()));
        let relay = Arc::new(Relay::new(link, store, &config.relay));
        AppState::new(config, relay)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/api/transcriptions", web::get().to(list_transcriptions))
                    .route("/api/transcriptions", web::delete().to(clear_transcriptions))
                    .route("/api/transcriptions/audio", web::post().to(send_audio)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_list_and_clear_history() {
        let store = Arc::new(MemoryStore::new());
        store.append(NewTranscription::new("Hello", "Hola"));
        store.append(NewTranscription::new("Bye", "Adiós"));
        let app = app!(state_with(AppConfig::default(), store.clone()));

        let req = test::TestRequest::get().uri("/api/transcriptions").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["originalText"], "Bye");
        assert_eq!(records[0]["translatedText"], "Adiós");
        assert!(records[0]["createdAt"].is_string());
        assert_eq!(records[1]["originalText"], "Hello");

        let req = test::TestRequest::delete().uri("/api/transcriptions").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, "History cleaned");
        assert_eq!(store.count(), 0);
    }

    #[actix_web::test]
    async fn test_audio_rejected_while_backend_down() {
        let app = app!(state_with(AppConfig::default(), Arc::new(MemoryStore::new())));

        let req = test::TestRequest::post()
            .uri("/api/transcriptions/audio")
            .set_payload("UklGRg==")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "service_unavailable");
    }

    #[actix_web::test]
    async fn test_empty_audio_is_a_bad_request() {
        let app = app!(state_with(AppConfig::default(), Arc::new(MemoryStore::new())));

        let req = test::TestRequest::post()
            .uri("/api/transcriptions/audio")
            .set_payload("")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_audio_is_forwarded_when_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = AppConfig::default();
        config.upstream.ws_url = format!("ws://{}", listener.local_addr().unwrap());
        let state = state_with(config, Arc::new(MemoryStore::new()));
        let link = state.relay.link().clone();
        link.spawn();

        let (tcp, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut backend = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let mut ready = link.subscribe_state();
        timeout(WAIT, ready.wait_for(|s| *s == LinkState::Ready))
            .await
            .unwrap()
            .unwrap();

        let app = app!(state);
        let req = test::TestRequest::post()
            .uri("/api/transcriptions/audio")
            .set_payload("UklGRg==")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            test::read_body(resp).await,
            "Audio data sent to translation backend"
        );

        // set_task first, then the audio frame.
        let mut frames = Vec::new();
        while frames.len() < 2 {
            match timeout(WAIT, backend.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => {
                    frames.push(serde_json::from_str::<Value>(&text).unwrap())
                }
                Some(Ok(_)) => {}
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(frames[0]["message_type"], "set_task");
        assert_eq!(frames[1]["message_type"], "input_audio_data");
        assert_eq!(frames[1]["data"]["data"], "UklGRg==");

        link.shutdown();
    }
}
