use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    ok: bool,
    service: String,
}

pub async fn health_check() -> HttpResponse {
    let response = HealthResponse {
        ok: true,
        service: "worker".to_string(),
    };

    HttpResponse::Ok().json(response)
}

/// Build the `/health` server; the caller awaits it for the worker lifetime.
pub fn health_server(port: u16) -> std::io::Result<Server> {
    log::info!("Health endpoint listening on 0.0.0.0:{}", port);
    let server = HttpServer::new(|| {
        App::new().service(web::resource("/health").route(web::get().to(health_check)))
    })
    .bind(("0.0.0.0", port))?
    .run();
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::test::TestRequest;

    #[actix_rt::test]
    async fn health_reports_ok_worker() {
        let request = TestRequest::get().to_http_request();
        let response = health_check().await.respond_to(&request);
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["service"], "worker");
    }
}
