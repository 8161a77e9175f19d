use super::{serve, EngineManager, Matchmaker};
use crate::uci::Stockfish;
use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::web;
use actix_web::App;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use actix_web::HttpServer;
use actix_web::Responder;
use std::sync::Arc;

pub struct Server;

impl Server {
    /// Binds the WebSocket endpoints and runs until the process is stopped.
    /// One matchmaking manager and one engine manager own every live match.
    pub async fn run() -> Result<(), std::io::Error> {
        let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());
        let engine = std::env::var("ENGINE_PATH").unwrap_or_else(|_| "stockfish".to_string());
        let matchmaking = web::Data::from(Matchmaker::new());
        let engines = web::Data::from(EngineManager::new(Arc::new(Stockfish::new(engine))));
        log::info!("starting hosting server on {}", bind);
        HttpServer::new(move || {
            App::new()
                .wrap(Logger::new("%r %s %Ts"))
                .wrap(
                    Cors::default()
                        .allow_any_origin()
                        .allow_any_method()
                        .allow_any_header(),
                )
                .app_data(matchmaking.clone())
                .app_data(engines.clone())
                .route("/ws/matchmaking", web::get().to(matchmaking_ws))
                .route("/ws/engine", web::get().to(engine_ws))
        })
        .workers(4)
        .bind(bind)?
        .run()
        .await
    }
}

async fn matchmaking_ws(
    manager: web::Data<Matchmaker>,
    req: HttpRequest,
    body: web::Payload,
) -> impl Responder {
    match actix_ws::handle(&req, body) {
        Ok((response, session, stream)) => {
            serve(manager.into_inner(), session, stream);
            response
        }
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

async fn engine_ws(
    manager: web::Data<EngineManager>,
    req: HttpRequest,
    body: web::Payload,
) -> impl Responder {
    match actix_ws::handle(&req, body) {
        Ok((response, session, stream)) => {
            serve(manager.into_inner(), session, stream);
            response
        }
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}
