use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use chatter_gateway::connection;
use chatter_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
    db: Arc<chatter_db::Database>,
    dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatter=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("CHATTER_DB_PATH").unwrap_or_else(|_| "chatter.db".into());
    let host = std::env::var("CHATTER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CHATTER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(chatter_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let state = ServerState {
        db,
        dispatcher,
    };

    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Chatter server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db)
    })
}
