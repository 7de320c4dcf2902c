use std::net::TcpListener;
use std::sync::Arc;

use axum::{Router, routing};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cache::Cache;
use crate::engine::Handle;
use crate::store::{BlockStore, RoundStore};
use crate::{account, health, tiering};

/// Everything the responders read from.
pub struct State {
    pub id: account::NodeId,
    pub engine: Handle,
    pub blocks: Arc<dyn BlockStore>,
    pub rounds: Arc<dyn RoundStore>,
    pub cache: Arc<Cache>,
    pub reports: Arc<health::Reports>,
    pub tiering: Option<Arc<RwLock<tiering::Stats>>>,
}

mod handlers {
    use super::*;

    use axum::extract;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response as HttpResponse};
    use axum::Json;
    use serde::{Serialize, Deserialize};

    use crate::msg::{ticket, Response};
    use crate::{block, engine, store};

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("not found")]
        NotFound,
        #[error("storage: {0}")]
        Store(#[from] store::Error),
        #[error("engine: {0}")]
        Engine(#[from] engine::Error),
    }

    impl IntoResponse for Error {
        fn into_response(self) -> HttpResponse {
            let status = match &self {
                Error::NotFound => StatusCode::NOT_FOUND,
                Error::Store(e) if e.is_not_found() => StatusCode::NOT_FOUND,
                Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                Error::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, self.to_string()).into_response()
        }
    }

    #[derive(Deserialize)]
    pub struct RoundQuery {
        round: i64,
    }

    #[derive(Deserialize)]
    pub struct BlockQuery {
        round: i64,
        hash: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct TxnQuery {
        hash: String,
    }

    #[derive(Serialize, Deserialize)]
    pub struct Health {
        pub id: account::NodeId,
        pub status: engine::Status,
        pub health: Vec<health::Report>,
        pub tiering: Option<tiering::Stats>,
    }

    pub async fn latest_round(extract::State(state): extract::State<Arc<State>>) -> Result<Json<Response>, Error> {
        let round = state.rounds.get(state.engine.current_round()).await?;
        Ok(Json(Response::Round(round)))
    }

    pub async fn round(
        extract::State(state): extract::State<Arc<State>>,
        extract::Query(q): extract::Query<RoundQuery>,
    ) -> Result<Json<Response>, Error> {
        Ok(Json(Response::Round(state.rounds.get(q.round).await?)))
    }

    pub async fn block(
        extract::State(state): extract::State<Arc<State>>,
        extract::Query(q): extract::Query<BlockQuery>,
    ) -> Result<Json<Response>, Error> {
        let hash = match q.hash {
            Some(hash) if block::is_hash(&hash) => hash,
            Some(_) => return Err(Error::NotFound),
            None => state.rounds.block_hash(q.round).await?,
        };
        if let Some(b) = state.cache.block(&hash) {
            return Ok(Json(Response::Block(b.as_ref().clone())));
        }
        Ok(Json(Response::Block(state.blocks.read(&hash, q.round).await?)))
    }

    pub async fn lfb_ticket(extract::State(state): extract::State<Arc<State>>) -> Json<Response> {
        Json(Response::Ticket(ticket::Ticket {
            round: state.engine.current_round(),
            timestamp: chrono::Utc::now().timestamp(),
            sharder: state.id.clone(),
        }))
    }

    pub async fn receive(
        extract::State(state): extract::State<Arc<State>>,
        Json(b): Json<block::Block>,
    ) -> Result<StatusCode, Error> {
        // a full queue answers 503, the round comes back through sync
        state.engine.try_submit(b)?;
        Ok(StatusCode::ACCEPTED)
    }

    pub async fn txn_summary(
        extract::State(state): extract::State<Arc<State>>,
        extract::Query(q): extract::Query<TxnQuery>,
    ) -> Result<Json<Response>, Error> {
        let summary = state.cache.txn_summary(&q.hash).ok_or(Error::NotFound)?;
        Ok(Json(Response::Confirmation(summary)))
    }

    pub async fn health(extract::State(state): extract::State<Arc<State>>) -> Json<Health> {
        Json(Health {
            id: state.id.clone(),
            status: state.engine.status(),
            health: state.reports.snapshot(),
            tiering: state.tiering.as_ref().map(|stats| stats.read().clone()),
        })
    }
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/v1/round/latest", routing::get(handlers::latest_round))
        .route("/v1/round/get", routing::get(handlers::round))
        .route("/v1/block/get", routing::get(handlers::block))
        .route("/v1/lfb_ticket", routing::get(handlers::lfb_ticket))
        .route("/v1/block/receive", routing::post(handlers::receive))
        .route("/v1/transaction/summary", routing::get(handlers::txn_summary))
        .route("/_health", routing::get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the node's routes until the token is cancelled.
pub async fn serve(listener: TcpListener, state: Arc<State>, token: CancellationToken) {
    let addr = listener.local_addr().ok();
    let server = match axum::Server::from_tcp(listener) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "cannot serve on listener");
            return;
        }
    };
    info!(?addr, "serving");
    let shutdown = async move { token.cancelled().await };
    if let Err(e) = server
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "server failed");
    }
    info!("server stopped");
}
