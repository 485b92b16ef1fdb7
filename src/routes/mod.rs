use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{http, socket, Gateway};

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/polls", post(http::create_poll))
        .route("/polls/join", post(http::join_poll))
        .route("/polls/rejoin", post(http::rejoin_poll))
        .route("/polls/socket", get(socket::poll_socket))
        .with_state(gateway)
}
