use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::StreamExt;

use crate::state::AppState;

/// Multiplexes a task's log/diff/state/finished frames onto one websocket, replaying history
/// before switching to live frames (`MsgStore::history_plus_stream`). Closes the socket once a
/// `Finished` frame is sent.
pub async fn task_stream(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app, task_id))
}

async fn handle_socket(mut socket: WebSocket, app: AppState, task_id: String) {
    let store = app.state.channel(&task_id).await;
    let mut stream = store.history_plus_stream();

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(_) => break,
        };

        let finished = matches!(msg, utils::channel_msg::ChannelMsg::Finished);
        let payload = match serde_json::to_string(&msg) {
            Ok(payload) => payload,
            Err(_) => continue,
        };

        if socket.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
        if finished {
            break;
        }
    }
}
