use std::sync::Arc;

use serde_json::Value;
use socketioxide::extract::{AckSender, Data, SocketRef, State};

use crate::broadcast::spawn_forwarder;
use crate::error::{ErrorAck, SignalError};
use crate::ids::ConnectionId;
use crate::session::ConnectionHandle;
use crate::signaling::Request;
use crate::AppState;

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// Synchronous on purpose: the connection must be registered and its event
/// handlers installed before the client's first event can arrive.
pub fn on_connect(socket: SocketRef, state: State<Arc<AppState>>) {
    let connection_id = ConnectionId::new(socket.id.to_string());

    let handle = match state.supervisor.accept(connection_id.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(sid = %socket.id, error = %e, "connection rejected");
            let _ = socket.emit("error", &e.payload());
            socket.disconnect().ok();
            return;
        }
    };

    socket.extensions.insert(handle.clone());

    for event in Request::EVENTS {
        socket.on(
            event,
            move |socket: SocketRef, Data(payload): Data<Value>, ack: AckSender| {
                dispatch(&socket, event, payload, ack);
            },
        );
    }
    socket.on_disconnect(on_disconnect);

    // push session-wide notifications onto this socket
    let push_socket = socket.clone();
    spawn_forwarder(
        handle.notifications(),
        handle.cancellation(),
        connection_id.clone(),
        move |notification| {
            if let Err(e) = push_socket.emit(notification.event_name(), notification) {
                tracing::debug!(sid = %push_socket.id, error = %e, "notification push failed");
            }
        },
    );

    tracing::info!(connection_id = %connection_id, "socket connected");
}

// ---------------------------------------------------------------------------
// Request dispatch
// ---------------------------------------------------------------------------

/// Parse and enqueue synchronously so same-connection requests keep their
/// arrival order; only the wait for the reply runs on a task.
fn dispatch(socket: &SocketRef, event: &'static str, payload: Value, ack: AckSender) {
    let Some(handle) = get_handle(socket) else {
        return;
    };

    let request = match Request::parse(event, payload) {
        Ok(request) => request,
        Err(e) => {
            reply_error(socket, ack, &e);
            return;
        }
    };

    let pending = handle.submit(request);
    let socket = socket.clone();
    tokio::spawn(async move {
        let result = pending
            .await
            .unwrap_or_else(|_| Err(SignalError::UnknownConnection(handle.id().clone())));

        match result {
            Ok(response) => {
                if let Err(e) = ack.send(&response) {
                    tracing::debug!(sid = %socket.id, event, error = %e, "ack not delivered");
                }
            }
            // nobody left to answer
            Err(SignalError::UnknownConnection(_)) => {}
            Err(e) => reply_error(&socket, ack, &e),
        }
    });
}

/// Failed requests are answered on the ack and mirrored as an `error` push,
/// since the server cannot tell whether the client asked for an ack.
fn reply_error(socket: &SocketRef, ack: AckSender, err: &SignalError) {
    let _ = ack.send(&ErrorAck::from(err));
    let _ = socket.emit("error", &err.payload());
}

// ---------------------------------------------------------------------------
// Disconnect handler
// ---------------------------------------------------------------------------

async fn on_disconnect(socket: SocketRef, state: State<Arc<AppState>>) {
    let Some(handle) = get_handle(&socket) else {
        return;
    };

    tracing::info!(connection_id = %handle.id(), "socket disconnected");
    state.supervisor.disconnect(&handle).await;
}

fn get_handle(socket: &SocketRef) -> Option<ConnectionHandle> {
    socket.extensions.get::<ConnectionHandle>()
}
