//! Bridges one websocket to one terminal tab.
//!
//! Binary frames from the tab carry raw pty output; JSON text frames carry
//! state changes and errors. From the client, binary frames are raw input
//! and text frames are control envelopes only, so a paste that happens to
//! look like a control message is never acted on.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use warp::ws::{Message, WebSocket};

use super::types::{parse_client_frame, terminal_error, ServerFrame};
use crate::error_handling::types::TerminalError;
use crate::session_management::{TabCommand, TabEvent, TabSpec, TerminalManager};

fn frame(server_frame: &ServerFrame) -> Message {
    match serde_json::to_string(server_frame) {
        Ok(text) => Message::text(text),
        Err(e) => {
            warn!("Failed to encode terminal frame: {}", e);
            Message::text(r#"{"type":"error","message":"frame encoding failed"}"#)
        }
    }
}

fn event_message(event: TabEvent) -> Message {
    match event {
        TabEvent::Output(data) => Message::binary(data),
        TabEvent::State { session_id, state } => frame(&ServerFrame::Status { state, session_id }),
        TabEvent::Error(message) => frame(&ServerFrame::Error { message }),
    }
}

fn client_command(msg: &Message) -> Option<TabCommand> {
    if let Ok(text) = msg.to_str() {
        let command = parse_client_frame(text);
        if command.is_none() {
            debug!("Ignoring text frame that is not a control envelope");
        }
        command
    } else if msg.is_binary() {
        Some(TabCommand::Input(msg.as_bytes().to_vec()))
    } else {
        None
    }
}

pub async fn bridge(socket: WebSocket, terminals: Arc<TerminalManager>, client: String, spec: TabSpec) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let channel = match terminals.open_tab(&client, spec).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Refused terminal for {}: {}", client, e);
            let (_, body) = terminal_error(&e);
            let message = body.message;
            let _ = ws_tx.send(frame(&ServerFrame::Error { message })).await;
            let _ = ws_tx.close().await;
            return;
        }
    };
    let id = channel.id;
    let commands = channel.commands;
    let mut events = channel.events;

    let outbound = async move {
        while let Some(event) = events.recv().await {
            if ws_tx.send(event_message(event)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    };
    let inbound = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if msg.is_close() {
                break;
            }
            let Some(command) = client_command(&msg) else {
                continue;
            };
            if commands.send(command).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = outbound => debug!("[{}] Tab closed, ending socket", id),
        _ = inbound => debug!("[{}] Client {} went away", id, client),
    }
    match terminals.close_tab(id).await {
        Ok(()) | Err(TerminalError::NotFound) => {}
        Err(e) => warn!("[{}] Failed to close tab: {}", id, e),
    }
    info!("[{}] Terminal socket finished", id);
}

#[cfg(test)]
mod tests {
    use super::super::routes::api;
    use crate::context::test_support::test_context;
    use serde_json::Value;
    use std::sync::Arc;

    async fn next_json(client: &mut warp::test::WsClient) -> Value {
        let msg = client.recv().await.unwrap();
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_terminal_echo_and_limit() {
        let (_dir, ctx) = test_context().await;
        let ctx = Arc::new(ctx);
        let filter = api(ctx.clone());

        let mut first = warp::test::ws()
            .path("/terminal?shell=sh&cols=100&rows=40")
            .handshake(filter.clone())
            .await
            .unwrap();
        assert_eq!(next_json(&mut first).await["state"], "connecting");
        let connected = next_json(&mut first).await;
        assert_eq!(connected["type"], "status");
        assert_eq!(connected["state"], "connected");
        assert!(connected["sessionId"].is_string());

        first.send_text(r#"{"type":"input","data":"whoami\r"}"#).await;
        let echoed = first.recv().await.unwrap();
        assert!(echoed.is_binary());
        assert_eq!(echoed.as_bytes(), b"whoami\r");

        let mut second = warp::test::ws()
            .path("/terminal")
            .handshake(filter.clone())
            .await
            .unwrap();
        next_json(&mut second).await;
        assert_eq!(next_json(&mut second).await["state"], "connected");
        assert_eq!(ctx.terminals.list_tabs().len(), 2);

        let mut third = warp::test::ws()
            .path("/terminal")
            .handshake(filter.clone())
            .await
            .unwrap();
        let refused = next_json(&mut third).await;
        assert_eq!(refused["type"], "error");
        assert_eq!(refused["message"], "Terminal tab limit reached");
        assert_eq!(ctx.terminals.list_tabs().len(), 2);
    }

    #[tokio::test]
    async fn test_pasted_control_json_stays_input() {
        let (_dir, ctx) = test_context().await;
        let ctx = Arc::new(ctx);
        let mut client = warp::test::ws()
            .path("/terminal?shell=sh&cols=80&rows=24")
            .handshake(api(ctx.clone()))
            .await
            .unwrap();
        next_json(&mut client).await;
        assert_eq!(next_json(&mut client).await["state"], "connected");

        let paste = br#"{"type":"resize","cols":1,"rows":1}"#;
        client.send(warp::ws::Message::binary(paste.to_vec())).await;
        let echoed = client.recv().await.unwrap();
        assert!(echoed.is_binary());
        assert_eq!(echoed.as_bytes(), paste);

        client.send_text("plain text").await;
        client.send_text(r#"{"type":"input","data":"ok"}"#).await;
        let echoed = client.recv().await.unwrap();
        assert_eq!(echoed.as_bytes(), b"ok");

        let tabs = ctx.terminals.list_tabs();
        assert_eq!(tabs.len(), 1);
        assert_eq!((tabs[0].cols, tabs[0].rows), (80, 24));
    }

    #[tokio::test]
    async fn test_disallowed_shell_is_refused() {
        let (_dir, ctx) = test_context().await;
        let mut client = warp::test::ws()
            .path("/terminal?shell=zsh")
            .handshake(api(Arc::new(ctx)))
            .await
            .unwrap();
        let refused = next_json(&mut client).await;
        assert_eq!(refused["type"], "error");
        assert_eq!(refused["message"], "Shell not allowed: zsh");
    }
}
