//! Echo handler used by the demo binary.
//!
//! Writes every inbound byte back to the peer. Stops when the peer finishes
//! sending, when the connection is asked to close, or when either pipe fails.

use std::sync::Arc;

use crate::net::{Connection, ConnectionHandler};
use crate::pipe::ApplicationPipe;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    async fn on_connection(&self, connection: Arc<Connection>, pipe: ApplicationPipe) {
        let ApplicationPipe {
            mut input,
            mut output,
        } = pipe;
        let closing = connection.closing();
        tokio::pin!(closing);

        loop {
            let read = tokio::select! {
                _ = &mut closing => break,
                read = input.read() => read,
            };
            let Ok(read) = read else { break };

            let data = read.buffer.to_vec();
            let completed = read.is_completed;
            drop(read);

            if input.advance(data.len()).is_err() {
                break;
            }
            match output.write(&data).await {
                Ok(flush) if !flush.is_completed => {}
                _ => break,
            }
            if completed {
                break;
            }
        }

        tracing::trace!(connection_id = %connection.id(), "Echo finished");
        output.complete();
    }
}
