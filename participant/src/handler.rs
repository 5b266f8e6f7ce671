//! Request handling for incoming coordinator lines.

use std::sync::Arc;

use bankcoord_protocol::{BranchReply, BranchRequest, Reply};

use crate::ledger::Ledger;

/// Turns one coordinator request into one reply.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request.
    async fn handle(&self, request: BranchRequest) -> BranchReply;
}

/// Handler backed by a [`Ledger`].
pub struct LedgerHandler {
    ledger: Arc<Ledger>,
}

impl LedgerHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
}

#[async_trait::async_trait]
impl RequestHandler for LedgerHandler {
    async fn handle(&self, request: BranchRequest) -> BranchReply {
        let reply = self.ledger.apply(&request);
        tracing::debug!(request = %request, reply = %reply, "Request handled");
        BranchReply::new(request.txn_id, reply)
    }
}

/// Handler that forwards requests to a callback. Useful for scripted
/// branches in tests.
pub struct CallbackHandler {
    callback: Box<dyn Fn(&BranchRequest) -> Reply + Send + Sync>,
}

impl CallbackHandler {
    /// Create a new callback handler.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&BranchRequest) -> Reply + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for CallbackHandler {
    async fn handle(&self, request: BranchRequest) -> BranchReply {
        let reply = (self.callback)(&request);
        BranchReply::new(request.txn_id, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bankcoord_protocol::BranchCommand;

    #[test]
    fn test_ledger_handler_keeps_txn_id() {
        let handler = LedgerHandler::new(Arc::new(Ledger::new()));
        let request: BranchRequest = "c-1 DEPOSIT A.x 3".parse().unwrap();
        let reply = tokio_test::block_on(handler.handle(request));
        assert_eq!(reply.to_string(), "c-1 OK");
    }

    #[test]
    fn test_callback_handler() {
        let handler = CallbackHandler::new(|request| match request.command {
            BranchCommand::Commit => Reply::Aborted,
            _ => Reply::Ok,
        });
        let request: BranchRequest = "c-2 COMMIT".parse().unwrap();
        let reply = tokio_test::block_on(handler.handle(request));
        assert_eq!(reply.to_string(), "c-2 ABORTED");
    }
}
