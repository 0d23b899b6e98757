//! Routes messages to handlers by message type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::handler::{Handler, HandlerError, HandlerResult, Message};

#[derive(Default, Clone)]
pub struct HandlerRouter {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, message_type: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl Handler for HandlerRouter {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let message_type = message.envelope.message_type.as_str();
        match self.handlers.get(message_type) {
            Some(handler) => handler.handle(message).await,
            None => Err(HandlerError::validation(format!(
                "no handler registered for message type {}",
                message_type
            ))),
        }
    }
}
