//! Host capabilities registered on the dispatcher at startup.

pub mod exec_check;
pub mod send_message;
pub mod taint;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

pub use exec_check::ExecCheckHandler;
pub use send_message::{OutboundMessage, SendMessageHandler};
pub use taint::TaintReportHandler;

use super::dispatcher::Dispatcher;
use crate::security::SecurityGate;

pub fn register_builtin(
    dispatcher: &mut Dispatcher,
    gate: Arc<SecurityGate>,
    workspaces: HashSet<String>,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
) {
    dispatcher.register_handler(exec_check::REQUEST_TYPE, Arc::new(ExecCheckHandler::new(gate)));
    dispatcher.register_handler(taint::REQUEST_TYPE, Arc::new(TaintReportHandler));
    dispatcher.register_handler(
        send_message::REQUEST_TYPE,
        Arc::new(SendMessageHandler::new(workspaces, outbox)),
    );
}
