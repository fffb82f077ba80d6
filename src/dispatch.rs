//! Maps decoded requests onto allocator calls and allocator outcomes onto
//! response messages.

use crate::allocator::{DockAllocator, DockError};
use crate::ledger::LedgerStore;
use crate::protocol::{weight_as_f64, Frame, Message, ProtocolError, Status, NO_DOCK, NO_FEE};
use std::sync::Arc;
use tracing::error;

/// Wire status for an allocator failure. Store details stay server-side.
pub fn status_for(err: &DockError) -> Status {
    match err {
        DockError::NotFound(_) => Status::NotFound,
        DockError::Overweight { .. } => Status::Overweight,
        DockError::Occupied(_) => Status::Occupied,
        DockError::NotDocked(_) => Status::NotDocked,
        DockError::Store(_) => Status::StoreFailure,
    }
}

pub struct Dispatcher<S> {
    allocator: Arc<DockAllocator<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            allocator: Arc::clone(&self.allocator),
        }
    }
}

impl<S: LedgerStore> Dispatcher<S> {
    pub fn new(allocator: Arc<DockAllocator<S>>) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &DockAllocator<S> {
        &self.allocator
    }

    /// Answers one request frame. The response echoes the request's sequence
    /// number and carries the server-side `session` id.
    pub fn handle(&self, request: &Frame, session: u32) -> Result<Frame, ProtocolError> {
        let response = self.dispatch(&request.message)?;
        Ok(Frame::new(request.sequence, session, response))
    }

    /// Fails only for messages a client must not send (response types).
    pub fn dispatch(&self, request: &Message) -> Result<Message, ProtocolError> {
        let response = match *request {
            Message::DockQuery { weight } => {
                let dock_id = match self.allocator.find_free_dock(weight_as_f64(weight)) {
                    Ok(found) => found.unwrap_or(NO_DOCK),
                    Err(e) => {
                        log_failure("dock query", &e);
                        NO_DOCK
                    }
                };
                Message::DockQueryResponse { dock_id }
            }
            Message::DockRequest {
                dock_id,
                weight,
                license,
            } => {
                let status = match self.allocator.dock(dock_id, weight_as_f64(weight), &license) {
                    Ok(_) => Status::Ok,
                    Err(e) => {
                        log_failure("dock", &e);
                        status_for(&e)
                    }
                };
                Message::DockResponse { status }
            }
            Message::UndockRequest { dock_id } => match self.allocator.undock(dock_id) {
                Ok(undocking) => Message::UndockResponse {
                    status: Status::Ok,
                    fee: undocking.fee,
                },
                Err(e) => {
                    log_failure("undock", &e);
                    Message::UndockResponse {
                        status: status_for(&e),
                        fee: NO_FEE,
                    }
                }
            },
            Message::FeeQuery { dock_id } => match self.allocator.fee_for(dock_id) {
                Ok(fee) => Message::FeeResponse {
                    status: Status::Ok,
                    fee,
                },
                Err(e) => {
                    log_failure("fee query", &e);
                    Message::FeeResponse {
                        status: status_for(&e),
                        fee: NO_FEE,
                    }
                }
            },
            Message::DockQueryResponse { .. }
            | Message::DockResponse { .. }
            | Message::UndockResponse { .. }
            | Message::FeeResponse { .. } => {
                return Err(ProtocolError::UnexpectedMessage(request.message_type()));
            }
        };

        Ok(response)
    }
}

fn log_failure(operation: &str, err: &DockError) {
    if let DockError::Store(store_err) = err {
        error!(operation, error = %store_err, "Ledger failure while serving request");
    }
}
