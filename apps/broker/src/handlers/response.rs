//! ResponseHandler - Processes frames sent by the agent
//!
//! Decodes each inbound frame and hands HTTP responses to the ingress request
//! waiting on the same request ID. Malformed payloads are dropped and logged;
//! they never end the connection.

use tracing::{debug, warn};
use tunnel_common::protocol::{Frame, HttpResponse, Message};

use crate::store::{Delivery, Session};

/// Handler for a single frame received from the agent
pub fn handle_response(session: &Session, frame: Frame) {
    let kind = frame.kind;

    match Message::try_from(frame) {
        Ok(Message::HttpResponse {
            request_id,
            response,
        }) => handle_http_response(session, &request_id, response),
        Ok(other) => {
            warn!(
                session_id = %session.session_id,
                kind = ?other.kind(),
                "Unexpected frame from agent, dropping"
            );
        }
        Err(e) => {
            warn!(
                session_id = %session.session_id,
                ?kind,
                error = %e,
                "Dropping malformed frame from agent"
            );
        }
    }
}

fn handle_http_response(session: &Session, request_id: &str, response: HttpResponse) {
    let status = response.status_code;

    match session.complete_request(request_id, response) {
        Delivery::Delivered => {
            debug!(
                session_id = %session.session_id,
                request_id,
                status,
                "Received HTTP response from agent"
            );
        }
        Delivery::Unknown => {
            debug!(
                session_id = %session.session_id,
                request_id,
                "Discarding response with no pending request (late or duplicate)"
            );
        }
        Delivery::Abandoned => {
            debug!(
                session_id = %session.session_id,
                request_id,
                "Discarding response: caller already gone"
            );
        }
    }
}
