use crate::TransportError;
use knita_protocol::{
    CloseRequest, ExecEvent, ExecRequest, OpenRequest, OpenResponse, ProtocolError,
    TransferRequest,
};

/// The exec response: events in the order the control plane sent them.
pub type EventStream = Box<dyn Iterator<Item = Result<ExecEvent, ProtocolError>>>;

/// The RPC surface of a control plane.
///
/// Every call blocks until the control plane answers. Implementations do not
/// retry and report failures unmodified.
pub trait ControlPlane: Send + Sync {
    fn open(&self, request: &OpenRequest) -> Result<OpenResponse, TransportError>;

    /// Start a command. Returns once the response stream is established; the
    /// events are then pulled from the returned iterator.
    fn exec(&self, request: &ExecRequest) -> Result<EventStream, TransportError>;

    fn import(&self, request: &TransferRequest) -> Result<(), TransportError>;

    fn export(&self, request: &TransferRequest) -> Result<(), TransportError>;

    fn close(&self, request: &CloseRequest) -> Result<(), TransportError>;
}
