//! Collaborators provided by the host stack.

use crate::att::{Handle, HandleRange, Req, SrvRsp};
use crate::le::{Addr, Link};
use crate::Uuid;

use super::*;

/// ATT bearer. Turns parsed PDU fields into wire PDUs and owns link
/// establishment. Methods are called from the engine task and must not block.
pub trait Bearer: Send {
    /// Sends a client request or command.
    fn send_req(&mut self, link: Link, req: &Req) -> Result<()>;

    /// Sends a server response.
    fn send_rsp(&mut self, link: Link, rsp: &SrvRsp) -> Result<()>;

    /// Sends `ATT_HANDLE_VALUE_NTF`.
    fn send_ntf(&mut self, link: Link, hdl: Handle, val: &[u8]) -> Result<()>;

    /// Sends `ATT_HANDLE_VALUE_IND`.
    fn send_ind(&mut self, link: Link, hdl: Handle, val: &[u8]) -> Result<()>;

    /// Sends `ATT_HANDLE_VALUE_CFM`.
    fn send_cfm(&mut self, link: Link) -> Result<()>;

    /// Initiates a direct connection.
    fn connect(&mut self, link: Link) -> Result<()> {
        let _ = link;
        Ok(())
    }

    /// Cancels a pending direct connection.
    fn cancel_connect(&mut self, link: Link) -> Result<()> {
        let _ = link;
        Ok(())
    }

    /// Terminates a connected link.
    fn disconnect(&mut self, link: Link, reason: Reason) -> Result<()> {
        let _ = (link, reason);
        Ok(())
    }

    /// Adds or removes a peer from the controller's background connection
    /// list.
    fn background_connect(&mut self, peer: Addr, enable: bool) -> Result<()> {
        let _ = (peer, enable);
        Ok(())
    }
}

/// Result of a security admission check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecCheck {
    /// The link already satisfies the requirements.
    Granted,
    /// A security procedure was started. Its outcome is reported via
    /// [`Gatt::on_security_complete`].
    Pending,
    /// The link cannot be secured.
    Denied,
}

/// Security admission for client operations.
pub trait Security: Send {
    /// Starts the security check for a client operation on `conn`.
    fn check(&mut self, conn: ConnId, link: Link) -> SecCheck;
}

/// Service Discovery Protocol publisher for services that are reachable over
/// BR/EDR.
pub trait Sdp: Send {
    /// Publishes a record for a primary service and returns its handle.
    fn create_record(&mut self, svc: Uuid, range: HandleRange) -> Option<u32>;

    /// Deletes a previously published record.
    fn delete_record(&mut self, rec: u32);
}

/// Service-changed client update kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SrvChgCmd {
    Add,
    Update,
    Remove,
}

/// Peer that subscribed to Service Changed indications and whether an
/// indication is owed to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SrvChgClient {
    pub peer: Addr,
    pub pending: bool,
}

/// Persistent storage of handle assignments and service-changed clients.
pub trait Store: Send {
    /// Records the addition or removal of an application service range.
    fn handle_range_changed(&mut self, added: bool, r: &ServiceRange);

    /// Records a change to the service-changed client list.
    fn srv_chg_client_updated(&mut self, cmd: SrvChgCmd, c: &SrvChgClient);

    /// Returns the service-changed clients saved by a previous instance.
    fn load_srv_chg_clients(&mut self) -> Vec<SrvChgClient> {
        Vec::new()
    }
}
