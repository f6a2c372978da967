//! In-process transport to a [`Host`] running in the same address space.

use super::{Connector, Transport, TransportEvent};
use crate::error::{Result, SyncError};
use crate::host::Host;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::ConnectionId;
use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use std::sync::Arc;
use tracing::debug;

pub struct LocalTransport {
    host: Arc<Host>,
    connection_id: ConnectionId,
    inbox: Receiver<ServerMessage>,
    closed: bool,
}

impl LocalTransport {
    pub fn connect(host: &Arc<Host>, module: &str, token: Option<&str>) -> Result<Self> {
        if module != host.module_name() {
            return Err(SyncError::UnknownModule(module.to_string()));
        }
        let (outbox, inbox) = unbounded();
        let (connection_id, _) = host.open_session(token, outbox)?;
        Ok(Self {
            host: Arc::clone(host),
            connection_id,
            inbox,
            closed: false,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl Transport for LocalTransport {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        if self.closed {
            return Err(SyncError::NotConnected);
        }
        match message {
            ClientMessage::Disconnect => {
                self.close();
                Ok(())
            }
            message => self.host.handle_message(self.connection_id, message),
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        loop {
            match self.inbox.try_recv() {
                Ok(message) => events.push(TransportEvent::Message(message)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!(target: "tablesync::transport", connection = self.connection_id.0, "host closed session");
                    self.closed = true;
                    events.push(TransportEvent::Closed(Some("session closed by host".into())));
                    break;
                }
            }
        }
        events
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.host.close_session(self.connection_id);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connector for Arc<Host> {
    fn connect(&self, module: &str, token: Option<&str>) -> Result<Box<dyn Transport>> {
        Ok(Box::new(LocalTransport::connect(self, module, token)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    #[test]
    fn test_connect_receives_identity() {
        let host = Host::tank(&HostConfig::default());
        let mut transport = LocalTransport::connect(&host, host.module_name(), None).unwrap();
        let events = transport.poll();
        assert!(matches!(
            events.first(),
            Some(TransportEvent::Message(ServerMessage::IdentityToken { .. }))
        ));
        assert_eq!(host.session_count(), 1);

        transport.close();
        transport.close();
        assert_eq!(host.session_count(), 0);
        assert!(transport.send(ClientMessage::Disconnect).is_err());
    }

    #[test]
    fn test_wrong_module_rejected() {
        let host = Host::tank(&HostConfig::default());
        let result = LocalTransport::connect(&host, "chat", None);
        assert!(matches!(result, Err(SyncError::UnknownModule(_))));
    }

    #[test]
    fn test_host_shutdown_reports_abnormal_close() {
        let host = Host::tank(&HostConfig::default());
        let mut transport = LocalTransport::connect(&host, host.module_name(), None).unwrap();
        host.shutdown();

        let events = transport.poll();
        assert!(matches!(events.last(), Some(TransportEvent::Closed(Some(_)))));
        assert!(transport.poll().is_empty());
    }
}
