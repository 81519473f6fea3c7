//! WebSocket connection management for Huddle Server

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::models::ServerFrame;
use crate::rooms::Delivery;

/// Represents an active WebSocket connection
#[derive(Clone)]
pub struct Connection {
    pub connection_id: String,
    pub device_id: String,
    pub sender: mpsc::UnboundedSender<ServerFrame>,
}

/// Manages all active WebSocket connections
pub struct ConnectionManager {
    /// Map of user_id -> Vec<Connection> (multiple devices per user)
    connections: DashMap<String, Vec<Connection>>,
    /// Map of connection_id -> user_id for quick lookup
    connection_to_user: DashMap<String, String>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            connection_to_user: DashMap::new(),
        }
    }

    /// Register a new connection
    pub fn register(&self, user_id: &str, connection: Connection) {
        self.connection_to_user
            .insert(connection.connection_id.clone(), user_id.to_string());

        tracing::info!(
            "Connection registered: user={}, device={}",
            user_id,
            connection.device_id
        );

        self.connections
            .entry(user_id.to_string())
            .or_default()
            .push(connection);
    }

    /// Unregister a connection. Returns the owning user and whether that was
    /// its last connection.
    pub fn unregister(&self, connection_id: &str) -> Option<(String, bool)> {
        let (_, user_id) = self.connection_to_user.remove(connection_id)?;

        let mut offline = true;
        if let Some(mut connections) = self.connections.get_mut(&user_id) {
            connections.retain(|c| c.connection_id != connection_id);
            offline = connections.is_empty();

            // If no more connections for this user, remove the entry
            if offline {
                drop(connections);
                self.connections.remove(&user_id);
            }
        }

        tracing::info!("Connection unregistered: user={}, offline={}", user_id, offline);
        Some((user_id, offline))
    }

    /// Check if a user is online (has any active connections)
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.connections.get(user_id).map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Get number of online users
    pub fn online_user_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    /// Send a frame to a specific user (all devices)
    pub fn send_to_user(&self, user_id: &str, frame: ServerFrame) {
        if let Some(connections) = self.connections.get(user_id) {
            for conn in connections.iter() {
                if let Err(e) = conn.sender.send(frame.clone()) {
                    tracing::warn!("Failed to send to device {}: {}", conn.device_id, e);
                }
            }
        }
    }

    /// Push relay events to their recipients. Offline recipients are skipped.
    pub fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            tracing::debug!("-> {} {:?}", delivery.user_id, delivery.event);
            self.send_to_user(
                &delivery.user_id,
                ServerFrame::Event {
                    event: delivery.event,
                },
            );
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerEvent;

    fn connection(id: &str) -> (Connection, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            connection_id: id.to_string(),
            device_id: format!("device-{}", id),
            sender: tx,
        };
        (conn, rx)
    }

    #[test]
    fn test_connection_management() {
        let manager = ConnectionManager::new();

        // Register connection
        let (conn1, _rx1) = connection("c1");
        manager.register("user1", conn1);
        assert!(manager.is_user_online("user1"));
        assert!(!manager.is_user_online("user2"));

        // Register another device for same user
        let (conn2, _rx2) = connection("c2");
        manager.register("user1", conn2);
        assert_eq!(manager.connection_count("user1"), 2);
        assert_eq!(manager.online_user_count(), 1);

        // Unregister one device
        assert_eq!(manager.unregister("c1"), Some(("user1".to_string(), false)));
        assert!(manager.is_user_online("user1"));

        // Unregister last device
        assert_eq!(manager.unregister("c2"), Some(("user1".to_string(), true)));
        assert!(!manager.is_user_online("user1"));
        assert_eq!(manager.unregister("c2"), None);
    }

    #[test]
    fn test_deliver_reaches_every_device() {
        let manager = ConnectionManager::new();
        let (conn1, mut rx1) = connection("c1");
        let (conn2, mut rx2) = connection("c2");
        manager.register("bob", conn1);
        manager.register("bob", conn2);

        let event = ServerEvent::Cancelled {
            room_id: "r1".to_string(),
        };
        manager.deliver(vec![
            Delivery {
                user_id: "bob".to_string(),
                event: event.clone(),
            },
            Delivery {
                user_id: "nobody".to_string(),
                event: event.clone(),
            },
        ]);

        let expected = ServerFrame::Event { event };
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
        assert!(rx1.try_recv().is_err());
    }
}
