use std::collections::HashMap;

use uuid::Uuid;

/// Who is online right now.
///
/// A user stays present while at least one of their connections is open, so
/// membership is counted per connection rather than per user.
#[derive(Debug, Default)]
pub struct Presence {
    connections: HashMap<Uuid, usize>,
    /// First-connect order of the users currently present
    order: Vec<Uuid>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection. Returns true if the user just came online.
    pub fn connect(&mut self, user_id: Uuid) -> bool {
        let count = self.connections.entry(user_id).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.order.push(user_id);
            true
        } else {
            false
        }
    }

    /// Drop one connection. Returns true if the user just went offline.
    /// Unknown users are ignored.
    pub fn disconnect(&mut self, user_id: Uuid) -> bool {
        let Some(count) = self.connections.get_mut(&user_id) else {
            return false;
        };

        *count -= 1;
        if *count > 0 {
            return false;
        }

        self.connections.remove(&user_id);
        self.order.retain(|id| *id != user_id);
        true
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn snapshot(&self) -> Vec<Uuid> {
        self.order.clone()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_disconnect_counts() {
        let mut presence = Presence::new();
        let user = Uuid::new_v4();

        assert!(presence.connect(user));
        assert!(!presence.connect(user));
        assert!(!presence.connect(user));

        assert!(!presence.disconnect(user));
        assert!(presence.is_online(user));
        assert!(!presence.disconnect(user));
        assert!(presence.is_online(user));

        assert!(presence.disconnect(user));
        assert!(!presence.is_online(user));
        assert!(presence.snapshot().is_empty());
    }

    #[test]
    fn test_unknown_disconnect_is_ignored() {
        let mut presence = Presence::new();
        assert!(!presence.disconnect(Uuid::new_v4()));
        assert!(presence.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_keeps_first_connect_order() {
        let mut presence = Presence::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        presence.connect(a);
        presence.connect(b);
        presence.connect(a);
        presence.connect(c);
        assert_eq!(presence.snapshot(), vec![a, b, c]);

        presence.disconnect(b);
        assert_eq!(presence.snapshot(), vec![a, c]);

        presence.clear();
        assert!(!presence.is_online(a));
    }
}
