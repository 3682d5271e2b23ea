//! Single-use tickets bridging HTTP-authenticated identity to the
//! anonymous socket upgrade.
//!
//! A ticket is bound to the requesting client IP, expires after a short
//! TTL, and is consumed by its first successful validation. Either
//! transition (used, expired) removes it from the store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use confab_session::UserId;
use rand::rngs::OsRng;
use rand::RngCore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// 256 bits of CSPRNG output, base64url-encoded.
const TICKET_ID_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub ticket_id: String,
    pub user_id: UserId,
    pub client_ip: IpAddr,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl Ticket {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Seconds until expiry, clamped at zero.
    pub fn expires_in(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

/// In-memory ticket store. One instance per process.
pub struct TicketStore {
    tickets: Mutex<HashMap<String, Ticket>>,
    ttl: chrono::Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300)),
        }
    }

    /// Mint a ticket for `user_id`, bound to `client_ip`. Sweeps expired
    /// tickets while it holds the lock anyway.
    pub fn generate(&self, user_id: UserId, client_ip: IpAddr, now: DateTime<Utc>) -> Ticket {
        let mut bytes = [0u8; TICKET_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let ticket_id = URL_SAFE_NO_PAD.encode(bytes);

        let ticket = Ticket {
            ticket_id: ticket_id.clone(),
            user_id,
            client_ip,
            created_at: now,
            expires_at: now + self.ttl,
            used: false,
        };

        let mut tickets = self.tickets.lock().expect("ticket store mutex poisoned");
        tickets.retain(|_, t| !t.is_expired(now));
        tickets.insert(ticket_id, ticket.clone());

        ticket
    }

    /// Consume a ticket.
    ///
    /// Returns the ticket iff it exists, is unused, unexpired, and bound to
    /// `client_ip`; the ticket leaves the store on success. Unknown, used,
    /// or expired tickets are removed and yield `None`. An IP mismatch
    /// yields `None` but keeps the ticket: the mismatch may be a spoof
    /// attempt and the real client can still retry.
    pub fn validate(
        &self,
        ticket_id: &str,
        client_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Option<Ticket> {
        let mut tickets = self.tickets.lock().expect("ticket store mutex poisoned");

        let ticket = match tickets.get(ticket_id) {
            Some(ticket) => ticket,
            None => return None,
        };

        if ticket.used || ticket.is_expired(now) {
            tickets.remove(ticket_id);
            return None;
        }

        if ticket.client_ip != client_ip {
            tracing::warn!(expected = %ticket.client_ip, got = %client_ip, "ticket IP mismatch");
            return None;
        }

        let mut ticket = tickets
            .remove(ticket_id)
            .expect("ticket present under lock");
        ticket.used = true;
        Some(ticket)
    }

    /// Idempotent removal.
    pub fn purge(&self, ticket_id: &str) {
        self.tickets
            .lock()
            .expect("ticket store mutex poisoned")
            .remove(ticket_id);
    }

    /// Unexpired, unused tickets remaining. Sweeps expired entries.
    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        let mut tickets = self.tickets.lock().expect("ticket store mutex poisoned");
        tickets.retain(|_, t| !t.is_expired(now));
        tickets.values().filter(|t| !t.used).count()
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_generated_ids_are_long_and_unique() {
        let store = TicketStore::default();
        let now = Utc::now();
        let a = store.generate(UserId::generate(), ip("10.0.0.1"), now);
        let b = store.generate(UserId::generate(), ip("10.0.0.1"), now);
        // 32 bytes base64url without padding.
        assert_eq!(a.ticket_id.len(), 43);
        assert_ne!(a.ticket_id, b.ticket_id);
        assert_eq!(a.expires_in(now), 300);
    }

    #[test]
    fn test_single_use() {
        let store = TicketStore::default();
        let now = Utc::now();
        let user = UserId::generate();
        let ticket = store.generate(user, ip("10.0.0.1"), now);

        let first = store.validate(&ticket.ticket_id, ip("10.0.0.1"), now);
        let second = store.validate(&ticket.ticket_id, ip("10.0.0.1"), now);

        let first = first.expect("first validation succeeds");
        assert!(first.used);
        assert_eq!(first.user_id, user);
        assert!(second.is_none());
    }

    #[test]
    fn test_ip_mismatch_rejects_but_allows_retry() {
        let store = TicketStore::default();
        let now = Utc::now();
        let ticket = store.generate(UserId::generate(), ip("10.0.0.1"), now);

        assert!(store
            .validate(&ticket.ticket_id, ip("10.0.0.2"), now)
            .is_none());
        // Ticket survives the spoof attempt; the real client still wins.
        assert!(store
            .validate(&ticket.ticket_id, ip("10.0.0.1"), now)
            .is_some());
    }

    #[test]
    fn test_expired_ticket_rejected_and_removed() {
        let store = TicketStore::new(Duration::from_secs(60));
        let now = Utc::now();
        let ticket = store.generate(UserId::generate(), ip("10.0.0.1"), now);

        let later = now + chrono::Duration::seconds(61);
        assert!(store
            .validate(&ticket.ticket_id, ip("10.0.0.1"), later)
            .is_none());
        // Removed on the expiry transition: valid-looking retry also fails.
        assert!(store
            .validate(&ticket.ticket_id, ip("10.0.0.1"), now)
            .is_none());
    }

    #[test]
    fn test_unknown_ticket_rejected() {
        let store = TicketStore::default();
        assert!(store
            .validate("not-a-ticket", ip("10.0.0.1"), Utc::now())
            .is_none());
    }

    #[test]
    fn test_purge_is_idempotent() {
        let store = TicketStore::default();
        let now = Utc::now();
        let ticket = store.generate(UserId::generate(), ip("10.0.0.1"), now);

        store.purge(&ticket.ticket_id);
        store.purge(&ticket.ticket_id);
        assert!(store
            .validate(&ticket.ticket_id, ip("10.0.0.1"), now)
            .is_none());
    }

    #[test]
    fn test_active_count_sweeps_expired() {
        let store = TicketStore::new(Duration::from_secs(60));
        let now = Utc::now();
        store.generate(UserId::generate(), ip("10.0.0.1"), now);
        store.generate(UserId::generate(), ip("10.0.0.2"), now);
        assert_eq!(store.active_count(now), 2);

        let later = now + chrono::Duration::seconds(120);
        assert_eq!(store.active_count(later), 0);
    }
}
