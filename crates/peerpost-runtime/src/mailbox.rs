//! Per-contact mailboxes
//!
//! Every contact has a bounded inbound mailbox (messages the application has not
//! consumed yet) and a bounded outbound mailbox (messages waiting for that
//! contact's stream writer). Offers never block: when a mailbox is full the new
//! message is dropped and the caller is told so.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use peerpost_core::{Message, PublicKeyHex};

// ----------------------------------------------------------------------------
// Mailbox
// ----------------------------------------------------------------------------

/// Bounded, non-blocking message queue for one contact and direction
#[derive(Debug, Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    receiver: MailboxReceiver,
}

/// Why an offer was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    Full,
    Closed,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: MailboxReceiver {
                inner: Arc::new(Mutex::new(receiver)),
            },
        }
    }

    /// Enqueue without waiting; a full mailbox drops `message`
    pub fn offer(&self, message: Message) -> Result<(), OfferError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OfferError::Full,
            mpsc::error::TrySendError::Closed(_) => OfferError::Closed,
        })
    }

    pub fn receiver(&self) -> MailboxReceiver {
        self.receiver.clone()
    }
}

/// Shared receiving end of a [`Mailbox`]
///
/// `recv` yields `None` once every sender is gone, which is how readers and
/// writers learn that a reload discarded their mailbox.
#[derive(Debug, Clone)]
pub struct MailboxReceiver {
    inner: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl MailboxReceiver {
    pub async fn recv(&self) -> Option<Message> {
        self.inner.lock().await.recv().await
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.inner.try_lock().ok()?.try_recv().ok()
    }
}

// ----------------------------------------------------------------------------
// Mailbox Registry
// ----------------------------------------------------------------------------

/// Inbound and outbound mailboxes of every contact, created on first use
#[derive(Debug)]
pub struct Mailboxes {
    inbound: DashMap<PublicKeyHex, Mailbox>,
    outbound: DashMap<PublicKeyHex, Mailbox>,
    inbound_capacity: usize,
    outbound_capacity: usize,
}

impl Mailboxes {
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        Self {
            inbound: DashMap::new(),
            outbound: DashMap::new(),
            inbound_capacity,
            outbound_capacity,
        }
    }

    pub fn inbound(&self, contact: &PublicKeyHex) -> Mailbox {
        self.inbound
            .entry(contact.clone())
            .or_insert_with(|| Mailbox::new(self.inbound_capacity))
            .clone()
    }

    pub fn outbound(&self, contact: &PublicKeyHex) -> Mailbox {
        self.outbound
            .entry(contact.clone())
            .or_insert_with(|| Mailbox::new(self.outbound_capacity))
            .clone()
    }

    /// Forget every mailbox; queued messages are discarded
    pub fn clear(&self) {
        self.inbound.clear();
        self.outbound.clear();
    }

    pub fn len(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpost_core::Timestamp;

    fn message(text: &str) -> Message {
        Message::new(
            PublicKeyHex::from_bytes(&[1; 32]),
            PublicKeyHex::from_bytes(&[2; 32]),
            text,
            Timestamp::new(1),
        )
    }

    #[test]
    fn test_full_mailbox_drops_newest() {
        let mailbox = Mailbox::new(2);
        assert!(mailbox.offer(message("a")).is_ok());
        assert!(mailbox.offer(message("b")).is_ok());
        assert_eq!(mailbox.offer(message("c")), Err(OfferError::Full));

        let receiver = mailbox.receiver();
        assert_eq!(receiver.try_recv().unwrap().text, "a");
        assert_eq!(receiver.try_recv().unwrap().text, "b");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_clear_closes_receivers() {
        let mailboxes = Mailboxes::new(10, 10);
        let contact = PublicKeyHex::from_bytes(&[2; 32]);
        let receiver = mailboxes.outbound(&contact).receiver();
        mailboxes.outbound(&contact).offer(message("queued")).unwrap();
        assert_eq!(mailboxes.len(), 1);

        mailboxes.clear();
        assert!(mailboxes.is_empty());
        assert_eq!(receiver.recv().await.unwrap().text, "queued");
        assert!(receiver.recv().await.is_none());
    }
}
