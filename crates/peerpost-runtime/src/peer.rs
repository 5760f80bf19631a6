//! Per-contact stream tasks
//!
//! One authenticated connection carries both directions of a conversation. The
//! reader persists what arrives and answers messages written by the contact with
//! the stored copy, which is how delivery and read state travel back to the
//! author. The writer drains the contact's outbound mailbox.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use peerpost_core::{
    envelope, IdentityKeyPair, Message, PeerId, PeerpostError, PublicKeyHex, Result,
    StorageError, TransportError,
};
use peerpost_store::{RecordStore, SaveOutcome};

use crate::frame::{read_frame, write_frame};
use crate::mailbox::{MailboxReceiver, Mailboxes, OfferError};

/// Everything a stream task needs to know about its conversation
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub store: RecordStore,
    pub identity: Arc<IdentityKeyPair>,
    pub account: PublicKeyHex,
    pub contact: PublicKeyHex,
    pub remote: PeerId,
    pub mailboxes: Arc<Mailboxes>,
    pub max_frame_len: usize,
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

/// Read frames until the stream fails or closes
///
/// Always returns an error describing why the stream ended; a clean close is
/// reported as [`TransportError::StreamClosed`].
pub async fn read_loop<R>(ctx: &StreamContext, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader, ctx.max_frame_len).await? {
            Some(frame) => frame,
            None => {
                return Err(TransportError::StreamClosed {
                    peer_id: ctx.remote.to_string(),
                }
                .into())
            }
        };

        if let Err(e) = handle_frame(ctx, &frame) {
            if e.is_stream_fatal() {
                return Err(e);
            }
            warn!(peer = %ctx.remote.short(), error = %e, "dropping inbound message");
        }
    }
}

fn handle_frame(ctx: &StreamContext, frame: &[u8]) -> Result<()> {
    let mut message = envelope::open(&ctx.identity, frame, &ctx.remote)?;
    if message.counterpart(&ctx.account)? != &ctx.contact {
        return Err(PeerpostError::identity_mismatch(
            ctx.contact.as_str(),
            message.counterpart(&ctx.account)?.as_str(),
        ));
    }

    let incoming = message.state;
    let outcome = if message.is_authored_by(&ctx.account) {
        // Our own messages only come back as acknowledgements of a stored copy.
        match ctx.store.merge_message_state(&ctx.account, &mut message) {
            Err(PeerpostError::Storage(StorageError::NotFound { .. })) => {
                return Err(PeerpostError::identity_mismatch(
                    ctx.contact.as_str(),
                    ctx.account.as_str(),
                ))
            }
            result => result?,
        }
    } else {
        ctx.store.save_or_update_message(&ctx.account, &mut message)?
    };
    trace!(id = %message.id, %incoming, stored = %message.state, ?outcome, "inbound message merged");

    if outcome != SaveOutcome::Unchanged {
        if let Err(OfferError::Full) = ctx.mailboxes.inbound(&ctx.contact).offer(message.clone()) {
            debug!(id = %message.id, contact = %ctx.contact, "inbound mailbox full");
        }
    }

    // Answer the author with what we hold; our own messages coming back are acks.
    if !message.is_authored_by(&ctx.account) {
        match ctx.mailboxes.outbound(&ctx.contact).offer(message) {
            Ok(()) => {}
            Err(OfferError::Full) => {
                debug!(contact = %ctx.contact, "outbound mailbox full, acknowledgement deferred")
            }
            Err(OfferError::Closed) => {}
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Drain the outbound mailbox into the stream
///
/// Returns `Ok` when the mailbox is discarded; write failures end the loop.
pub async fn write_loop<W>(ctx: &StreamContext, mut writer: W, outbound: MailboxReceiver) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let frame = match seal_for(ctx, &message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(id = %message.id, contact = %ctx.contact, error = %e, "cannot seal message");
                continue;
            }
        };
        if frame.len() > ctx.max_frame_len {
            warn!(
                id = %message.id,
                size = frame.len(),
                max = ctx.max_frame_len,
                "sealed message exceeds frame limit"
            );
            continue;
        }
        write_frame(&mut writer, &frame, ctx.max_frame_len).await?;
        trace!(id = %message.id, state = %message.state, peer = %ctx.remote.short(), "message written");
    }
    debug!(contact = %ctx.contact, "outbound mailbox closed");
    Ok(())
}

fn seal_for(ctx: &StreamContext, message: &Message) -> Result<Vec<u8>> {
    if message.counterpart(&ctx.account)? != &ctx.contact {
        return Err(PeerpostError::identity_mismatch(
            ctx.contact.as_str(),
            message.counterpart(&ctx.account)?.as_str(),
        ));
    }
    envelope::seal(&ctx.identity, message)
}

/// Run both directions until either ends
pub async fn run_stream<R, W>(ctx: StreamContext, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outbound = ctx.mailboxes.outbound(&ctx.contact).receiver();
    tokio::select! {
        result = read_loop(&ctx, reader) => result,
        result = write_loop(&ctx, writer, outbound) => result,
    }
}
