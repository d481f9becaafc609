//! Scatter-gather response collection.

use crate::basis::RequestFuture;
use bytes::Bytes;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Per-request response book: one slot per expected responder, `None` until
/// that member answers. Slots still `None` after [`record_resp`] returns
/// belong to members that timed out.
pub type ResponseBook = HashMap<String, Option<Bytes>>;

/// Pre-initialize a book with one empty slot per expected responder.
pub fn new_response_book<S: AsRef<str>>(targets: &[S]) -> ResponseBook {
    targets
        .iter()
        .map(|t| (t.as_ref().to_string(), None))
        .collect()
}

/// Drain `future` into `book`, best effort.
///
/// Responses from nodes outside the book are discarded; a second response
/// from an already-filled slot is discarded as a misconfiguration hint; a
/// response with a missing payload is stored as empty bytes, since presence
/// is what callers test for. Returns when every slot is filled, the request
/// deadline passes, or `stop` fires; the caller inspects the book either
/// way.
pub async fn record_resp(
    request_name: &str,
    mut future: RequestFuture,
    book: &mut ResponseBook,
    stop: &CancellationToken,
) {
    let mut filled = 0usize;
    while filled < book.len() {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(future.deadline) => break,
            resp = future.responses.recv() => {
                let Some(resp) = resp else {
                    // Stream closed: every delivery was dropped, nothing more
                    // can arrive.
                    break;
                };
                let Some(slot) = book.get_mut(&resp.node) else {
                    warn!(
                        request = %request_name,
                        node = %resp.node,
                        "received a response from an unexpected node, discarded"
                    );
                    continue;
                };
                if slot.is_some() {
                    error!(
                        request = %request_name,
                        node = %resp.node,
                        "received multiple responses from one node, discarded; \
                         the substrate probably needs tuning"
                    );
                    continue;
                }
                let payload = match resp.payload {
                    Some(payload) => payload,
                    None => {
                        error!(
                            request = %request_name,
                            node = %resp.node,
                            "BUG: received a response with no payload"
                        );
                        Bytes::new()
                    }
                };
                *slot = Some(payload);
                filled += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::MemberResponse;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn future_with(deadline_in: Duration) -> (mpsc::UnboundedSender<MemberResponse>, RequestFuture) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            RequestFuture {
                responses: rx,
                deadline: Instant::now() + deadline_in,
            },
        )
    }

    fn resp(node: &str, payload: &[u8]) -> MemberResponse {
        MemberResponse {
            node: node.to_string(),
            payload: Some(Bytes::copy_from_slice(payload)),
        }
    }

    #[tokio::test]
    async fn fills_every_slot_and_returns() {
        let (tx, future) = future_with(Duration::from_secs(5));
        let mut book = new_response_book(&["a", "b"]);
        tx.send(resp("b", b"bb")).unwrap();
        tx.send(resp("a", b"aa")).unwrap();

        let stop = CancellationToken::new();
        record_resp("stat", future, &mut book, &stop).await;

        assert_eq!(book["a"].as_deref(), Some(&b"aa"[..]));
        assert_eq!(book["b"].as_deref(), Some(&b"bb"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_null_slots() {
        let (tx, future) = future_with(Duration::from_millis(50));
        let mut book = new_response_book(&["a", "b", "c"]);
        tx.send(resp("a", b"aa")).unwrap();
        tx.send(resp("b", b"bb")).unwrap();
        // c never answers; the deadline ends the collection.

        let stop = CancellationToken::new();
        record_resp("stat", future, &mut book, &stop).await;

        assert!(book["a"].is_some());
        assert!(book["b"].is_some());
        assert!(book["c"].is_none());
    }

    #[tokio::test]
    async fn duplicates_and_strangers_are_discarded() {
        let (tx, future) = future_with(Duration::from_secs(5));
        let mut book = new_response_book(&["a", "b"]);
        tx.send(resp("a", b"first")).unwrap();
        tx.send(resp("a", b"second")).unwrap();
        tx.send(resp("zz", b"stranger")).unwrap();
        tx.send(resp("b", b"bb")).unwrap();

        let stop = CancellationToken::new();
        record_resp("stat", future, &mut book, &stop).await;

        assert_eq!(book["a"].as_deref(), Some(&b"first"[..]));
        assert_eq!(book["b"].as_deref(), Some(&b"bb"[..]));
        assert_eq!(book.len(), 2);
    }

    #[tokio::test]
    async fn missing_payload_counts_as_presence() {
        let (tx, future) = future_with(Duration::from_secs(5));
        let mut book = new_response_book(&["a"]);
        tx.send(MemberResponse {
            node: "a".to_string(),
            payload: None,
        })
        .unwrap();

        let stop = CancellationToken::new();
        record_resp("stat", future, &mut book, &stop).await;

        assert_eq!(book["a"].as_deref(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn stop_token_ends_collection_early() {
        let (_tx, future) = future_with(Duration::from_secs(600));
        let mut book = new_response_book(&["a"]);
        let stop = CancellationToken::new();
        stop.cancel();

        record_resp("stat", future, &mut book, &stop).await;
        assert!(book["a"].is_none());
    }
}
